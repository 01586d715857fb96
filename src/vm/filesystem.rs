//! Disk images and other files placed in a VM directory by `create`.
//!
//! Raw disk allocation is delegated to the host's `truncate(1)`, which
//! produces a sparse file: it only consumes real blocks once the guest
//! writes to them.

use std::path::Path;
use std::process::Command;

use tracing::{debug, info};

use crate::error::VmError;

// ---------------------------------------------------------------------------
// Disk allocation
// ---------------------------------------------------------------------------

/// Creates a sparse file of `size_bytes` at `path`.
pub trait DiskAllocator: Send + Sync {
    fn allocate_sparse_file(&self, path: &Path, size_bytes: u64) -> Result<(), VmError>;
}

/// `truncate -s <bytes> <path>`; BSD and GNU coreutils accept the same form.
#[derive(Debug, Default, Clone, Copy)]
pub struct TruncateAllocator;

impl DiskAllocator for TruncateAllocator {
    fn allocate_sparse_file(&self, path: &Path, size_bytes: u64) -> Result<(), VmError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                VmError::ResourceAllocationFailed(format!(
                    "create parent directory {}: {e}",
                    parent.display()
                ))
            })?;
        }

        let output = Command::new("truncate")
            .arg("-s")
            .arg(size_bytes.to_string())
            .arg(path)
            .output()
            .map_err(|e| VmError::ResourceAllocationFailed(format!("spawn `truncate`: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(VmError::ResourceAllocationFailed(format!(
                "truncate failed (exit {}): {}",
                output.status,
                stderr.trim()
            )));
        }

        info!(path = %path.display(), size_bytes, "Allocated sparse disk image");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Installer media
// ---------------------------------------------------------------------------

/// Link the operator's installer image into the VM directory.
///
/// A symlink keeps multi-gigabyte ISOs out of the VM directory; the target
/// must stay in place for as long as the VM boots from it.
pub fn link_install_iso(source: &Path, target: &Path) -> Result<(), VmError> {
    let source = source
        .canonicalize()
        .map_err(|e| VmError::InvalidConfiguration(format!("install ISO {}: {e}", source.display())))?;

    if target.symlink_metadata().is_ok() {
        std::fs::remove_file(target).map_err(|e| VmError::storage(target, e))?;
    }
    std::os::unix::fs::symlink(&source, target).map_err(|e| VmError::storage(target, e))?;

    debug!(source = %source.display(), target = %target.display(), "Linked install ISO");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_allocates_sparse_file_of_requested_size() {
        let tmp = tempfile::tempdir().unwrap();
        let disk = tmp.path().join("nested").join("vm1.img");

        TruncateAllocator.allocate_sparse_file(&disk, 64 * 1024 * 1024).unwrap();

        assert_eq!(std::fs::metadata(&disk).unwrap().len(), 64 * 1024 * 1024);
    }

    #[test]
    fn truncate_failure_is_resource_allocation_failed() {
        let tmp = tempfile::tempdir().unwrap();
        // A directory in place of the target file makes truncate fail.
        let disk = tmp.path().join("vm1.img");
        std::fs::create_dir(&disk).unwrap();

        let err = TruncateAllocator.allocate_sparse_file(&disk, 1024).unwrap_err();
        assert!(matches!(err, VmError::ResourceAllocationFailed(_)), "{err}");
    }

    #[test]
    fn install_iso_link_replaces_previous_link() {
        let tmp = tempfile::tempdir().unwrap();
        let first = tmp.path().join("first.iso");
        let second = tmp.path().join("second.iso");
        std::fs::write(&first, b"one").unwrap();
        std::fs::write(&second, b"two").unwrap();
        let target = tmp.path().join("vm1-install.iso");

        link_install_iso(&first, &target).unwrap();
        link_install_iso(&second, &target).unwrap();

        assert_eq!(std::fs::read(&target).unwrap(), b"two");
    }
}
