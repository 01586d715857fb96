//! Per-VM SSH key pairs.
//!
//! The pair lives at `<vm dir>/ssh/vm_key{,.pub}` and is removed with the VM
//! directory. Generation shells out to OpenSSH's `ssh-keygen`, which is
//! present on every macOS install.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Command;

use tracing::info;

use crate::error::VmError;

/// Produces a new key pair: private key at `private_key`, public key at
/// `<private_key>.pub`.
pub trait KeyGenerator: Send + Sync {
    fn generate(&self, private_key: &Path, comment: &str) -> Result<(), VmError>;
}

/// `ssh-keygen -t ed25519 -N "" -f <path> -C <comment>`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SshKeygen;

impl KeyGenerator for SshKeygen {
    fn generate(&self, private_key: &Path, comment: &str) -> Result<(), VmError> {
        let output = Command::new("ssh-keygen")
            .args(["-q", "-t", "ed25519", "-N", "", "-C", comment, "-f"])
            .arg(private_key)
            .output()
            .map_err(|e| VmError::KeyGenerationFailed(format!("spawn `ssh-keygen`: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(VmError::KeyGenerationFailed(format!(
                "ssh-keygen failed (exit {}): {}",
                output.status,
                stderr.trim()
            )));
        }
        Ok(())
    }
}

/// Path of the public half for a private key path.
pub fn public_key_path(private_key: &Path) -> PathBuf {
    let mut name = private_key.as_os_str().to_owned();
    name.push(".pub");
    PathBuf::from(name)
}

/// Return the key pair at `private_key`, generating it when either half is
/// missing or `force` is set. An existing complete pair is never touched
/// without `force`.
pub fn ensure_keypair(
    private_key: &Path,
    force: bool,
    generator: &dyn KeyGenerator,
) -> Result<(PathBuf, PathBuf), VmError> {
    let public_key = public_key_path(private_key);

    if !force && private_key.is_file() && public_key.is_file() {
        return Ok((private_key.to_path_buf(), public_key));
    }

    if let Some(dir) = private_key.parent() {
        std::fs::create_dir_all(dir).map_err(|e| VmError::storage(dir, e))?;
    }
    // ssh-keygen prompts before overwriting.
    for path in [private_key, public_key.as_path()] {
        if path.exists() {
            std::fs::remove_file(path).map_err(|e| VmError::storage(path, e))?;
        }
    }

    let comment = private_key
        .parent()
        .and_then(Path::parent)
        .and_then(Path::file_name)
        .and_then(|n| n.to_str())
        .unwrap_or("vzctl");
    generator.generate(private_key, comment)?;

    if !private_key.is_file() || !public_key.is_file() {
        return Err(VmError::KeyGenerationFailed(format!(
            "key generator did not produce {} and {}",
            private_key.display(),
            public_key.display()
        )));
    }
    std::fs::set_permissions(private_key, std::fs::Permissions::from_mode(0o600))
        .map_err(|e| VmError::storage(private_key, e))?;

    info!(path = %private_key.display(), forced = force, "Generated SSH key pair");
    Ok((private_key.to_path_buf(), public_key))
}

/// Read a public key file, trimmed to its single line.
pub fn read_public_key(path: &Path) -> Result<String, VmError> {
    let text = std::fs::read_to_string(path).map_err(|e| VmError::storage(path, e))?;
    Ok(text.trim().to_owned())
}
