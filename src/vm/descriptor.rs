//! VM descriptor store.
//!
//! The descriptor is the declarative configuration of one VM, kept as
//! `vm.toml` in the VM directory. It is the only state that outlives a
//! process; runtime state is always re-derived from the host process.

use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::VmError;
use crate::paths::VmLayout;
use crate::vm::network::{MacAddress, derive_mac};

pub const MIB: u64 = 1024 * 1024;
pub const GIB: u64 = 1024 * MIB;

pub const MAX_NAME_LEN: usize = 63;
pub const MIN_CPUS: u32 = 1;
pub const MAX_CPUS: u32 = 32;
pub const MIN_MEMORY_BYTES: u64 = 512 * MIB;
pub const MAX_MEMORY_BYTES: u64 = 128 * GIB;
pub const MIN_DISK_BYTES: u64 = GIB;
pub const MAX_DISK_BYTES: u64 = 1000 * GIB;

/// Operator input to `create`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescriptorInputs {
    pub name: String,
    pub cpu_count: u32,
    pub memory_bytes: u64,
    pub disk_bytes: u64,
    /// Installer image to attach; linked into the VM directory.
    pub install_iso: Option<PathBuf>,
    /// Build a cloud-init bundle and attach it as a second ISO.
    pub auto_install: bool,
    /// Public key to inject instead of generating a per-VM pair.
    pub ssh_public_key: Option<String>,
}

impl DescriptorInputs {
    pub fn new(name: impl Into<String>, cpu_count: u32, memory_bytes: u64, disk_bytes: u64) -> Self {
        Self {
            name: name.into(),
            cpu_count,
            memory_bytes,
            disk_bytes,
            install_iso: None,
            auto_install: false,
            ssh_public_key: None,
        }
    }

    pub fn validate(&self) -> Result<(), VmError> {
        validate_name(&self.name)?;

        if !(MIN_CPUS..=MAX_CPUS).contains(&self.cpu_count) {
            return Err(VmError::InvalidConfiguration(format!(
                "cpu count must be between {MIN_CPUS} and {MAX_CPUS}, got {}",
                self.cpu_count
            )));
        }
        if !(MIN_MEMORY_BYTES..=MAX_MEMORY_BYTES).contains(&self.memory_bytes) {
            return Err(VmError::InvalidConfiguration(format!(
                "memory must be between {} MiB and {} GiB, got {} bytes",
                MIN_MEMORY_BYTES / MIB,
                MAX_MEMORY_BYTES / GIB,
                self.memory_bytes
            )));
        }
        if !(MIN_DISK_BYTES..=MAX_DISK_BYTES).contains(&self.disk_bytes) {
            return Err(VmError::InvalidConfiguration(format!(
                "disk size must be between {} GiB and {} GiB, got {} bytes",
                MIN_DISK_BYTES / GIB,
                MAX_DISK_BYTES / GIB,
                self.disk_bytes
            )));
        }
        if let Some(iso) = &self.install_iso {
            if !iso.is_file() {
                return Err(VmError::InvalidConfiguration(format!(
                    "install ISO not found: {}",
                    iso.display()
                )));
            }
        }
        if let Some(key) = &self.ssh_public_key {
            if key.trim().is_empty() || key.contains('\n') {
                return Err(VmError::InvalidConfiguration(
                    "SSH public key must be a single non-empty line".into(),
                ));
            }
        }
        Ok(())
    }
}

/// Names double as directory names and hostnames: `[a-z0-9-]+`, at most 63.
pub fn validate_name(name: &str) -> Result<(), VmError> {
    if name.is_empty() {
        return Err(VmError::InvalidConfiguration("VM name must not be empty".into()));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(VmError::InvalidConfiguration(format!(
            "VM name must be at most {MAX_NAME_LEN} characters"
        )));
    }
    if !name
        .bytes()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
    {
        return Err(VmError::InvalidConfiguration(format!(
            "VM name '{name}' may only contain lowercase letters, digits and '-'"
        )));
    }
    Ok(())
}

/// Persisted declarative configuration of one VM.
///
/// Immutable once written, apart from the optional ISO paths which `create`
/// sets at most once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Descriptor {
    pub name: String,
    pub cpu_count: u32,
    pub memory_bytes: u64,
    pub disk_path: PathBuf,
    pub disk_bytes: u64,
    pub efi_vars_path: PathBuf,
    pub mac_address: MacAddress,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub install_iso_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cloud_init_iso_path: Option<PathBuf>,
    pub console_log_path: PathBuf,
    pub created_at: DateTime<Utc>,
}

impl Descriptor {
    /// Build the descriptor `create` will write for validated inputs.
    pub fn from_inputs(inputs: &DescriptorInputs, layout: &VmLayout) -> Self {
        Self {
            name: inputs.name.clone(),
            cpu_count: inputs.cpu_count,
            memory_bytes: inputs.memory_bytes,
            disk_path: layout.disk(),
            disk_bytes: inputs.disk_bytes,
            efi_vars_path: layout.efi_vars(),
            mac_address: derive_mac(&inputs.name),
            install_iso_path: inputs.install_iso.as_ref().map(|_| layout.install_iso()),
            cloud_init_iso_path: inputs.auto_install.then(|| layout.cloud_init_iso()),
            console_log_path: layout.console_log(),
            created_at: Utc::now(),
        }
    }

    /// Whether `create` with `inputs` would produce this descriptor.
    pub fn matches_inputs(&self, inputs: &DescriptorInputs) -> bool {
        self.name == inputs.name
            && self.cpu_count == inputs.cpu_count
            && self.memory_bytes == inputs.memory_bytes
            && self.disk_bytes == inputs.disk_bytes
            && self.install_iso_path.is_some() == inputs.install_iso.is_some()
            && self.cloud_init_iso_path.is_some() == inputs.auto_install
    }

    pub fn memory_mib(&self) -> u64 {
        self.memory_bytes / MIB
    }
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Read the descriptor for `layout`. A missing VM directory is `NotCreated`.
pub fn load(layout: &VmLayout) -> Result<Descriptor, VmError> {
    if !layout.exists() {
        return Err(VmError::NotCreated(layout.name().to_owned()));
    }
    let path = layout.descriptor();
    let text = std::fs::read_to_string(&path).map_err(|e| {
        if e.kind() == io::ErrorKind::NotFound {
            // Directory without a descriptor: a create that never finished.
            VmError::NotCreated(layout.name().to_owned())
        } else {
            VmError::storage(&path, e)
        }
    })?;
    toml::from_str(&text)
        .map_err(|e| VmError::storage(&path, io::Error::new(io::ErrorKind::InvalidData, e)))
}

/// Write `descriptor` atomically (temp file + rename).
pub fn write(layout: &VmLayout, descriptor: &Descriptor) -> Result<(), VmError> {
    let path = layout.descriptor();
    let text = toml::to_string_pretty(descriptor)
        .map_err(|e| VmError::storage(&path, io::Error::new(io::ErrorKind::InvalidData, e)))?;

    let tmp = path.with_extension("toml.tmp");
    std::fs::write(&tmp, text).map_err(|e| VmError::storage(&tmp, e))?;
    std::fs::rename(&tmp, &path).map_err(|e| VmError::storage(&path, e))?;

    debug!(path = %path.display(), "Descriptor written");
    Ok(())
}

/// Names of all VMs under `root` that have a descriptor, sorted.
pub fn list(root: &Path) -> Result<Vec<String>, VmError> {
    let entries = match std::fs::read_dir(root) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(VmError::storage(root, e)),
    };

    let mut names = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| VmError::storage(root, e))?;
        let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
            continue;
        };
        if validate_name(&name).is_err() {
            continue;
        }
        if VmLayout::new(root, &name).descriptor().is_file() {
            names.push(name);
        }
    }
    names.sort();
    Ok(names)
}

/// Remove the VM directory and everything in it.
pub fn remove(layout: &VmLayout) -> Result<(), VmError> {
    match std::fs::remove_dir_all(layout.dir()) {
        Ok(()) => {
            info!(vm = %layout.name(), dir = %layout.dir().display(), "VM directory removed");
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(VmError::storage(layout.dir(), e)),
    }
}
