//! Unattended-install bundle for cloud-init's NoCloud datasource.
//!
//! [`build_bundle`] renders `user-data` and `meta-data`; [`assemble`] writes
//! them under `<vm dir>/cloud-init/` and hands the directory to an
//! [`IsoPackager`], which produces the ISO attached to the VM.
//!
//! NoCloud looks for a volume labelled `cidata` with both files at its root.

use std::path::{Path, PathBuf};
use std::process::Command;

use serde::Serialize;
use tracing::{debug, info};

use crate::error::VmError;
use crate::paths::VmLayout;

/// Login user created by the bundle.
pub const DEFAULT_USER: &str = "ubuntu";

const VOLUME_LABEL: &str = "cidata";

/// Rendered cloud-init documents for one VM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisioningBundle {
    pub user_data: String,
    pub meta_data: String,
}

#[derive(Serialize)]
struct CloudConfig<'a> {
    hostname: &'a str,
    users: Vec<CloudUser<'a>>,
    ssh_pwauth: bool,
    package_update: bool,
    packages: Vec<&'a str>,
}

#[derive(Serialize)]
struct CloudUser<'a> {
    name: &'a str,
    sudo: &'a str,
    shell: &'a str,
    groups: &'a str,
    lock_passwd: bool,
    ssh_authorized_keys: Vec<&'a str>,
}

#[derive(Serialize)]
#[serde(rename_all = "kebab-case")]
struct MetaData<'a> {
    instance_id: &'a str,
    local_hostname: &'a str,
}

/// Render the bundle: hostname is `name`, `ssh_public_key` becomes the
/// default user's only authorized key.
pub fn build_bundle(name: &str, ssh_public_key: &str) -> Result<ProvisioningBundle, VmError> {
    let config = CloudConfig {
        hostname: name,
        users: vec![CloudUser {
            name: DEFAULT_USER,
            sudo: "ALL=(ALL) NOPASSWD:ALL",
            shell: "/bin/bash",
            groups: "sudo",
            lock_passwd: true,
            ssh_authorized_keys: vec![ssh_public_key.trim()],
        }],
        ssh_pwauth: false,
        package_update: true,
        packages: vec!["openssh-server"],
    };
    let meta = MetaData {
        instance_id: name,
        local_hostname: name,
    };

    let body = serde_yaml::to_string(&config)
        .map_err(|e| VmError::PackagingFailed(format!("render user-data: {e}")))?;
    let meta_data = serde_yaml::to_string(&meta)
        .map_err(|e| VmError::PackagingFailed(format!("render meta-data: {e}")))?;

    Ok(ProvisioningBundle {
        user_data: format!("#cloud-config\n{body}"),
        meta_data,
    })
}

// ---------------------------------------------------------------------------
// ISO packaging
// ---------------------------------------------------------------------------

/// Builds an ISO filesystem from a directory tree.
pub trait IsoPackager: Send + Sync {
    fn package_iso(&self, source_dir: &Path, target: &Path) -> Result<PathBuf, VmError>;
}

/// Host ISO tooling: `hdiutil` on macOS, `genisoimage`/`mkisofs` elsewhere.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostIsoTool;

impl IsoPackager for HostIsoTool {
    fn package_iso(&self, source_dir: &Path, target: &Path) -> Result<PathBuf, VmError> {
        let mut last_error = String::from("no ISO tool available");
        for (program, args) in iso_tool_invocations(source_dir, target) {
            let output = match Command::new(program).args(&args).output() {
                Ok(output) => output,
                Err(e) => {
                    debug!(program, error = %e, "ISO tool unavailable");
                    last_error = format!("spawn `{program}`: {e}");
                    continue;
                }
            };
            if !output.status.success() {
                let stderr = String::from_utf8_lossy(&output.stderr);
                return Err(VmError::PackagingFailed(format!(
                    "`{program}` failed (exit {}): {}",
                    output.status,
                    stderr.trim()
                )));
            }
            info!(program, iso = %target.display(), "Packaged cloud-init ISO");
            return Ok(target.to_path_buf());
        }
        Err(VmError::PackagingFailed(last_error))
    }
}

/// Candidate tool invocations, in preference order.
pub fn iso_tool_invocations(source_dir: &Path, target: &Path) -> Vec<(&'static str, Vec<String>)> {
    let source = source_dir.display().to_string();
    let target = target.display().to_string();

    if cfg!(target_os = "macos") {
        vec![(
            "hdiutil",
            vec![
                "makehybrid".into(),
                "-o".into(),
                target,
                "-iso".into(),
                "-joliet".into(),
                "-default-volume-name".into(),
                VOLUME_LABEL.into(),
                source,
            ],
        )]
    } else {
        let args = vec![
            "-output".into(),
            target,
            "-volid".into(),
            VOLUME_LABEL.into(),
            "-joliet".into(),
            "-rock".into(),
            source,
        ];
        vec![("genisoimage", args.clone()), ("mkisofs", args)]
    }
}

/// Write the bundle into the VM's `cloud-init/` directory and package it as
/// the VM's cloud-init ISO. Packager failures propagate unchanged.
pub fn assemble(
    layout: &VmLayout,
    ssh_public_key: &str,
    packager: &dyn IsoPackager,
) -> Result<PathBuf, VmError> {
    let bundle = build_bundle(layout.name(), ssh_public_key)?;

    let dir = layout.cloud_init_dir();
    std::fs::create_dir_all(&dir).map_err(|e| VmError::storage(&dir, e))?;
    for (file, contents) in [("user-data", &bundle.user_data), ("meta-data", &bundle.meta_data)] {
        let path = dir.join(file);
        std::fs::write(&path, contents).map_err(|e| VmError::storage(&path, e))?;
    }

    let target = layout.cloud_init_iso();
    if target.exists() {
        std::fs::remove_file(&target).map_err(|e| VmError::storage(&target, e))?;
    }
    packager.package_iso(&dir, &target)
}
