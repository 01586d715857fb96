//! Directory structure for vzctl.
//!
//! Two kinds of paths live here:
//!
//! - [`AppPaths`]: the tool's own directories (config, logs) and the default
//!   VM root. Follows macOS conventions, falling back to XDG paths elsewhere:
//!   - Config:  `~/.config/vzctl/`  (human-editable, XDG-style)
//!   - Logs:    `~/Library/Logs/vzctl/`
//!   - VM root: `~/VMs/`
//! - [`VmLayout`]: the fixed file layout inside one VM directory
//!   (`<vm root>/<name>/`). Every command derives paths from the VM name
//!   through this type; nothing else hard-codes a file name.
//!
//! Control sockets are the exception: `sun_path` holds at most 104 bytes on
//! macOS, so they live in a short per-user runtime directory under the
//! system temp dir instead of next to the VM's files.

use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tracing::info;

const APP_NAME: &str = "vzctl";

/// Hex digits of the VM-directory digest used as the socket file name.
const SOCKET_ID_LEN: usize = 16;

/// Resolved application directory paths.
#[derive(Debug, Clone)]
pub struct AppPaths {
    /// Human-editable config: `~/.config/vzctl/`
    pub config: PathBuf,
    /// Application and host-process logs
    pub logs: PathBuf,
    /// Default parent of all VM directories: `~/VMs/`
    pub vm_root: PathBuf,
}

impl AppPaths {
    /// Resolve all paths from the user's home directory.
    /// Does not create any directories; `ensure()` does that.
    pub fn resolve() -> Option<Self> {
        let home = std::env::var("HOME").ok().map(PathBuf::from)?;

        Some(Self {
            config: resolve_config_dir(&home),
            logs: resolve_log_dir(&home),
            vm_root: home.join("VMs"),
        })
    }

    /// Create the config and log directories if they don't already exist.
    /// The VM root is created lazily by the first `create`.
    pub fn ensure(&self) -> std::io::Result<()> {
        for dir in [&self.config, &self.logs] {
            if !dir.is_dir() {
                std::fs::create_dir_all(dir)?;
                info!("created directory: {}", dir.display());
            }
        }
        Ok(())
    }

    pub fn config_file(&self) -> PathBuf {
        self.config.join("config.toml")
    }
}

// ---------------------------------------------------------------------------
// Per-VM layout
// ---------------------------------------------------------------------------

/// File layout of one VM directory.
///
/// ```text
/// <root>/<name>/
///     vm.toml                  descriptor
///     efi_vars.fd
///     <name>.img
///     <name>-install.iso       optional
///     <name>-cloud-init.iso    optional
///     <name>_console.log
///     ssh/vm_key, ssh/vm_key.pub
///     cloud-init/user-data, cloud-init/meta-data
///     host.lock                while a host process runs
///
/// <temp dir>/vzctl-<uid>/<digest>.sock   control socket of a running host
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmLayout {
    name: String,
    dir: PathBuf,
}

impl VmLayout {
    pub fn new(root: &Path, name: &str) -> Self {
        Self {
            name: name.to_owned(),
            dir: root.join(name),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// The directory's presence is the descriptor's existence check.
    pub fn exists(&self) -> bool {
        self.dir.is_dir()
    }

    pub fn descriptor(&self) -> PathBuf {
        self.dir.join("vm.toml")
    }

    pub fn efi_vars(&self) -> PathBuf {
        self.dir.join("efi_vars.fd")
    }

    pub fn disk(&self) -> PathBuf {
        self.dir.join(format!("{}.img", self.name))
    }

    pub fn install_iso(&self) -> PathBuf {
        self.dir.join(format!("{}-install.iso", self.name))
    }

    pub fn cloud_init_iso(&self) -> PathBuf {
        self.dir.join(format!("{}-cloud-init.iso", self.name))
    }

    pub fn console_log(&self) -> PathBuf {
        self.dir.join(format!("{}_console.log", self.name))
    }

    pub fn ssh_dir(&self) -> PathBuf {
        self.dir.join("ssh")
    }

    pub fn private_key(&self) -> PathBuf {
        self.ssh_dir().join("vm_key")
    }

    pub fn cloud_init_dir(&self) -> PathBuf {
        self.dir.join("cloud-init")
    }

    /// Well-known control-channel address for this VM.
    ///
    /// Named after a SHA-256 digest of the VM directory, so the path length
    /// does not grow with the VM root or name, and two roots holding the
    /// same name never share a socket.
    pub fn control_socket(&self) -> PathBuf {
        let digest = Sha256::digest(self.dir.as_os_str().as_bytes());
        let mut id: String = digest.iter().map(|b| format!("{b:02x}")).collect();
        id.truncate(SOCKET_ID_LEN);
        runtime_dir().join(format!("{id}.sock"))
    }

    pub fn host_lock(&self) -> PathBuf {
        self.dir.join("host.lock")
    }
}

/// Per-user directory for control sockets. Created by the host before it
/// binds.
pub fn runtime_dir() -> PathBuf {
    let uid = nix::unistd::getuid();
    std::env::temp_dir().join(format!("{APP_NAME}-{uid}"))
}

// ---------------------------------------------------------------------------
// Platform-specific path resolution
// ---------------------------------------------------------------------------

fn resolve_config_dir(home: &Path) -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        PathBuf::from(xdg).join(APP_NAME)
    } else {
        home.join(".config").join(APP_NAME)
    }
}

#[cfg(target_os = "macos")]
fn resolve_log_dir(home: &Path) -> PathBuf {
    home.join("Library").join("Logs").join(APP_NAME)
}

#[cfg(not(target_os = "macos"))]
fn resolve_log_dir(home: &Path) -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
        PathBuf::from(xdg).join(APP_NAME).join("logs")
    } else {
        home.join(".local").join("share").join(APP_NAME).join("logs")
    }
}
