//! Operator settings loaded from `config.toml`.
//!
//! Every key is optional; a missing file yields the defaults below.
//!
//! ```toml
//! vm_root = "/Users/op/VMs"
//!
//! [timeouts]
//! boot_secs = 120
//! stop_secs = 30
//!
//! [network]
//! ip_timeout_secs = 90
//!
//! [ssh]
//! user = "ubuntu"
//!
//! [vfkit]
//! binary = "/opt/homebrew/bin/vfkit"
//! ```
//!
//! `VZCTL_VM_ROOT` overrides `vm_root`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::paths::AppPaths;

pub const VM_ROOT_ENV: &str = "VZCTL_VM_ROOT";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Parent directory of all VM directories. Defaults to `~/VMs`.
    pub vm_root: Option<PathBuf>,
    pub timeouts: Timeouts,
    pub network: NetworkSettings,
    pub ssh: SshSettings,
    pub vfkit: VfkitSettings,
}

/// Bounded waits used by the lifecycle controller and the host process.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    /// How long a blocking `start` waits for `Running`.
    pub boot_secs: u64,
    /// How long `stop` waits for `Stopped`.
    pub stop_secs: u64,
    /// Connect + query budget for `status`.
    pub status_millis: u64,
    /// How long a freshly spawned host may take to open its socket.
    pub spawn_secs: u64,
    /// A host that never receives `Boot` exits after this long.
    pub host_idle_secs: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            boot_secs: 120,
            stop_secs: 30,
            status_millis: 500,
            spawn_secs: 10,
            host_idle_secs: 60,
        }
    }
}

impl Timeouts {
    pub fn boot(&self) -> Duration {
        Duration::from_secs(self.boot_secs)
    }

    pub fn stop(&self) -> Duration {
        Duration::from_secs(self.stop_secs)
    }

    pub fn status(&self) -> Duration {
        Duration::from_millis(self.status_millis)
    }

    pub fn spawn(&self) -> Duration {
        Duration::from_secs(self.spawn_secs)
    }

    pub fn host_idle(&self) -> Duration {
        Duration::from_secs(self.host_idle_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkSettings {
    pub ip_timeout_secs: u64,
    pub ip_poll_millis: u64,
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            ip_timeout_secs: 90,
            ip_poll_millis: 2000,
        }
    }
}

impl NetworkSettings {
    pub fn ip_timeout(&self) -> Duration {
        Duration::from_secs(self.ip_timeout_secs)
    }

    pub fn ip_poll_interval(&self) -> Duration {
        Duration::from_millis(self.ip_poll_millis)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SshSettings {
    /// Login user created by the cloud-init bundle.
    pub user: String,
}

impl Default for SshSettings {
    fn default() -> Self {
        Self {
            user: "ubuntu".to_owned(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VfkitSettings {
    /// Explicit vfkit binary; searched on `PATH` and Homebrew prefixes otherwise.
    pub binary: Option<PathBuf>,
}

impl Settings {
    /// Load `config.toml` from the config directory, falling back to defaults
    /// when the file does not exist.
    pub fn load(paths: &AppPaths) -> anyhow::Result<Self> {
        let mut settings = Self::load_file(&paths.config_file())?;
        if let Ok(root) = std::env::var(VM_ROOT_ENV) {
            settings.vm_root = Some(PathBuf::from(root));
        }
        if settings.vm_root.is_none() {
            settings.vm_root = Some(paths.vm_root.clone());
        }
        Ok(settings)
    }

    fn load_file(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("read {}", path.display()))?;
        Self::from_toml(&text).with_context(|| format!("parse {}", path.display()))
    }

    pub fn from_toml(s: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(s)
    }

    /// The VM root. `load` always resolves one; a relative `VMs` is the last resort.
    pub fn vm_root(&self) -> PathBuf {
        self.vm_root.clone().unwrap_or_else(|| PathBuf::from("VMs"))
    }
}
