//! Error taxonomy for the VM control plane.
//!
//! Every failure reaches the invoking command unchanged; nothing in the
//! library retries on its own. [`ErrorKind`] is the subset that crosses the
//! control channel between a CLI invocation and a VM host process.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Errors surfaced by the lifecycle controller and its collaborators.
#[derive(Debug, thiserror::Error)]
pub enum VmError {
    /// Bad operator input. Never retried.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("a VM named '{0}' already exists with a different configuration")]
    NameInUse(String),

    #[error("VM '{0}' does not exist")]
    NotCreated(String),

    #[error("VM '{0}' is already running")]
    AlreadyRunning(String),

    #[error("VM '{0}' is not running")]
    NotRunning(String),

    #[error("VM '{0}' is running; stop it before deleting")]
    VmRunning(String),

    #[error("resource allocation failed: {0}")]
    ResourceAllocationFailed(String),

    #[error("ISO packaging failed: {0}")]
    PackagingFailed(String),

    #[error("SSH key generation failed: {0}")]
    KeyGenerationFailed(String),

    /// The guest did not report `Running` in time. The boot keeps going in
    /// the host process.
    #[error("VM '{name}' did not reach Running within {secs}s; check `vzctl status {name}`")]
    BootTimeout { name: String, secs: u64 },

    /// The guest did not stop in time. The stop keeps going in the host
    /// process.
    #[error("{}", stop_timeout_message(.name, .forced, .secs))]
    StopTimeout { name: String, forced: bool, secs: u64 },

    #[error("device attach failed: {0}")]
    DeviceAttachFailed(String),

    #[error("configuration rejected: {0}")]
    ConfigurationInvalid(String),

    #[error("another lifecycle operation is in progress for VM '{0}'")]
    OperationInProgress(String),

    /// The host process failed terminally, or could not be brought up.
    #[error("VM host failure: {0}")]
    HostFailed(String),

    #[error("control channel error: {0}")]
    Channel(String),

    /// IP discovery found no lease for the VM's MAC. The guest may still
    /// be booting; retrying later is reasonable.
    #[error("VM '{0}' has no IP address yet (not yet leased); it may still be booting")]
    AddressNotLeased(String),

    #[error("neighbor table unavailable: {0}")]
    NeighborTable(String),

    #[error("{}: {source}", .path.display())]
    Storage {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

fn stop_timeout_message(name: &str, forced: &bool, secs: &u64) -> String {
    if *forced {
        format!("VM '{name}' did not stop within {secs}s after a forced stop; check `vzctl status {name}`")
    } else {
        format!("VM '{name}' ignored the shutdown request for {secs}s; retry with `vzctl stop --force {name}`")
    }
}

impl VmError {
    pub(crate) fn storage(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        VmError::Storage {
            path: path.into(),
            source,
        }
    }

    /// Rebuild a controller-side error from a host-process rejection.
    pub fn from_kind(kind: ErrorKind, name: &str, message: String) -> Self {
        match kind {
            ErrorKind::OperationInProgress => VmError::OperationInProgress(name.to_owned()),
            ErrorKind::AlreadyRunning => VmError::AlreadyRunning(name.to_owned()),
            ErrorKind::NotRunning => VmError::NotRunning(name.to_owned()),
            ErrorKind::ConfigurationInvalid => VmError::ConfigurationInvalid(message),
            ErrorKind::DeviceAttachFailed => VmError::DeviceAttachFailed(message),
            ErrorKind::Failed => VmError::HostFailed(message),
            ErrorKind::BadRequest => VmError::Channel(message),
        }
    }
}

/// Rejection kinds carried by `HostMessage::Error` on the control channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    OperationInProgress,
    AlreadyRunning,
    NotRunning,
    ConfigurationInvalid,
    DeviceAttachFailed,
    /// The framework failed, or the host is in its terminal error state.
    Failed,
    /// The request line could not be parsed.
    BadRequest,
}
