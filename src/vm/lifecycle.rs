//! vfkit adapter for the [`Hypervisor`] seam (macOS Virtualization.framework).
//!
//! ## Architecture
//!
//! ```text
//! VfkitHypervisor::launch(DevicePlan)
//!     └─► tokio::process::Command  →  vfkit child process
//!             └─► watcher task
//!                     ├─► polls GET /vm/state until VirtualMachineStateRunning → Started
//!                     └─► child exit → Stopped (or Failed if it died unasked)
//! request_stop()  PUT /vm/state {"state":"Stop"}
//! force_stop()    PUT /vm/state {"state":"HardStop"}, kill on failure
//! ```
//!
//! The REST endpoint listens on a loopback port chosen at launch.

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use crate::error::VmError;
use crate::vm::devices::DevicePlan;
use crate::vm::hypervisor::{FrameworkEvent, FrameworkEvents, Hypervisor};

const STATE_POLL_INTERVAL: Duration = Duration::from_millis(500);
const REST_TIMEOUT: Duration = Duration::from_secs(5);
const RUNNING: &str = "VirtualMachineStateRunning";

#[derive(Debug, Deserialize)]
struct VmStateResponse {
    state: String,
}

/// Live vfkit child for one VM.
struct Running {
    rest_port: u16,
    stop_requested: Arc<AtomicBool>,
    kill: Option<oneshot::Sender<()>>,
}

pub struct VfkitHypervisor {
    binary: Option<PathBuf>,
    client: reqwest::Client,
    running: Option<Running>,
}

impl VfkitHypervisor {
    /// `binary` overrides the `PATH`/Homebrew search.
    pub fn new(binary: Option<PathBuf>) -> Self {
        Self {
            binary,
            client: reqwest::Client::new(),
            running: None,
        }
    }

    async fn put_state(&self, port: u16, state: &str) -> Result<(), VmError> {
        let url = format!("http://localhost:{port}/vm/state");
        let resp = self
            .client
            .put(&url)
            .json(&serde_json::json!({ "state": state }))
            .timeout(REST_TIMEOUT)
            .send()
            .await
            .map_err(|e| VmError::HostFailed(format!("vfkit {state} request: {e}")))?;

        if !resp.status().is_success() {
            return Err(VmError::HostFailed(format!(
                "vfkit {state} request returned HTTP {}",
                resp.status().as_u16()
            )));
        }
        info!(port, state, "vfkit state change requested");
        Ok(())
    }
}

impl Hypervisor for VfkitHypervisor {
    async fn launch(&mut self, plan: &DevicePlan, events: FrameworkEvents) -> Result<(), VmError> {
        if self.running.is_some() {
            return Err(VmError::HostFailed("vfkit is already running for this host".into()));
        }

        let vfkit = find_vfkit(self.binary.as_deref())?;
        let rest_port = free_loopback_port()?;

        let mut cmd = Command::new(&vfkit);
        cmd.args(plan.vfkit_args())
            .arg("--restful-uri")
            .arg(format!("tcp://localhost:{rest_port}"))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(vfkit = %vfkit.display(), args = ?plan.vfkit_args(), "Spawning vfkit");
        let mut child = cmd
            .spawn()
            .map_err(|e| VmError::HostFailed(format!("spawn {}: {e}", vfkit.display())))?;

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    info!(target: "vfkit", "{line}");
                }
            });
        }

        info!(
            vm = %plan.name,
            port = rest_port,
            cpus = plan.cpu_count,
            memory_mib = plan.memory_bytes / (1024 * 1024),
            "vfkit spawned"
        );

        let stop_requested = Arc::new(AtomicBool::new(false));
        let (kill_tx, kill_rx) = oneshot::channel();
        tokio::spawn(watch_child(
            child,
            rest_port,
            self.client.clone(),
            Arc::clone(&stop_requested),
            kill_rx,
            events,
        ));

        self.running = Some(Running {
            rest_port,
            stop_requested,
            kill: Some(kill_tx),
        });
        Ok(())
    }

    async fn request_stop(&mut self) -> Result<(), VmError> {
        let Some(running) = &self.running else {
            return Err(VmError::HostFailed("vfkit is not running".into()));
        };
        running.stop_requested.store(true, Ordering::SeqCst);
        self.put_state(running.rest_port, "Stop").await
    }

    async fn force_stop(&mut self) -> Result<(), VmError> {
        let Some(running) = &self.running else {
            return Ok(());
        };
        running.stop_requested.store(true, Ordering::SeqCst);
        let port = running.rest_port;

        if let Err(e) = self.put_state(port, "HardStop").await {
            warn!(port, error = %e, "REST HardStop failed; killing vfkit");
            if let Some(kill) = self.running.as_mut().and_then(|r| r.kill.take()) {
                let _ = kill.send(());
            }
        }
        Ok(())
    }
}

/// Drive one vfkit child to completion, reporting framework events.
async fn watch_child(
    mut child: Child,
    rest_port: u16,
    client: reqwest::Client,
    stop_requested: Arc<AtomicBool>,
    mut kill: oneshot::Receiver<()>,
    events: FrameworkEvents,
) {
    let url = format!("http://localhost:{rest_port}/vm/state");
    let mut poll = tokio::time::interval(STATE_POLL_INTERVAL);
    let mut started = false;
    let mut kill_armed = true;

    let status = loop {
        tokio::select! {
            status = child.wait() => break status,
            signal = &mut kill, if kill_armed => {
                kill_armed = false;
                // A dropped sender only means the adapter went away.
                if signal.is_ok() {
                    if let Err(e) = child.kill().await {
                        error!(error = %e, "Failed to kill vfkit");
                    }
                    break child.wait().await;
                }
            }
            _ = poll.tick(), if !started => {
                if query_running(&client, &url).await {
                    started = true;
                    info!(port = rest_port, "Guest running");
                    let _ = events.send(FrameworkEvent::Started);
                }
            }
        }
    };

    let event = exit_event(status, started, stop_requested.load(Ordering::SeqCst));
    info!(port = rest_port, event = ?event, "vfkit exited");
    let _ = events.send(event);
}

fn exit_event(status: std::io::Result<ExitStatus>, started: bool, stop_requested: bool) -> FrameworkEvent {
    match status {
        Err(e) => FrameworkEvent::Failed(format!("waiting for vfkit: {e}")),
        Ok(_) if stop_requested => FrameworkEvent::Stopped,
        Ok(status) if !started => FrameworkEvent::Failed(format!("vfkit exited during boot ({status})")),
        Ok(status) if !status.success() => FrameworkEvent::Failed(format!("vfkit exited unexpectedly ({status})")),
        // Guest powered itself off.
        Ok(_) => FrameworkEvent::Stopped,
    }
}

async fn query_running(client: &reqwest::Client, url: &str) -> bool {
    let resp = match client.get(url).timeout(REST_TIMEOUT).send().await {
        Ok(resp) if resp.status().is_success() => resp,
        Ok(resp) => {
            debug!(http_status = resp.status().as_u16(), "vfkit state query non-2xx");
            return false;
        }
        // The REST server comes up shortly after the process.
        Err(_) => return false,
    };
    match resp.json::<VmStateResponse>().await {
        Ok(body) => {
            debug!(state = %body.state, "vfkit state");
            body.state == RUNNING
        }
        Err(e) => {
            warn!(error = %e, "Unparseable vfkit state response");
            false
        }
    }
}

fn free_loopback_port() -> Result<u16, VmError> {
    let listener = std::net::TcpListener::bind(("127.0.0.1", 0))
        .map_err(|e| VmError::HostFailed(format!("reserve REST port: {e}")))?;
    let port = listener
        .local_addr()
        .map_err(|e| VmError::HostFailed(format!("reserve REST port: {e}")))?
        .port();
    Ok(port)
}

/// Resolve the path to the `vfkit` binary: an explicit override, then
/// `PATH`, then the Homebrew prefixes.
pub fn find_vfkit(configured: Option<&Path>) -> Result<PathBuf, VmError> {
    if let Some(path) = configured {
        if path.is_file() {
            return Ok(path.to_path_buf());
        }
        return Err(VmError::HostFailed(format!(
            "configured vfkit binary {} does not exist",
            path.display()
        )));
    }

    if let Ok(path_var) = std::env::var("PATH") {
        for dir in path_var.split(':') {
            let candidate = PathBuf::from(dir).join("vfkit");
            if candidate.is_file() {
                return Ok(candidate);
            }
        }
    }

    // Homebrew on Apple Silicon and Intel.
    for path in ["/opt/homebrew/bin/vfkit", "/usr/local/bin/vfkit"] {
        if Path::new(path).is_file() {
            return Ok(PathBuf::from(path));
        }
    }

    Err(VmError::HostFailed(
        "vfkit binary not found. Install it with: brew install vfkit".into(),
    ))
}

// ---------------------------------------------------------------------------
// Host support check
// ---------------------------------------------------------------------------

/// Outcome of `vzctl check`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupportReport {
    pub supported: bool,
    pub message: String,
}

#[cfg(target_os = "macos")]
mod imp {
    use std::path::Path;
    use std::process::Command;

    use super::{SupportReport, find_vfkit};

    pub fn check_support(vfkit: Option<&Path>) -> SupportReport {
        let hv = Command::new("sysctl")
            .args(["-n", "kern.hv_support"])
            .output()
            .map(|out| String::from_utf8_lossy(&out.stdout).trim() == "1")
            .unwrap_or(false);
        if !hv {
            return SupportReport {
                supported: false,
                message: "Hardware virtualization is not available (kern.hv_support = 0)".into(),
            };
        }

        match find_vfkit(vfkit) {
            Ok(path) => SupportReport {
                supported: true,
                message: format!("Virtualization.framework available; vfkit at {}", path.display()),
            },
            Err(e) => SupportReport {
                supported: false,
                message: e.to_string(),
            },
        }
    }
}

#[cfg(not(target_os = "macos"))]
mod imp {
    use std::path::Path;

    use super::SupportReport;

    pub fn check_support(_vfkit: Option<&Path>) -> SupportReport {
        SupportReport {
            supported: false,
            message: "VM lifecycle requires macOS (Virtualization.framework via vfkit)".into(),
        }
    }
}

pub use imp::check_support;
