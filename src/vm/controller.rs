//! Lifecycle controller: the synchronous face of every CLI command.
//!
//! The controller holds no runtime state of its own. Each call re-derives
//! the VM's state from two facts: does the VM directory exist, and does a
//! host answer on the VM's control socket. Commands that need a live VM
//! spawn a detached host process and talk to it over the channel.

use std::net::IpAddr;
use std::os::unix::process::CommandExt;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::Settings;
use crate::error::VmError;
use crate::paths::VmLayout;
use crate::protocol::{Request, RuntimeState};
use crate::vm::control_channel::{ControlClient, WaitOutcome};
use crate::vm::credentials::{self, KeyGenerator, SshKeygen};
use crate::vm::descriptor::{self, Descriptor, DescriptorInputs};
use crate::vm::filesystem::{self, DiskAllocator, TruncateAllocator};
use crate::vm::network::{self, NeighborTable};
use crate::vm::provisioning::{self, HostIsoTool, IsoPackager};

/// Interval between connect attempts while a fresh host starts up.
const CONNECT_RETRY: Duration = Duration::from_millis(50);

/// Starts a host process for one VM. The host must open the VM's control
/// socket on its own; the launcher does not wait for it.
pub trait HostLauncher: Send + Sync {
    fn launch(&self, layout: &VmLayout) -> Result<Box<dyn LaunchedHost>, VmError>;
}

/// A launched host, watched until its control socket opens.
pub trait LaunchedHost: Send {
    /// Why the host has already exited, or `None` while it is alive.
    fn exited(&mut self) -> Option<String>;
}

/// Hosts run as tasks inside the calling process.
impl<T: Send + 'static> LaunchedHost for tokio::task::JoinHandle<T> {
    fn exited(&mut self) -> Option<String> {
        self.is_finished().then(|| "host task ended".to_owned())
    }
}

/// Re-executes this binary as `vzctl host <name> --vm-root <root>`, detached
/// into its own process group so the VM outlives the invoking terminal.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    vm_root: PathBuf,
    /// Binary to run; the current executable when unset.
    executable: Option<PathBuf>,
    /// Where the host writes `<name>-host.log`. Its stderr is appended there
    /// too, so failures before logging starts are not lost.
    log_dir: Option<PathBuf>,
}

impl ProcessLauncher {
    pub fn new(vm_root: PathBuf) -> Self {
        Self {
            vm_root,
            executable: None,
            log_dir: None,
        }
    }

    pub fn with_executable(mut self, executable: PathBuf) -> Self {
        self.executable = Some(executable);
        self
    }

    pub fn with_log_dir(mut self, log_dir: PathBuf) -> Self {
        self.log_dir = Some(log_dir);
        self
    }

    fn host_log(&self, layout: &VmLayout) -> Option<PathBuf> {
        self.log_dir
            .as_ref()
            .map(|dir| dir.join(format!("{}-host.log", layout.name())))
    }
}

impl HostLauncher for ProcessLauncher {
    fn launch(&self, layout: &VmLayout) -> Result<Box<dyn LaunchedHost>, VmError> {
        let exe = match &self.executable {
            Some(exe) => exe.clone(),
            None => std::env::current_exe()
                .map_err(|e| VmError::HostFailed(format!("locate current executable: {e}")))?,
        };

        let log = self.host_log(layout);
        let stderr = match &log {
            Some(path) => match open_append(path) {
                Ok(file) => Stdio::from(file),
                Err(e) => {
                    warn!(log = %path.display(), error = %e, "Cannot open host log; discarding host stderr");
                    Stdio::null()
                }
            },
            None => Stdio::null(),
        };

        let child = Command::new(&exe)
            .arg("host")
            .arg(layout.name())
            .arg("--vm-root")
            .arg(&self.vm_root)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(stderr)
            .process_group(0)
            .spawn()
            .map_err(|e| VmError::HostFailed(format!("spawn host process: {e}")))?;

        info!(vm = %layout.name(), pid = child.id(), "Spawned host process");
        Ok(Box::new(HostProcess { child, log }))
    }
}

fn open_append(path: &Path) -> std::io::Result<std::fs::File> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    OpenOptions::new().create(true).append(true).open(path)
}

/// A spawned `vzctl host`. Dropping it leaves the process running.
struct HostProcess {
    child: Child,
    log: Option<PathBuf>,
}

impl LaunchedHost for HostProcess {
    fn exited(&mut self) -> Option<String> {
        let status = match self.child.try_wait() {
            Ok(Some(status)) => status,
            Ok(None) => return None,
            Err(e) => {
                debug!(pid = self.child.id(), error = %e, "Cannot poll host process");
                return None;
            }
        };
        let Some(log) = &self.log else {
            return Some(format!("host process ended with {status}"));
        };
        match last_line(log) {
            Some(line) => Some(format!("host process ended with {status}: {line} (see {})", log.display())),
            None => Some(format!("host process ended with {status} (see {})", log.display())),
        }
    }
}

fn last_line(path: &Path) -> Option<String> {
    let text = std::fs::read_to_string(path).ok()?;
    text.lines()
        .rev()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(str::to_owned)
}

/// Everything `ssh` needs to reach a running VM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshTarget {
    pub ip: IpAddr,
    pub user: String,
    /// The VM's generated key, if it has one.
    pub identity: Option<PathBuf>,
}

pub struct Controller {
    settings: Settings,
    root: PathBuf,
    launcher: Arc<dyn HostLauncher>,
    disks: Arc<dyn DiskAllocator>,
    isos: Arc<dyn IsoPackager>,
    keys: Arc<dyn KeyGenerator>,
    neighbors: Arc<dyn NeighborTable>,
}

impl Controller {
    /// A controller wired to the host's real collaborators.
    pub fn new(settings: Settings) -> Self {
        let root = settings.vm_root();
        Self {
            launcher: Arc::new(ProcessLauncher::new(root.clone())),
            disks: Arc::new(TruncateAllocator),
            isos: Arc::new(HostIsoTool),
            keys: Arc::new(SshKeygen),
            neighbors: network::host_neighbor_table(),
            root,
            settings,
        }
    }

    pub fn with_launcher(mut self, launcher: Arc<dyn HostLauncher>) -> Self {
        self.launcher = launcher;
        self
    }

    pub fn with_disk_allocator(mut self, disks: Arc<dyn DiskAllocator>) -> Self {
        self.disks = disks;
        self
    }

    pub fn with_iso_packager(mut self, isos: Arc<dyn IsoPackager>) -> Self {
        self.isos = isos;
        self
    }

    pub fn with_key_generator(mut self, keys: Arc<dyn KeyGenerator>) -> Self {
        self.keys = keys;
        self
    }

    pub fn with_neighbor_table(mut self, neighbors: Arc<dyn NeighborTable>) -> Self {
        self.neighbors = neighbors;
        self
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn layout(&self, name: &str) -> Result<VmLayout, VmError> {
        descriptor::validate_name(name)?;
        Ok(VmLayout::new(&self.root, name))
    }

    // -----------------------------------------------------------------------
    // create / delete / list
    // -----------------------------------------------------------------------

    /// Create the VM directory, disk, credentials and descriptor.
    ///
    /// Repeating a create with identical inputs returns the existing
    /// descriptor. A failure part-way removes the partial directory.
    pub fn create(&self, inputs: &DescriptorInputs) -> Result<Descriptor, VmError> {
        inputs.validate()?;
        let layout = self.layout(&inputs.name)?;

        if layout.exists() {
            return match descriptor::load(&layout) {
                Ok(existing) if existing.matches_inputs(inputs) => {
                    info!(vm = %inputs.name, "VM already exists with identical configuration");
                    Ok(existing)
                }
                _ => Err(VmError::NameInUse(inputs.name.clone())),
            };
        }

        std::fs::create_dir_all(&self.root).map_err(|e| VmError::storage(&self.root, e))?;
        match std::fs::create_dir(layout.dir()) {
            Ok(()) => {}
            // Lost a race with a concurrent create.
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(VmError::NameInUse(inputs.name.clone()));
            }
            Err(e) => return Err(VmError::storage(layout.dir(), e)),
        }

        match self.populate(&layout, inputs) {
            Ok(descriptor) => {
                info!(
                    vm = %descriptor.name,
                    mac = %descriptor.mac_address,
                    cpus = descriptor.cpu_count,
                    memory_mib = descriptor.memory_mib(),
                    "VM created"
                );
                Ok(descriptor)
            }
            Err(e) => {
                warn!(vm = %inputs.name, error = %e, "Create failed; removing partial VM directory");
                if let Err(cleanup) = descriptor::remove(&layout) {
                    warn!(vm = %inputs.name, error = %cleanup, "Cleanup failed");
                }
                Err(e)
            }
        }
    }

    fn populate(&self, layout: &VmLayout, inputs: &DescriptorInputs) -> Result<Descriptor, VmError> {
        self.disks.allocate_sparse_file(&layout.disk(), inputs.disk_bytes)?;

        if let Some(iso) = &inputs.install_iso {
            filesystem::link_install_iso(iso, &layout.install_iso())?;
        }

        let public_key = match &inputs.ssh_public_key {
            Some(key) => key.trim().to_owned(),
            None => {
                let (_, public) = credentials::ensure_keypair(&layout.private_key(), false, self.keys.as_ref())?;
                credentials::read_public_key(&public)?
            }
        };

        if inputs.auto_install {
            provisioning::assemble(layout, &public_key, self.isos.as_ref())?;
        }

        let descriptor = Descriptor::from_inputs(inputs, layout);
        descriptor::write(layout, &descriptor)?;
        Ok(descriptor)
    }

    /// Remove a VM that is not running. Deleting a missing VM is a no-op.
    pub async fn delete(&self, name: &str) -> Result<(), VmError> {
        let layout = self.layout(name)?;
        match self.status(name).await? {
            RuntimeState::NotCreated => {
                debug!(vm = %name, "Nothing to delete");
                Ok(())
            }
            RuntimeState::Stopped => descriptor::remove(&layout),
            state => {
                debug!(vm = %name, %state, "Refusing to delete");
                Err(VmError::VmRunning(name.to_owned()))
            }
        }
    }

    /// Every VM under the root with its current state.
    pub async fn list(&self) -> Result<Vec<(Descriptor, RuntimeState)>, VmError> {
        let mut out = Vec::new();
        for name in descriptor::list(&self.root)? {
            let layout = self.layout(&name)?;
            let descriptor = match descriptor::load(&layout) {
                Ok(d) => d,
                Err(e) => {
                    warn!(vm = %name, error = %e, "Skipping unreadable descriptor");
                    continue;
                }
            };
            let state = self.status(&name).await?;
            out.push((descriptor, state));
        }
        Ok(out)
    }

    // -----------------------------------------------------------------------
    // status
    // -----------------------------------------------------------------------

    /// Best-effort state: an unreachable host reads as `Stopped` (or
    /// `NotCreated` without a VM directory).
    pub async fn status(&self, name: &str) -> Result<RuntimeState, VmError> {
        let layout = self.layout(name)?;
        if !layout.exists() {
            return Ok(RuntimeState::NotCreated);
        }

        let timeout = self.settings.timeouts.status();
        let Some(mut client) = ControlClient::connect(&layout, timeout).await? else {
            return Ok(RuntimeState::Stopped);
        };
        match client.query(timeout).await {
            Ok(state) => Ok(state),
            Err(e) => {
                debug!(vm = %name, error = %e, "Host did not answer; reporting Stopped");
                Ok(RuntimeState::Stopped)
            }
        }
    }

    // -----------------------------------------------------------------------
    // start
    // -----------------------------------------------------------------------

    /// Boot the VM. With `detach` the call returns once the host accepted
    /// `Boot`; otherwise it waits, bounded, for `Running`.
    ///
    /// A VM that is already running is left alone and `Running` returned.
    /// A timed-out boot keeps going in the host.
    pub async fn start(&self, name: &str, detach: bool) -> Result<RuntimeState, VmError> {
        let layout = self.layout(name)?;
        descriptor::load(&layout)?;
        let timeouts = &self.settings.timeouts;

        let mut client = match ControlClient::connect(&layout, timeouts.status()).await? {
            Some(mut client) => match client.query(timeouts.status()).await? {
                state if state.is_running() => {
                    info!(vm = %name, "Already running");
                    return Ok(state);
                }
                state if state.is_transitional() => {
                    debug!(vm = %name, %state, "Host is mid-transition");
                    return Err(VmError::OperationInProgress(name.to_owned()));
                }
                RuntimeState::Error(reason) => {
                    info!(vm = %name, %reason, "Retiring failed host before restart");
                    self.retire(&layout, client).await?;
                    self.spawn_host(&layout).await?
                }
                // An idle host that has not booted yet.
                _ => client,
            },
            None => self.spawn_host(&layout).await?,
        };

        match client.request(Request::Boot, timeouts.spawn()).await {
            Ok(_) => {}
            Err(VmError::AlreadyRunning(_)) => return Ok(RuntimeState::Running),
            Err(e) => return Err(e),
        }
        info!(vm = %name, detach, "Boot accepted");

        if detach {
            return Ok(RuntimeState::Starting);
        }

        let outcome = client
            .wait_for(
                |s| matches!(s, RuntimeState::Running | RuntimeState::Stopped | RuntimeState::Error(_)),
                timeouts.boot(),
            )
            .await?;
        match outcome {
            WaitOutcome::Reached(RuntimeState::Running) => Ok(RuntimeState::Running),
            WaitOutcome::Reached(RuntimeState::Error(reason)) => Err(VmError::HostFailed(reason)),
            WaitOutcome::Reached(state) => Err(VmError::HostFailed(format!(
                "VM '{name}' reached {state} while booting"
            ))),
            WaitOutcome::Closed => Err(VmError::HostFailed(format!(
                "host for VM '{name}' exited during boot"
            ))),
            WaitOutcome::TimedOut => Err(VmError::BootTimeout {
                name: name.to_owned(),
                secs: timeouts.boot_secs,
            }),
        }
    }

    /// Launch a host and wait for its control socket. A host that exits
    /// first is reported with whatever it left behind.
    async fn spawn_host(&self, layout: &VmLayout) -> Result<ControlClient, VmError> {
        let mut launched = self.launcher.launch(layout)?;

        let spawn_timeout = self.settings.timeouts.spawn();
        let deadline = tokio::time::Instant::now() + spawn_timeout;
        loop {
            if let Some(client) = ControlClient::connect(layout, CONNECT_RETRY).await? {
                return Ok(client);
            }
            if let Some(reason) = launched.exited() {
                // A host that lost the lock to a concurrent start exits too.
                if let Some(client) = ControlClient::connect(layout, CONNECT_RETRY).await? {
                    return Ok(client);
                }
                return Err(VmError::HostFailed(format!(
                    "host for VM '{}' exited before opening its control channel: {reason}",
                    layout.name()
                )));
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(VmError::HostFailed(format!(
                    "host for VM '{}' did not open its control channel within {spawn_timeout:?}",
                    layout.name()
                )));
            }
            tokio::time::sleep(CONNECT_RETRY).await;
        }
    }

    /// Tell a host in `Error` to exit and wait until it has.
    async fn retire(&self, layout: &VmLayout, mut client: ControlClient) -> Result<(), VmError> {
        let timeouts = &self.settings.timeouts;
        client.request(Request::ForceStop, timeouts.spawn()).await?;
        match client.wait_for(|_| false, timeouts.spawn()).await? {
            WaitOutcome::Closed => Ok(()),
            _ => Err(VmError::HostFailed(format!(
                "failed host for VM '{}' did not exit",
                layout.name()
            ))),
        }
    }

    // -----------------------------------------------------------------------
    // stop
    // -----------------------------------------------------------------------

    /// Stop the VM and wait, bounded, until it has. A timed-out stop keeps
    /// going in the host.
    pub async fn stop(&self, name: &str, force: bool) -> Result<(), VmError> {
        let layout = self.layout(name)?;
        descriptor::load(&layout)?;
        let timeouts = &self.settings.timeouts;

        let Some(mut client) = ControlClient::connect(&layout, timeouts.status()).await? else {
            return Err(VmError::NotRunning(name.to_owned()));
        };

        let request = if force { Request::ForceStop } else { Request::Shutdown };
        client.request(request, timeouts.status().max(Duration::from_secs(5))).await?;
        info!(vm = %name, force, "Stop accepted");

        match client
            .wait_for(|s| *s == RuntimeState::Stopped, timeouts.stop())
            .await?
        {
            WaitOutcome::Reached(_) | WaitOutcome::Closed => {
                info!(vm = %name, "Stopped");
                Ok(())
            }
            WaitOutcome::TimedOut => Err(VmError::StopTimeout {
                name: name.to_owned(),
                forced: force,
                secs: timeouts.stop_secs,
            }),
        }
    }

    // -----------------------------------------------------------------------
    // ip / ssh
    // -----------------------------------------------------------------------

    /// Look up the VM's leased address. `Ok(None)` means not leased yet.
    pub async fn ip(&self, name: &str) -> Result<Option<IpAddr>, VmError> {
        let layout = self.layout(name)?;
        let descriptor = descriptor::load(&layout)?;
        let net = &self.settings.network;
        network::discover_ip(
            Arc::clone(&self.neighbors),
            descriptor.mac_address,
            net.ip_timeout(),
            net.ip_poll_interval(),
        )
        .await
    }

    /// Resolve where `ssh` should connect. The VM must be running and leased.
    pub async fn ssh_target(&self, name: &str, user: Option<String>) -> Result<SshTarget, VmError> {
        let layout = self.layout(name)?;
        match self.status(name).await? {
            state if state.is_running() => {}
            RuntimeState::NotCreated => return Err(VmError::NotCreated(name.to_owned())),
            _ => return Err(VmError::NotRunning(name.to_owned())),
        }

        let Some(ip) = self.ip(name).await? else {
            return Err(VmError::AddressNotLeased(name.to_owned()));
        };
        let key = layout.private_key();
        Ok(SshTarget {
            ip,
            user: user.unwrap_or_else(|| self.settings.ssh.user.clone()),
            identity: key.is_file().then_some(key),
        })
    }
}
