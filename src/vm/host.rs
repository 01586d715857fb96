//! VM host process: owns one live VM and serves its control channel.
//!
//! ## Architecture
//!
//! ```text
//! serve(layout, hypervisor)
//!     ├─► flock(host.lock)            one host per VM name
//!     ├─► UnixListener(<runtime dir>/<digest>.sock)
//!     │       └─► connection task     request lines → main loop (Envelope)
//!     │                               watch<RuntimeState> → state_changed lines
//!     └─► main loop  select! {
//!             request     → RuntimeMachine → directives → Hypervisor
//!             framework   → RuntimeMachine
//!             idle timer  → exit if never booted
//!             SIGTERM     → force stop, exit
//!         }
//! ```
//!
//! The host exits once a booted VM reaches `Stopped`, when a host in
//! `Error` is retired with `ForceStop`, or when no `Boot` arrives within the
//! idle timeout. Its socket disappears with it, which is how clients learn
//! the VM is no longer running.

use std::fs::{DirBuilder, OpenOptions};
use std::future::Future;
use std::os::unix::fs::DirBuilderExt;
use std::sync::mpsc as std_mpsc;
use std::time::Duration;

use nix::fcntl::{Flock, FlockArg};
use statig::prelude::*;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::config::Settings;
use crate::error::{ErrorKind, VmError};
use crate::paths::VmLayout;
use crate::protocol::{HostMessage, Request, RuntimeState};
use crate::state_machine::runtime_sm::{Directive, HostEvent, RuntimeMachine};
use crate::vm::descriptor;
use crate::vm::devices::DevicePlan;
use crate::vm::hypervisor::{FrameworkEvent, Hypervisor};
use crate::vm::lifecycle::VfkitHypervisor;

/// How long a terminating host waits for a forced stop to complete.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);
/// How long a new host waits for a retiring one to release the VM lock.
const LOCK_WAIT: Duration = Duration::from_secs(1);
/// How long exiting hosts give connection tasks to flush final lines.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// A request from a connection task, with the slot for its reply.
struct Envelope {
    request: Request,
    reply: oneshot::Sender<HostMessage>,
}

/// Entry point for `vzctl host <name>`: the vfkit adapter plus signal
/// handling.
pub async fn run(layout: VmLayout, settings: &Settings) -> Result<(), VmError> {
    let hypervisor = VfkitHypervisor::new(settings.vfkit.binary.clone());
    serve(layout, hypervisor, settings.timeouts.host_idle(), termination()).await
}

/// Resolves on SIGTERM or SIGINT.
async fn termination() {
    use tokio::signal::unix::{SignalKind, signal};

    match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
        (Ok(mut term), Ok(mut int)) => {
            tokio::select! {
                _ = term.recv() => info!("SIGTERM received"),
                _ = int.recv() => info!("SIGINT received"),
            }
        }
        _ => {
            warn!("Could not install signal handlers");
            std::future::pending::<()>().await;
        }
    }
}

/// Serve one VM until it stops or the host is retired.
pub async fn serve<H, S>(
    layout: VmLayout,
    hypervisor: H,
    idle_timeout: Duration,
    shutdown: S,
) -> Result<(), VmError>
where
    H: Hypervisor,
    S: Future<Output = ()> + Send,
{
    // Fail before taking any resources if there is nothing to host.
    descriptor::load(&layout)?;

    let lock_path = layout.host_lock();
    let lock_file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(&lock_path)
        .map_err(|e| VmError::storage(&lock_path, e))?;
    let _lock = acquire_host_lock(&layout, lock_file).await?;

    let socket_path = layout.control_socket();
    if let Some(dir) = socket_path.parent() {
        DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(dir)
            .map_err(|e| VmError::storage(dir, e))?;
    }
    if socket_path.exists() {
        // Stale: the lock proves no live host is serving it.
        std::fs::remove_file(&socket_path).map_err(|e| VmError::storage(&socket_path, e))?;
    }
    let listener = UnixListener::bind(&socket_path).map_err(|e| VmError::storage(&socket_path, e))?;
    info!(vm = %layout.name(), socket = %socket_path.display(), pid = std::process::id(), "Host listening");

    let mut host = Host::new(layout.clone(), hypervisor);
    let result = host.run(listener, idle_timeout, shutdown).await;

    if let Err(e) = std::fs::remove_file(&socket_path) {
        warn!(socket = %socket_path.display(), error = %e, "Could not remove control socket");
    }
    info!(vm = %layout.name(), "Host exiting");
    result
}

/// Take the per-VM lock. A retired host may hold it for a few more
/// milliseconds while it tears down, so keep trying for a short while.
async fn acquire_host_lock(layout: &VmLayout, mut file: std::fs::File) -> Result<Flock<std::fs::File>, VmError> {
    let deadline = tokio::time::Instant::now() + LOCK_WAIT;
    loop {
        match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(lock) => return Ok(lock),
            Err((returned, errno)) => {
                if tokio::time::Instant::now() >= deadline {
                    info!(vm = %layout.name(), %errno, "Another host owns this VM; exiting");
                    return Err(VmError::HostFailed(format!(
                        "another host process already owns VM '{}'",
                        layout.name()
                    )));
                }
                file = returned;
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        }
    }
}

struct Host<H> {
    layout: VmLayout,
    hypervisor: H,
    machine: StateMachine<RuntimeMachine>,
    directives: std_mpsc::Receiver<Directive>,
    state_tx: watch::Sender<RuntimeState>,
    events_tx: mpsc::UnboundedSender<FrameworkEvent>,
    events_rx: mpsc::UnboundedReceiver<FrameworkEvent>,
    launched: bool,
    retire: bool,
}

impl<H: Hypervisor> Host<H> {
    fn new(layout: VmLayout, hypervisor: H) -> Self {
        let (directive_tx, directives) = std_mpsc::channel();
        let machine = RuntimeMachine::new(layout.name(), directive_tx).state_machine();
        let (state_tx, _) = watch::channel(RuntimeState::Stopped);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            layout,
            hypervisor,
            machine,
            directives,
            state_tx,
            events_tx,
            events_rx,
            launched: false,
            retire: false,
        }
    }

    fn state(&self) -> RuntimeState {
        RuntimeMachine::runtime_state(self.machine.state())
    }

    fn publish(&self) {
        let state = self.state();
        self.state_tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                debug!(vm = %self.layout.name(), state = %state, "State changed");
                *current = state;
                true
            }
        });
    }

    async fn run<S>(&mut self, listener: UnixListener, idle_timeout: Duration, shutdown: S) -> Result<(), VmError>
    where
        S: Future<Output = ()> + Send,
    {
        let (request_tx, mut request_rx) = mpsc::channel::<Envelope>(16);
        let mut connections = JoinSet::new();
        let idle = tokio::time::sleep(idle_timeout);
        tokio::pin!(idle);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        debug!(vm = %self.layout.name(), "Client connected");
                        connections.spawn(serve_connection(
                            stream,
                            request_tx.clone(),
                            self.state_tx.subscribe(),
                        ));
                    }
                    Err(e) => {
                        error!(error = %e, "Control socket accept error");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
                Some(envelope) = request_rx.recv() => {
                    let reply = self.handle_request(envelope.request).await;
                    let _ = envelope.reply.send(reply);
                }
                Some(event) = self.events_rx.recv() => {
                    self.handle_framework(event);
                }
                _ = &mut idle, if !self.launched => {
                    info!(vm = %self.layout.name(), ?idle_timeout, "No boot request; idle host exiting");
                    break;
                }
                _ = &mut shutdown => {
                    self.shut_down().await;
                    break;
                }
                // Reap finished connection tasks.
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
            }

            if self.retire {
                break;
            }
            if self.launched && self.state() == RuntimeState::Stopped {
                info!(vm = %self.layout.name(), "VM stopped; host exiting");
                break;
            }
        }

        drop(listener);
        drop(request_rx);
        // Dropping the sender lets connection tasks flush the final state
        // and close.
        let (closed_tx, _) = watch::channel(self.state());
        drop(std::mem::replace(&mut self.state_tx, closed_tx));
        let drained = tokio::time::timeout(DRAIN_TIMEOUT, async {
            while connections.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            connections.abort_all();
        }
        Ok(())
    }

    async fn handle_request(&mut self, request: Request) -> HostMessage {
        debug!(vm = %self.layout.name(), ?request, "Request");
        let event = match request {
            Request::Query => return HostMessage::State { state: self.state() },
            Request::Boot => HostEvent::Boot,
            Request::Shutdown => HostEvent::Shutdown,
            Request::ForceStop => HostEvent::ForceStop,
        };

        self.machine.handle(&event);
        let mut reply = HostMessage::Ack;
        let pending: Vec<Directive> = self.directives.try_iter().collect();
        for directive in pending {
            if let Some(rejection) = self.execute(directive).await {
                reply = rejection;
            }
        }
        self.publish();
        reply
    }

    /// Carry out one directive. Returns the error reply, if any.
    async fn execute(&mut self, directive: Directive) -> Option<HostMessage> {
        match directive {
            Directive::Reject(kind) => {
                let message = format!("VM '{}' is {}", self.layout.name(), self.state());
                Some(HostMessage::error(kind, message))
            }
            Directive::RejectWith(kind, message) => Some(HostMessage::error(kind, message)),
            Directive::Launch => {
                self.launched = true;
                match self.launch().await {
                    Ok(()) => None,
                    Err(e) => {
                        let (kind, message) = match e {
                            VmError::ConfigurationInvalid(m) => (ErrorKind::ConfigurationInvalid, m),
                            VmError::DeviceAttachFailed(m) => (ErrorKind::DeviceAttachFailed, m),
                            other => (ErrorKind::Failed, other.to_string()),
                        };
                        error!(vm = %self.layout.name(), error = %message, "Boot failed");
                        self.machine.handle(&HostEvent::FrameworkFailed(message.clone()));
                        Some(HostMessage::error(kind, message))
                    }
                }
            }
            Directive::RequestStop => match self.hypervisor.request_stop().await {
                Ok(()) => None,
                Err(e) => {
                    warn!(vm = %self.layout.name(), error = %e, "Graceful stop request failed");
                    Some(HostMessage::error(ErrorKind::Failed, e.to_string()))
                }
            },
            Directive::ForceStop => match self.hypervisor.force_stop().await {
                Ok(()) => None,
                Err(e) => {
                    error!(vm = %self.layout.name(), error = %e, "Forced stop failed");
                    Some(HostMessage::error(ErrorKind::Failed, e.to_string()))
                }
            },
            Directive::Exit => {
                // Release anything the failed framework still holds.
                if let Err(e) = self.hypervisor.force_stop().await {
                    warn!(vm = %self.layout.name(), error = %e, "Cleanup after failure");
                }
                self.retire = true;
                None
            }
        }
    }

    /// Re-read the descriptor, build and validate the plan, start the
    /// framework.
    async fn launch(&mut self) -> Result<(), VmError> {
        let descriptor = descriptor::load(&self.layout)?;
        let plan = DevicePlan::from_descriptor(&descriptor);
        plan.validate()?;
        self.hypervisor.launch(&plan, self.events_tx.clone()).await
    }

    fn handle_framework(&mut self, event: FrameworkEvent) {
        debug!(vm = %self.layout.name(), ?event, "Framework event");
        let event = match event {
            FrameworkEvent::Started => HostEvent::FrameworkStarted,
            FrameworkEvent::Stopped => HostEvent::FrameworkStopped,
            FrameworkEvent::Failed(reason) => HostEvent::FrameworkFailed(reason),
        };
        self.machine.handle(&event);
        // Framework events never reject; drop anything emitted.
        for directive in self.directives.try_iter() {
            debug!(?directive, "Ignoring directive from framework event");
        }
        self.publish();
    }

    /// Termination signal: stop the VM hard and give it a moment to go.
    async fn shut_down(&mut self) {
        if !matches!(
            self.state(),
            RuntimeState::Starting | RuntimeState::Running | RuntimeState::Stopping
        ) {
            return;
        }
        warn!(vm = %self.layout.name(), "Terminating with VM powered on; forcing stop");
        self.machine.handle(&HostEvent::ForceStop);
        let pending: Vec<Directive> = self.directives.try_iter().collect();
        for directive in pending {
            self.execute(directive).await;
        }
        self.publish();

        let _ = tokio::time::timeout(SHUTDOWN_GRACE, async {
            while self.state() != RuntimeState::Stopped {
                match self.events_rx.recv().await {
                    Some(event) => self.handle_framework(event),
                    None => break,
                }
            }
        })
        .await;
    }
}

/// One client connection: replies to its requests in order and pushes
/// every state change it has not yet seen.
async fn serve_connection(
    stream: UnixStream,
    requests: mpsc::Sender<Envelope>,
    mut state_rx: watch::Receiver<RuntimeState>,
) {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();
    // Only changes after connecting are pushed; `Query` covers the rest.
    state_rx.borrow_and_update();

    loop {
        let outgoing = tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) if line.trim().is_empty() => continue,
                Ok(Some(line)) => match serde_json::from_str::<Request>(&line) {
                    Ok(request) => {
                        let (reply_tx, reply_rx) = oneshot::channel();
                        if requests.send(Envelope { request, reply: reply_tx }).await.is_err() {
                            break;
                        }
                        match reply_rx.await {
                            Ok(reply) => reply,
                            Err(_) => break,
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "Malformed request line");
                        HostMessage::error(ErrorKind::BadRequest, e.to_string())
                    }
                },
                Ok(None) => break,
                Err(e) => {
                    debug!(error = %e, "Client read error");
                    break;
                }
            },
            changed = state_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                HostMessage::StateChanged { state: state_rx.borrow_and_update().clone() }
            }
        };

        if let Err(e) = write_half.write_all(outgoing.to_line().as_bytes()).await {
            debug!(error = %e, "Client write error");
            break;
        }
    }
}
