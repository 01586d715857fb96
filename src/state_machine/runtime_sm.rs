//! Runtime state machine owned by a VM host process.
//!
//! Hierarchy:
//! ```text
//! Stopped
//! Powered (superstate)
//!     ├── Starting  [entry: log]
//!     ├── Running   [entry: log]
//!     └── Stopping  [entry: log]
//! Error { reason }  (terminal for this host)
//! ```
//!
//! Handlers never touch the framework. They emit [`Directive`]s that the
//! host loop executes after `handle` returns, and a rejected request emits
//! `Directive::Reject` so the host can answer the client with the right kind.

use std::sync::mpsc;

use statig::prelude::*;
use tracing::{info, warn};

use crate::error::ErrorKind;
use crate::protocol::RuntimeState;

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Events dispatched to the runtime state machine.
#[derive(Debug, Clone)]
pub enum HostEvent {
    /// Client request.
    Boot,
    /// Client request: graceful guest shutdown.
    Shutdown,
    /// Client request: immediate stop.
    ForceStop,
    /// The framework reports the guest is running.
    FrameworkStarted,
    /// The framework reports the guest has stopped.
    FrameworkStopped,
    /// The framework reports a failure.
    FrameworkFailed(String),
}

/// Work the host loop must carry out after a transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directive {
    /// Build the device plan and start the framework.
    Launch,
    /// Ask the guest to power off.
    RequestStop,
    /// Stop the framework immediately.
    ForceStop,
    /// Retire this host process.
    Exit,
    /// Answer the current request with an error of this kind.
    Reject(ErrorKind),
    /// As `Reject`, with the machine's own message.
    RejectWith(ErrorKind, String),
}

// ---------------------------------------------------------------------------
// Shared storage
// ---------------------------------------------------------------------------

pub struct RuntimeMachine {
    vm_name: String,
    directives: mpsc::Sender<Directive>,
}

impl RuntimeMachine {
    pub fn new(vm_name: impl Into<String>, directives: mpsc::Sender<Directive>) -> Self {
        Self {
            vm_name: vm_name.into(),
            directives,
        }
    }

    /// Map a machine state to its wire representation.
    pub fn runtime_state(state: &State) -> RuntimeState {
        match state {
            State::Stopped {} => RuntimeState::Stopped,
            State::Starting {} => RuntimeState::Starting,
            State::Running {} => RuntimeState::Running,
            State::Stopping {} => RuntimeState::Stopping,
            State::Error { reason } => RuntimeState::Error(reason.clone()),
        }
    }

    fn emit(&self, directive: Directive) {
        // The receiver lives in the host loop for as long as the machine.
        let _ = self.directives.send(directive);
    }

    fn reject(&self, kind: ErrorKind) {
        self.emit(Directive::Reject(kind));
    }
}

// ---------------------------------------------------------------------------
// State machine implementation
// ---------------------------------------------------------------------------

#[state_machine(
    initial = "State::stopped()",
    state(derive(Debug, Clone, PartialEq))
)]
impl RuntimeMachine {
    /// Host is up, framework is not running.
    #[state(entry_action = "enter_stopped")]
    fn stopped(&mut self, event: &HostEvent) -> Outcome<State> {
        match event {
            HostEvent::Boot => {
                self.emit(Directive::Launch);
                Transition(State::starting())
            }
            HostEvent::Shutdown | HostEvent::ForceStop => {
                self.reject(ErrorKind::NotRunning);
                Handled
            }
            // Late framework notifications after a stop carry no information.
            _ => Handled,
        }
    }

    // ------------------------------------------------------------------
    // Superstate: Powered (parent of Starting, Running, Stopping)
    // ------------------------------------------------------------------

    #[superstate]
    fn powered(&mut self, event: &HostEvent) -> Outcome<State> {
        match event {
            HostEvent::ForceStop => {
                self.emit(Directive::ForceStop);
                Transition(State::stopping())
            }
            HostEvent::FrameworkStopped => Transition(State::stopped()),
            HostEvent::FrameworkFailed(reason) => Transition(State::error(reason.clone())),
            HostEvent::Boot | HostEvent::Shutdown => {
                self.reject(ErrorKind::OperationInProgress);
                Handled
            }
            HostEvent::FrameworkStarted => Handled,
        }
    }

    #[state(superstate = "powered", entry_action = "enter_starting")]
    fn starting(&mut self, event: &HostEvent) -> Outcome<State> {
        match event {
            HostEvent::FrameworkStarted => Transition(State::running()),
            _ => Super,
        }
    }

    #[state(superstate = "powered", entry_action = "enter_running")]
    fn running(&mut self, event: &HostEvent) -> Outcome<State> {
        match event {
            HostEvent::Boot => {
                self.reject(ErrorKind::AlreadyRunning);
                Handled
            }
            HostEvent::Shutdown => {
                self.emit(Directive::RequestStop);
                Transition(State::stopping())
            }
            _ => Super,
        }
    }

    #[state(superstate = "powered", entry_action = "enter_stopping")]
    fn stopping(&mut self, event: &HostEvent) -> Outcome<State> {
        match event {
            // Escalation from a graceful stop stays in Stopping.
            HostEvent::ForceStop => {
                self.emit(Directive::ForceStop);
                Handled
            }
            _ => Super,
        }
    }

    /// The framework failed. Only `ForceStop` is accepted, and it retires
    /// the host so a fresh one can be spawned.
    #[state(entry_action = "enter_error")]
    fn error(&mut self, event: &HostEvent, reason: &String) -> Outcome<State> {
        match event {
            HostEvent::ForceStop => {
                info!(target: "runtime", vm = %self.vm_name, "Retiring failed host");
                self.emit(Directive::Exit);
                Handled
            }
            HostEvent::Boot => {
                warn!(target: "runtime", vm = %self.vm_name, %reason, "Boot refused; host already failed");
                let message = format!("VM '{}' failed: {reason}; force-stop it to retire this host", self.vm_name);
                self.emit(Directive::RejectWith(ErrorKind::Failed, message));
                Handled
            }
            HostEvent::Shutdown => {
                self.reject(ErrorKind::NotRunning);
                Handled
            }
            _ => Handled,
        }
    }

    // ------------------------------------------------------------------
    // Entry actions
    // ------------------------------------------------------------------

    #[action]
    fn enter_stopped(&mut self) {
        info!(target: "runtime", vm = %self.vm_name, "Stopped");
    }

    #[action]
    fn enter_starting(&mut self) {
        info!(target: "runtime", vm = %self.vm_name, "Starting");
    }

    #[action]
    fn enter_running(&mut self) {
        info!(target: "runtime", vm = %self.vm_name, "Running");
    }

    #[action]
    fn enter_stopping(&mut self) {
        info!(target: "runtime", vm = %self.vm_name, "Stopping");
    }

    #[action]
    fn enter_error(&mut self) {
        warn!(target: "runtime", vm = %self.vm_name, "Entered error state");
    }
}
