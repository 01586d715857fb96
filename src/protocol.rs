//! Control-channel protocol types.
//!
//! A CLI invocation talks to a VM host process over the host's Unix socket
//! using newline-delimited JSON: one object per line, in both directions.
//!
//! ```text
//! → {"type":"boot"}
//! ← {"type":"ack"}
//! ← {"type":"state_changed","state":"running"}
//! → {"type":"query"}
//! ← {"type":"state","state":"running"}
//! → {"type":"shutdown"}
//! ← {"type":"error","kind":"operation_in_progress","message":"..."}
//! ```
//!
//! Every request gets exactly one reply (`ack`, `state` or `error`).
//! `state_changed` lines are unsolicited and may arrive between a request and
//! its reply; clients skip them when waiting for a reply.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ErrorKind;

/// Runtime state of one VM. Never persisted; only the host process that owns
/// the VM knows it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeState {
    /// No descriptor exists for the name.
    NotCreated,
    Stopped,
    Starting,
    Running,
    Stopping,
    /// Terminal for the current host process; carries the framework's reason.
    Error(String),
}

impl RuntimeState {
    pub fn is_running(&self) -> bool {
        matches!(self, RuntimeState::Running)
    }

    /// States in which a transition is still underway.
    pub fn is_transitional(&self) -> bool {
        matches!(self, RuntimeState::Starting | RuntimeState::Stopping)
    }
}

impl fmt::Display for RuntimeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuntimeState::NotCreated => f.write_str("not created"),
            RuntimeState::Stopped => f.write_str("stopped"),
            RuntimeState::Starting => f.write_str("starting"),
            RuntimeState::Running => f.write_str("running"),
            RuntimeState::Stopping => f.write_str("stopping"),
            RuntimeState::Error(reason) => write!(f, "error ({reason})"),
        }
    }
}

/// Controller → host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    Boot,
    /// Graceful stop: the guest is asked to power off.
    Shutdown,
    /// Immediate stop. Accepted while a transition is underway.
    ForceStop,
    Query,
}

/// Host → controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HostMessage {
    /// The request was accepted; progress follows as `StateChanged`.
    Ack,
    /// Reply to `Query`.
    State { state: RuntimeState },
    Error { kind: ErrorKind, message: String },
    /// Unsolicited: the runtime state moved.
    StateChanged { state: RuntimeState },
}

impl HostMessage {
    pub fn error(kind: ErrorKind, message: impl Into<String>) -> Self {
        HostMessage::Error {
            kind,
            message: message.into(),
        }
    }

    /// Serialize to one protocol line, newline included.
    pub fn to_line(&self) -> String {
        let mut line = serde_json::to_string(self).unwrap_or_else(|e| {
            format!(r#"{{"type":"error","kind":"failed","message":"encode: {e}"}}"#)
        });
        line.push('\n');
        line
    }
}

impl Request {
    pub fn to_line(&self) -> String {
        // Unit variants of an internally tagged enum always serialize.
        let mut line = serde_json::to_string(self).unwrap_or_default();
        line.push('\n');
        line
    }
}
