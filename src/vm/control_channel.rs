//! Client side of the control channel.
//!
//! A host is addressed by its VM alone: the socket lives at a path derived
//! from the VM directory. A socket that cannot be reached, for whatever
//! reason, means "no host", which callers interpret conservatively.

use std::io;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::UnixStream;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::time::{Instant, timeout_at};
use tracing::{debug, warn};

use crate::error::VmError;
use crate::paths::VmLayout;
use crate::protocol::{HostMessage, Request, RuntimeState};

/// How a bounded wait for a state ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitOutcome {
    Reached(RuntimeState),
    /// The host closed the connection (it exited).
    Closed,
    TimedOut,
}

pub struct ControlClient {
    name: String,
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
    /// Latest `state_changed` seen while waiting for a reply.
    last_change: Option<RuntimeState>,
}

impl ControlClient {
    /// Connect to the host for `layout`. `Ok(None)` when no host can be
    /// reached, including a socket path the OS refuses outright.
    pub async fn connect(layout: &VmLayout, timeout: Duration) -> Result<Option<Self>, VmError> {
        let path = layout.control_socket();
        let stream = match tokio::time::timeout(timeout, UnixStream::connect(&path)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) if is_unreachable(&e) => {
                debug!(socket = %path.display(), error = %e, "No host listening");
                return Ok(None);
            }
            Ok(Err(e)) => {
                warn!(socket = %path.display(), error = %e, "Control socket unusable; treating as no host");
                return Ok(None);
            }
            Err(_) => {
                debug!(socket = %path.display(), "Connect timed out");
                return Ok(None);
            }
        };

        let (read_half, writer) = stream.into_split();
        Ok(Some(Self {
            name: layout.name().to_owned(),
            lines: BufReader::new(read_half).lines(),
            writer,
            last_change: None,
        }))
    }

    /// Send `request` and wait for its reply. `Error` replies become the
    /// matching [`VmError`].
    pub async fn request(&mut self, request: Request, timeout: Duration) -> Result<HostMessage, VmError> {
        let deadline = Instant::now() + timeout;
        self.writer
            .write_all(request.to_line().as_bytes())
            .await
            .map_err(|e| VmError::Channel(format!("send {request:?}: {e}")))?;

        loop {
            let message = match timeout_at(deadline, self.next_message()).await {
                Ok(Ok(Some(message))) => message,
                Ok(Ok(None)) => {
                    return Err(VmError::Channel(format!(
                        "host for '{}' closed the connection",
                        self.name
                    )));
                }
                Ok(Err(e)) => return Err(e),
                Err(_) => {
                    return Err(VmError::Channel(format!(
                        "no reply to {request:?} within {timeout:?}"
                    )));
                }
            };

            match message {
                HostMessage::StateChanged { state } => self.last_change = Some(state),
                HostMessage::Error { kind, message } => {
                    return Err(VmError::from_kind(kind, &self.name, message));
                }
                reply => return Ok(reply),
            }
        }
    }

    pub async fn query(&mut self, timeout: Duration) -> Result<RuntimeState, VmError> {
        match self.request(Request::Query, timeout).await? {
            HostMessage::State { state } => Ok(state),
            other => Err(VmError::Channel(format!("unexpected reply to query: {other:?}"))),
        }
    }

    /// Wait until a pushed state satisfies `reached`, the host goes away,
    /// or `timeout` passes.
    pub async fn wait_for<F>(&mut self, reached: F, timeout: Duration) -> Result<WaitOutcome, VmError>
    where
        F: Fn(&RuntimeState) -> bool,
    {
        if let Some(state) = self.last_change.take() {
            if reached(&state) {
                return Ok(WaitOutcome::Reached(state));
            }
        }

        let deadline = Instant::now() + timeout;
        loop {
            match timeout_at(deadline, self.next_message()).await {
                Err(_) => return Ok(WaitOutcome::TimedOut),
                Ok(Ok(None)) => return Ok(WaitOutcome::Closed),
                Ok(Err(e)) => return Err(e),
                Ok(Ok(Some(HostMessage::StateChanged { state }))) => {
                    debug!(vm = %self.name, state = %state, "State pushed");
                    if reached(&state) {
                        return Ok(WaitOutcome::Reached(state));
                    }
                }
                Ok(Ok(Some(other))) => {
                    debug!(?other, "Ignoring unsolicited message");
                }
            }
        }
    }

    async fn next_message(&mut self) -> Result<Option<HostMessage>, VmError> {
        loop {
            let line = match self.lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => return Ok(None),
                // A reset from an exiting host is the same as a close.
                Err(e) => {
                    debug!(vm = %self.name, error = %e, "Control channel read failed");
                    return Ok(None);
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            return serde_json::from_str(&line)
                .map(Some)
                .map_err(|e| VmError::Channel(format!("malformed host message {line:?}: {e}")));
        }
    }
}

fn is_unreachable(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::NotFound | io::ErrorKind::ConnectionRefused | io::ErrorKind::ConnectionReset
    )
}
