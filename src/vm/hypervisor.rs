//! The seam between the host process and the virtualization framework.
//!
//! Framework primitives complete asynchronously. An implementation starts or
//! stops the VM and later reports the outcome as a [`FrameworkEvent`] on the
//! channel it was handed at launch; the host loop turns those events into
//! state transitions.

use std::future::Future;

use tokio::sync::mpsc;

use crate::error::VmError;
use crate::vm::devices::DevicePlan;

/// Completion signals from the framework.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameworkEvent {
    /// The guest is running.
    Started,
    /// The VM has stopped, gracefully or not.
    Stopped,
    /// The framework failed; the string is its reason.
    Failed(String),
}

pub type FrameworkEvents = mpsc::UnboundedSender<FrameworkEvent>;

pub trait Hypervisor: Send + 'static {
    /// Begin booting `plan`. Returns once the framework accepted the
    /// request; `Started` or `Failed` follows on `events`.
    fn launch(
        &mut self,
        plan: &DevicePlan,
        events: FrameworkEvents,
    ) -> impl Future<Output = Result<(), VmError>> + Send;

    /// Ask the guest to power off. `Stopped` follows if it complies.
    fn request_stop(&mut self) -> impl Future<Output = Result<(), VmError>> + Send;

    /// Stop the VM immediately. `Stopped` follows.
    fn force_stop(&mut self) -> impl Future<Output = Result<(), VmError>> + Send;
}
