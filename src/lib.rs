//! vzctl: lifecycle control for Linux VMs on macOS Virtualization.framework.

pub mod config;
pub mod error;
pub mod logging;
pub mod paths;
pub mod protocol;
pub mod state_machine;
pub mod vm;

pub use error::VmError;
