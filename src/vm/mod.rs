//! VM management: persistent descriptors, the host process that owns a live
//! VM, and the lifecycle controller every CLI command goes through.
//!
//! Provisioning (disk, SSH keys, cloud-init bundle) happens once at create
//! time. Everything after that flows through a per-VM host process reached
//! over its control channel.

pub mod control_channel;
pub mod controller;
pub mod credentials;
pub mod descriptor;
pub mod devices;
pub mod filesystem;
pub mod host;
pub mod hypervisor;
pub mod lifecycle;
pub mod network;
pub mod provisioning;

#[cfg(test)]
pub(crate) mod testing;

// ---------------------------------------------------------------------------
// Re-exports
// ---------------------------------------------------------------------------

pub use controller::{Controller, SshTarget};
pub use descriptor::{Descriptor, DescriptorInputs, GIB, MIB};
pub use lifecycle::{SupportReport, check_support};
pub use network::{MacAddress, derive_mac};
