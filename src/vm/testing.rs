//! In-process fakes for exercising the controller and host without vfkit.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use tempfile::TempDir;

use crate::config::Settings;
use crate::error::VmError;
use crate::paths::VmLayout;
use crate::vm::controller::{Controller, HostLauncher, LaunchedHost};
use crate::vm::credentials::testing::CountingGenerator;
use crate::vm::devices::DevicePlan;
use crate::vm::filesystem::DiskAllocator;
use crate::vm::host;
use crate::vm::hypervisor::{FrameworkEvent, FrameworkEvents, Hypervisor};
use crate::vm::network::{NeighborEntry, NeighborTable};
use crate::vm::provisioning::IsoPackager;

/// Scripted framework. Clones share the boot counter.
#[derive(Debug, Clone)]
pub struct FakeHypervisor {
    boot_delay: Duration,
    ignore_shutdown: bool,
    fail_boot: Option<String>,
    events: Option<FrameworkEvents>,
    boots: Arc<AtomicU32>,
}

impl Default for FakeHypervisor {
    fn default() -> Self {
        Self {
            boot_delay: Duration::from_millis(10),
            ignore_shutdown: false,
            fail_boot: None,
            events: None,
            boots: Arc::new(AtomicU32::new(0)),
        }
    }
}

impl FakeHypervisor {
    pub fn booting_in(delay: Duration) -> Self {
        Self {
            boot_delay: delay,
            ..Self::default()
        }
    }

    /// A guest that never honours a graceful power-off.
    pub fn ignoring_shutdown() -> Self {
        Self {
            ignore_shutdown: true,
            ..Self::default()
        }
    }

    pub fn failing(reason: &str) -> Self {
        Self {
            fail_boot: Some(reason.to_owned()),
            ..Self::default()
        }
    }

    pub fn boots(&self) -> u32 {
        self.boots.load(Ordering::SeqCst)
    }

    fn send(&self, event: FrameworkEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }
}

impl Hypervisor for FakeHypervisor {
    async fn launch(&mut self, _plan: &DevicePlan, events: FrameworkEvents) -> Result<(), VmError> {
        self.boots.fetch_add(1, Ordering::SeqCst);
        self.events = Some(events.clone());

        let delay = self.boot_delay;
        let outcome = match &self.fail_boot {
            Some(reason) => FrameworkEvent::Failed(reason.clone()),
            None => FrameworkEvent::Started,
        };
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events.send(outcome);
        });
        Ok(())
    }

    async fn request_stop(&mut self) -> Result<(), VmError> {
        if !self.ignore_shutdown {
            self.send(FrameworkEvent::Stopped);
        }
        Ok(())
    }

    async fn force_stop(&mut self) -> Result<(), VmError> {
        self.send(FrameworkEvent::Stopped);
        Ok(())
    }
}

/// Runs each host as a task on the current runtime.
pub struct InProcessLauncher {
    hypervisor: FakeHypervisor,
    launches: AtomicU32,
}

impl InProcessLauncher {
    pub fn new(hypervisor: FakeHypervisor) -> Self {
        Self {
            hypervisor,
            launches: AtomicU32::new(0),
        }
    }

    pub fn launches(&self) -> u32 {
        self.launches.load(Ordering::SeqCst)
    }

    pub fn boots(&self) -> u32 {
        self.hypervisor.boots()
    }
}

impl HostLauncher for InProcessLauncher {
    fn launch(&self, layout: &VmLayout) -> Result<Box<dyn LaunchedHost>, VmError> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        let layout = layout.clone();
        let hypervisor = self.hypervisor.clone();
        let task = tokio::spawn(async move {
            if let Err(e) = host::serve(layout, hypervisor, Duration::from_secs(30), std::future::pending()).await {
                tracing::debug!(error = %e, "in-process host ended");
            }
        });
        Ok(Box::new(task))
    }
}

/// Sparse files via `set_len`, no external tools.
pub struct SetLenAllocator;

impl DiskAllocator for SetLenAllocator {
    fn allocate_sparse_file(&self, path: &Path, size_bytes: u64) -> Result<(), VmError> {
        let file = std::fs::File::create(path).map_err(|e| VmError::storage(path, e))?;
        file.set_len(size_bytes).map_err(|e| VmError::storage(path, e))
    }
}

/// Writes a placeholder where the ISO would go.
pub struct PlaceholderIso;

impl IsoPackager for PlaceholderIso {
    fn package_iso(&self, source_dir: &Path, target: &Path) -> Result<PathBuf, VmError> {
        std::fs::write(target, format!("iso of {}", source_dir.display()))
            .map_err(|e| VmError::storage(target, e))?;
        Ok(target.to_path_buf())
    }
}

pub struct EmptyNeighborTable;

impl NeighborTable for EmptyNeighborTable {
    fn list_neighbor_entries(&self) -> Result<Vec<NeighborEntry>, VmError> {
        Ok(Vec::new())
    }
}

/// A controller over a fresh temp root, with short timeouts and every
/// external collaborator faked.
pub fn test_controller(hypervisor: FakeHypervisor) -> (TempDir, Controller) {
    let tmp = tempfile::tempdir().unwrap();
    let controller = test_controller_at(tmp.path(), hypervisor);
    (tmp, controller)
}

/// As [`test_controller`], over a caller-chosen VM root.
pub fn test_controller_at(root: &Path, hypervisor: FakeHypervisor) -> Controller {
    let mut settings = Settings {
        vm_root: Some(root.to_path_buf()),
        ..Settings::default()
    };
    settings.timeouts.boot_secs = 5;
    settings.timeouts.stop_secs = 2;
    settings.timeouts.spawn_secs = 5;
    settings.network.ip_timeout_secs = 1;
    settings.network.ip_poll_millis = 50;

    Controller::new(settings)
        .with_launcher(Arc::new(InProcessLauncher::new(hypervisor)))
        .with_disk_allocator(Arc::new(SetLenAllocator))
        .with_iso_packager(Arc::new(PlaceholderIso))
        .with_key_generator(Arc::new(CountingGenerator::default()))
        .with_neighbor_table(Arc::new(EmptyNeighborTable))
}
