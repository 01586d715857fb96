//! Public-API tests for the VM control plane.
//!
//! Nothing here needs macOS, vfkit or a guest image. External collaborators
//! (disk allocation, key generation, ISO packaging, neighbor table and the
//! hypervisor itself) are replaced through the same traits the production
//! adapters implement, and host processes run as tasks in the test runtime.
//!
//! Tested in this file:
//! - descriptor persistence and the on-disk layout `create` produces
//! - name-derived MAC addresses and IP discovery timing
//! - control-channel wire format
//! - a full create → start → stop → delete cycle against a scripted hypervisor

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use vzctl::VmError;
use vzctl::config::Settings;
use vzctl::error::ErrorKind;
use vzctl::paths::VmLayout;
use vzctl::protocol::{HostMessage, Request, RuntimeState};
use vzctl::vm::controller::{HostLauncher, LaunchedHost};
use vzctl::vm::credentials::{KeyGenerator, public_key_path};
use vzctl::vm::devices::DevicePlan;
use vzctl::vm::filesystem::DiskAllocator;
use vzctl::vm::hypervisor::{FrameworkEvent, FrameworkEvents, Hypervisor};
use vzctl::vm::network::{NeighborEntry, NeighborTable, discover_ip};
use vzctl::vm::provisioning::{IsoPackager, build_bundle};
use vzctl::vm::{Controller, DescriptorInputs, GIB, descriptor, derive_mac, host};

// ---------------------------------------------------------------------------
// Collaborator fakes
// ---------------------------------------------------------------------------

struct SparseFile;

impl DiskAllocator for SparseFile {
    fn allocate_sparse_file(&self, path: &Path, size_bytes: u64) -> Result<(), VmError> {
        let file = std::fs::File::create(path).unwrap();
        file.set_len(size_bytes).unwrap();
        Ok(())
    }
}

struct FixedKeys;

impl KeyGenerator for FixedKeys {
    fn generate(&self, private_key: &Path, comment: &str) -> Result<(), VmError> {
        std::fs::write(private_key, "PRIVATE\n").unwrap();
        std::fs::write(public_key_path(private_key), format!("ssh-ed25519 AAAAtest {comment}\n")).unwrap();
        Ok(())
    }
}

struct CopyDir;

impl IsoPackager for CopyDir {
    fn package_iso(&self, source_dir: &Path, target: &Path) -> Result<PathBuf, VmError> {
        let user_data = std::fs::read(source_dir.join("user-data")).unwrap();
        std::fs::write(target, user_data).unwrap();
        Ok(target.to_path_buf())
    }
}

struct Neighbors(Vec<NeighborEntry>);

impl NeighborTable for Neighbors {
    fn list_neighbor_entries(&self) -> Result<Vec<NeighborEntry>, VmError> {
        Ok(self.0.clone())
    }
}

/// Boots after a short delay and honours every stop request.
#[derive(Clone, Default)]
struct ScriptedHypervisor {
    events: Option<FrameworkEvents>,
    launches: Arc<AtomicU32>,
}

impl Hypervisor for ScriptedHypervisor {
    async fn launch(&mut self, plan: &DevicePlan, events: FrameworkEvents) -> Result<(), VmError> {
        assert!(plan.vfkit_args().iter().any(|a| a.starts_with("virtio-net,nat,mac=")));
        self.launches.fetch_add(1, Ordering::SeqCst);
        self.events = Some(events.clone());
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let _ = events.send(FrameworkEvent::Started);
        });
        Ok(())
    }

    async fn request_stop(&mut self) -> Result<(), VmError> {
        if let Some(events) = &self.events {
            let _ = events.send(FrameworkEvent::Stopped);
        }
        Ok(())
    }

    async fn force_stop(&mut self) -> Result<(), VmError> {
        self.request_stop().await
    }
}

struct TaskLauncher(ScriptedHypervisor);

impl HostLauncher for TaskLauncher {
    fn launch(&self, layout: &VmLayout) -> Result<Box<dyn LaunchedHost>, VmError> {
        let layout = layout.clone();
        let hypervisor = self.0.clone();
        Ok(Box::new(tokio::spawn(async move {
            let _ = host::serve(layout, hypervisor, Duration::from_secs(30), std::future::pending()).await;
        })))
    }
}

fn controller(root: &Path, hypervisor: ScriptedHypervisor, neighbors: Vec<NeighborEntry>) -> Controller {
    let mut settings = Settings {
        vm_root: Some(root.to_path_buf()),
        ..Settings::default()
    };
    settings.timeouts.boot_secs = 5;
    settings.timeouts.stop_secs = 5;
    settings.network.ip_timeout_secs = 1;
    settings.network.ip_poll_millis = 50;

    Controller::new(settings)
        .with_launcher(Arc::new(TaskLauncher(hypervisor)))
        .with_disk_allocator(Arc::new(SparseFile))
        .with_key_generator(Arc::new(FixedKeys))
        .with_iso_packager(Arc::new(CopyDir))
        .with_neighbor_table(Arc::new(Neighbors(neighbors)))
}

// ---------------------------------------------------------------------------
// create
// ---------------------------------------------------------------------------

#[test]
fn create_writes_descriptor_and_layout() {
    let tmp = tempfile::tempdir().unwrap();
    let controller = controller(tmp.path(), ScriptedHypervisor::default(), vec![]);

    let mut inputs = DescriptorInputs::new("vm1", 2, 4 * GIB, 20 * GIB);
    inputs.auto_install = true;
    let created = controller.create(&inputs).unwrap();

    let layout = VmLayout::new(tmp.path(), "vm1");
    assert!(layout.descriptor().is_file());
    assert_eq!(std::fs::metadata(layout.disk()).unwrap().len(), 20 * GIB);
    assert_eq!(created.mac_address, derive_mac("vm1"));
    assert_eq!(created.memory_mib(), 4096);

    // The bundle on disk authorizes the generated key.
    let user_data = std::fs::read_to_string(layout.cloud_init_dir().join("user-data")).unwrap();
    assert!(user_data.starts_with("#cloud-config"));
    assert!(user_data.contains("ssh-ed25519 AAAAtest"));
    assert_eq!(created.cloud_init_iso_path, Some(layout.cloud_init_iso()));
    assert!(layout.cloud_init_iso().is_file());

    assert_eq!(descriptor::load(&layout).unwrap(), created);
    assert_eq!(descriptor::list(tmp.path()).unwrap(), vec!["vm1".to_owned()]);
}

#[test]
fn create_rejects_out_of_range_inputs_before_touching_disk() {
    let tmp = tempfile::tempdir().unwrap();
    let controller = controller(tmp.path(), ScriptedHypervisor::default(), vec![]);

    let cases = [
        DescriptorInputs::new("vm1", 33, 4 * GIB, 20 * GIB),
        DescriptorInputs::new("vm1", 2, 256 * 1024 * 1024, 20 * GIB),
        DescriptorInputs::new("vm1", 2, 4 * GIB, 1001 * GIB),
        DescriptorInputs::new("bad/name", 2, 4 * GIB, 20 * GIB),
        DescriptorInputs::new("", 2, 4 * GIB, 20 * GIB),
    ];
    for inputs in &cases {
        let err = controller.create(inputs).unwrap_err();
        assert!(matches!(err, VmError::InvalidConfiguration(_)), "{inputs:?}: {err}");
    }
    assert!(descriptor::list(tmp.path()).unwrap().is_empty());
}

#[test]
fn bundle_carries_hostname_and_instance_id() {
    let bundle = build_bundle("builder", "ssh-ed25519 AAAAkey op@host\n").unwrap();
    assert!(bundle.user_data.contains("hostname: builder"));
    assert!(bundle.user_data.contains("- ssh-ed25519 AAAAkey op@host"));
    assert!(bundle.meta_data.contains("instance-id: builder"));
    assert!(bundle.meta_data.contains("local-hostname: builder"));
}

// ---------------------------------------------------------------------------
// Network identity
// ---------------------------------------------------------------------------

#[test]
fn derived_mac_is_stable_and_locally_administered() {
    let mac = derive_mac("vm1");
    assert_eq!(mac, derive_mac("vm1"));
    assert_ne!(mac, derive_mac("vm2"));
    let first = mac.octets()[0];
    assert_eq!(first & 0x02, 0x02);
    assert_eq!(first & 0x01, 0x00);
}

#[tokio::test]
async fn discover_ip_miss_waits_out_the_timeout() {
    let table = Arc::new(Neighbors(vec![NeighborEntry {
        mac: derive_mac("someone-else"),
        ip: "192.168.64.7".parse().unwrap(),
    }]));
    let timeout = Duration::from_millis(300);
    let poll = Duration::from_millis(100);

    let started = Instant::now();
    let found = discover_ip(table, derive_mac("vm1"), timeout, poll).await.unwrap();
    let elapsed = started.elapsed();

    assert_eq!(found, None);
    assert!(elapsed >= timeout, "returned after {elapsed:?}");
    assert!(elapsed < timeout + poll + Duration::from_millis(200), "returned after {elapsed:?}");
}

#[tokio::test]
async fn discover_ip_hit_returns_immediately() {
    let table = Arc::new(Neighbors(vec![NeighborEntry {
        mac: derive_mac("vm1"),
        ip: "192.168.64.3".parse().unwrap(),
    }]));
    let started = Instant::now();
    let found = discover_ip(table, derive_mac("vm1"), Duration::from_secs(5), Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(found, Some("192.168.64.3".parse::<IpAddr>().unwrap()));
    assert!(started.elapsed() < Duration::from_secs(1));
}

// ---------------------------------------------------------------------------
// Control-channel wire format
// ---------------------------------------------------------------------------

#[test]
fn wire_lines_are_tagged_json() {
    assert_eq!(Request::Boot.to_line(), "{\"type\":\"boot\"}\n");
    assert_eq!(Request::ForceStop.to_line(), "{\"type\":\"force_stop\"}\n");

    let changed = HostMessage::StateChanged {
        state: RuntimeState::Running,
    };
    assert_eq!(changed.to_line(), "{\"type\":\"state_changed\",\"state\":\"running\"}\n");

    let rejected: HostMessage = serde_json::from_str(
        r#"{"type":"error","kind":"operation_in_progress","message":"VM 'vm1' is starting"}"#,
    )
    .unwrap();
    assert_eq!(rejected, HostMessage::error(ErrorKind::OperationInProgress, "VM 'vm1' is starting"));

    let failed: HostMessage =
        serde_json::from_str(r#"{"type":"state","state":{"error":"disk missing"}}"#).unwrap();
    assert_eq!(
        failed,
        HostMessage::State {
            state: RuntimeState::Error("disk missing".into())
        }
    );
}

// ---------------------------------------------------------------------------
// Full lifecycle
// ---------------------------------------------------------------------------

#[tokio::test]
async fn full_lifecycle_against_scripted_hypervisor() {
    let tmp = tempfile::tempdir().unwrap();
    let hypervisor = ScriptedHypervisor::default();
    let launches = Arc::clone(&hypervisor.launches);
    let controller = controller(
        tmp.path(),
        hypervisor,
        vec![NeighborEntry {
            mac: derive_mac("vm1"),
            ip: "192.168.64.9".parse().unwrap(),
        }],
    );

    assert_eq!(controller.status("vm1").await.unwrap(), RuntimeState::NotCreated);
    controller.create(&DescriptorInputs::new("vm1", 2, 4 * GIB, 20 * GIB)).unwrap();
    assert_eq!(controller.status("vm1").await.unwrap(), RuntimeState::Stopped);

    assert_eq!(controller.start("vm1", false).await.unwrap(), RuntimeState::Running);
    assert_eq!(controller.status("vm1").await.unwrap(), RuntimeState::Running);
    assert_eq!(controller.ip("vm1").await.unwrap(), Some("192.168.64.9".parse().unwrap()));
    assert!(matches!(controller.delete("vm1").await, Err(VmError::VmRunning(_))));

    controller.stop("vm1", false).await.unwrap();
    assert_eq!(controller.status("vm1").await.unwrap(), RuntimeState::Stopped);
    assert_eq!(launches.load(Ordering::SeqCst), 1);

    controller.delete("vm1").await.unwrap();
    assert_eq!(controller.status("vm1").await.unwrap(), RuntimeState::NotCreated);
    assert!(!tmp.path().join("vm1").exists());
}

#[tokio::test]
async fn operations_on_missing_vm_report_not_created() {
    let tmp = tempfile::tempdir().unwrap();
    let controller = controller(tmp.path(), ScriptedHypervisor::default(), vec![]);

    assert!(matches!(controller.start("ghost", false).await, Err(VmError::NotCreated(_))));
    assert!(matches!(controller.stop("ghost", false).await, Err(VmError::NotCreated(_))));
    assert!(matches!(controller.ip("ghost").await, Err(VmError::NotCreated(_))));
    controller.delete("ghost").await.unwrap();
}
