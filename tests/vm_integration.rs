//! Integration tests that boot real VMs through vfkit.
//!
//! These need macOS with Virtualization.framework, `vfkit` on `PATH` and a
//! bootable installer ISO, so they are gated with the `vm-integration-tests`
//! feature flag.
//!
//! # Running
//!
//! ```bash
//! VZCTL_TEST_ISO=~/Downloads/ubuntu-24.04-live-server-arm64.iso \
//!     cargo test --features vm-integration-tests --test vm_integration
//! ```
//!
//! Host processes are the real `vzctl host` binary built by cargo. Every
//! test works in its own temporary VM root; `TestVm` force-stops its VM on
//! drop so a failing test does not leave vfkit running.

#![cfg(all(feature = "vm-integration-tests", target_os = "macos"))]

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};

use vzctl::config::Settings;
use vzctl::protocol::RuntimeState;
use vzctl::vm::controller::ProcessLauncher;
use vzctl::vm::{Controller, DescriptorInputs, GIB, check_support, derive_mac};

const VZCTL: &str = env!("CARGO_BIN_EXE_vzctl");

// ---------------------------------------------------------------------------
// Environment helpers
// ---------------------------------------------------------------------------

/// Installer ISO to boot. Set `VZCTL_TEST_ISO` or place the image at
/// `tests/fixtures/test-install.iso`.
fn test_iso() -> PathBuf {
    std::env::var("VZCTL_TEST_ISO")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            PathBuf::from(env!("CARGO_MANIFEST_DIR"))
                .join("tests")
                .join("fixtures")
                .join("test-install.iso")
        })
}

fn require_iso() -> Result<PathBuf> {
    let iso = test_iso();
    if !iso.is_file() {
        bail!(
            "Test ISO not found at {}. Set VZCTL_TEST_ISO to a bootable installer image.",
            iso.display()
        );
    }
    Ok(iso)
}

// ---------------------------------------------------------------------------
// TestVm helper
// ---------------------------------------------------------------------------

/// One VM under a private VM root.
struct TestVm {
    name: String,
    controller: Controller,
    tmp: tempfile::TempDir,
}

impl TestVm {
    fn create(name: &str) -> Result<Self> {
        let tmp = tempfile::TempDir::new().context("create temp VM root")?;
        let mut settings = Settings {
            vm_root: Some(tmp.path().to_path_buf()),
            ..Settings::default()
        };
        settings.timeouts.boot_secs = 60;
        settings.timeouts.stop_secs = 20;

        let launcher = ProcessLauncher::new(tmp.path().to_path_buf()).with_executable(PathBuf::from(VZCTL));
        let controller = Controller::new(settings).with_launcher(Arc::new(launcher));

        let mut inputs = DescriptorInputs::new(name, 2, 2 * GIB, 8 * GIB);
        inputs.install_iso = Some(require_iso()?);
        inputs.auto_install = true;
        controller.create(&inputs)?;

        Ok(Self {
            name: name.to_owned(),
            controller,
            tmp,
        })
    }

    fn root(&self) -> &Path {
        self.tmp.path()
    }

    fn dir(&self) -> PathBuf {
        self.root().join(&self.name)
    }
}

impl Drop for TestVm {
    fn drop(&mut self) {
        // Best effort through the CLI; the runtime may already be gone.
        let _ = Command::new(VZCTL)
            .args(["stop", "--force", &self.name])
            .env("VZCTL_VM_ROOT", self.root())
            .output();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[test]
fn host_supports_virtualization() {
    let report = check_support(None);
    assert!(report.supported, "{}", report.message);
}

#[tokio::test(flavor = "multi_thread")]
async fn boot_then_force_stop() -> Result<()> {
    let vm = TestVm::create("it-boot")?;
    assert_eq!(vm.controller.status(&vm.name).await?, RuntimeState::Stopped);

    let state = vm.controller.start(&vm.name, false).await?;
    assert_eq!(state, RuntimeState::Running);
    assert_eq!(vm.controller.status(&vm.name).await?, RuntimeState::Running);
    assert!(vzctl::paths::VmLayout::new(vm.root(), &vm.name).control_socket().exists());

    // A second start finds the live host and leaves it alone.
    assert_eq!(vm.controller.start(&vm.name, false).await?, RuntimeState::Running);

    vm.controller.stop(&vm.name, true).await?;
    assert_eq!(vm.controller.status(&vm.name).await?, RuntimeState::Stopped);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn console_log_and_efi_store_appear_after_boot() -> Result<()> {
    let vm = TestVm::create("it-files")?;
    vm.controller.start(&vm.name, false).await?;

    // vfkit creates the variable store on first boot.
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(vm.dir().join("efi_vars.fd").exists());
    assert!(vm.dir().join("it-files_console.log").exists());

    vm.controller.stop(&vm.name, true).await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn detached_start_reaches_running() -> Result<()> {
    let vm = TestVm::create("it-detach")?;
    let state = vm.controller.start(&vm.name, true).await?;
    assert!(matches!(state, RuntimeState::Starting | RuntimeState::Running), "{state}");

    let deadline = tokio::time::Instant::now() + Duration::from_secs(60);
    loop {
        match vm.controller.status(&vm.name).await? {
            RuntimeState::Running => break,
            RuntimeState::Starting => {}
            other => bail!("unexpected state while booting: {other}"),
        }
        if tokio::time::Instant::now() > deadline {
            bail!("VM did not reach Running");
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }

    vm.controller.stop(&vm.name, true).await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn delete_requires_stopped_vm() -> Result<()> {
    let vm = TestVm::create("it-delete")?;
    vm.controller.start(&vm.name, false).await?;

    let err = vm.controller.delete(&vm.name).await.unwrap_err();
    assert!(err.to_string().contains("stop it before deleting"), "{err}");
    assert!(vm.dir().join("vm.toml").is_file());

    vm.controller.stop(&vm.name, true).await?;
    vm.controller.delete(&vm.name).await?;
    assert!(!vm.dir().exists());
    assert_eq!(vm.controller.status(&vm.name).await?, RuntimeState::NotCreated);
    Ok(())
}

/// The installer takes a while to bring up networking; the lease carries
/// the name-derived MAC.
#[tokio::test(flavor = "multi_thread")]
#[ignore = "waits for the guest to lease an address; run with --ignored"]
async fn guest_leases_address_for_derived_mac() -> Result<()> {
    let vm = TestVm::create("it-net")?;
    vm.controller.start(&vm.name, false).await?;

    let descriptor = vzctl::vm::descriptor::load(&vzctl::paths::VmLayout::new(vm.root(), &vm.name))?;
    assert_eq!(descriptor.mac_address, derive_mac("it-net"));

    let ip = vm.controller.ip(&vm.name).await?;
    assert!(ip.is_some(), "no lease for {}", descriptor.mac_address);

    vm.controller.stop(&vm.name, true).await?;
    Ok(())
}
