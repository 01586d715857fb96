//! Device plan: the framework configuration for one VM as plain data.
//!
//! A [`DevicePlan`] is built from a [`Descriptor`] in a fixed order, checked
//! by [`DevicePlan::validate`] before any framework process exists, and only
//! then rendered into hypervisor arguments.
//!
//! Storage order decides boot priority:
//!
//! ```text
//! 1. main disk          read-write
//! 2. install ISO        read-only, if present
//! 3. cloud-init ISO     read-only, if present
//! ```

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::VmError;
use crate::vm::descriptor::{Descriptor, MIB, MIN_MEMORY_BYTES};
use crate::vm::network::MacAddress;

pub const DISPLAY_WIDTH: u32 = 800;
pub const DISPLAY_HEIGHT: u32 = 600;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageKind {
    Disk,
    InstallMedia,
    CloudInit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputKind {
    Keyboard,
    Pointing,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Device {
    Storage {
        path: PathBuf,
        read_only: bool,
        kind: StorageKind,
    },
    /// NAT-attached NIC.
    Network { mac: MacAddress },
    /// Serial console appended to `log_path`.
    Console { log_path: PathBuf },
    Entropy,
    Input(InputKind),
    Graphics { width: u32, height: u32 },
    Audio,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DevicePlan {
    pub name: String,
    pub cpu_count: u32,
    pub memory_bytes: u64,
    pub efi_vars_path: PathBuf,
    pub devices: Vec<Device>,
}

impl DevicePlan {
    pub fn from_descriptor(descriptor: &Descriptor) -> Self {
        let mut devices = vec![Device::Storage {
            path: descriptor.disk_path.clone(),
            read_only: false,
            kind: StorageKind::Disk,
        }];
        if let Some(iso) = &descriptor.install_iso_path {
            devices.push(Device::Storage {
                path: iso.clone(),
                read_only: true,
                kind: StorageKind::InstallMedia,
            });
        }
        if let Some(iso) = &descriptor.cloud_init_iso_path {
            devices.push(Device::Storage {
                path: iso.clone(),
                read_only: true,
                kind: StorageKind::CloudInit,
            });
        }
        devices.extend([
            Device::Network {
                mac: descriptor.mac_address,
            },
            Device::Entropy,
            Device::Input(InputKind::Keyboard),
            Device::Input(InputKind::Pointing),
            Device::Graphics {
                width: DISPLAY_WIDTH,
                height: DISPLAY_HEIGHT,
            },
            Device::Audio,
            Device::Console {
                log_path: descriptor.console_log_path.clone(),
            },
        ]);

        Self {
            name: descriptor.name.clone(),
            cpu_count: descriptor.cpu_count,
            memory_bytes: descriptor.memory_bytes,
            efi_vars_path: descriptor.efi_vars_path.clone(),
            devices,
        }
    }

    pub fn storage(&self) -> impl Iterator<Item = (&Path, bool, StorageKind)> {
        self.devices.iter().filter_map(|d| match d {
            Device::Storage {
                path,
                read_only,
                kind,
            } => Some((path.as_path(), *read_only, *kind)),
            _ => None,
        })
    }

    /// Reject malformed combinations (`ConfigurationInvalid`) and missing
    /// images (`DeviceAttachFailed`).
    pub fn validate(&self) -> Result<(), VmError> {
        let invalid = |msg: String| Err(VmError::ConfigurationInvalid(msg));

        if self.cpu_count == 0 {
            return invalid("at least one CPU is required".into());
        }
        if self.memory_bytes < MIN_MEMORY_BYTES {
            return invalid(format!(
                "memory {} MiB is below the {} MiB minimum",
                self.memory_bytes / MIB,
                MIN_MEMORY_BYTES / MIB
            ));
        }

        match self.storage().next() {
            Some((_, false, StorageKind::Disk)) => {}
            _ => return invalid("the first storage device must be the writable main disk".into()),
        }
        let mut seen = HashSet::new();
        for (path, read_only, kind) in self.storage() {
            if !seen.insert(path) {
                return invalid(format!("{} is attached more than once", path.display()));
            }
            if kind != StorageKind::Disk && !read_only {
                return invalid(format!("{} must be attached read-only", path.display()));
            }
        }
        if self.storage().filter(|(_, _, k)| *k == StorageKind::Disk).count() != 1 {
            return invalid("exactly one main disk is required".into());
        }

        let count = |f: fn(&Device) -> bool| self.devices.iter().filter(|d| f(d)).count();
        if count(|d| matches!(d, Device::Network { .. })) != 1 {
            return invalid("exactly one network device is required".into());
        }
        if count(|d| matches!(d, Device::Console { .. })) > 1 {
            return invalid("at most one console device is allowed".into());
        }
        for device in &self.devices {
            if let Device::Graphics { width, height } = device {
                if *width == 0 || *height == 0 {
                    return invalid(format!("invalid display size {width}x{height}"));
                }
            }
        }

        for (path, _, kind) in self.storage() {
            if !path.exists() {
                return Err(VmError::DeviceAttachFailed(format!(
                    "{kind:?} image {} does not exist",
                    path.display()
                )));
            }
        }
        if let Some(Device::Console { log_path }) =
            self.devices.iter().find(|d| matches!(d, Device::Console { .. }))
        {
            let parent_ok = log_path.parent().is_some_and(Path::is_dir);
            if !parent_ok {
                return Err(VmError::DeviceAttachFailed(format!(
                    "console log directory for {} does not exist",
                    log_path.display()
                )));
            }
        }
        Ok(())
    }

    /// vfkit command-line arguments for this plan, excluding the REST
    /// endpoint which the adapter owns.
    pub fn vfkit_args(&self) -> Vec<String> {
        let mut bootloader = format!("efi,variable-store={}", self.efi_vars_path.display());
        if !self.efi_vars_path.exists() {
            bootloader.push_str(",create");
        }

        let mut args = vec![
            "--cpus".to_owned(),
            self.cpu_count.to_string(),
            "--memory".to_owned(),
            (self.memory_bytes / MIB).to_string(),
            "--bootloader".to_owned(),
            bootloader,
        ];

        for device in &self.devices {
            let spec = match device {
                Device::Storage {
                    path,
                    kind: StorageKind::Disk,
                    ..
                } => format!("virtio-blk,path={}", path.display()),
                Device::Storage { path, read_only, .. } => {
                    let mut spec = format!("usb-mass-storage,path={}", path.display());
                    if *read_only {
                        spec.push_str(",readonly");
                    }
                    spec
                }
                Device::Network { mac } => format!("virtio-net,nat,mac={mac}"),
                Device::Console { log_path } => {
                    format!("virtio-serial,logFilePath={}", log_path.display())
                }
                Device::Entropy => "virtio-rng".to_owned(),
                Device::Input(InputKind::Keyboard) => "virtio-input,keyboard".to_owned(),
                Device::Input(InputKind::Pointing) => "virtio-input,pointing".to_owned(),
                Device::Graphics { width, height } => {
                    format!("virtio-gpu,width={width},height={height}")
                }
                Device::Audio => {
                    debug!(vm = %self.name, "vfkit has no sound device; skipping audio");
                    continue;
                }
            };
            args.push("--device".to_owned());
            args.push(spec);
        }
        args
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paths::VmLayout;
    use crate::vm::descriptor::{DescriptorInputs, GIB};

    fn descriptor(root: &Path, install: bool, cloud_init: bool) -> Descriptor {
        let layout = VmLayout::new(root, "vm1");
        let mut inputs = DescriptorInputs::new("vm1", 2, 4 * GIB, 20 * GIB);
        inputs.auto_install = cloud_init;
        let mut d = Descriptor::from_inputs(&inputs, &layout);
        if install {
            d.install_iso_path = Some(layout.install_iso());
        }
        d
    }

    fn touch_images(d: &Descriptor) {
        std::fs::create_dir_all(d.disk_path.parent().unwrap()).unwrap();
        for path in [Some(&d.disk_path), d.install_iso_path.as_ref(), d.cloud_init_iso_path.as_ref()]
            .into_iter()
            .flatten()
        {
            std::fs::write(path, b"").unwrap();
        }
    }

    #[test]
    fn storage_order_is_disk_install_cloud_init() {
        let tmp = tempfile::tempdir().unwrap();
        let plan = DevicePlan::from_descriptor(&descriptor(tmp.path(), true, true));
        let kinds: Vec<_> = plan.storage().map(|(_, _, k)| k).collect();
        assert_eq!(
            kinds,
            vec![StorageKind::Disk, StorageKind::InstallMedia, StorageKind::CloudInit]
        );
    }

    #[test]
    fn complete_plan_validates() {
        let tmp = tempfile::tempdir().unwrap();
        let d = descriptor(tmp.path(), true, true);
        touch_images(&d);
        DevicePlan::from_descriptor(&d).validate().unwrap();
    }

    #[test]
    fn missing_image_fails_attach() {
        let tmp = tempfile::tempdir().unwrap();
        let d = descriptor(tmp.path(), false, true);
        touch_images(&d);
        std::fs::remove_file(d.cloud_init_iso_path.as_ref().unwrap()).unwrap();

        let err = DevicePlan::from_descriptor(&d).validate().unwrap_err();
        assert!(matches!(err, VmError::DeviceAttachFailed(_)), "{err}");
    }

    #[test]
    fn structural_problems_are_configuration_invalid() {
        let tmp = tempfile::tempdir().unwrap();
        let d = descriptor(tmp.path(), false, false);
        touch_images(&d);
        let plan = DevicePlan::from_descriptor(&d);

        let mut two_nics = plan.clone();
        two_nics.devices.push(Device::Network { mac: d.mac_address });
        assert!(matches!(two_nics.validate(), Err(VmError::ConfigurationInvalid(_))));

        let mut iso_first = plan.clone();
        iso_first.devices.insert(
            0,
            Device::Storage {
                path: d.disk_path.with_extension("iso"),
                read_only: true,
                kind: StorageKind::InstallMedia,
            },
        );
        assert!(matches!(iso_first.validate(), Err(VmError::ConfigurationInvalid(_))));

        let mut duplicate = plan.clone();
        duplicate.devices.push(Device::Storage {
            path: d.disk_path.clone(),
            read_only: true,
            kind: StorageKind::InstallMedia,
        });
        assert!(matches!(duplicate.validate(), Err(VmError::ConfigurationInvalid(_))));

        let mut no_cpu = plan;
        no_cpu.cpu_count = 0;
        assert!(matches!(no_cpu.validate(), Err(VmError::ConfigurationInvalid(_))));
    }

    #[test]
    fn vfkit_args_render_every_supported_device() {
        let tmp = tempfile::tempdir().unwrap();
        let d = descriptor(tmp.path(), true, false);
        let args = DevicePlan::from_descriptor(&d).vfkit_args();

        assert_eq!(&args[..4], ["--cpus", "2", "--memory", "4096"]);
        assert!(args[5].starts_with("efi,variable-store="));
        assert!(args[5].ends_with(",create"));

        let devices: Vec<&str> = args
            .windows(2)
            .filter(|w| w[0] == "--device")
            .map(|w| w[1].as_str())
            .collect();
        assert!(devices[0].starts_with("virtio-blk,path="));
        assert!(devices[1].starts_with("usb-mass-storage,path="));
        assert!(devices[1].ends_with(",readonly"));
        assert_eq!(devices[2], format!("virtio-net,nat,mac={}", d.mac_address));
        assert!(devices.contains(&"virtio-rng"));
        assert!(devices.contains(&"virtio-gpu,width=800,height=600"));
        assert!(devices.last().unwrap().starts_with("virtio-serial,logFilePath="));
    }
}
