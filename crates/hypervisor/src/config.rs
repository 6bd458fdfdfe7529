// Copyright (c) 2023-2024 The Virtrun Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use std::collections::HashMap;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::error::HypervisorError;
use crate::pci::PciePort;
use crate::{VIRTIO_BLOCK_CCW, VIRTIO_BLOCK_MMIO, VIRTIO_BLOCK_PCI, VIRTIO_PMEM, VIRTIO_SCSI};

/// Shared-FS selector values.
pub const SHARED_FS_VIRTIO_9P: &str = "virtio-9p";
pub const SHARED_FS_VIRTIO_FS: &str = "virtio-fs";
pub const SHARED_FS_VIRTIO_FS_NYDUS: &str = "virtio-fs-nydus";
pub const SHARED_FS_NONE: &str = "none";

/// Shared-FS cache modes accepted by the daemon.
pub const VIRTIO_FS_CACHE_NEVER: &str = "never";
pub const VIRTIO_FS_CACHE_AUTO: &str = "auto";
pub const VIRTIO_FS_CACHE_ALWAYS: &str = "always";

/// Asset-map keys for per-sandbox overrides of the boot assets.
pub const ASSET_KERNEL: &str = "kernel";
pub const ASSET_IMAGE: &str = "image";
pub const ASSET_INITRD: &str = "initrd";
pub const ASSET_FIRMWARE: &str = "firmware";

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct BootInfo {
    /// Guest kernel path. Always required.
    pub kernel: String,
    /// Guest rootfs disk image. Exactly one of image/initrd is used.
    pub image: String,
    pub initrd: String,
    pub firmware: String,
    /// Extra kernel command line, space separated `key=value` tokens.
    pub kernel_params: String,
    pub rootfs_type: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CpuInfo {
    /// Boot-time vCPU count; fractional values are rounded up at VM create.
    pub default_vcpus: f32,
    /// Ceiling for CPU hotplug.
    pub default_maxvcpus: u32,
    /// Pin each vCPU thread to one host CPU when the container cpusets
    /// allow an exact assignment.
    pub enable_vcpu_pinning: bool,
}

impl Default for CpuInfo {
    fn default() -> Self {
        Self {
            default_vcpus: 1.0,
            default_maxvcpus: 1,
            enable_vcpu_pinning: false,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MemoryInfo {
    /// Boot-time memory, MiB.
    pub default_memory: u32,
    /// Ceiling for memory hotplug, MiB. Zero means "no hotplug".
    pub default_max_memory: u32,
    /// Number of ACPI memory slots advertised to the guest.
    pub memory_slots: u32,
    pub enable_mem_prealloc: bool,
    pub enable_hugepages: bool,
    pub enable_virtio_mem: bool,
    /// Host-side swap for the VMM process.
    pub enable_swap: bool,
    /// Guest-side swap provisioning through hot-plugged swap disks.
    pub enable_guest_swap: bool,
    /// Back guest RAM with a shared mapping (required by virtio-fs DAX).
    pub shared_mem: bool,
    /// Optional file-backed memory directory.
    pub file_mem_backend: String,
}

impl Default for MemoryInfo {
    fn default() -> Self {
        Self {
            default_memory: 128,
            default_max_memory: 0,
            memory_slots: 10,
            enable_mem_prealloc: false,
            enable_hugepages: false,
            enable_virtio_mem: false,
            enable_swap: false,
            enable_guest_swap: false,
            shared_mem: false,
            file_mem_backend: String::new(),
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct MachineInfo {
    /// Machine type tag, e.g. "q35", "virt", "pseries", "s390-ccw-virtio".
    pub machine_type: String,
    /// Number of PCIe root ports emitted at create time.
    pub pcie_root_port: u32,
    /// Number of PCIe switch downstream ports emitted at create time.
    pub pcie_switch_port: u32,
    /// Where hot-plugged VFIO devices land.
    pub hotplug_vfio: PciePort,
    /// Where cold-plugged VFIO devices land.
    pub coldplug_vfio: PciePort,
    pub entropy_source: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct BlockDeviceInfo {
    pub block_device_driver: String,
    pub disable_block_device_use: bool,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SharedFsInfo {
    /// One of the `SHARED_FS_*` selectors; `None` maps to "none".
    pub shared_fs: Option<String>,
    /// Path of the shared-FS daemon binary.
    pub virtio_fs_daemon: String,
    pub virtio_fs_cache: String,
    pub virtio_fs_extra_args: Vec<String>,
    pub virtio_fs_queue_size: u32,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Number of bridges of the platform default kind created at boot.
    pub default_bridges: u32,
    pub enable_iommu: bool,
    /// Wire a pvpanic-style notifier into the VM.
    pub enable_guest_panic_notifier: bool,
    /// Sysfs paths of pass-through devices declared before boot; planner
    /// input.
    pub coldplug_vfio_devices: Vec<String>,
    /// vhost-user block backends declared before boot; planner input.
    pub coldplug_vhost_user_blk: u32,
    /// Network endpoints expected at boot; planner input.
    pub network_endpoints: u32,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SecurityInfo {
    pub rootless: bool,
    pub selinux_label: String,
    pub confidential_guest: bool,
    pub guest_hook_path: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DebugInfo {
    pub enable_debug: bool,
    /// Extra out-of-band monitor socket. The peer is untrusted; only honored
    /// together with `enable_debug`.
    pub extra_monitor_socket: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RateLimiterInfo {
    /// Bytes per second, zero disables.
    pub bandwidth_max_rate: u64,
    /// Operations per second, zero disables.
    pub ops_max_rate: u64,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct HypervisorConfig {
    /// VMM binary path.
    pub path: String,
    /// Control tool path (partitioning backends).
    pub ctlpath: String,
    pub boot_info: BootInfo,
    pub cpu_info: CpuInfo,
    pub memory_info: MemoryInfo,
    pub machine_info: MachineInfo,
    pub blockdev_info: BlockDeviceInfo,
    pub shared_fs: SharedFsInfo,
    pub device_info: DeviceInfo,
    pub security_info: SecurityInfo,
    pub debug_info: DebugInfo,
    pub rate_limiter: RateLimiterInfo,
    /// Boot the VM from a previously saved device-state template.
    pub boot_from_template: bool,
    pub template_path: String,
    /// Per-sandbox asset overrides, asset type -> path.
    pub custom_assets: HashMap<String, String>,
}

impl HypervisorConfig {
    /// Effective path of a boot asset, honoring per-sandbox overrides.
    pub fn asset(&self, kind: &str) -> String {
        if let Some(path) = self.custom_assets.get(kind) {
            return path.clone();
        }
        match kind {
            ASSET_KERNEL => self.boot_info.kernel.clone(),
            ASSET_IMAGE => self.boot_info.image.clone(),
            ASSET_INITRD => self.boot_info.initrd.clone(),
            ASSET_FIRMWARE => self.boot_info.firmware.clone(),
            _ => String::new(),
        }
    }

    pub fn shared_fs_kind(&self) -> &str {
        self.shared_fs
            .shared_fs
            .as_deref()
            .unwrap_or(SHARED_FS_NONE)
    }

    /// Boot vCPU count after rounding the fractional configuration value.
    pub fn boot_vcpus(&self) -> u32 {
        (self.cpu_info.default_vcpus.ceil() as u32).max(1)
    }

    pub fn validate(&self) -> Result<()> {
        if self.asset(ASSET_KERNEL).is_empty() {
            return Err(HypervisorError::Config("guest kernel is not set".to_string()).into());
        }

        let image = self.asset(ASSET_IMAGE);
        let initrd = self.asset(ASSET_INITRD);
        if !image.is_empty() && !initrd.is_empty() {
            return Err(HypervisorError::Config(
                "image and initrd are mutually exclusive".to_string(),
            )
            .into());
        }
        if image.is_empty() && initrd.is_empty() && !self.security_info.confidential_guest {
            return Err(
                HypervisorError::Config("one of image or initrd is required".to_string()).into(),
            );
        }

        match self.shared_fs.virtio_fs_cache.as_str() {
            "" | VIRTIO_FS_CACHE_NEVER | VIRTIO_FS_CACHE_AUTO | VIRTIO_FS_CACHE_ALWAYS => {}
            other => return Err(HypervisorError::InvalidCacheMode(other.to_string()).into()),
        }

        match self.blockdev_info.block_device_driver.as_str() {
            "" | VIRTIO_BLOCK_PCI | VIRTIO_BLOCK_CCW | VIRTIO_BLOCK_MMIO | VIRTIO_SCSI
            | VIRTIO_PMEM => {}
            other => {
                return Err(HypervisorError::Config(format!(
                    "unknown block device driver {:?}",
                    other
                ))
                .into())
            }
        }

        if self.cpu_info.default_vcpus <= 0.0 {
            return Err(HypervisorError::Config("default_vcpus must be > 0".to_string()).into());
        }
        if self.cpu_info.default_maxvcpus > 0
            && self.boot_vcpus() > self.cpu_info.default_maxvcpus
        {
            return Err(HypervisorError::Config(
                "default_vcpus exceeds default_maxvcpus".to_string(),
            )
            .into());
        }

        // templating snapshots device state; neither virtio-fs nor shared or
        // file-backed memory can be restored from it
        if self.boot_from_template {
            if self.shared_fs_kind() == SHARED_FS_VIRTIO_FS
                || self.shared_fs_kind() == SHARED_FS_VIRTIO_FS_NYDUS
            {
                return Err(HypervisorError::Config(
                    "boot_from_template cannot be combined with virtio-fs".to_string(),
                )
                .into());
            }
            if self.memory_info.shared_mem || !self.memory_info.file_mem_backend.is_empty() {
                return Err(HypervisorError::Config(
                    "boot_from_template cannot be combined with shared or file-backed memory"
                        .to_string(),
                )
                .into());
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> HypervisorConfig {
        let mut config = HypervisorConfig::default();
        config.boot_info.kernel = "/opt/virtrun/vmlinux".to_string();
        config.boot_info.image = "/opt/virtrun/rootfs.img".to_string();
        config
    }

    #[test]
    fn test_validate_assets() {
        let mut config = valid_config();
        assert!(config.validate().is_ok());

        config.boot_info.initrd = "/opt/virtrun/initrd.img".to_string();
        let err = config.validate().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<HypervisorError>(),
            Some(HypervisorError::Config(_))
        ));

        config.boot_info.image.clear();
        assert!(config.validate().is_ok());

        config.boot_info.kernel.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_cache_mode() {
        let mut config = valid_config();
        config.shared_fs.virtio_fs_cache = "always".to_string();
        assert!(config.validate().is_ok());

        config.shared_fs.virtio_fs_cache = "write-back".to_string();
        let err = config.validate().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<HypervisorError>(),
            Some(HypervisorError::InvalidCacheMode(_))
        ));
    }

    #[test]
    fn test_validate_template_conflicts() {
        let mut config = valid_config();
        config.boot_from_template = true;
        config.shared_fs.shared_fs = Some(SHARED_FS_VIRTIO_FS.to_string());
        assert!(config.validate().is_err());

        config.shared_fs.shared_fs = Some(SHARED_FS_NONE.to_string());
        config.memory_info.shared_mem = true;
        assert!(config.validate().is_err());

        config.memory_info.shared_mem = false;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_custom_asset_override() {
        let mut config = valid_config();
        config
            .custom_assets
            .insert(ASSET_KERNEL.to_string(), "/custom/vmlinux".to_string());
        assert_eq!(config.asset(ASSET_KERNEL), "/custom/vmlinux");
        assert_eq!(config.asset(ASSET_IMAGE), "/opt/virtrun/rootfs.img");
    }

    #[test]
    fn test_boot_vcpus_rounds_fractional() {
        let mut config = valid_config();
        config.cpu_info.default_vcpus = 0.5;
        assert_eq!(config.boot_vcpus(), 1);
        config.cpu_info.default_vcpus = 2.3;
        assert_eq!(config.boot_vcpus(), 3);
    }
}
