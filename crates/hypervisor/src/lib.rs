// Copyright (c) 2023-2024 The Virtrun Authors
//
// SPDX-License-Identifier: Apache-2.0
//

#[macro_use]
extern crate slog;

logging::logger_with_subsystem!(sl, "hypervisor");

pub mod acrn;
pub mod config;
pub mod device;
pub mod error;
mod hypervisor_persist;
pub mod kernel_param;
pub mod micro;
pub mod mock;
pub mod pci;
pub mod qemu;
pub mod share_fs;
pub mod utils;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

pub use config::HypervisorConfig;
pub use device::DeviceType;
pub use error::HypervisorError;
pub use hypervisor_persist::HypervisorState;
pub use kernel_param::{KernelParams, Param};

/// Hypervisor kind tags accepted by [`new_hypervisor`].
pub const HYPERVISOR_QEMU: &str = "qemu";
pub const HYPERVISOR_ACRN: &str = "acrn";
pub const HYPERVISOR_MICROVM: &str = "microvm";
pub const HYPERVISOR_REMOTE: &str = "remote";
pub const HYPERVISOR_MOCK: &str = "mock";

/// Rootfs drivers.
pub const VM_ROOTFS_DRIVER_BLK: &str = "virtio-blk-pci";
pub const VM_ROOTFS_DRIVER_PMEM: &str = "virtio-pmem";

/// Block device drivers.
pub const VIRTIO_BLOCK_PCI: &str = "virtio-blk-pci";
pub const VIRTIO_BLOCK_CCW: &str = "virtio-blk-ccw";
pub const VIRTIO_BLOCK_MMIO: &str = "virtio-blk-mmio";
pub const VIRTIO_SCSI: &str = "virtio-scsi";
pub const VIRTIO_PMEM: &str = "nvdimm";

/// Well-known files inside a sandbox's VM directory.
pub const VM_PID_FILE: &str = "pid";
pub const CONSOLE_SOCK: &str = "console.sock";
pub const QMP_SOCK: &str = "qmp.sock";
pub const VHOST_FS_SOCK: &str = "vhost-fs.sock";
pub const NYDUSD_API_SOCK: &str = "nydusd-api.sock";
pub const CPU_AFFINITY_IDX_FILE: &str = "cpu_affinity_idx";

/// Console transport of [`Hypervisor::get_vm_console`].
pub const CONSOLE_PROTO_UNIX: &str = "unix";
pub const CONSOLE_PROTO_PTY: &str = "pty";

bitflags::bitflags! {
    #[derive(Default)]
    pub struct CapabilityBits: u32 {
        const BLOCK_DEVICE_SUPPORT = 0b1;
        const BLOCK_DEVICE_HOTPLUG_SUPPORT = 0b10;
        const NET_DEVICE_HOTPLUG_SUPPORT = 0b100;
        const VFIO_HOTPLUG_SUPPORT = 0b1000;
        const MULTI_QUEUE_SUPPORT = 0b1_0000;
        const FS_SHARING_SUPPORT = 0b10_0000;
        const CPU_HOTPLUG_SUPPORT = 0b100_0000;
        const MEM_HOTPLUG_SUPPORT = 0b1000_0000;
        const VM_TEMPLATE_SUPPORT = 0b1_0000_0000;
    }
}

/// What the current backend can do; the orchestrator checks these before
/// issuing backend-dependent operations.
#[derive(Clone, Copy, Debug, Default)]
pub struct Capabilities {
    flags: CapabilityBits,
}

impl Capabilities {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, flags: CapabilityBits) {
        self.flags = flags;
    }

    pub fn add(&mut self, flags: CapabilityBits) {
        self.flags |= flags;
    }

    pub fn is_block_device_hotplug_supported(&self) -> bool {
        self.flags.contains(CapabilityBits::BLOCK_DEVICE_HOTPLUG_SUPPORT)
    }

    pub fn is_net_device_hotplug_supported(&self) -> bool {
        self.flags.contains(CapabilityBits::NET_DEVICE_HOTPLUG_SUPPORT)
    }

    pub fn is_vfio_hotplug_supported(&self) -> bool {
        self.flags.contains(CapabilityBits::VFIO_HOTPLUG_SUPPORT)
    }

    pub fn is_fs_sharing_supported(&self) -> bool {
        self.flags.contains(CapabilityBits::FS_SHARING_SUPPORT)
    }

    pub fn is_cpu_hotplug_supported(&self) -> bool {
        self.flags.contains(CapabilityBits::CPU_HOTPLUG_SUPPORT)
    }

    pub fn is_mem_hotplug_supported(&self) -> bool {
        self.flags.contains(CapabilityBits::MEM_HOTPLUG_SUPPORT)
    }

    pub fn is_vm_template_supported(&self) -> bool {
        self.flags.contains(CapabilityBits::VM_TEMPLATE_SUPPORT)
    }
}

/// vCPU index -> host thread id, as reported by the monitor.
#[derive(Clone, Debug, Default)]
pub struct VcpuThreadIds {
    pub vcpus: HashMap<u32, u32>,
}

/// Lifecycle of one backend instance. `Stopped` is terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VmmState {
    NotReady,
    Created,
    Running,
    Paused,
    Stopped,
}

impl Default for VmmState {
    fn default() -> Self {
        VmmState::NotReady
    }
}

/// Out-of-band conditions surfaced to the sandbox owner through the channel
/// registered with [`Hypervisor::set_event_notifier`]. Handlers enqueue a
/// sandbox stop instead of re-entering the hypervisor synchronously.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HypervisorEvent {
    VmmExited(Option<i32>),
    GuestPanicked,
    ShareFsDaemonExited,
}

/// The hypervisor capability consumed by the sandbox orchestrator.
///
/// Lifecycle: `prepare_vm` -> `start_vm` -> (`pause_vm` <-> `resume_vm`) ->
/// `stop_vm`. Once stopped, every operation except `save_state` and
/// `cleanup` fails with [`HypervisorError::NotRunning`]; `save_state`
/// returns an empty record.
#[async_trait]
pub trait Hypervisor: Send + Sync {
    // vm lifecycle
    async fn prepare_vm(&self, id: &str, netns: Option<String>) -> Result<()>;
    async fn start_vm(&self, timeout_secs: i32) -> Result<()>;
    async fn stop_vm(&self, wait_only: bool) -> Result<()>;
    async fn pause_vm(&self) -> Result<()>;
    async fn resume_vm(&self) -> Result<()>;
    /// Save device state to the configured template path.
    async fn save_vm(&self) -> Result<()>;

    // devices
    /// Append to the build-time device list; only valid before `start_vm`.
    async fn add_device(&self, device: DeviceType) -> Result<()>;
    /// Plug while running; the returned descriptor carries the assigned
    /// guest identity (PCI path, CCW devno, SCSI address).
    async fn hotplug_add_device(&self, device: DeviceType) -> Result<DeviceType>;
    async fn hotplug_remove_device(&self, device: DeviceType) -> Result<()>;

    // resources
    async fn resize_vcpu(&self, old_vcpus: u32, new_vcpus: u32) -> Result<(u32, u32)>;
    /// Returns the resulting memory size and, when a module was added with
    /// probing requested, its description for the agent.
    async fn resize_memory(
        &self,
        req_mem_mb: u32,
        block_size_mb: u32,
        probe: bool,
    ) -> Result<(u32, Option<device::MemoryConfig>)>;

    // introspection
    /// Returns `(protocol, url)` of the VM console.
    async fn get_vm_console(&self) -> Result<(String, String)>;
    async fn get_thread_ids(&self) -> Result<VcpuThreadIds>;
    async fn get_pids(&self) -> Result<Vec<u32>>;
    async fn get_vmm_master_tid(&self) -> Result<u32>;
    /// Agent transport descriptor appropriate for this backend.
    async fn generate_socket(&self) -> Result<DeviceType>;
    /// Liveness probe of the VMM process and, when present, the monitor.
    async fn check(&self) -> Result<()>;
    async fn capabilities(&self) -> Result<Capabilities>;
    async fn hypervisor_config(&self) -> HypervisorConfig;

    // persistence and teardown
    async fn save_state(&self) -> Result<HypervisorState>;
    async fn cleanup(&self) -> Result<()>;
    async fn set_event_notifier(&self, tx: mpsc::Sender<HypervisorEvent>);
}

/// Build a backend from its kind tag.
pub fn new_hypervisor(kind: &str, config: HypervisorConfig) -> Result<Arc<dyn Hypervisor>> {
    match kind {
        HYPERVISOR_QEMU => Ok(Arc::new(qemu::Qemu::new(config))),
        HYPERVISOR_ACRN => Ok(Arc::new(acrn::Acrn::new(config))),
        HYPERVISOR_MICROVM => Ok(Arc::new(micro::MicroVmm::new(config))),
        HYPERVISOR_MOCK => Ok(Arc::new(mock::MockHypervisor::new(config))),
        HYPERVISOR_REMOTE => Err(HypervisorError::Unsupported(
            "remote hypervisor driver is not built in".to_string(),
        )
        .into()),
        _ => Err(HypervisorError::Config(format!("unknown hypervisor kind {:?}", kind)).into()),
    }
}

/// Rebuild a backend from a persisted record.
pub async fn restore_hypervisor(state: HypervisorState) -> Result<Arc<dyn Hypervisor>> {
    match state.hypervisor_type.as_str() {
        HYPERVISOR_QEMU => Ok(Arc::new(qemu::Qemu::restore(state).await?)),
        HYPERVISOR_ACRN => Ok(Arc::new(acrn::Acrn::restore(state).await?)),
        HYPERVISOR_MICROVM => Ok(Arc::new(micro::MicroVmm::restore(state).await?)),
        HYPERVISOR_MOCK => Ok(Arc::new(mock::MockHypervisor::new(state.config))),
        other => {
            Err(HypervisorError::Config(format!("unknown hypervisor kind {:?}", other)).into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_hypervisor_rejects_unknown_kind() {
        let err = new_hypervisor("no-such-vmm", HypervisorConfig::default())
            .err()
            .unwrap();
        assert!(matches!(
            err.downcast_ref::<HypervisorError>(),
            Some(HypervisorError::Config(_))
        ));

        let err = new_hypervisor(HYPERVISOR_REMOTE, HypervisorConfig::default())
            .err()
            .unwrap();
        assert!(matches!(
            err.downcast_ref::<HypervisorError>(),
            Some(HypervisorError::Unsupported(_))
        ));
    }

    #[test]
    fn test_capabilities_flags() {
        let mut caps = Capabilities::new();
        assert!(!caps.is_block_device_hotplug_supported());
        caps.set(
            CapabilityBits::BLOCK_DEVICE_HOTPLUG_SUPPORT | CapabilityBits::FS_SHARING_SUPPORT,
        );
        assert!(caps.is_block_device_hotplug_supported());
        assert!(caps.is_fs_sharing_supported());
        assert!(!caps.is_vfio_hotplug_supported());
        caps.add(CapabilityBits::VFIO_HOTPLUG_SUPPORT);
        assert!(caps.is_vfio_hotplug_supported());
    }
}
