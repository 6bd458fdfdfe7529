// Copyright (c) 2023-2024 The Virtrun Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::{mpsc, RwLock};

use crate::device::{DeviceType, HybridVsockConfig, MemoryConfig};
use crate::error::HypervisorError;
use crate::{
    Capabilities, CapabilityBits, Hypervisor, HypervisorConfig, HypervisorEvent, HypervisorState,
    VcpuThreadIds, VmmState, CONSOLE_PROTO_UNIX, HYPERVISOR_MOCK,
};

/// Fixed pid the mock reports.
pub const MOCK_VMM_PID: u32 = 8888;

#[derive(Default)]
struct MockInner {
    id: String,
    config: HypervisorConfig,
    state: VmmState,
    devices: Vec<DeviceType>,
    vcpus: u32,
    memory_mb: u32,
    stopped: bool,
    event_tx: Option<mpsc::Sender<HypervisorEvent>>,
}

/// No-I/O backend for orchestrator tests: accepts every operation, records
/// devices, resizes within the configured bounds.
pub struct MockHypervisor {
    inner: Arc<RwLock<MockInner>>,
}

impl MockHypervisor {
    pub fn new(config: HypervisorConfig) -> Self {
        let vcpus = config.boot_vcpus();
        let memory_mb = config.memory_info.default_memory;
        Self {
            inner: Arc::new(RwLock::new(MockInner {
                config,
                vcpus,
                memory_mb,
                ..Default::default()
            })),
        }
    }

    /// Devices recorded so far, for assertions.
    pub async fn device_count(&self) -> usize {
        self.inner.read().await.devices.len()
    }
}

#[async_trait]
impl Hypervisor for MockHypervisor {
    async fn prepare_vm(&self, id: &str, _netns: Option<String>) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.id = id.to_string();
        inner.state = VmmState::Created;
        Ok(())
    }

    async fn start_vm(&self, _timeout_secs: i32) -> Result<()> {
        let mut inner = self.inner.write().await;
        if inner.state != VmmState::Created {
            return Err(HypervisorError::NotRunning.into());
        }
        inner.state = VmmState::Running;
        Ok(())
    }

    async fn stop_vm(&self, _wait_only: bool) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.stopped = true;
        inner.state = VmmState::Stopped;
        Ok(())
    }

    async fn pause_vm(&self) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.state = VmmState::Paused;
        Ok(())
    }

    async fn resume_vm(&self) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.state = VmmState::Running;
        Ok(())
    }

    async fn save_vm(&self) -> Result<()> {
        Ok(())
    }

    async fn add_device(&self, device: DeviceType) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.devices.push(device);
        Ok(())
    }

    async fn hotplug_add_device(&self, device: DeviceType) -> Result<DeviceType> {
        let mut inner = self.inner.write().await;
        inner.devices.push(device.clone());
        Ok(device)
    }

    async fn hotplug_remove_device(&self, _device: DeviceType) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.devices.pop();
        Ok(())
    }

    async fn resize_vcpu(&self, _old_vcpus: u32, new_vcpus: u32) -> Result<(u32, u32)> {
        let mut inner = self.inner.write().await;
        let old = inner.vcpus;
        let max = inner.config.cpu_info.default_maxvcpus.max(1);
        inner.vcpus = new_vcpus.min(max).max(1);
        Ok((old, inner.vcpus))
    }

    async fn resize_memory(
        &self,
        req_mem_mb: u32,
        _block_size_mb: u32,
        probe: bool,
    ) -> Result<(u32, Option<MemoryConfig>)> {
        let mut inner = self.inner.write().await;
        let current = inner.memory_mb;
        if req_mem_mb <= current {
            return Ok((current, None));
        }
        let added = req_mem_mb - current;
        inner.memory_mb = req_mem_mb;
        Ok((
            req_mem_mb,
            Some(MemoryConfig {
                slot: 0,
                size_mb: added,
                addr: 0x1_0000_0000,
                probe,
            }),
        ))
    }

    async fn get_vm_console(&self) -> Result<(String, String)> {
        Ok((
            CONSOLE_PROTO_UNIX.to_string(),
            "/tmp/mock-console.sock".to_string(),
        ))
    }

    async fn get_thread_ids(&self) -> Result<VcpuThreadIds> {
        let inner = self.inner.read().await;
        let mut ids = VcpuThreadIds::default();
        for i in 0..inner.vcpus {
            ids.vcpus.insert(i, MOCK_VMM_PID + 1 + i);
        }
        Ok(ids)
    }

    async fn get_pids(&self) -> Result<Vec<u32>> {
        Ok(vec![MOCK_VMM_PID])
    }

    async fn get_vmm_master_tid(&self) -> Result<u32> {
        Ok(MOCK_VMM_PID)
    }

    async fn generate_socket(&self) -> Result<DeviceType> {
        Ok(DeviceType::HybridVsock(HybridVsockConfig {
            guest_cid: 3,
            uds_path: "/tmp/mock-hvsock.sock".to_string(),
        }))
    }

    async fn check(&self) -> Result<()> {
        let inner = self.inner.read().await;
        if inner.stopped {
            return Err(HypervisorError::NotRunning.into());
        }
        Ok(())
    }

    async fn capabilities(&self) -> Result<Capabilities> {
        let mut caps = Capabilities::new();
        caps.set(
            CapabilityBits::BLOCK_DEVICE_SUPPORT
                | CapabilityBits::BLOCK_DEVICE_HOTPLUG_SUPPORT
                | CapabilityBits::NET_DEVICE_HOTPLUG_SUPPORT
                | CapabilityBits::FS_SHARING_SUPPORT
                | CapabilityBits::CPU_HOTPLUG_SUPPORT
                | CapabilityBits::MEM_HOTPLUG_SUPPORT,
        );
        Ok(caps)
    }

    async fn hypervisor_config(&self) -> HypervisorConfig {
        let inner = self.inner.read().await;
        inner.config.clone()
    }

    async fn save_state(&self) -> Result<HypervisorState> {
        let inner = self.inner.read().await;
        if inner.stopped {
            return Ok(HypervisorState::default());
        }
        Ok(HypervisorState {
            hypervisor_type: HYPERVISOR_MOCK.to_string(),
            pid: Some(MOCK_VMM_PID as i32),
            config: inner.config.clone(),
            ..Default::default()
        })
    }

    async fn cleanup(&self) -> Result<()> {
        Ok(())
    }

    async fn set_event_notifier(&self, tx: mpsc::Sender<HypervisorEvent>) {
        let mut inner = self.inner.write().await;
        inner.event_tx = Some(tx);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mock_config() -> HypervisorConfig {
        let mut config = HypervisorConfig::default();
        config.cpu_info.default_maxvcpus = 8;
        config.memory_info.default_memory = 256;
        config
    }

    #[tokio::test]
    async fn test_mock_lifecycle_and_resize() {
        let mock = MockHypervisor::new(mock_config());
        mock.prepare_vm("mock-1", None).await.unwrap();
        mock.start_vm(10).await.unwrap();

        let (old, new) = mock.resize_vcpu(1, 4).await.unwrap();
        assert_eq!((old, new), (1, 4));
        // the configured maximum caps growth
        let (_, new) = mock.resize_vcpu(4, 64).await.unwrap();
        assert_eq!(new, 8);

        let (total, added) = mock.resize_memory(512, 128, true).await.unwrap();
        assert_eq!(total, 512);
        assert_eq!(added.unwrap().size_mb, 256);

        mock.stop_vm(false).await.unwrap();
        assert!(mock.check().await.is_err());
        assert!(mock.save_state().await.unwrap().hypervisor_type.is_empty());
    }
}
