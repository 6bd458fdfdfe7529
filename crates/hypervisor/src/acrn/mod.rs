// Copyright (c) 2023-2024 The Virtrun Authors
//
// SPDX-License-Identifier: Apache-2.0
//

mod inner;
mod uuid_pool;

pub use uuid_pool::ACRN_UUIDS;

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use persist::sandbox_persist::Persist;
use tokio::sync::{mpsc, RwLock};

use crate::device::MemoryConfig;
use crate::{
    Capabilities, DeviceType, Hypervisor, HypervisorConfig, HypervisorEvent, HypervisorState,
    VcpuThreadIds,
};
use inner::AcrnInner;

/// The partitioning-hypervisor backend: a fixed UUID pool, a prepared block
/// pool rescanned at container attach, no monitor.
pub struct Acrn {
    inner: Arc<RwLock<AcrnInner>>,
}

impl Acrn {
    pub fn new(config: HypervisorConfig) -> Self {
        Self {
            inner: Arc::new(RwLock::new(AcrnInner::new(config))),
        }
    }

    pub async fn restore(state: HypervisorState) -> Result<Self> {
        let inner = AcrnInner::restore((), state).await?;
        Ok(Self {
            inner: Arc::new(RwLock::new(inner)),
        })
    }
}

#[async_trait]
impl Hypervisor for Acrn {
    async fn prepare_vm(&self, id: &str, netns: Option<String>) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.prepare_vm(id, netns).await
    }

    async fn start_vm(&self, timeout_secs: i32) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.start_vm(timeout_secs).await
    }

    async fn stop_vm(&self, wait_only: bool) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.stop_vm(wait_only).await
    }

    async fn pause_vm(&self) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.pause_vm().await
    }

    async fn resume_vm(&self) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.resume_vm().await
    }

    async fn save_vm(&self) -> Result<()> {
        let inner = self.inner.read().await;
        inner.save_vm().await
    }

    async fn add_device(&self, device: DeviceType) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.add_device(device).await
    }

    async fn hotplug_add_device(&self, device: DeviceType) -> Result<DeviceType> {
        let mut inner = self.inner.write().await;
        inner.hotplug_add_device(device).await
    }

    async fn hotplug_remove_device(&self, device: DeviceType) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.hotplug_remove_device(device).await
    }

    async fn resize_vcpu(&self, old_vcpus: u32, new_vcpus: u32) -> Result<(u32, u32)> {
        let mut inner = self.inner.write().await;
        inner.resize_vcpu(old_vcpus, new_vcpus).await
    }

    async fn resize_memory(
        &self,
        _req_mem_mb: u32,
        _block_size_mb: u32,
        _probe: bool,
    ) -> Result<(u32, Option<MemoryConfig>)> {
        let mut inner = self.inner.write().await;
        inner.resize_memory().await
    }

    async fn get_vm_console(&self) -> Result<(String, String)> {
        let inner = self.inner.read().await;
        inner.get_vm_console()
    }

    async fn get_thread_ids(&self) -> Result<VcpuThreadIds> {
        let inner = self.inner.read().await;
        inner.get_thread_ids()
    }

    async fn get_pids(&self) -> Result<Vec<u32>> {
        let inner = self.inner.read().await;
        inner.get_pids()
    }

    async fn get_vmm_master_tid(&self) -> Result<u32> {
        let inner = self.inner.read().await;
        inner.get_vmm_master_tid()
    }

    async fn generate_socket(&self) -> Result<DeviceType> {
        let inner = self.inner.read().await;
        inner.generate_socket()
    }

    async fn check(&self) -> Result<()> {
        let inner = self.inner.read().await;
        inner.check().await
    }

    async fn capabilities(&self) -> Result<Capabilities> {
        let inner = self.inner.read().await;
        Ok(inner.capabilities())
    }

    async fn hypervisor_config(&self) -> HypervisorConfig {
        let inner = self.inner.read().await;
        inner.hypervisor_config()
    }

    async fn save_state(&self) -> Result<HypervisorState> {
        let inner = self.inner.read().await;
        inner.save().await
    }

    async fn cleanup(&self) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.cleanup().await
    }

    async fn set_event_notifier(&self, tx: mpsc::Sender<HypervisorEvent>) {
        let mut inner = self.inner.write().await;
        inner.set_event_notifier(tx);
    }
}
