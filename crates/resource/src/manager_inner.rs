// Copyright (c) 2023-2024 The Virtrun Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use std::sync::Arc;

use agent::{Agent, LinuxResources, Storage};
use anyhow::{Context, Result};
use async_trait::async_trait;
use hypervisor::Hypervisor;
use persist::sandbox_persist::Persist;
use tokio::sync::RwLock;

use crate::cpu_mem::{CpuResource, MemResource};
use crate::resource_persist::ResourceState;
use crate::{ResourceController, ResourceUpdateOp};

pub(crate) struct ManagerArgs {
    pub sid: String,
    pub agent: Arc<dyn Agent>,
    pub hypervisor: Arc<dyn Hypervisor>,
    pub controller: Arc<dyn ResourceController>,
    pub static_resource_mgmt: bool,
}

pub(crate) struct ResourceManagerInner {
    sid: String,
    agent: Arc<dyn Agent>,
    hypervisor: Arc<dyn Hypervisor>,
    controller: Arc<dyn ResourceController>,
    static_resource_mgmt: bool,

    pub cpu_resource: CpuResource,
    pub mem_resource: MemResource,

    /// Guest memory block granularity, learned from the agent after boot.
    guest_block_size_mb: RwLock<u32>,
    /// The guest onlines hot-added memory by probing addresses.
    use_mem_hotplug_probe: RwLock<bool>,
}

impl ResourceManagerInner {
    pub(crate) async fn new(args: ManagerArgs) -> Result<Self> {
        let config = args.hypervisor.hypervisor_config().await;
        Ok(Self {
            cpu_resource: CpuResource::new(&config),
            mem_resource: MemResource::new(&args.sid, &config),
            sid: args.sid,
            agent: args.agent,
            hypervisor: args.hypervisor,
            controller: args.controller,
            static_resource_mgmt: args.static_resource_mgmt,
            guest_block_size_mb: RwLock::new(0),
            use_mem_hotplug_probe: RwLock::new(false),
        })
    }

    pub fn sid(&self) -> &str {
        &self.sid
    }

    /// Record what the agent reported after boot; memory reconciliation
    /// honors both from then on.
    pub async fn set_guest_details(&self, block_size_bytes: u64, support_probe: bool) {
        *self.guest_block_size_mb.write().await = (block_size_bytes >> 20) as u32;
        *self.use_mem_hotplug_probe.write().await = support_probe;
    }

    pub async fn register_ephemeral_storage(&self, storage: Storage) {
        self.mem_resource.register_ephemeral_storage(storage).await;
    }

    /// Reconcile vCPUs, memory and swap after a container change.
    pub async fn update_linux_resource(
        &self,
        cid: &str,
        linux_resources: Option<&LinuxResources>,
        op: ResourceUpdateOp,
    ) -> Result<()> {
        if self.static_resource_mgmt {
            warn!(sl!(), "static resource management is on, no update allowed");
            return Ok(());
        }

        let caps = self.hypervisor.capabilities().await?;
        if caps.is_cpu_hotplug_supported() {
            self.cpu_resource
                .update_cpu_resources(
                    cid,
                    linux_resources.and_then(|r| r.cpu.as_ref()),
                    op,
                    self.hypervisor.as_ref(),
                    self.agent.as_ref(),
                    self.controller.as_ref(),
                )
                .await
                .context("update cpu resources")?;
        }

        if caps.is_mem_hotplug_supported() {
            let block_size_mb = *self.guest_block_size_mb.read().await;
            let use_probe = *self.use_mem_hotplug_probe.read().await;
            self.mem_resource
                .update_mem_resources(
                    cid,
                    linux_resources,
                    op,
                    self.hypervisor.as_ref(),
                    self.agent.as_ref(),
                    block_size_mb,
                    use_probe,
                )
                .await
                .context("update memory resources")?;
        }

        Ok(())
    }

    pub async fn cleanup(&self) {
        self.mem_resource.swap().clean().await;
    }
}

#[async_trait]
impl Persist for ResourceManagerInner {
    type State = ResourceState;
    type ConstructorArgs = ManagerArgs;

    async fn save(&self) -> Result<Self::State> {
        Ok(ResourceState {
            swap_devices: self.mem_resource.swap().devices().await,
            current_vcpu: self.cpu_resource.current_vcpu().await,
            current_mem_mb: self.mem_resource.current_mem_mb().await,
        })
    }

    async fn restore(args: Self::ConstructorArgs, state: Self::State) -> Result<Self> {
        let inner = ResourceManagerInner::new(args).await?;
        *inner.cpu_resource.current_vcpu.write().await = state.current_vcpu;
        *inner.mem_resource.current_mem_mb.write().await = state.current_mem_mb;
        inner
            .mem_resource
            .swap()
            .set_devices(state.swap_devices)
            .await;
        Ok(inner)
    }
}
