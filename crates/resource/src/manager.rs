// Copyright (c) 2023-2024 The Virtrun Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use std::sync::Arc;

use agent::{Agent, LinuxResources, Storage};
use anyhow::Result;
use hypervisor::Hypervisor;
use persist::sandbox_persist::Persist;
use tokio::sync::RwLock;

use crate::manager_inner::{ManagerArgs, ResourceManagerInner};
use crate::resource_persist::ResourceState;
use crate::{ResourceController, ResourceUpdateOp};

/// Public face of resource reconciliation; one per sandbox.
pub struct ResourceManager {
    inner: Arc<RwLock<ResourceManagerInner>>,
}

impl ResourceManager {
    pub async fn new(
        sid: &str,
        agent: Arc<dyn Agent>,
        hypervisor: Arc<dyn Hypervisor>,
        controller: Arc<dyn ResourceController>,
        static_resource_mgmt: bool,
    ) -> Result<Self> {
        let args = ManagerArgs {
            sid: sid.to_string(),
            agent,
            hypervisor,
            controller,
            static_resource_mgmt,
        };
        Ok(Self {
            inner: Arc::new(RwLock::new(ResourceManagerInner::new(args).await?)),
        })
    }

    pub async fn restore(
        sid: &str,
        agent: Arc<dyn Agent>,
        hypervisor: Arc<dyn Hypervisor>,
        controller: Arc<dyn ResourceController>,
        static_resource_mgmt: bool,
        state: ResourceState,
    ) -> Result<Self> {
        let args = ManagerArgs {
            sid: sid.to_string(),
            agent,
            hypervisor,
            controller,
            static_resource_mgmt,
        };
        Ok(Self {
            inner: Arc::new(RwLock::new(
                ResourceManagerInner::restore(args, state).await?,
            )),
        })
    }

    pub async fn set_guest_details(&self, block_size_bytes: u64, support_probe: bool) {
        let inner = self.inner.read().await;
        inner
            .set_guest_details(block_size_bytes, support_probe)
            .await;
    }

    pub async fn register_ephemeral_storage(&self, storage: Storage) {
        let inner = self.inner.read().await;
        inner.register_ephemeral_storage(storage).await;
    }

    pub async fn update_linux_resource(
        &self,
        cid: &str,
        linux_resources: Option<&LinuxResources>,
        op: ResourceUpdateOp,
    ) -> Result<()> {
        let inner = self.inner.read().await;
        inner.update_linux_resource(cid, linux_resources, op).await
    }

    pub async fn current_vcpu(&self) -> u32 {
        let inner = self.inner.read().await;
        inner.cpu_resource.current_vcpu().await
    }

    pub async fn current_mem_mb(&self) -> u32 {
        let inner = self.inner.read().await;
        inner.mem_resource.current_mem_mb().await
    }

    pub async fn cleanup(&self) {
        let inner = self.inner.read().await;
        inner.cleanup().await;
    }

    pub async fn save(&self) -> Result<ResourceState> {
        let inner = self.inner.read().await;
        inner.save().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agent::mock::MockAgent;
    use agent::{LinuxCpu, LinuxMemory};
    use hypervisor::mock::MockHypervisor;
    use hypervisor::HypervisorConfig;
    use crate::NoopResourceController;

    fn test_config() -> HypervisorConfig {
        let mut config = HypervisorConfig::default();
        config.cpu_info.default_vcpus = 1.0;
        config.cpu_info.default_maxvcpus = 8;
        config.memory_info.default_memory = 256;
        config.memory_info.default_max_memory = 16384;
        config
    }

    async fn new_manager(config: &HypervisorConfig, static_mgmt: bool) -> ResourceManager {
        let hypervisor = Arc::new(MockHypervisor::new(config.clone()));
        hypervisor.prepare_vm("rm-ut", None).await.unwrap();
        hypervisor.start_vm(10).await.unwrap();
        ResourceManager::new(
            "rm-ut",
            Arc::new(MockAgent::new()),
            hypervisor,
            Arc::new(NoopResourceController::default()),
            static_mgmt,
        )
        .await
        .unwrap()
    }

    #[actix_rt::test]
    async fn test_container_add_grows_cpu_and_memory() {
        let config = test_config();
        let manager = new_manager(&config, false).await;
        manager.set_guest_details(128 << 20, false).await;

        let resources = LinuxResources {
            cpu: Some(LinuxCpu {
                quota: Some(200_000),
                period: Some(100_000),
                ..Default::default()
            }),
            memory: Some(LinuxMemory {
                limit: Some(512 << 20),
                swap: None,
                swappiness: None,
            }),
            ..Default::default()
        };

        manager
            .update_linux_resource("c1", Some(&resources), ResourceUpdateOp::Add)
            .await
            .unwrap();
        assert_eq!(manager.current_vcpu().await, 3);
        assert_eq!(manager.current_mem_mb().await, 768);
    }

    #[actix_rt::test]
    async fn test_static_resource_mgmt_blocks_updates() {
        let config = test_config();
        let manager = new_manager(&config, true).await;

        let resources = LinuxResources {
            cpu: Some(LinuxCpu {
                quota: Some(400_000),
                period: Some(100_000),
                ..Default::default()
            }),
            ..Default::default()
        };
        manager
            .update_linux_resource("c1", Some(&resources), ResourceUpdateOp::Add)
            .await
            .unwrap();
        assert_eq!(manager.current_vcpu().await, 1);
    }

    #[actix_rt::test]
    async fn test_save_restores_counters() {
        let config = test_config();
        let manager = new_manager(&config, false).await;
        manager.set_guest_details(128 << 20, false).await;

        let resources = LinuxResources {
            memory: Some(LinuxMemory {
                limit: Some(1024 << 20),
                swap: None,
                swappiness: None,
            }),
            ..Default::default()
        };
        manager
            .update_linux_resource("c1", Some(&resources), ResourceUpdateOp::Add)
            .await
            .unwrap();

        let state = manager.save().await.unwrap();
        assert_eq!(state.current_mem_mb, 1280);

        let hypervisor = Arc::new(MockHypervisor::new(test_config()));
        let restored = ResourceManager::restore(
            "rm-ut",
            Arc::new(MockAgent::new()),
            hypervisor,
            Arc::new(NoopResourceController::default()),
            false,
            state,
        )
        .await
        .unwrap();
        assert_eq!(restored.current_mem_mb().await, 1280);
    }
}
