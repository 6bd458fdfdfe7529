// Copyright (c) 2023-2024 The Virtrun Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use std::collections::HashMap;
use std::sync::Arc;

use agent::{
    Agent, LinuxResources, MemHotplugByProbeRequest, OnlineCPUMemRequest, Storage,
    UpdateMountsRequest,
};
use anyhow::{Context, Result};
use hypervisor::Hypervisor;
use tokio::sync::RwLock;

use crate::cpu_mem::{SwapResource, MIB_TO_BYTES_SHIFT};
use crate::ResourceUpdateOp;

/// ACPI hotplug needs free guest memory for struct pages; experience puts
/// the safe single-step growth at 48x what the guest already has.
const ACPI_MEMORY_HOTPLUG_FACTOR: u32 = 48;

#[derive(Clone)]
pub struct MemResource {
    /// Boot memory, the reconciliation baseline.
    orig_default_mem_mb: u32,
    pub(crate) current_mem_mb: Arc<RwLock<u32>>,
    container_mem_resources: Arc<RwLock<HashMap<String, LinuxResources>>>,
    /// Tmpfs mounts without an explicit size follow the sandbox total.
    ephemeral_storages: Arc<RwLock<Vec<Storage>>>,
    use_guest_swap: bool,
    swap: SwapResource,
}

impl MemResource {
    pub fn new(sid: &str, config: &hypervisor::HypervisorConfig) -> Self {
        Self {
            orig_default_mem_mb: config.memory_info.default_memory,
            current_mem_mb: Arc::new(RwLock::new(config.memory_info.default_memory)),
            container_mem_resources: Arc::new(RwLock::new(HashMap::new())),
            ephemeral_storages: Arc::new(RwLock::new(Vec::new())),
            use_guest_swap: config.memory_info.enable_guest_swap,
            swap: SwapResource::new(sid),
        }
    }

    pub async fn current_mem_mb(&self) -> u32 {
        *self.current_mem_mb.read().await
    }

    pub(crate) fn swap(&self) -> &SwapResource {
        &self.swap
    }

    /// Tmpfs mounts registered here are re-sized on every memory change.
    pub async fn register_ephemeral_storage(&self, storage: Storage) {
        self.ephemeral_storages.write().await.push(storage);
    }

    pub async fn update_mem_resources(
        &self,
        cid: &str,
        linux_resources: Option<&LinuxResources>,
        op: ResourceUpdateOp,
        hypervisor: &dyn Hypervisor,
        agent: &dyn Agent,
        block_size_mb: u32,
        use_probe: bool,
    ) -> Result<()> {
        self.update_container_mem_resources(cid, linux_resources, op)
            .await
            .context("update container memory resources")?;

        let (mut mem_sb_mb, swap_sb_mb) = self.total_mems().await;
        mem_sb_mb += self.orig_default_mem_mb;
        info!(sl!(), "computed sandbox memory demand";
            "mem_mb" => mem_sb_mb, "swap_mb" => swap_sb_mb);

        if swap_sb_mb > 0 {
            self.swap
                .provision(swap_sb_mb, hypervisor, agent)
                .await
                .context("provision guest swap")?;
        }

        self.do_update_mem_resource(mem_sb_mb, hypervisor, agent, block_size_mb, use_probe)
            .await
            .context("update memory resource")?;

        self.update_ephemeral_storages(agent)
            .await
            .context("resize ephemeral storages")?;
        Ok(())
    }

    /// Memory demand and swap demand, MiB. A container with swap enabled
    /// but no memory limit flips sandbox-level swap sized by the baseline.
    async fn total_mems(&self) -> (u32, u32) {
        let mut mem_bytes = 0u64;
        let mut swap_bytes = 0u64;
        let mut need_sandbox_swap = false;

        let resources = self.container_mem_resources.read().await;
        for (_, r) in resources.iter() {
            for l in &r.hugepage_limits {
                mem_bytes += l.limit;
            }

            if let Some(memory) = &r.memory {
                let limit = memory.limit.unwrap_or(0).max(0);
                if limit > 0 {
                    mem_bytes += limit as u64;
                }

                if self.use_guest_swap && memory.swappiness.unwrap_or(0) > 0 {
                    if limit > 0 {
                        let swap_limit = memory.swap.unwrap_or(0).max(0);
                        swap_bytes += std::cmp::max(swap_limit - limit, limit) as u64;
                    } else {
                        need_sandbox_swap = true;
                    }
                }
            }
        }
        drop(resources);

        let mut swap_mb = (swap_bytes >> MIB_TO_BYTES_SHIFT) as u32;
        if need_sandbox_swap {
            // no limit to derive from; reserve a baseline-sized chunk
            swap_mb += self.orig_default_mem_mb;
        }
        ((mem_bytes >> MIB_TO_BYTES_SHIFT) as u32, swap_mb)
    }

    async fn update_container_mem_resources(
        &self,
        cid: &str,
        linux_resources: Option<&LinuxResources>,
        op: ResourceUpdateOp,
    ) -> Result<()> {
        let mut resources = self.container_mem_resources.write().await;
        match op {
            ResourceUpdateOp::Add | ResourceUpdateOp::Update => {
                if let Some(r) = linux_resources {
                    resources.insert(cid.to_owned(), r.clone());
                }
            }
            ResourceUpdateOp::Del => {
                resources.remove(cid);
            }
        }
        Ok(())
    }

    /// Grow toward `end_mb` in bounded steps. ACPI hotplug caps one step at
    /// 48x the present size; virtio-mem takes the whole delta at once (the
    /// backend handles it internally).
    async fn do_update_mem_resource(
        &self,
        end_mb: u32,
        hypervisor: &dyn Hypervisor,
        agent: &dyn Agent,
        block_size_mb: u32,
        use_probe: bool,
    ) -> Result<()> {
        let virtio_mem = hypervisor
            .hypervisor_config()
            .await
            .memory_info
            .enable_virtio_mem;

        let mut grew = false;
        loop {
            let current_mb = self.current_mem_mb().await;
            if end_mb <= current_mb {
                // hot-remove is not available; the backend logs and keeps
                // its size, so one call settles it
                if end_mb < current_mb {
                    let (now_mb, _) = hypervisor
                        .resize_memory(end_mb, block_size_mb, use_probe)
                        .await
                        .context("resize memory")?;
                    *self.current_mem_mb.write().await = now_mb;
                }
                break;
            }

            let max_step_mb = if virtio_mem {
                end_mb
            } else {
                current_mb.saturating_mul(ACPI_MEMORY_HOTPLUG_FACTOR)
            };
            let step_target_mb = std::cmp::min(end_mb, current_mb + max_step_mb);

            let (now_mb, added) = hypervisor
                .resize_memory(step_target_mb, block_size_mb, use_probe)
                .await
                .context("resize memory")?;
            *self.current_mem_mb.write().await = now_mb;
            grew = true;

            // probed modules are onlined by address from inside the guest
            if use_probe {
                if let Some(added) = added {
                    if added.probe && block_size_mb > 0 {
                        let sections = (added.size_mb / block_size_mb).max(1);
                        let addrs: Vec<u64> = (0..sections)
                            .map(|i| added.addr + ((i as u64 * block_size_mb as u64) << 20))
                            .collect();
                        agent
                            .mem_hotplug_by_probe(MemHotplugByProbeRequest {
                                mem_hotplug_probe_addr: addrs,
                            })
                            .await
                            .context("memory hotplug by probe")?;
                    }
                }
            }

            if now_mb >= end_mb {
                break;
            }
        }

        if grew {
            agent
                .online_cpu_mem(OnlineCPUMemRequest {
                    wait: false,
                    nb_cpus: 0,
                    cpu_only: false,
                })
                .await
                .context("online memory")?;
        }
        Ok(())
    }

    /// Re-issue remount directives sized to the new total for every
    /// registered tmpfs mount without an explicit size. Old agents without
    /// the method only cost a warning.
    async fn update_ephemeral_storages(&self, agent: &dyn Agent) -> Result<()> {
        let current_mb = self.current_mem_mb().await;
        let storages: Vec<Storage> = {
            let registered = self.ephemeral_storages.read().await;
            registered
                .iter()
                .filter(|s| !s.options.iter().any(|o| o.starts_with("size=")))
                .map(|s| {
                    let mut resized = s.clone();
                    resized
                        .options
                        .push(format!("size={}M", current_mb));
                    resized.options.push("remount".to_string());
                    resized
                })
                .collect()
        };
        if storages.is_empty() {
            return Ok(());
        }

        if let Err(e) = agent.update_mounts(UpdateMountsRequest { storages }).await {
            warn!(sl!(), "agent does not support mount updates";
                "error" => format!("{:#}", e));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agent::mock::MockAgent;
    use agent::{HugepageLimit, LinuxMemory};
    use hypervisor::mock::MockHypervisor;
    use hypervisor::HypervisorConfig;

    fn test_config() -> HypervisorConfig {
        let mut config = HypervisorConfig::default();
        config.memory_info.default_memory = 256;
        config.memory_info.default_max_memory = 16384;
        config
    }

    async fn running_mock(config: &HypervisorConfig) -> MockHypervisor {
        let hypervisor = MockHypervisor::new(config.clone());
        hypervisor.prepare_vm("mem-ut", None).await.unwrap();
        hypervisor.start_vm(10).await.unwrap();
        hypervisor
    }

    #[actix_rt::test]
    async fn test_limits_and_hugepages_grow_memory() {
        let config = test_config();
        let hypervisor = running_mock(&config).await;
        let agent = MockAgent::new();
        let mem = MemResource::new("mem-ut", &config);

        let resources = LinuxResources {
            memory: Some(LinuxMemory {
                limit: Some(512 << 20),
                swap: None,
                swappiness: None,
            }),
            hugepage_limits: vec![HugepageLimit {
                page_size: "2MB".to_string(),
                limit: 128 << 20,
            }],
            ..Default::default()
        };
        mem.update_mem_resources(
            "c1",
            Some(&resources),
            ResourceUpdateOp::Add,
            &hypervisor,
            &agent,
            128,
            false,
        )
        .await
        .unwrap();
        // 256 baseline + 512 limit + 128 hugepages
        assert_eq!(mem.current_mem_mb().await, 896);
    }

    #[actix_rt::test]
    async fn test_acpi_growth_walks_in_bounded_steps() {
        // 256 MiB baseline growing to 13 GiB: the first step may add at most
        // 256 * 48 = 12288 MiB, the second covers the rest
        let mut config = test_config();
        config.memory_info.default_max_memory = 32768;
        let hypervisor = running_mock(&config).await;
        let agent = MockAgent::new();
        let mem = MemResource::new("mem-acpi", &config);

        let resources = LinuxResources {
            memory: Some(LinuxMemory {
                limit: Some((13312i64 - 256) << 20),
                swap: None,
                swappiness: None,
            }),
            ..Default::default()
        };
        mem.update_mem_resources(
            "c1",
            Some(&resources),
            ResourceUpdateOp::Add,
            &hypervisor,
            &agent,
            0,
            false,
        )
        .await
        .unwrap();
        assert_eq!(mem.current_mem_mb().await, 13312);
    }

    #[actix_rt::test]
    async fn test_removed_container_does_not_shrink() {
        let config = test_config();
        let hypervisor = running_mock(&config).await;
        let agent = MockAgent::new();
        let mem = MemResource::new("mem-ut2", &config);

        let resources = LinuxResources {
            memory: Some(LinuxMemory {
                limit: Some(512 << 20),
                swap: None,
                swappiness: None,
            }),
            ..Default::default()
        };
        mem.update_mem_resources(
            "c1",
            Some(&resources),
            ResourceUpdateOp::Add,
            &hypervisor,
            &agent,
            128,
            false,
        )
        .await
        .unwrap();
        let grown = mem.current_mem_mb().await;

        mem.update_mem_resources(
            "c1",
            None,
            ResourceUpdateOp::Del,
            &hypervisor,
            &agent,
            128,
            false,
        )
        .await
        .unwrap();
        // the mock keeps its size on shrink, mirroring real backends
        assert_eq!(mem.current_mem_mb().await, grown);
    }
}
