// Copyright (c) 2023-2024 The Virtrun Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use agent::{Agent, LinuxCpu, OnlineCPUMemRequest};
use anyhow::{anyhow, Context, Result};
use hypervisor::Hypervisor;
use tokio::sync::RwLock;

use crate::{ResourceController, ResourceUpdateOp};

#[derive(Clone)]
pub struct CpuResource {
    /// Boot vCPU count, the reconciliation baseline.
    default_vcpus: u32,
    pub(crate) current_vcpu: Arc<RwLock<u32>>,
    container_cpu_resources: Arc<RwLock<HashMap<String, LinuxCpu>>>,
    enable_pinning: bool,
}

impl CpuResource {
    pub fn new(config: &hypervisor::HypervisorConfig) -> Self {
        let boot_vcpus = config.boot_vcpus();
        Self {
            default_vcpus: boot_vcpus,
            current_vcpu: Arc::new(RwLock::new(boot_vcpus)),
            container_cpu_resources: Arc::new(RwLock::new(HashMap::new())),
            enable_pinning: config.cpu_info.enable_vcpu_pinning,
        }
    }

    pub async fn current_vcpu(&self) -> u32 {
        *self.current_vcpu.read().await
    }

    pub async fn update_cpu_resources(
        &self,
        cid: &str,
        linux_cpus: Option<&LinuxCpu>,
        op: ResourceUpdateOp,
        hypervisor: &dyn Hypervisor,
        agent: &dyn Agent,
        controller: &dyn ResourceController,
    ) -> Result<()> {
        self.update_container_cpu_resources(cid, linux_cpus, op)
            .await
            .context("update container cpu resources")?;

        let target = self.default_vcpus + self.calculate_vcpus().await;
        let current = self.current_vcpu().await;
        if target != current {
            let (old, new) = hypervisor
                .resize_vcpu(current, target)
                .await
                .context("resize vcpu")?;
            *self.current_vcpu.write().await = new;

            // newly plugged cpus stay offline until the agent brings them up
            if new > old {
                let added = new - old;
                info!(sl!(), "request to online {} vcpus", added);
                agent
                    .online_cpu_mem(OnlineCPUMemRequest {
                        wait: false,
                        nb_cpus: new,
                        cpu_only: true,
                    })
                    .await
                    .context("online vcpus")?;
            }
        }

        self.apply_cpuset(hypervisor, controller)
            .await
            .context("apply cpuset")?;
        Ok(())
    }

    async fn update_container_cpu_resources(
        &self,
        cid: &str,
        linux_cpus: Option<&LinuxCpu>,
        op: ResourceUpdateOp,
    ) -> Result<()> {
        let mut resources = self.container_cpu_resources.write().await;
        match op {
            ResourceUpdateOp::Add | ResourceUpdateOp::Update => {
                if let Some(cpu) = linux_cpus {
                    resources.insert(cid.to_owned(), cpu.clone());
                }
            }
            ResourceUpdateOp::Del => {
                resources.remove(cid);
            }
        }
        Ok(())
    }

    /// Sum of per-container `ceil(quota/period)`. When no container carries
    /// a quota but cpuset masks exist, the cardinality of their union is
    /// the demand instead.
    async fn calculate_vcpus(&self) -> u32 {
        let resources = self.container_cpu_resources.read().await;
        let mut vcpus = 0u32;
        let mut cpuset_union: BTreeSet<u32> = BTreeSet::new();

        for (_, cpu) in resources.iter() {
            if let (Some(quota), Some(period)) = (cpu.quota, cpu.period) {
                if quota > 0 && period > 0 {
                    vcpus += ((quota as u64 + period - 1) / period) as u32;
                    continue;
                }
            }
            if let Ok(set) = parse_cpuset(&cpu.cpus) {
                cpuset_union.extend(set);
            }
        }

        if vcpus == 0 {
            vcpus = cpuset_union.len() as u32;
        }
        vcpus
    }

    /// Push the cpuset/memset union to the controller; pin vCPU threads
    /// 1:1 when the union is exactly as wide as the VM.
    async fn apply_cpuset(
        &self,
        hypervisor: &dyn Hypervisor,
        controller: &dyn ResourceController,
    ) -> Result<()> {
        let resources = self.container_cpu_resources.read().await;
        let mut cpus: BTreeSet<u32> = BTreeSet::new();
        let mut mems: BTreeSet<u32> = BTreeSet::new();
        for (_, cpu) in resources.iter() {
            if let Ok(set) = parse_cpuset(&cpu.cpus) {
                cpus.extend(set);
            }
            if let Ok(set) = parse_cpuset(&cpu.mems) {
                mems.extend(set);
            }
        }
        drop(resources);

        controller.update_cpuset(&format_cpuset(&cpus), &format_cpuset(&mems))?;

        if !self.enable_pinning {
            return Ok(());
        }

        let thread_ids = hypervisor.get_thread_ids().await.context("thread ids")?;
        let current = self.current_vcpu().await;
        if cpus.len() == current as usize && !cpus.is_empty() {
            for (vcpu, tid) in thread_ids.vcpus.iter() {
                let host_cpu = cpus.iter().nth(*vcpu as usize).copied();
                if let Some(host_cpu) = host_cpu {
                    set_thread_affinity(*tid, &[host_cpu])
                        .with_context(|| format!("pin vcpu {} thread {}", vcpu, tid))?;
                }
            }
        } else {
            // the union does not map 1:1; spread every thread over it
            let all: Vec<u32> = cpus.iter().copied().collect();
            if !all.is_empty() {
                for (_, tid) in thread_ids.vcpus.iter() {
                    set_thread_affinity(*tid, &all).context("clear vcpu pinning")?;
                }
            }
        }
        Ok(())
    }
}

fn set_thread_affinity(tid: u32, cpus: &[u32]) -> Result<()> {
    use nix::sched::{sched_setaffinity, CpuSet};
    use nix::unistd::Pid;

    let mut cpu_set = CpuSet::new();
    for cpu in cpus {
        cpu_set.set(*cpu as usize)?;
    }
    sched_setaffinity(Pid::from_raw(tid as i32), &cpu_set)?;
    Ok(())
}

/// Parse a kernel cpuset list like "0-2,4" into its members.
pub fn parse_cpuset(cpuset: &str) -> Result<BTreeSet<u32>> {
    let mut result = BTreeSet::new();
    if cpuset.trim().is_empty() {
        return Ok(result);
    }
    for part in cpuset.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        match part.split_once('-') {
            Some((start, end)) => {
                let start: u32 = start.trim().parse().context("cpuset range start")?;
                let end: u32 = end.trim().parse().context("cpuset range end")?;
                if start > end {
                    return Err(anyhow!("invalid cpuset range {:?}", part));
                }
                result.extend(start..=end);
            }
            None => {
                result.insert(part.parse().context("cpuset member")?);
            }
        }
    }
    Ok(result)
}

fn format_cpuset(cpus: &BTreeSet<u32>) -> String {
    cpus.iter()
        .map(|c| c.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;
    use agent::mock::MockAgent;
    use hypervisor::mock::MockHypervisor;
    use hypervisor::HypervisorConfig;

    fn test_config() -> HypervisorConfig {
        let mut config = HypervisorConfig::default();
        config.cpu_info.default_vcpus = 1.0;
        config.cpu_info.default_maxvcpus = 8;
        config
    }

    #[test]
    fn test_parse_cpuset() {
        assert_eq!(parse_cpuset("").unwrap().len(), 0);
        assert_eq!(
            parse_cpuset("0-2,4").unwrap().into_iter().collect::<Vec<_>>(),
            vec![0, 1, 2, 4]
        );
        assert!(parse_cpuset("3-1").is_err());
        assert!(parse_cpuset("a").is_err());
    }

    #[actix_rt::test]
    async fn test_quota_demand_drives_resize() {
        let config = test_config();
        let hypervisor = MockHypervisor::new(config.clone());
        hypervisor.prepare_vm("cpu-ut", None).await.unwrap();
        hypervisor.start_vm(10).await.unwrap();
        let agent = MockAgent::new();
        let controller = crate::NoopResourceController::default();

        let cpu = CpuResource::new(&config);
        let cpus = LinuxCpu {
            quota: Some(150_000),
            period: Some(100_000),
            ..Default::default()
        };
        // ceil(1.5) = 2 on top of the 1-vcpu baseline
        cpu.update_cpu_resources(
            "c1",
            Some(&cpus),
            ResourceUpdateOp::Add,
            &hypervisor,
            &agent,
            &controller,
        )
        .await
        .unwrap();
        assert_eq!(cpu.current_vcpu().await, 3);

        // removing the container drops the demand back to the baseline
        cpu.update_cpu_resources(
            "c1",
            None,
            ResourceUpdateOp::Del,
            &hypervisor,
            &agent,
            &controller,
        )
        .await
        .unwrap();
        assert_eq!(cpu.current_vcpu().await, 1);
    }

    #[actix_rt::test]
    async fn test_cpuset_fallback_when_no_quota() {
        let config = test_config();
        let hypervisor = MockHypervisor::new(config.clone());
        hypervisor.prepare_vm("cpu-ut2", None).await.unwrap();
        hypervisor.start_vm(10).await.unwrap();
        let agent = MockAgent::new();
        let controller = crate::NoopResourceController::default();

        let cpu = CpuResource::new(&config);
        let cpus = LinuxCpu {
            cpus: "0-3".to_string(),
            ..Default::default()
        };
        cpu.update_cpu_resources(
            "c1",
            Some(&cpus),
            ResourceUpdateOp::Add,
            &hypervisor,
            &agent,
            &controller,
        )
        .await
        .unwrap();
        // union cardinality 4 on top of the baseline
        assert_eq!(cpu.current_vcpu().await, 5);
    }
}
