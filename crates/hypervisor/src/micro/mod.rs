// Copyright (c) 2023-2024 The Virtrun Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use nix::sys::signal::Signal;
use persist::sandbox_persist::Persist;
use tokio::sync::{mpsc, RwLock};

use crate::config::{HypervisorConfig, ASSET_KERNEL};
use crate::device::{DeviceType, HybridVsockConfig, MemoryConfig};
use crate::error::HypervisorError;
use crate::utils;
use crate::{
    Capabilities, CapabilityBits, Hypervisor, HypervisorEvent, HypervisorState, VcpuThreadIds,
    VmmState, CONSOLE_PROTO_UNIX, CONSOLE_SOCK, HYPERVISOR_MICROVM, VM_PID_FILE,
};

/// Host socket multiplexing the guest vsock ports.
const HYBRID_VSOCK_SOCK: &str = "hvsock.sock";

struct MicroVmmInner {
    id: String,
    config: HypervisorConfig,
    state: VmmState,
    vm_path: PathBuf,
    vmm_pid: Option<i32>,
    devices: Vec<DeviceType>,
    stopped: bool,
    event_tx: Option<mpsc::Sender<HypervisorEvent>>,
}

/// A minimal microVMM backend: boot-time devices only, a hybrid-vsock agent
/// transport, no monitor. Everything dynamic reports `Unsupported`.
pub struct MicroVmm {
    inner: Arc<RwLock<MicroVmmInner>>,
}

impl MicroVmm {
    pub fn new(config: HypervisorConfig) -> Self {
        Self {
            inner: Arc::new(RwLock::new(MicroVmmInner {
                id: String::new(),
                config,
                state: VmmState::NotReady,
                vm_path: PathBuf::new(),
                vmm_pid: None,
                devices: vec![],
                stopped: false,
                event_tx: None,
            })),
        }
    }

    pub async fn restore(state: HypervisorState) -> Result<Self> {
        let vmm = MicroVmm::new(state.config.clone());
        {
            let mut inner = vmm.inner.write().await;
            inner.restore_from(&state);
        }
        Ok(vmm)
    }
}

impl MicroVmmInner {
    fn restore_from(&mut self, state: &HypervisorState) {
        self.vm_path = PathBuf::from(&state.vm_path);
        self.vmm_pid = state.pid;
        match state.pid {
            Some(pid) if utils::pid_alive(pid) => self.state = VmmState::Running,
            _ => {
                self.stopped = true;
                self.state = VmmState::Stopped;
            }
        }
    }
}

#[async_trait]
impl Hypervisor for MicroVmm {
    async fn prepare_vm(&self, id: &str, _netns: Option<String>) -> Result<()> {
        let mut inner = self.inner.write().await;
        if inner.state != VmmState::NotReady {
            return Err(anyhow!("vm {} has already been prepared", inner.id));
        }
        inner.config.validate().context("validate config")?;
        inner.id = id.to_string();
        inner.vm_path = persist::run_vm_storage_path(id);
        inner.state = VmmState::Created;
        Ok(())
    }

    async fn start_vm(&self, _timeout_secs: i32) -> Result<()> {
        let mut inner = self.inner.write().await;
        if inner.state != VmmState::Created {
            return Err(HypervisorError::NotRunning.into());
        }

        tokio::fs::create_dir_all(&inner.vm_path)
            .await
            .with_context(|| format!("create vm dir {}", inner.vm_path.display()))?;

        let mut cmd = tokio::process::Command::new(&inner.config.path);
        cmd.arg("--kernel")
            .arg(inner.config.asset(ASSET_KERNEL))
            .arg("--vsock")
            .arg(inner.vm_path.join(HYBRID_VSOCK_SOCK))
            .arg("--console")
            .arg(inner.vm_path.join(CONSOLE_SOCK))
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null());
        for device in &inner.devices {
            match device {
                DeviceType::Block(b) => {
                    cmd.arg("--disk").arg(&b.config.path_on_host);
                }
                other => {
                    return Err(HypervisorError::Unsupported(format!(
                        "cold-plug of {} on microvm",
                        other
                    ))
                    .into())
                }
            }
        }
        let mut child = cmd
            .spawn()
            .map_err(|e| HypervisorError::Io(format!("spawn vmm: {}", e)))?;

        let pid = child
            .id()
            .ok_or_else(|| anyhow!("vmm exited before its pid was read"))? as i32;
        inner.vmm_pid = Some(pid);
        tokio::fs::write(inner.vm_path.join(VM_PID_FILE), format!("{}", pid))
            .await
            .context("write vmm pid file")?;

        let event_tx = inner.event_tx.clone();
        tokio::spawn(async move {
            let status = child.wait().await;
            let code = status.as_ref().ok().and_then(|s| s.code());
            if let Some(tx) = event_tx {
                let _ = tx.send(HypervisorEvent::VmmExited(code)).await;
            }
        });

        inner.state = VmmState::Running;
        Ok(())
    }

    async fn stop_vm(&self, wait_only: bool) -> Result<()> {
        let mut inner = self.inner.write().await;
        if inner.stopped {
            return Ok(());
        }
        let pid = match inner.vmm_pid {
            Some(pid) => pid,
            None => {
                inner.stopped = true;
                inner.state = VmmState::Stopped;
                return Ok(());
            }
        };
        if wait_only {
            return utils::wait_for_exit(pid).await;
        }
        utils::wait_with_signal(pid, Signal::SIGKILL).await?;
        let _ = tokio::fs::remove_dir_all(&inner.vm_path).await;
        inner.vmm_pid = None;
        inner.stopped = true;
        inner.state = VmmState::Stopped;
        Ok(())
    }

    async fn pause_vm(&self) -> Result<()> {
        // no monitor; pause succeeds as a no-op
        Ok(())
    }

    async fn resume_vm(&self) -> Result<()> {
        Ok(())
    }

    async fn save_vm(&self) -> Result<()> {
        Err(HypervisorError::Unsupported("device-state save on microvm".to_string()).into())
    }

    async fn add_device(&self, device: DeviceType) -> Result<()> {
        let mut inner = self.inner.write().await;
        if inner.state != VmmState::Created {
            return Err(HypervisorError::Config(
                "device cold-plug is only valid before the vm starts".to_string(),
            )
            .into());
        }
        inner.devices.push(device);
        Ok(())
    }

    async fn hotplug_add_device(&self, device: DeviceType) -> Result<DeviceType> {
        Err(
            HypervisorError::Unsupported(format!("hotplug of {} on microvm", device))
                .into(),
        )
    }

    async fn hotplug_remove_device(&self, device: DeviceType) -> Result<()> {
        Err(
            HypervisorError::Unsupported(format!("hot-unplug of {} on microvm", device))
                .into(),
        )
    }

    async fn resize_vcpu(&self, _old_vcpus: u32, _new_vcpus: u32) -> Result<(u32, u32)> {
        Err(HypervisorError::Unsupported("vcpu resize on microvm".to_string()).into())
    }

    async fn resize_memory(
        &self,
        _req_mem_mb: u32,
        _block_size_mb: u32,
        _probe: bool,
    ) -> Result<(u32, Option<MemoryConfig>)> {
        Err(HypervisorError::Unsupported("memory resize on microvm".to_string()).into())
    }

    async fn get_vm_console(&self) -> Result<(String, String)> {
        let inner = self.inner.read().await;
        if inner.stopped {
            return Err(HypervisorError::NotRunning.into());
        }
        Ok((
            CONSOLE_PROTO_UNIX.to_string(),
            inner
                .vm_path
                .join(CONSOLE_SOCK)
                .to_string_lossy()
                .to_string(),
        ))
    }

    async fn get_thread_ids(&self) -> Result<VcpuThreadIds> {
        Ok(VcpuThreadIds::default())
    }

    async fn get_pids(&self) -> Result<Vec<u32>> {
        let inner = self.inner.read().await;
        Ok(inner.vmm_pid.map(|p| p as u32).into_iter().collect())
    }

    async fn get_vmm_master_tid(&self) -> Result<u32> {
        let inner = self.inner.read().await;
        inner
            .vmm_pid
            .map(|pid| pid as u32)
            .ok_or_else(|| HypervisorError::NotRunning.into())
    }

    async fn generate_socket(&self) -> Result<DeviceType> {
        let inner = self.inner.read().await;
        Ok(DeviceType::HybridVsock(HybridVsockConfig {
            guest_cid: 3,
            uds_path: inner
                .vm_path
                .join(HYBRID_VSOCK_SOCK)
                .to_string_lossy()
                .to_string(),
        }))
    }

    async fn check(&self) -> Result<()> {
        let inner = self.inner.read().await;
        if inner.stopped || inner.state == VmmState::Stopped {
            return Err(HypervisorError::NotRunning.into());
        }
        let pid = inner.vmm_pid.ok_or(HypervisorError::NotRunning)?;
        if !utils::pid_alive(pid) {
            return Err(HypervisorError::NotRunning.into());
        }
        Ok(())
    }

    async fn capabilities(&self) -> Result<Capabilities> {
        let mut caps = Capabilities::new();
        caps.set(CapabilityBits::BLOCK_DEVICE_SUPPORT);
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
            hypervisor_type: HYPERVISOR_MICROVM.to_string(),
            pid: inner.vmm_pid,
            vm_path: inner.vm_path.to_string_lossy().to_string(),
            config: inner.config.clone(),
            ..Default::default()
        })
    }

    async fn cleanup(&self) -> Result<()> {
        let stopped = { self.inner.read().await.stopped };
        if !stopped {
            self.stop_vm(false).await?;
        }
        Ok(())
    }

    async fn set_event_notifier(&self, tx: mpsc::Sender<HypervisorEvent>) {
        let mut inner = self.inner.write().await;
        inner.event_tx = Some(tx);
    }
}

#[async_trait]
impl Persist for MicroVmm {
    type State = HypervisorState;
    type ConstructorArgs = ();

    async fn save(&self) -> Result<Self::State> {
        self.save_state().await
    }

    async fn restore(_args: Self::ConstructorArgs, state: Self::State) -> Result<Self> {
        MicroVmm::restore(state).await
    }
}
