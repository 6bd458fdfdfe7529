// Copyright (c) 2023-2024 The Virtrun Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use std::collections::BTreeSet;
use std::sync::Arc;

use agent::{
    Agent, CreateContainerRequest, CreateSandboxRequest, DestroySandboxRequest,
    GetGuestDetailsRequest, LinuxResources, RemoveContainerRequest,
};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use agent::DEFAULT_AGENT_VSOCK_PORT;
use hypervisor::device::{DeviceType, VhostUserType};
use hypervisor::{new_hypervisor, Hypervisor, HypervisorError, HypervisorEvent};
use resource::network::{DeviceReceiver, Network};
use resource::{ResourceController, ResourceManager, ResourceUpdateOp};
use tokio::sync::{mpsc, Mutex, RwLock};

use crate::console_watcher::ConsoleWatcher;
use crate::health_check::HealthCheck;
use crate::hooks::run_prestart_hooks;
use crate::sandbox_persist::{PersistRecord, SandboxState, SandboxStatus};
use crate::{Sandbox, SandboxConfig};

/// Seconds granted to the VMM for boot plus monitor handshake.
const VM_START_TIMEOUT_SECS: i32 = 10;
/// Block indexes live in [0, BLOCK_INDEX_LIMIT).
const BLOCK_INDEX_LIMIT: u32 = 65535;

struct SandboxInner {
    status: SandboxStatus,
    block_index_set: BTreeSet<u32>,
    /// Negotiated at agent init: the VM must not power down on its own.
    keep_vm_on_shutdown: bool,
    guest_mem_block_size_mb: u32,
    guest_supports_probe: bool,
}

/// One VM-backed pod: drives the hypervisor, the in-guest agent, the
/// network collaborator and resource reconciliation through the sandbox
/// lifecycle.
pub struct VirtSandbox {
    sid: String,
    config: SandboxConfig,
    agent: Arc<dyn Agent>,
    hypervisor: Arc<dyn Hypervisor>,
    resource_manager: Arc<ResourceManager>,
    network: Option<Arc<dyn Network>>,
    inner: Arc<RwLock<SandboxInner>>,
    monitor: HealthCheck,
    console_watcher: ConsoleWatcher,
    abnormal_tx: mpsc::Sender<()>,
    /// Serializes lifecycle transitions across tasks.
    lifecycle_lock: Mutex<()>,
}

impl VirtSandbox {
    pub async fn new(
        sid: &str,
        mut config: SandboxConfig,
        agent: Arc<dyn Agent>,
        network: Option<Arc<dyn Network>>,
        controller: Arc<dyn ResourceController>,
    ) -> Result<Arc<Self>> {
        harvest_coldplug_devices(&mut config);
        if !config.selinux_label.is_empty() {
            config.hypervisor_config.security_info.selinux_label = config.selinux_label.clone();
        }

        let hypervisor = new_hypervisor(&config.hypervisor_name, config.hypervisor_config.clone())
            .context("new hypervisor")?;
        let resource_manager = Arc::new(
            ResourceManager::new(
                sid,
                agent.clone(),
                hypervisor.clone(),
                controller,
                config.static_resource_mgmt,
            )
            .await?,
        );

        let (abnormal_tx, abnormal_rx) = mpsc::channel(1);
        let sandbox = Arc::new(Self {
            sid: sid.to_string(),
            config,
            agent,
            hypervisor,
            resource_manager,
            network,
            inner: Arc::new(RwLock::new(SandboxInner {
                status: SandboxStatus::Unmaterialized,
                block_index_set: BTreeSet::new(),
                keep_vm_on_shutdown: false,
                guest_mem_block_size_mb: 0,
                guest_supports_probe: false,
            })),
            monitor: HealthCheck::new(),
            console_watcher: ConsoleWatcher::new(),
            abnormal_tx,
            lifecycle_lock: Mutex::new(()),
        });
        Self::spawn_event_loop(&sandbox, abnormal_rx).await;
        Ok(sandbox)
    }

    /// Rebuild a sandbox from its on-disk record without touching the live
    /// VM.
    pub async fn restore(
        sid: &str,
        agent: Arc<dyn Agent>,
        network: Option<Arc<dyn Network>>,
        controller: Arc<dyn ResourceController>,
    ) -> Result<Arc<Self>> {
        let record: PersistRecord = persist::from_disk(sid).context("load sandbox record")?;
        let hypervisor_state = record.hypervisor.clone().unwrap_or_default();
        if hypervisor_state.hypervisor_type.is_empty() {
            return Err(anyhow!("sandbox {} has no restorable vm", sid));
        }

        let config = SandboxConfig {
            hypervisor_name: hypervisor_state.hypervisor_type.clone(),
            hypervisor_config: hypervisor_state.config.clone(),
            ..Default::default()
        };
        let hypervisor = hypervisor::restore_hypervisor(hypervisor_state)
            .await
            .context("restore hypervisor")?;
        let resource_manager = Arc::new(
            ResourceManager::restore(
                sid,
                agent.clone(),
                hypervisor.clone(),
                controller,
                config.static_resource_mgmt,
                record.resource.clone().unwrap_or_default(),
            )
            .await
            .context("restore resource manager")?,
        );

        let (abnormal_tx, abnormal_rx) = mpsc::channel(1);
        let sandbox = Arc::new(Self {
            sid: sid.to_string(),
            config,
            agent,
            hypervisor,
            resource_manager,
            network,
            inner: Arc::new(RwLock::new(SandboxInner {
                status: record.sandbox.status,
                block_index_set: record.sandbox.block_index_set.clone(),
                keep_vm_on_shutdown: false,
                guest_mem_block_size_mb: record.sandbox.guest_mem_block_size_mb,
                guest_supports_probe: record.sandbox.guest_supports_mem_hotplug_probe,
            })),
            monitor: HealthCheck::new(),
            console_watcher: ConsoleWatcher::new(),
            abnormal_tx,
            lifecycle_lock: Mutex::new(()),
        });
        sandbox
            .resource_manager
            .set_guest_details(
                (record.sandbox.guest_mem_block_size_mb as u64) << 20,
                record.sandbox.guest_supports_mem_hotplug_probe,
            )
            .await;
        Self::spawn_event_loop(&sandbox, abnormal_rx).await;
        info!(sl!(), "sandbox restored"; "sandbox" => sid,
            "status" => format!("{:?}", record.sandbox.status));
        Ok(sandbox)
    }

    /// Out-of-band failures (VMM exit, guest panic, daemon exit, failed
    /// health checks) arrive on channels; the handler enqueues a forced
    /// stop instead of re-entering the sandbox from the notifier task.
    async fn spawn_event_loop(sandbox: &Arc<Self>, mut abnormal_rx: mpsc::Receiver<()>) {
        let (event_tx, mut event_rx) = mpsc::channel::<HypervisorEvent>(8);
        sandbox.hypervisor.set_event_notifier(event_tx).await;

        let weak = Arc::downgrade(sandbox);
        tokio::spawn(async move {
            loop {
                let reason = tokio::select! {
                    event = event_rx.recv() => match event {
                        Some(event) => format!("{:?}", event),
                        None => return,
                    },
                    failed = abnormal_rx.recv() => match failed {
                        Some(()) => "health check failure".to_string(),
                        None => return,
                    },
                };
                let sandbox = match weak.upgrade() {
                    Some(s) => s,
                    None => return,
                };
                if sandbox.status().await == SandboxStatus::Stopped {
                    continue;
                }
                warn!(sl!(), "stopping sandbox on event";
                    "sandbox" => sandbox.sid.as_str(), "reason" => reason);
                if let Err(e) = sandbox.stop(true).await {
                    error!(sl!(), "forced stop failed";
                        "sandbox" => sandbox.sid.as_str(), "error" => format!("{:#}", e));
                }
            }
        });
    }

    /// Materialize the sandbox: create the VM, negotiate with the agent
    /// client, cold-plug declared devices.
    pub async fn create(&self) -> Result<()> {
        let _guard = self.lifecycle_lock.lock().await;
        {
            let inner = self.inner.read().await;
            if inner.status != SandboxStatus::Unmaterialized {
                return Err(anyhow!("sandbox {} has already been created", self.sid));
            }
        }

        self.hypervisor
            .prepare_vm(&self.sid, self.config.network.netns.clone())
            .await
            .context("prepare vm")?;

        let disable_vm_shutdown = self.agent.init().await.context("agent init")?;

        for device in self.config.coldplug_devices.clone() {
            self.hypervisor
                .add_device(device)
                .await
                .context("cold-plug device")?;
        }

        let mut inner = self.inner.write().await;
        inner.keep_vm_on_shutdown = disable_vm_shutdown;
        inner.status = SandboxStatus::Ready;
        drop(inner);
        self.persist().await.context("persist after create")?;
        info!(sl!(), "sandbox created"; "sandbox" => self.sid.as_str());
        Ok(())
    }

    async fn do_start(&self) -> Result<()> {
        let caps = self.hypervisor.capabilities().await?;
        let net_hotplug = caps.is_net_device_hotplug_supported();

        let mut endpoints_deferred = false;
        if !self.config.network.disable_new_network {
            if self.config.network.requires_net_hotplug && !net_hotplug {
                return Err(HypervisorError::Config(
                    "the container engine requires network device hot-plug".to_string(),
                )
                .into());
            }
            if let Some(network) = &self.network {
                if net_hotplug {
                    // endpoints appear after boot through hot-plug
                    endpoints_deferred = true;
                } else {
                    network
                        .add_endpoints(self, false)
                        .await
                        .context("add endpoints before boot")?;
                }
            }
        }

        self.setup_shared_dirs().await.context("shared dirs")?;

        // with hot-plug networking the hook runs before the VMM exists and
        // sees no pid; otherwise it runs against the booted VM
        if net_hotplug {
            run_prestart_hooks(&self.config.prestart_hooks, &self.sid, None)
                .await
                .context("prestart hooks")?;
            self.hypervisor
                .start_vm(VM_START_TIMEOUT_SECS)
                .await
                .context("start vm")?;
        } else {
            self.hypervisor
                .start_vm(VM_START_TIMEOUT_SECS)
                .await
                .context("start vm")?;
            let pid = self.hypervisor.get_vmm_master_tid().await.ok();
            run_prestart_hooks(&self.config.prestart_hooks, &self.sid, pid)
                .await
                .context("prestart hooks")?;
        }

        if endpoints_deferred {
            if let Some(network) = &self.network {
                network
                    .add_endpoints(self, true)
                    .await
                    .context("add endpoints after boot")?;
            }
        }

        let address = self.agent_address().await.context("agent address")?;
        self.agent.start(&address).await.context("connect agent")?;
        self.agent
            .create_sandbox(CreateSandboxRequest {
                hostname: self.config.hostname.clone(),
                sandbox_id: self.sid.clone(),
                sandbox_pidns: false,
                ..Default::default()
            })
            .await
            .context("agent create sandbox")?;

        let details = self
            .agent
            .get_guest_details(GetGuestDetailsRequest {
                mem_block_size: true,
                mem_hotplug_probe: true,
            })
            .await
            .context("guest details")?;
        self.resource_manager
            .set_guest_details(
                details.mem_block_size_bytes,
                details.support_mem_hotplug_probe,
            )
            .await;
        {
            let mut inner = self.inner.write().await;
            inner.guest_mem_block_size_mb = (details.mem_block_size_bytes >> 20) as u32;
            inner.guest_supports_probe = details.support_mem_hotplug_probe;
        }

        match self.hypervisor.get_vm_console().await {
            Ok((proto, url)) => {
                if let Err(e) = self.console_watcher.start(&self.sid, &proto, &url).await {
                    warn!(sl!(), "console watcher not started"; "error" => format!("{:#}", e));
                }
            }
            Err(e) => debug!(sl!(), "no console"; "error" => format!("{:#}", e)),
        }
        self.monitor
            .start(&self.sid, self.hypervisor.clone(), self.abnormal_tx.clone())
            .await;
        Ok(())
    }

    /// Stage the host side of the shared tree: the directory is bind
    /// mounted onto itself with slave propagation so sub-mounts made later
    /// reach the guest through the shared-fs daemon.
    async fn setup_shared_dirs(&self) -> Result<()> {
        let kind = self.config.hypervisor_config.shared_fs_kind();
        if kind == hypervisor::config::SHARED_FS_NONE {
            return Ok(());
        }
        let shared = persist::run_storage_path(&self.sid).join("shared");
        tokio::fs::create_dir_all(&shared)
            .await
            .context("create shared dir")?;

        use nix::mount::{mount, MsFlags};
        mount(
            Some(&shared),
            &shared,
            None::<&str>,
            MsFlags::MS_BIND | MsFlags::MS_REC,
            None::<&str>,
        )
        .context("bind shared dir")?;
        mount(
            None::<&str>,
            &shared,
            None::<&str>,
            MsFlags::MS_SLAVE | MsFlags::MS_REC,
            None::<&str>,
        )
        .context("set slave propagation")?;
        Ok(())
    }

    /// Transport URI of the agent, derived from the backend's descriptor.
    async fn agent_address(&self) -> Result<String> {
        let port = self
            .config
            .agent_config
            .server_port
            .max(DEFAULT_AGENT_VSOCK_PORT);
        match self.hypervisor.generate_socket().await? {
            DeviceType::Vsock(v) => Ok(format!("vsock://{}:{}", v.guest_cid, port)),
            DeviceType::HybridVsock(h) => Ok(format!("hvsock://{}:{}", h.uds_path, port)),
            DeviceType::Socket(s) => Ok(format!("hvsock://{}:{}", s.host_path, port)),
            other => Err(anyhow!("unusable agent transport {}", other)),
        }
    }

    async fn persist(&self) -> Result<()> {
        let inner = self.inner.read().await;
        let record = PersistRecord {
            sandbox: SandboxState {
                status: inner.status,
                block_index_set: inner.block_index_set.clone(),
                sandbox_controller_id: self.sid.clone(),
                overhead_controller_id: format!("{}-overhead", self.sid),
                guest_mem_block_size_mb: inner.guest_mem_block_size_mb,
                guest_supports_mem_hotplug_probe: inner.guest_supports_probe,
            },
            hypervisor: self.hypervisor.save_state().await.ok(),
            resource: self.resource_manager.save().await.ok(),
        };
        drop(inner);
        persist::to_disk(&record, &self.sid)
    }

    // container-facing operations

    pub async fn create_container(
        &self,
        cid: &str,
        req: CreateContainerRequest,
        resources: Option<&LinuxResources>,
    ) -> Result<()> {
        self.agent
            .create_container(req)
            .await
            .context("agent create container")?;
        self.resource_manager
            .update_linux_resource(cid, resources, ResourceUpdateOp::Add)
            .await
            .context("grow resources for container")?;
        Ok(())
    }

    pub async fn update_container(
        &self,
        cid: &str,
        resources: Option<&LinuxResources>,
    ) -> Result<()> {
        self.resource_manager
            .update_linux_resource(cid, resources, ResourceUpdateOp::Update)
            .await
    }

    pub async fn remove_container(&self, cid: &str, timeout: u32) -> Result<()> {
        self.agent
            .remove_container(RemoveContainerRequest::new(cid, timeout))
            .await
            .context("agent remove container")?;
        self.resource_manager
            .update_linux_resource(cid, None, ResourceUpdateOp::Del)
            .await
            .context("shrink resources after container removal")?;
        Ok(())
    }

    // block index bookkeeping

    /// First-fit allocation of a sandbox-wide block index.
    pub async fn get_and_set_sandbox_block_index(&self) -> Result<u32> {
        let mut inner = self.inner.write().await;
        for index in 0..BLOCK_INDEX_LIMIT {
            if !inner.block_index_set.contains(&index) {
                inner.block_index_set.insert(index);
                return Ok(index);
            }
        }
        Err(HypervisorError::ResourceExhausted("sandbox block indexes".to_string()).into())
    }

    /// Give an index back, e.g. when the un-plug of its device failed half
    /// way and the caller rolls back.
    pub async fn unset_sandbox_block_index(&self, index: u32) {
        let mut inner = self.inner.write().await;
        inner.block_index_set.remove(&index);
    }

    pub fn agent_ref(&self) -> &Arc<dyn Agent> {
        &self.agent
    }

    pub fn hypervisor_ref(&self) -> &Arc<dyn Hypervisor> {
        &self.hypervisor
    }

    pub fn resource_manager_ref(&self) -> &Arc<ResourceManager> {
        &self.resource_manager
    }
}

/// Counts of up-front declared devices feed the PCIe topology planner.
fn harvest_coldplug_devices(config: &mut SandboxConfig) {
    let dev_info = &mut config.hypervisor_config.device_info;
    for device in &config.coldplug_devices {
        match device {
            DeviceType::Vfio(v) => {
                dev_info
                    .coldplug_vfio_devices
                    .push(v.config.sysfs_path.clone());
            }
            DeviceType::VhostUser(v) if v.config.dev_type == VhostUserType::Blk => {
                dev_info.coldplug_vhost_user_blk += 1;
            }
            _ => {}
        }
    }
}

#[async_trait]
impl Sandbox for VirtSandbox {
    async fn start(&self) -> Result<()> {
        let _guard = self.lifecycle_lock.lock().await;
        {
            let inner = self.inner.read().await;
            if inner.status != SandboxStatus::Ready {
                return Err(anyhow!(
                    "sandbox {} cannot start from {:?}",
                    self.sid,
                    inner.status
                ));
            }
        }

        if let Err(e) = self.do_start().await {
            // reverse what a half-finished start left behind, then surface
            // the original failure
            error!(sl!(), "sandbox start failed, cleaning up";
                "sandbox" => self.sid.as_str(), "error" => format!("{:#}", e));
            let _ = self.hypervisor.stop_vm(false).await;
            return Err(e);
        }

        let mut inner = self.inner.write().await;
        inner.status = SandboxStatus::Running;
        drop(inner);
        self.persist().await.context("persist after start")?;
        info!(sl!(), "sandbox started"; "sandbox" => self.sid.as_str());
        Ok(())
    }

    async fn stop(&self, force: bool) -> Result<()> {
        let _guard = self.lifecycle_lock.lock().await;
        {
            let inner = self.inner.read().await;
            if inner.status == SandboxStatus::Stopped {
                return Ok(());
            }
        }

        macro_rules! guarded {
            ($what:expr, $fut:expr) => {
                if let Err(e) = $fut.await {
                    if !force {
                        return Err(e).context($what);
                    }
                    warn!(sl!(), "step failed during forced stop";
                        "step" => $what, "error" => format!("{:#}", e));
                }
            };
        }

        guarded!(
            "agent destroy sandbox",
            self.agent.destroy_sandbox(DestroySandboxRequest::default())
        );
        self.console_watcher.stop().await;
        self.monitor.stop().await;

        // unless shutdown was negotiated away at init, the guest powers
        // itself down after destroy; give it that chance before the kill
        let keep_vm = { self.inner.read().await.keep_vm_on_shutdown };
        if !keep_vm {
            if let Err(e) = self.hypervisor.stop_vm(true).await {
                debug!(sl!(), "vm did not exit on its own"; "error" => format!("{:#}", e));
            }
        }
        guarded!("stop vm", self.hypervisor.stop_vm(false));
        if let Some(network) = &self.network {
            guarded!("remove endpoints", network.remove_endpoints(self, false));
        }
        self.agent.stop().await;
        self.resource_manager.cleanup().await;

        let mut inner = self.inner.write().await;
        inner.status = SandboxStatus::Stopped;
        drop(inner);
        self.persist().await.context("persist after stop")?;
        info!(sl!(), "sandbox stopped"; "sandbox" => self.sid.as_str());
        Ok(())
    }

    async fn pause(&self) -> Result<()> {
        let _guard = self.lifecycle_lock.lock().await;
        {
            let inner = self.inner.read().await;
            if inner.status != SandboxStatus::Running {
                return Err(anyhow!("sandbox {} is not running", self.sid));
            }
        }
        self.hypervisor.pause_vm().await.context("pause vm")?;
        let mut inner = self.inner.write().await;
        inner.status = SandboxStatus::Paused;
        drop(inner);
        self.persist().await
    }

    async fn resume(&self) -> Result<()> {
        let _guard = self.lifecycle_lock.lock().await;
        {
            let inner = self.inner.read().await;
            if inner.status != SandboxStatus::Paused {
                return Err(anyhow!("sandbox {} is not paused", self.sid));
            }
        }
        self.hypervisor.resume_vm().await.context("resume vm")?;
        let mut inner = self.inner.write().await;
        inner.status = SandboxStatus::Running;
        drop(inner);
        self.persist().await
    }

    async fn cleanup(&self) -> Result<()> {
        self.hypervisor.cleanup().await.context("hypervisor cleanup")?;
        persist::destroy(&self.sid)
    }

    async fn status(&self) -> SandboxStatus {
        self.inner.read().await.status
    }
}

#[async_trait]
impl DeviceReceiver for VirtSandbox {
    /// Before the VM runs a device cold-plugs into the boot list; after
    /// boot it hot-plugs.
    async fn receive_device(&self, device: DeviceType) -> Result<DeviceType> {
        let running = { self.inner.read().await.status == SandboxStatus::Running };
        if running {
            self.hypervisor.hotplug_add_device(device).await
        } else {
            self.hypervisor.add_device(device.clone()).await?;
            Ok(device)
        }
    }

    async fn return_device(&self, device: DeviceType) -> Result<()> {
        let running = { self.inner.read().await.status == SandboxStatus::Running };
        if running {
            self.hypervisor.hotplug_remove_device(device).await
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agent::mock::MockAgent;
    use hypervisor::HYPERVISOR_MOCK;
    use resource::network::NoopNetwork;
    use resource::NoopResourceController;

    fn mock_sandbox_config() -> SandboxConfig {
        let mut config = SandboxConfig::default();
        config.hostname = "virtrun-ut".to_string();
        config.hypervisor_name = HYPERVISOR_MOCK.to_string();
        config.hypervisor_config.cpu_info.default_maxvcpus = 8;
        config.hypervisor_config.memory_info.default_memory = 256;
        config
    }

    async fn new_test_sandbox(sid: &str) -> Arc<VirtSandbox> {
        VirtSandbox::new(
            sid,
            mock_sandbox_config(),
            Arc::new(MockAgent::new()),
            Some(Arc::new(NoopNetwork::new("net-ut"))),
            Arc::new(NoopResourceController::default()),
        )
        .await
        .unwrap()
    }

    #[actix_rt::test]
    async fn test_lifecycle_happy_path() {
        let sandbox = new_test_sandbox("sb-life").await;
        assert_eq!(sandbox.status().await, SandboxStatus::Unmaterialized);

        sandbox.create().await.unwrap();
        assert_eq!(sandbox.status().await, SandboxStatus::Ready);
        // double create is a caller bug
        assert!(sandbox.create().await.is_err());

        sandbox.start().await.unwrap();
        assert_eq!(sandbox.status().await, SandboxStatus::Running);

        sandbox.pause().await.unwrap();
        assert_eq!(sandbox.status().await, SandboxStatus::Paused);
        sandbox.resume().await.unwrap();
        assert_eq!(sandbox.status().await, SandboxStatus::Running);

        sandbox.stop(false).await.unwrap();
        assert_eq!(sandbox.status().await, SandboxStatus::Stopped);
        // stop is idempotent
        sandbox.stop(false).await.unwrap();
    }

    #[actix_rt::test]
    async fn test_start_requires_ready() {
        let sandbox = new_test_sandbox("sb-order").await;
        assert!(sandbox.start().await.is_err());
    }

    #[actix_rt::test]
    async fn test_block_index_first_fit() {
        let sandbox = new_test_sandbox("sb-index").await;
        assert_eq!(sandbox.get_and_set_sandbox_block_index().await.unwrap(), 0);
        assert_eq!(sandbox.get_and_set_sandbox_block_index().await.unwrap(), 1);
        assert_eq!(sandbox.get_and_set_sandbox_block_index().await.unwrap(), 2);

        sandbox.unset_sandbox_block_index(1).await;
        assert_eq!(sandbox.get_and_set_sandbox_block_index().await.unwrap(), 1);
    }

    #[actix_rt::test]
    async fn test_coldplug_devices_feed_planner_inputs() {
        let mut config = mock_sandbox_config();
        config.coldplug_devices = vec![
            DeviceType::Vfio(hypervisor::device::VfioDevice::new(
                "vfio-0",
                hypervisor::device::VfioConfig {
                    sysfs_path: "/sys/bus/pci/devices/0000:3a:00.0".to_string(),
                    ..Default::default()
                },
            )),
            DeviceType::VhostUser(hypervisor::device::VhostUserDevice::new(
                "vub-0",
                hypervisor::device::VhostUserConfig {
                    dev_type: VhostUserType::Blk,
                    ..Default::default()
                },
            )),
        ];
        harvest_coldplug_devices(&mut config);
        let dev_info = &config.hypervisor_config.device_info;
        assert_eq!(dev_info.coldplug_vfio_devices.len(), 1);
        assert_eq!(dev_info.coldplug_vhost_user_blk, 1);
    }

    #[actix_rt::test]
    async fn test_restore_running_sandbox() {
        let sandbox = new_test_sandbox("sb-restore").await;
        sandbox.create().await.unwrap();
        sandbox.start().await.unwrap();
        sandbox.get_and_set_sandbox_block_index().await.unwrap();
        // persist once more so the record carries the block index
        sandbox.persist().await.unwrap();

        let restored = VirtSandbox::restore(
            "sb-restore",
            Arc::new(MockAgent::new()),
            None,
            Arc::new(NoopResourceController::default()),
        )
        .await
        .unwrap();
        assert_eq!(restored.status().await, SandboxStatus::Running);
        // index 0 is still taken, the next allocation moves on
        assert_eq!(restored.get_and_set_sandbox_block_index().await.unwrap(), 1);

        sandbox.stop(false).await.unwrap();
        persist::destroy("sb-restore").unwrap();
    }

    #[actix_rt::test]
    async fn test_container_updates_drive_resources() {
        let sandbox = new_test_sandbox("sb-res").await;
        sandbox.create().await.unwrap();
        sandbox.start().await.unwrap();

        let resources = LinuxResources {
            cpu: Some(agent::LinuxCpu {
                quota: Some(300_000),
                period: Some(100_000),
                ..Default::default()
            }),
            ..Default::default()
        };
        sandbox
            .create_container("c1", CreateContainerRequest::default(), Some(&resources))
            .await
            .unwrap();
        assert_eq!(sandbox.resource_manager_ref().current_vcpu().await, 4);

        sandbox.remove_container("c1", 5).await.unwrap();
        assert_eq!(sandbox.resource_manager_ref().current_vcpu().await, 1);

        sandbox.stop(false).await.unwrap();
    }
}
