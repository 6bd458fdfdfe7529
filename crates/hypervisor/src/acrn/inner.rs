// Copyright (c) 2023-2024 The Virtrun Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use lazy_static::lazy_static;
use nix::sys::signal::Signal;
use persist::sandbox_persist::Persist;
use tokio::sync::mpsc;

use crate::acrn::uuid_pool::UuidPool;
use crate::config::{HypervisorConfig, ASSET_IMAGE, ASSET_KERNEL};
use crate::device::{BlockDevice, DeviceType, SocketDevice};
use crate::error::HypervisorError;
use crate::kernel_param::KernelParams;
use crate::utils;
use crate::{
    Capabilities, CapabilityBits, HypervisorEvent, HypervisorState, VcpuThreadIds, VmmState,
    CONSOLE_PROTO_UNIX, CONSOLE_SOCK, CPU_AFFINITY_IDX_FILE, HYPERVISOR_ACRN, VM_PID_FILE,
    VM_ROOTFS_DRIVER_BLK,
};

/// Hot-attachable disk slots created at boot; slot 0 carries the VM rootfs.
pub(crate) const ACRN_BLOCK_POOL_SIZE: usize = 8;
/// Backing of an unused pool slot.
const ACRN_DUMMY_BACKING: &str = "nodisk";

const ACRN_DEV: &str = "/dev/acrn_hsm";
/// Encoded `GET_PLATFORM_INFO` request.
const ACRN_IOCTL_GET_PLATFORM_INFO: libc::c_ulong = 0x4300_0003;

/// Reply of `GET_PLATFORM_INFO`; only `max_kata_containers` is consumed, the
/// field names follow the kernel ABI.
#[repr(C)]
#[allow(dead_code)]
pub(crate) struct AcrnPlatformInfo {
    pub cpu_num: u16,
    reserved0: [u8; 126],
    pub max_vcpus_per_vm: u16,
    /// Platform limit on post-launched container VMs.
    pub max_kata_containers: u8,
    reserved1: [u8; 125],
}

fn get_platform_info(dev_path: &str) -> Result<AcrnPlatformInfo> {
    use nix::fcntl::{open, OFlag};
    use nix::sys::stat::Mode;

    let fd = open(dev_path, OFlag::O_RDWR | OFlag::O_CLOEXEC, Mode::empty())
        .map_err(|e| HypervisorError::Io(format!("open {}: {}", dev_path, e)))?;
    let mut info: AcrnPlatformInfo = unsafe { std::mem::zeroed() };
    let ret = unsafe { libc::ioctl(fd, ACRN_IOCTL_GET_PLATFORM_INFO, &mut info) };
    let _ = nix::unistd::close(fd);
    if ret < 0 {
        return Err(HypervisorError::Io(format!(
            "GET_PLATFORM_INFO: {}",
            std::io::Error::last_os_error()
        ))
        .into());
    }
    Ok(info)
}

lazy_static! {
    /// Process-wide allocator; busy slots mirror the VMs launched by this
    /// process. Allocation is synchronous and must not suspend.
    static ref UUID_POOL: Mutex<UuidPool> = Mutex::new(UuidPool::new());
}

pub(crate) struct AcrnInner {
    pub(crate) id: String,
    pub(crate) config: HypervisorConfig,
    pub(crate) state: VmmState,
    pub(crate) vm_path: PathBuf,
    pub(crate) uuid: String,
    pub(crate) vmm_pid: Option<i32>,
    /// Slot -> backing file; `None` means the slot still carries the dummy.
    pub(crate) block_pool: Vec<Option<String>>,
    pub(crate) stopped: bool,
    pub(crate) event_tx: Option<mpsc::Sender<HypervisorEvent>>,
}

impl AcrnInner {
    pub fn new(config: HypervisorConfig) -> Self {
        Self {
            id: String::new(),
            config,
            state: VmmState::NotReady,
            vm_path: PathBuf::new(),
            uuid: String::new(),
            vmm_pid: None,
            block_pool: vec![None; ACRN_BLOCK_POOL_SIZE],
            stopped: false,
            event_tx: None,
        }
    }

    pub fn set_event_notifier(&mut self, tx: mpsc::Sender<HypervisorEvent>) {
        self.event_tx = Some(tx);
    }

    pub fn hypervisor_config(&self) -> HypervisorConfig {
        self.config.clone()
    }

    pub async fn prepare_vm(&mut self, id: &str, _netns: Option<String>) -> Result<()> {
        if self.state != VmmState::NotReady {
            return Err(anyhow!("vm {} has already been prepared", self.id));
        }
        self.config.validate().context("validate config")?;

        self.id = id.to_string();
        self.vm_path = persist::run_vm_storage_path(id);

        if self.uuid.is_empty() {
            let mut pool = UUID_POOL.lock().unwrap();
            // the platform may allow fewer container VMs than the table holds
            match get_platform_info(ACRN_DEV) {
                Ok(info) if info.max_kata_containers > 0 => {
                    pool.set_capacity(info.max_kata_containers as usize);
                }
                Ok(_) => {}
                Err(e) => {
                    debug!(sl!(), "platform info unavailable, keeping full uuid pool";
                        "error" => format!("{}", e));
                }
            }
            self.uuid = pool.next_available()?.to_string();
        }

        info!(sl!(), "vm prepared"; "id" => id, "uuid" => self.uuid.as_str());
        self.state = VmmState::Created;
        Ok(())
    }

    pub async fn start_vm(&mut self, _timeout_secs: i32) -> Result<()> {
        if self.state != VmmState::Created {
            return Err(HypervisorError::NotRunning.into());
        }

        tokio::fs::create_dir_all(&self.vm_path)
            .await
            .with_context(|| format!("create vm dir {}", self.vm_path.display()))?;

        if let Err(e) = self.do_start_vm().await {
            error!(sl!(), "start vm failed, rolling back"; "error" => format!("{:#}", e));
            self.rollback_start().await;
            return Err(e);
        }
        self.state = VmmState::Running;
        Ok(())
    }

    async fn do_start_vm(&mut self) -> Result<()> {
        let args = self.build_launch_args()?;
        debug!(sl!(), "launching partitioning vmm";
            "path" => self.config.path.as_str(), "args" => args.join(" "));

        let mut child = tokio::process::Command::new(&self.config.path)
            .args(&args)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .spawn()
            .map_err(|e| HypervisorError::Io(format!("spawn vmm: {}", e)))?;

        let pid = child
            .id()
            .ok_or_else(|| anyhow!("vmm exited before its pid was read"))? as i32;
        self.vmm_pid = Some(pid);

        tokio::fs::write(self.vm_path.join(VM_PID_FILE), format!("{}", pid))
            .await
            .context("write vmm pid file")?;
        // the affinity index doubles as the stable per-VM slot on the host
        let affinity_idx = UUID_POOL.lock().unwrap().index_of(&self.uuid)?;
        tokio::fs::write(
            self.vm_path.join(CPU_AFFINITY_IDX_FILE),
            format!("{}", affinity_idx),
        )
        .await
        .context("write cpu affinity index")?;

        let event_tx = self.event_tx.clone();
        tokio::spawn(async move {
            let status = child.wait().await;
            let code = status.as_ref().ok().and_then(|s| s.code());
            info!(sl!(), "vmm exited"; "pid" => pid, "status" => format!("{:?}", status));
            if let Some(tx) = event_tx {
                let _ = tx.send(HypervisorEvent::VmmExited(code)).await;
            }
        });

        info!(sl!(), "vm started"; "id" => self.id.as_str(), "pid" => pid);
        Ok(())
    }

    async fn rollback_start(&mut self) {
        if let Some(pid) = self.vmm_pid.take() {
            let _ = utils::wait_with_signal(pid, Signal::SIGKILL).await;
        }
        if let Err(e) = tokio::fs::remove_dir_all(&self.vm_path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(sl!(), "remove vm dir during rollback"; "error" => format!("{}", e));
            }
        }
    }

    /// Minimal launch line: uuid, resources, rootfs at pool slot 0, dummy
    /// backing on the remaining slots, console and kernel.
    fn build_launch_args(&self) -> Result<Vec<String>> {
        let config = &self.config;
        let mut args: Vec<String> = vec![
            "--uuid".into(),
            self.uuid.clone(),
            "-s".into(),
            format!("0,virtio-blk,{}", config.asset(ASSET_IMAGE)),
        ];
        for slot in 1..ACRN_BLOCK_POOL_SIZE {
            let backing = self.block_pool[slot]
                .as_deref()
                .unwrap_or(ACRN_DUMMY_BACKING);
            args.push("-s".into());
            args.push(format!("{},virtio-blk,{}", slot, backing));
        }
        args.push("-s".into());
        args.push(format!(
            "{},virtio-console,socket:{}",
            ACRN_BLOCK_POOL_SIZE,
            self.vm_path.join(CONSOLE_SOCK).display()
        ));
        args.push("--cpus".into());
        args.push(format!("{}", config.boot_vcpus()));
        args.push("--memory".into());
        args.push(format!("{}M", config.memory_info.default_memory));

        let mut params = KernelParams::new(config.debug_info.enable_debug);
        params.append(&mut KernelParams::new_rootfs_kernel_params(
            VM_ROOTFS_DRIVER_BLK,
        ));
        params.append(&mut KernelParams::from_string(&config.boot_info.kernel_params));
        args.push("--kernel".into());
        args.push(config.asset(ASSET_KERNEL));
        args.push("--kernel-cmdline".into());
        args.push(params.to_string());
        args.push(self.id.clone());
        Ok(args)
    }

    pub async fn stop_vm(&mut self, wait_only: bool) -> Result<()> {
        if self.stopped {
            return Ok(());
        }

        let pid = match self.vmm_pid {
            Some(pid) => pid,
            None => {
                self.release_uuid();
                self.stopped = true;
                self.state = VmmState::Stopped;
                return Ok(());
            }
        };

        if wait_only {
            return utils::wait_for_exit(pid).await;
        }

        utils::wait_with_signal(pid, Signal::SIGKILL)
            .await
            .context("kill vmm")?;

        if let Err(e) = tokio::fs::remove_dir_all(&self.vm_path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(sl!(), "remove vm dir"; "error" => format!("{}", e));
            }
        }

        self.release_uuid();
        self.vmm_pid = None;
        self.stopped = true;
        self.state = VmmState::Stopped;
        info!(sl!(), "vm stopped"; "id" => self.id.as_str());
        Ok(())
    }

    fn release_uuid(&mut self) {
        if self.uuid.is_empty() {
            return;
        }
        if let Err(e) = UUID_POOL.lock().unwrap().release(&self.uuid) {
            warn!(sl!(), "release uuid"; "uuid" => self.uuid.as_str(),
                "error" => format!("{}", e));
        }
    }

    /// Cold-plugged disks claim a pool slot and boot with a real backing
    /// instead of the dummy. Everything else has no acrn counterpart.
    pub async fn add_device(&mut self, device: DeviceType) -> Result<()> {
        if self.state != VmmState::Created {
            return Err(HypervisorError::Config(
                "device cold-plug is only valid before the vm starts".to_string(),
            )
            .into());
        }
        match device {
            DeviceType::Block(b) => {
                let slot = self.next_free_pool_slot()?;
                self.block_pool[slot] = Some(b.config.path_on_host);
                Ok(())
            }
            other => Err(HypervisorError::Unsupported(format!(
                "cold-plug of {} on the partitioning hypervisor",
                other
            ))
            .into()),
        }
    }

    fn next_free_pool_slot(&self) -> Result<usize> {
        // slot 0 is the VM rootfs
        self.block_pool[1..]
            .iter()
            .position(|s| s.is_none())
            .map(|i| i + 1)
            .ok_or_else(|| {
                HypervisorError::ResourceExhausted("no free block pool slots".to_string()).into()
            })
    }

    /// The only supported hot-plug: point a prepared pool slot at a real
    /// disk through the control tool's rescan command.
    pub async fn hotplug_add_device(&mut self, device: DeviceType) -> Result<DeviceType> {
        if self.state != VmmState::Running {
            return Err(HypervisorError::NotRunning.into());
        }
        match device {
            DeviceType::Block(b) => self.blkrescan(b).await.map(DeviceType::Block),
            other => Err(HypervisorError::Unsupported(format!(
                "hotplug of {} on the partitioning hypervisor",
                other
            ))
            .into()),
        }
    }

    pub async fn hotplug_remove_device(&mut self, _device: DeviceType) -> Result<()> {
        Err(HypervisorError::Unsupported(
            "hot-unplug on the partitioning hypervisor".to_string(),
        )
        .into())
    }

    async fn blkrescan(&mut self, mut device: BlockDevice) -> Result<BlockDevice> {
        let slot = self.next_free_pool_slot()?;

        let output = tokio::process::Command::new(&self.config.ctlpath)
            .arg("blkrescan")
            .arg(&self.id)
            .arg(format!("{},{}", slot, device.config.path_on_host))
            .output()
            .await
            .map_err(|e| HypervisorError::Io(format!("run control tool: {}", e)))?;
        if !output.status.success() {
            return Err(HypervisorError::Io(format!(
                "blkrescan failed: {}",
                String::from_utf8_lossy(&output.stderr)
            ))
            .into());
        }

        self.block_pool[slot] = Some(device.config.path_on_host.clone());
        device.config.index = slot as u64;
        device.config.virt_path = Some(format!("/dev/vd{}", (b'a' + slot as u8) as char));
        Ok(device)
    }

    // operations without monitor support succeed as no-ops

    pub async fn pause_vm(&mut self) -> Result<()> {
        Ok(())
    }

    pub async fn resume_vm(&mut self) -> Result<()> {
        Ok(())
    }

    pub async fn save_vm(&self) -> Result<()> {
        Err(HypervisorError::Unsupported(
            "device-state save on the partitioning hypervisor".to_string(),
        )
        .into())
    }

    pub async fn resize_vcpu(&mut self, old_vcpus: u32, _new_vcpus: u32) -> Result<(u32, u32)> {
        Err(HypervisorError::Unsupported(format!(
            "vcpu resize on the partitioning hypervisor (current {})",
            old_vcpus
        ))
        .into())
    }

    pub async fn resize_memory(
        &mut self,
    ) -> Result<(u32, Option<crate::device::MemoryConfig>)> {
        Err(HypervisorError::Unsupported(
            "memory resize on the partitioning hypervisor".to_string(),
        )
        .into())
    }

    pub fn get_vm_console(&self) -> Result<(String, String)> {
        if self.stopped {
            return Err(HypervisorError::NotRunning.into());
        }
        Ok((
            CONSOLE_PROTO_UNIX.to_string(),
            self.vm_path.join(CONSOLE_SOCK).to_string_lossy().to_string(),
        ))
    }

    pub fn get_thread_ids(&self) -> Result<VcpuThreadIds> {
        // no monitor to enumerate vcpu threads from
        Ok(VcpuThreadIds::default())
    }

    pub fn get_pids(&self) -> Result<Vec<u32>> {
        Ok(self.vmm_pid.map(|p| p as u32).into_iter().collect())
    }

    pub fn get_vmm_master_tid(&self) -> Result<u32> {
        self.vmm_pid
            .map(|pid| pid as u32)
            .ok_or_else(|| HypervisorError::NotRunning.into())
    }

    pub fn generate_socket(&self) -> Result<DeviceType> {
        Ok(DeviceType::Socket(SocketDevice {
            device_id: format!("{}-agent", self.id),
            host_path: self.vm_path.join("agent.sock").to_string_lossy().to_string(),
            name: "agent.channel.0".to_string(),
        }))
    }

    pub async fn check(&self) -> Result<()> {
        if self.stopped || self.state == VmmState::Stopped {
            return Err(HypervisorError::NotRunning.into());
        }
        let pid = self.vmm_pid.ok_or(HypervisorError::NotRunning)?;
        if !utils::pid_alive(pid) {
            return Err(HypervisorError::NotRunning.into());
        }
        Ok(())
    }

    pub fn capabilities(&self) -> Capabilities {
        let mut caps = Capabilities::new();
        caps.set(CapabilityBits::BLOCK_DEVICE_SUPPORT | CapabilityBits::BLOCK_DEVICE_HOTPLUG_SUPPORT);
        caps
    }

    pub async fn cleanup(&mut self) -> Result<()> {
        if !self.stopped {
            self.stop_vm(false).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Persist for AcrnInner {
    type State = HypervisorState;
    type ConstructorArgs = ();

    async fn save(&self) -> Result<Self::State> {
        if self.stopped {
            return Ok(HypervisorState::default());
        }
        Ok(HypervisorState {
            hypervisor_type: HYPERVISOR_ACRN.to_string(),
            pid: self.vmm_pid,
            uuid: self.uuid.clone(),
            vm_path: self.vm_path.to_string_lossy().to_string(),
            block_pool: self.block_pool.clone(),
            config: self.config.clone(),
            ..Default::default()
        })
    }

    async fn restore(_args: Self::ConstructorArgs, state: Self::State) -> Result<Self> {
        let mut inner = AcrnInner::new(state.config.clone());
        inner.uuid = state.uuid.clone();
        inner.vm_path = PathBuf::from(&state.vm_path);
        inner.vmm_pid = state.pid;
        if !state.block_pool.is_empty() {
            inner.block_pool = state.block_pool.clone();
        }

        // busy slots re-derive from the set of VMs still alive
        match state.pid {
            Some(pid) if utils::pid_alive(pid) => {
                if !inner.uuid.is_empty() {
                    UUID_POOL.lock().unwrap().mark_busy(&inner.uuid)?;
                }
                inner.state = VmmState::Running;
            }
            _ => {
                inner.stopped = true;
                inner.state = VmmState::Stopped;
            }
        }
        Ok(inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acrn::uuid_pool::ACRN_UUIDS;
    use serial_test::serial;

    fn acrn_config() -> HypervisorConfig {
        let mut config = HypervisorConfig::default();
        config.boot_info.kernel = "/opt/virtrun/vmlinux".to_string();
        config.boot_info.image = "/opt/virtrun/rootfs.img".to_string();
        config.ctlpath = "/usr/bin/acrnctl".to_string();
        config
    }

    #[actix_rt::test]
    #[serial]
    async fn test_uuid_lifecycle() {
        let mut inner = AcrnInner::new(acrn_config());
        inner.prepare_vm("acrn-1", None).await.unwrap();
        let uuid = inner.uuid.clone();
        assert_eq!(uuid, ACRN_UUIDS[0]);
        assert!(UUID_POOL.lock().unwrap().is_busy(&uuid));

        inner.stop_vm(false).await.unwrap();
        assert!(!UUID_POOL.lock().unwrap().is_busy(&uuid));

        // the freed slot is the next allocation again
        let mut second = AcrnInner::new(acrn_config());
        second.prepare_vm("acrn-2", None).await.unwrap();
        assert_eq!(second.uuid, ACRN_UUIDS[0]);
        second.stop_vm(false).await.unwrap();
    }

    #[actix_rt::test]
    #[serial]
    async fn test_unsupported_operations() {
        let mut inner = AcrnInner::new(acrn_config());
        inner.prepare_vm("acrn-3", None).await.unwrap();

        let err = inner.resize_vcpu(1, 4).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<HypervisorError>(),
            Some(HypervisorError::Unsupported(_))
        ));
        let err = inner.resize_memory().await.map(|_| ()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<HypervisorError>(),
            Some(HypervisorError::Unsupported(_))
        ));
        let err = inner
            .hotplug_remove_device(DeviceType::Block(BlockDevice::default()))
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<HypervisorError>(),
            Some(HypervisorError::Unsupported(_))
        ));

        // pause and resume are monitor-less no-ops
        assert!(inner.pause_vm().await.is_ok());
        assert!(inner.resume_vm().await.is_ok());

        inner.stop_vm(false).await.unwrap();
    }

    #[actix_rt::test]
    #[serial]
    async fn test_stop_is_idempotent_and_save_empties() {
        let mut inner = AcrnInner::new(acrn_config());
        inner.prepare_vm("acrn-4", None).await.unwrap();
        inner.stop_vm(false).await.unwrap();
        inner.stop_vm(false).await.unwrap();
        let state = inner.save().await.unwrap();
        assert!(state.hypervisor_type.is_empty());
        assert!(state.uuid.is_empty());
    }

    #[test]
    fn test_launch_args_reserve_slot_zero() {
        let mut inner = AcrnInner::new(acrn_config());
        inner.id = "acrn-args".to_string();
        inner.uuid = ACRN_UUIDS[0].to_string();
        inner.vm_path = PathBuf::from("/tmp/acrn-args");
        let args = inner.build_launch_args().unwrap();
        let joined = args.join(" ");
        assert!(joined.contains("0,virtio-blk,/opt/virtrun/rootfs.img"));
        assert!(joined.contains("1,virtio-blk,nodisk"));
        assert!(joined.contains(&format!("--uuid {}", ACRN_UUIDS[0])));
    }

    #[actix_rt::test]
    #[serial]
    async fn test_coldplug_disk_claims_pool_slot() {
        let mut inner = AcrnInner::new(acrn_config());
        inner.prepare_vm("acrn-5", None).await.unwrap();

        let mut block = BlockDevice::default();
        block.config.path_on_host = "/var/lib/virtrun/c1-rootfs.img".to_string();
        inner.add_device(DeviceType::Block(block)).await.unwrap();

        let args = inner.build_launch_args().unwrap();
        let joined = args.join(" ");
        assert!(joined.contains("1,virtio-blk,/var/lib/virtrun/c1-rootfs.img"));
        assert!(joined.contains("2,virtio-blk,nodisk"));

        // anything but a disk has no counterpart on this backend
        let err = inner
            .add_device(DeviceType::Socket(SocketDevice::default()))
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<HypervisorError>(),
            Some(HypervisorError::Unsupported(_))
        ));

        inner.stop_vm(false).await.unwrap();
    }
}
