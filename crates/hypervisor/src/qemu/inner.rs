// Copyright (c) 2023-2024 The Virtrun Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use lazy_static::lazy_static;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use persist::sandbox_persist::Persist;
use regex::Regex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

use crate::config::{HypervisorConfig, ASSET_FIRMWARE, ASSET_IMAGE, ASSET_INITRD, ASSET_KERNEL};
use crate::device::{DeviceType, VsockConfig};
use crate::error::HypervisorError;
use crate::kernel_param::KernelParams;
use crate::pci::{Bridge, BridgeType, MachineType, PcieTopology, TopologyInputs};
use crate::qemu::qmp::{QmpClient, QmpEvent, EVENT_GUEST_PANICKED};
use crate::share_fs::{ShareFsDaemon, Virtiofsd};
use crate::utils;
use crate::{
    Capabilities, CapabilityBits, HypervisorEvent, HypervisorState, VcpuThreadIds, VmmState,
    CONSOLE_PROTO_UNIX, CONSOLE_SOCK, HYPERVISOR_QEMU, QMP_SOCK, VHOST_FS_SOCK, VM_PID_FILE,
    VM_ROOTFS_DRIVER_BLK, VM_ROOTFS_DRIVER_PMEM,
};

/// Fd number the monitor listener lands on in the child.
const QMP_EXTRA_FD: i32 = 3;

lazy_static! {
    /// VMM stderr lines of the shape `<prefix>: warning: <msg>` are warnings,
    /// everything else is an error.
    static ref VMM_WARNING_RE: Regex =
        Regex::new(r"^(?P<prefix>[^:]+): warning: (?P<msg>.*)").unwrap();
}

pub(crate) struct QemuInner {
    pub(crate) id: String,
    pub(crate) config: HypervisorConfig,
    pub(crate) state: VmmState,
    pub(crate) vm_path: PathBuf,
    pub(crate) netns: Option<String>,
    pub(crate) uuid: String,
    /// Build-time device list, consumed by the launcher.
    pub(crate) devices: Vec<DeviceType>,
    pub(crate) bridges: Vec<Bridge>,
    pub(crate) topology: Option<PcieTopology>,
    pub(crate) qmp: Option<QmpClient>,
    pub(crate) vmm_pid: Option<i32>,
    pub(crate) share_fs_daemon: Option<Box<dyn ShareFsDaemon>>,
    pub(crate) hotplugged_vcpus: Vec<String>,
    pub(crate) next_cpu_id: u32,
    pub(crate) hotplugged_mem_mb: u32,
    pub(crate) next_mem_slot: u32,
    /// Terminal; set once `stop_vm` completed a kill path.
    pub(crate) stopped: bool,
    pub(crate) event_tx: Option<mpsc::Sender<HypervisorEvent>>,
}

impl QemuInner {
    pub fn new(config: HypervisorConfig) -> Self {
        Self {
            id: String::new(),
            config,
            state: VmmState::NotReady,
            vm_path: PathBuf::new(),
            netns: None,
            uuid: String::new(),
            devices: vec![],
            bridges: vec![],
            topology: None,
            qmp: None,
            vmm_pid: None,
            share_fs_daemon: None,
            hotplugged_vcpus: vec![],
            next_cpu_id: 0,
            hotplugged_mem_mb: 0,
            next_mem_slot: 0,
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

    pub(crate) fn qmp(&self) -> Result<&QmpClient> {
        self.qmp
            .as_ref()
            .ok_or_else(|| HypervisorError::Transport("monitor not connected".to_string()).into())
    }

    pub(crate) fn machine_type(&self) -> MachineType {
        MachineType::from_str(&self.config.machine_info.machine_type).unwrap_or(MachineType::Q35)
    }

    pub(crate) fn bridge_type(&self) -> BridgeType {
        match self.machine_type() {
            MachineType::Ccw => BridgeType::Ccw,
            _ => BridgeType::Pci,
        }
    }

    // lifecycle

    pub async fn prepare_vm(&mut self, id: &str, netns: Option<String>) -> Result<()> {
        if self.state != VmmState::NotReady {
            return Err(anyhow!("vm {} has already been prepared", self.id));
        }
        self.config.validate().context("validate config")?;

        self.id = id.to_string();
        self.netns = netns;
        self.vm_path = persist::run_vm_storage_path(id);

        // the uuid survives restore; only mint one on first create
        if self.uuid.is_empty() {
            self.uuid = generate_uuid();
        }

        let bridge_type = self.bridge_type();
        for i in 0..self.config.device_info.default_bridges.max(1) {
            self.bridges.push(Bridge::new(
                &format!("{}-bridge-{}", self.id, i),
                bridge_type,
                2 + i,
            ));
        }

        let firmware = self.config.asset(ASSET_FIRMWARE);
        let dev_info = &self.config.device_info;
        let inputs = TopologyInputs {
            machine_type: MachineType::from_str(&self.config.machine_info.machine_type)
                .unwrap_or(MachineType::Q35),
            hotplug_vfio: self.config.machine_info.hotplug_vfio,
            coldplug_vfio: self.config.machine_info.coldplug_vfio,
            root_port_count: self.config.machine_info.pcie_root_port,
            switch_port_count: self.config.machine_info.pcie_switch_port,
            vfio_pcie_function_count: dev_info.coldplug_vfio_devices.len() as u32,
            vfio_sysfs_paths: &dev_info.coldplug_vfio_devices,
            vhost_user_blk_count: dev_info.coldplug_vhost_user_blk,
            endpoint_count: dev_info.network_endpoints,
            virtio_mem: self.config.memory_info.enable_virtio_mem,
            firmware: &firmware,
            base_slot: 2 + dev_info.default_bridges.max(1),
        };
        let topology = PcieTopology::plan(&inputs).context("plan pcie topology")?;
        self.topology = topology;

        info!(sl!(), "vm prepared";
            "id" => id, "uuid" => self.uuid.as_str(),
            "bridges" => self.bridges.len(),
            "root_ports" => self.topology.as_ref().map(|t| t.root_ports.len()).unwrap_or(0));
        self.state = VmmState::Created;
        Ok(())
    }

    pub async fn start_vm(&mut self, timeout_secs: i32) -> Result<()> {
        if self.state != VmmState::Created {
            return Err(HypervisorError::NotRunning.into());
        }
        if let Err(e) = self.do_start_vm(timeout_secs).await {
            error!(sl!(), "start vm failed, rolling back"; "error" => format!("{:#}", e));
            self.rollback_start().await;
            return Err(e);
        }
        self.state = VmmState::Running;
        Ok(())
    }

    async fn do_start_vm(&mut self, timeout_secs: i32) -> Result<()> {
        tokio::fs::create_dir_all(&self.vm_path)
            .await
            .with_context(|| format!("create vm dir {}", self.vm_path.display()))?;

        self.set_selinux_exec_label()?;
        self.start_share_fs_daemon().await?;

        // the monitor listener exists before the child so a transport
        // failure surfaces at connect rather than as a silent boot hang
        let qmp_path = self.vm_path.join(QMP_SOCK);
        if qmp_path.exists() {
            std::fs::remove_file(&qmp_path).context("remove stale monitor socket")?;
        }
        let qmp_listener = std::os::unix::net::UnixListener::bind(&qmp_path)
            .with_context(|| format!("bind monitor socket {}", qmp_path.display()))?;
        let qmp_fd = nix::unistd::dup(qmp_listener.as_raw_fd()).context("dup monitor listener")?;

        let spawn_result = self.spawn_vmm(qmp_fd).await;
        // child has its own copy now (or never will)
        let _ = nix::unistd::close(qmp_fd);
        drop(qmp_listener);
        spawn_result?;

        let (qmp_event_tx, qmp_event_rx) = mpsc::channel(16);
        let timeout = Duration::from_secs(timeout_secs.max(1) as u64);
        let qmp = QmpClient::connect(&qmp_path, timeout, qmp_event_tx)
            .await
            .context("monitor handshake")?;
        self.qmp = Some(qmp);
        self.spawn_monitor_event_loop(qmp_event_rx);

        info!(sl!(), "vm started"; "id" => self.id.as_str(), "pid" => self.vmm_pid);
        Ok(())
    }

    /// Reverse cleanup of a partially started VM: kill the child, stop the
    /// daemon, remove the working directory.
    async fn rollback_start(&mut self) {
        self.qmp = None;
        if let Some(pid) = self.vmm_pid.take() {
            let _ = kill(Pid::from_raw(pid), Signal::SIGKILL);
            let _ = utils::wait_for_exit(pid).await;
        }
        if let Some(daemon) = self.share_fs_daemon.as_mut() {
            if let Err(e) = daemon.stop().await {
                warn!(sl!(), "stop shared-fs daemon during rollback"; "error" => format!("{}", e));
            }
        }
        if let Err(e) = tokio::fs::remove_dir_all(&self.vm_path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(sl!(), "remove vm dir during rollback"; "error" => format!("{}", e));
            }
        }
    }

    fn set_selinux_exec_label(&self) -> Result<()> {
        let label = &self.config.security_info.selinux_label;
        if label.is_empty() {
            return Ok(());
        }
        std::fs::write("/proc/thread-self/attr/exec", label)
            .with_context(|| format!("set selinux exec label {:?}", label))
    }

    async fn start_share_fs_daemon(&mut self) -> Result<()> {
        if self.config.shared_fs_kind() != crate::config::SHARED_FS_VIRTIO_FS
            && self.config.shared_fs_kind() != crate::config::SHARED_FS_VIRTIO_FS_NYDUS
        {
            return Ok(());
        }

        let socket_path = self.vm_path.join(VHOST_FS_SOCK);
        let shared_dir = persist::run_storage_path(&self.id).join("shared");
        tokio::fs::create_dir_all(&shared_dir)
            .await
            .context("create shared dir")?;

        let mut daemon = Virtiofsd::new(
            &self.config.shared_fs.virtio_fs_daemon,
            &socket_path.to_string_lossy(),
            &shared_dir.to_string_lossy(),
            &self.config.shared_fs.virtio_fs_cache,
            self.config.shared_fs.virtio_fs_extra_args.clone(),
            self.config.debug_info.enable_debug,
        );

        // route daemon exit through the owner's event channel instead of
        // calling back into the sandbox from the watcher task
        if let Some(event_tx) = self.event_tx.clone() {
            let (quit_tx, mut quit_rx) = mpsc::channel(1);
            daemon.set_on_quit(quit_tx);
            tokio::spawn(async move {
                if quit_rx.recv().await.is_some() {
                    let _ = event_tx.send(HypervisorEvent::ShareFsDaemonExited).await;
                }
            });
        }

        daemon.start().await.context("start shared-fs daemon")?;
        self.share_fs_daemon = Some(Box::new(daemon));
        Ok(())
    }

    async fn spawn_vmm(&mut self, qmp_fd: RawFd) -> Result<()> {
        let args = self.build_launch_args()?;
        debug!(sl!(), "launching vmm"; "path" => self.config.path.as_str(),
            "args" => args.join(" "));

        let mut cmd = tokio::process::Command::new(&self.config.path);
        cmd.args(&args)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped());

        // tap devices live in the sandbox netns; the child joins it before
        // exec
        let netns_fd = match &self.netns {
            Some(path) => {
                use nix::fcntl::{open, OFlag};
                use nix::sys::stat::Mode;
                Some(
                    open(path.as_str(), OFlag::O_RDONLY | OFlag::O_CLOEXEC, Mode::empty())
                        .map_err(|e| {
                            HypervisorError::Io(format!("open netns {}: {}", path, e))
                        })?,
                )
            }
            None => None,
        };

        unsafe {
            cmd.pre_exec(move || {
                if libc::dup2(qmp_fd, QMP_EXTRA_FD) < 0 {
                    return Err(std::io::Error::last_os_error());
                }
                if let Some(fd) = netns_fd {
                    if libc::setns(fd, libc::CLONE_NEWNET) < 0 {
                        return Err(std::io::Error::last_os_error());
                    }
                }
                Ok(())
            });
        }

        let spawned = cmd
            .spawn()
            .map_err(|e| HypervisorError::Io(format!("spawn vmm: {}", e)));
        if let Some(fd) = netns_fd {
            let _ = nix::unistd::close(fd);
        }
        let mut child = spawned?;
        let pid = child
            .id()
            .ok_or_else(|| anyhow!("vmm exited before its pid was read"))? as i32;
        self.vmm_pid = Some(pid);

        tokio::fs::write(self.vm_path.join(VM_PID_FILE), format!("{}", pid))
            .await
            .context("write vmm pid file")?;

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(log_vmm_output(stderr));
        }
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(log_vmm_output(stdout));
        }

        // reap the child and surface its exit to the owner
        let event_tx = self.event_tx.clone();
        tokio::spawn(async move {
            let status = child.wait().await;
            let code = status.as_ref().ok().and_then(|s| s.code());
            info!(sl!(), "vmm exited"; "pid" => pid, "status" => format!("{:?}", status));
            if let Some(tx) = event_tx {
                let _ = tx.send(HypervisorEvent::VmmExited(code)).await;
            }
        });

        Ok(())
    }

    /// Minimal launch line: machine identity, resources, the monitor on the
    /// inherited fd, kernel and boot assets, serial console.
    fn build_launch_args(&self) -> Result<Vec<String>> {
        let config = &self.config;
        let mut args: Vec<String> = vec![
            "-name".into(),
            format!("sandbox-{}", self.id),
            "-uuid".into(),
            self.uuid.clone(),
            "-machine".into(),
            config.machine_info.machine_type.clone(),
            "-smp".into(),
            format!(
                "{},maxcpus={}",
                config.boot_vcpus(),
                config.cpu_info.default_maxvcpus.max(config.boot_vcpus())
            ),
            "-m".into(),
            format!(
                "{}M,slots={},maxmem={}M",
                config.memory_info.default_memory,
                config.memory_info.memory_slots,
                config
                    .memory_info
                    .default_max_memory
                    .max(config.memory_info.default_memory),
            ),
            "-chardev".into(),
            format!("socket,id=qmpmon,fd={},server=on,wait=off", QMP_EXTRA_FD),
            "-mon".into(),
            "chardev=qmpmon,mode=control".into(),
            "-kernel".into(),
            config.asset(ASSET_KERNEL),
            "-chardev".into(),
            format!(
                "socket,id=console,path={},server=on,wait=off",
                self.vm_path.join(CONSOLE_SOCK).display()
            ),
            "-serial".into(),
            "chardev:console".into(),
            "-nographic".into(),
            "-nodefaults".into(),
        ];

        let initrd = config.asset(ASSET_INITRD);
        let image = config.asset(ASSET_IMAGE);
        let mut params = KernelParams::new(config.debug_info.enable_debug);
        if !initrd.is_empty() {
            args.push("-initrd".into());
            args.push(initrd);
        } else {
            let rootfs_driver = if image.ends_with(".img") || !config.memory_info.enable_hugepages {
                VM_ROOTFS_DRIVER_BLK
            } else {
                VM_ROOTFS_DRIVER_PMEM
            };
            args.push("-drive".into());
            args.push(format!(
                "file={},format=raw,if=virtio,readonly=on",
                image
            ));
            params.append(&mut KernelParams::new_rootfs_kernel_params(rootfs_driver));
        }
        params.append(&mut KernelParams::from_string(&config.boot_info.kernel_params));
        args.push("-append".into());
        args.push(params.to_string());

        let firmware = config.asset(ASSET_FIRMWARE);
        if !firmware.is_empty() {
            args.push("-bios".into());
            args.push(firmware);
        }

        // firmware that honors it learns the 64-bit MMIO window over fw-cfg
        if let Some(aperture) = self.topology.as_ref().and_then(|t| t.mmio64_aperture_mib) {
            args.push("-fw_cfg".into());
            args.push(format!("name=opt/ovmf/X-PciMmio64Mb,string={}", aperture));
        }

        self.push_bridge_args(&mut args);
        self.push_device_args(&mut args)?;

        // the second, untrusted monitor is a debug facility only
        let extra_monitor = &config.debug_info.extra_monitor_socket;
        if !extra_monitor.is_empty() {
            if config.debug_info.enable_debug {
                args.push("-monitor".into());
                args.push(format!("unix:{},server=on,wait=off", extra_monitor));
            } else {
                warn!(sl!(), "extra monitor socket ignored without debug");
            }
        }

        Ok(args)
    }

    /// Bridges and planned hot-plug ports from `prepare_vm` become boot-time
    /// devices.
    fn push_bridge_args(&self, args: &mut Vec<String>) {
        for bridge in &self.bridges {
            let driver = match bridge.bridge_type {
                BridgeType::Pci | BridgeType::Pcie => "pci-bridge",
                BridgeType::Ccw => "virtio-bridge-ccw",
            };
            args.push("-device".into());
            args.push(format!(
                "{},id={},chassis_nr={},addr={:#x}",
                driver, bridge.id, bridge.addr, bridge.addr
            ));
        }
        if let Some(topology) = &self.topology {
            for port in &topology.root_ports {
                args.push("-device".into());
                args.push(format!(
                    "pcie-root-port,id={},addr={:#x}",
                    port.id, port.slot
                ));
            }
            if let Some(upstream) = &topology.upstream_port {
                args.push("-device".into());
                args.push(format!(
                    "x3130-upstream,id={},bus={}",
                    upstream,
                    topology
                        .root_ports
                        .first()
                        .map(|p| p.id.as_str())
                        .unwrap_or_default()
                ));
                for port in &topology.switch_ports {
                    args.push("-device".into());
                    args.push(format!(
                        "xio3130-downstream,id={},bus={},chassis={}",
                        port.id, upstream, port.slot
                    ));
                }
            }
        }
    }

    /// Descriptors cold-plugged through `add_device` join the launch line.
    fn push_device_args(&self, args: &mut Vec<String>) -> Result<()> {
        for device in &self.devices {
            match device {
                DeviceType::Block(b) => {
                    args.push("-drive".into());
                    args.push(format!(
                        "file={},format={},if=none,id=drive-{}",
                        b.config.path_on_host,
                        if b.config.format.is_empty() {
                            "raw"
                        } else {
                            &b.config.format
                        },
                        b.config.index
                    ));
                    args.push("-device".into());
                    args.push(format!(
                        "virtio-blk-pci,drive=drive-{},id={}",
                        b.config.index, b.device_id
                    ));
                }
                DeviceType::ShareFs(fs) => {
                    args.push("-chardev".into());
                    args.push(format!("socket,id=char-{},path={}", fs.mount_tag, fs.sock_path));
                    args.push("-device".into());
                    args.push(format!(
                        "vhost-user-fs-pci,chardev=char-{},tag={}",
                        fs.mount_tag, fs.mount_tag
                    ));
                }
                DeviceType::Vsock(v) => {
                    args.push("-device".into());
                    args.push(format!(
                        "vhost-vsock-pci,guest-cid={},vhostfd={}",
                        v.guest_cid, v.vhost_fd
                    ));
                }
                DeviceType::Vfio(v) => {
                    args.push("-device".into());
                    args.push(format!("vfio-pci,host={}", v.config.bus_slot_func));
                }
                DeviceType::VhostUser(v) => {
                    args.push("-chardev".into());
                    args.push(format!(
                        "socket,id=char-{},path={}",
                        v.device_id, v.config.socket_path
                    ));
                    args.push("-device".into());
                    args.push(format!(
                        "vhost-user-blk-pci,chardev=char-{},id={}",
                        v.device_id, v.device_id
                    ));
                }
                DeviceType::Socket(s) => {
                    args.push("-chardev".into());
                    args.push(format!(
                        "socket,id={},path={},server=on,wait=off",
                        s.name, s.host_path
                    ));
                }
                other => {
                    return Err(HypervisorError::Unsupported(format!(
                        "cold-plug of {} on this backend",
                        other
                    ))
                    .into())
                }
            }
        }
        Ok(())
    }

    fn spawn_monitor_event_loop(&self, mut event_rx: mpsc::Receiver<QmpEvent>) {
        let event_tx = self.event_tx.clone();
        tokio::spawn(async move {
            while let Some(event) = event_rx.recv().await {
                match event.name.as_str() {
                    EVENT_GUEST_PANICKED => {
                        error!(sl!(), "guest panicked"; "data" => format!("{}", event.data));
                        if let Some(tx) = &event_tx {
                            let _ = tx.send(HypervisorEvent::GuestPanicked).await;
                        }
                    }
                    other => {
                        debug!(sl!(), "monitor event"; "event" => other);
                    }
                }
            }
        });
    }

    pub async fn stop_vm(&mut self, wait_only: bool) -> Result<()> {
        if self.stopped {
            return Ok(());
        }

        let pid = match self.vmm_pid {
            Some(pid) => pid,
            None => {
                // never started; nothing to kill but the state still closes
                self.stopped = true;
                self.state = VmmState::Stopped;
                return Ok(());
            }
        };

        if wait_only {
            return utils::wait_for_exit(pid).await;
        }

        let _ = kill(Pid::from_raw(pid), Signal::SIGKILL);
        if let Err(e) = utils::wait_for_exit(pid).await {
            warn!(sl!(), "vmm did not exit after SIGKILL"; "pid" => pid,
                "error" => format!("{}", e));
        }
        self.qmp = None;

        if let Some(daemon) = self.share_fs_daemon.as_mut() {
            if let Err(e) = daemon.stop().await {
                warn!(sl!(), "stop shared-fs daemon"; "error" => format!("{}", e));
            }
        }

        // the vm dir may be a symlink kept short for socket path limits;
        // remove the target as well
        if let Ok(target) = std::fs::read_link(&self.vm_path) {
            let _ = tokio::fs::remove_dir_all(&target).await;
        }
        if let Err(e) = tokio::fs::remove_dir_all(&self.vm_path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(sl!(), "remove vm dir"; "error" => format!("{}", e));
            }
        }

        if self.config.security_info.rootless {
            self.remove_vm_user().await;
        }

        self.vmm_pid = None;
        self.stopped = true;
        self.state = VmmState::Stopped;
        info!(sl!(), "vm stopped"; "id" => self.id.as_str());
        Ok(())
    }

    /// Rootless deployments run each VM under a dedicated user.
    async fn remove_vm_user(&self) {
        let user = format!("virtrun-{}", self.id);
        match tokio::process::Command::new("userdel")
            .arg("-r")
            .arg(&user)
            .output()
            .await
        {
            Ok(output) if output.status.success() => {}
            Ok(output) => warn!(sl!(), "userdel failed"; "user" => user.as_str(),
                "stderr" => String::from_utf8_lossy(&output.stderr).to_string()),
            Err(e) => warn!(sl!(), "userdel failed"; "user" => user.as_str(),
                "error" => format!("{}", e)),
        }
    }

    pub async fn pause_vm(&mut self) -> Result<()> {
        if self.state != VmmState::Running {
            return Err(HypervisorError::NotRunning.into());
        }
        self.qmp()?.stop_vm().await.context("monitor stop")?;
        self.state = VmmState::Paused;
        Ok(())
    }

    pub async fn resume_vm(&mut self) -> Result<()> {
        if self.state != VmmState::Paused {
            return Err(HypervisorError::NotRunning.into());
        }
        self.qmp()?.cont_vm().await.context("monitor cont")?;
        self.state = VmmState::Running;
        Ok(())
    }

    pub async fn save_vm(&self) -> Result<()> {
        if !self.config.boot_from_template {
            return Err(HypervisorError::Unsupported(
                "device-state save needs template boot enabled".to_string(),
            )
            .into());
        }
        if self.config.template_path.is_empty() {
            return Err(HypervisorError::Config("template path is not set".to_string()).into());
        }
        let qmp = self.qmp()?;
        qmp.stop_vm().await.context("stop before save")?;
        qmp.execute(
            "migrate",
            Some(serde_json::json!({
                "uri": format!("exec:cat > {}", self.config.template_path),
            })),
        )
        .await
        .context("migrate to template file")?;
        Ok(())
    }

    pub async fn add_device(&mut self, device: DeviceType) -> Result<()> {
        if self.state != VmmState::Created {
            return Err(HypervisorError::Config(
                "device cold-plug is only valid before the vm starts".to_string(),
            )
            .into());
        }
        self.devices.push(device);
        Ok(())
    }

    // introspection

    pub fn get_vm_console(&self) -> Result<(String, String)> {
        if self.stopped {
            return Err(HypervisorError::NotRunning.into());
        }
        Ok((
            CONSOLE_PROTO_UNIX.to_string(),
            self.vm_path.join(CONSOLE_SOCK).to_string_lossy().to_string(),
        ))
    }

    pub async fn get_thread_ids(&self) -> Result<VcpuThreadIds> {
        let mut thread_ids = VcpuThreadIds::default();
        for cpu in self.qmp()?.query_cpus_fast().await? {
            thread_ids.vcpus.insert(cpu.cpu_index, cpu.thread_id);
        }
        Ok(thread_ids)
    }

    pub fn get_pids(&self) -> Result<Vec<u32>> {
        let mut pids = vec![];
        if let Some(pid) = self.vmm_pid {
            pids.push(pid as u32);
        }
        if let Some(daemon) = &self.share_fs_daemon {
            if daemon.pid() != 0 {
                pids.push(daemon.pid());
            }
        }
        Ok(pids)
    }

    pub fn get_vmm_master_tid(&self) -> Result<u32> {
        self.vmm_pid
            .map(|pid| pid as u32)
            .ok_or_else(|| HypervisorError::NotRunning.into())
    }

    pub fn generate_socket(&mut self) -> Result<DeviceType> {
        let (guest_cid, vhost_fd) = utils::generate_vhost_vsock_cid()?;
        Ok(DeviceType::Vsock(VsockConfig {
            guest_cid,
            vhost_fd,
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

        if let Ok(qmp) = self.qmp() {
            let status = qmp.query_status().await.context("query status")?;
            match status.status.as_str() {
                crate::qemu::qmp::STATUS_INTERNAL_ERROR
                | crate::qemu::qmp::STATUS_GUEST_PANICKED => {
                    return Err(HypervisorError::GuestFailure(status.status).into());
                }
                _ => {}
            }
        }
        Ok(())
    }

    pub fn capabilities(&self) -> Capabilities {
        let mut caps = Capabilities::new();
        caps.set(
            CapabilityBits::BLOCK_DEVICE_SUPPORT
                | CapabilityBits::BLOCK_DEVICE_HOTPLUG_SUPPORT
                | CapabilityBits::NET_DEVICE_HOTPLUG_SUPPORT
                | CapabilityBits::VFIO_HOTPLUG_SUPPORT
                | CapabilityBits::MULTI_QUEUE_SUPPORT
                | CapabilityBits::FS_SHARING_SUPPORT
                | CapabilityBits::CPU_HOTPLUG_SUPPORT
                | CapabilityBits::MEM_HOTPLUG_SUPPORT
                | CapabilityBits::VM_TEMPLATE_SUPPORT,
        );
        caps
    }

    pub async fn cleanup(&mut self) -> Result<()> {
        if !self.stopped {
            self.stop_vm(false).await?;
        }
        Ok(())
    }
}

/// Forward one VMM output stream into the logger, preserving the
/// warning/error distinction.
async fn log_vmm_output<R>(stream: R)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stream).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if line.is_empty() {
            continue;
        }
        match VMM_WARNING_RE.captures(&line) {
            Some(caps) => {
                warn!(sl!(), "vmm"; "prefix" => caps.name("prefix").map(|m| m.as_str().to_string()),
                    "msg" => caps.name("msg").map(|m| m.as_str().to_string()))
            }
            None => error!(sl!(), "vmm"; "msg" => line),
        }
    }
}

/// A v4-format uuid from the thread-local generator.
fn generate_uuid() -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    let b: [u8; 16] = rng.gen();
    format!(
        "{:02x}{:02x}{:02x}{:02x}-{:02x}{:02x}-4{:01x}{:02x}-{:02x}{:02x}-{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}",
        b[0], b[1], b[2], b[3],
        b[4], b[5],
        b[6] & 0x0f, b[7],
        (b[8] & 0x3f) | 0x80, b[9],
        b[10], b[11], b[12], b[13], b[14], b[15]
    )
}

#[async_trait]
impl Persist for QemuInner {
    type State = HypervisorState;
    type ConstructorArgs = ();

    async fn save(&self) -> Result<Self::State> {
        // a stopped vm saves as an empty record
        if self.stopped {
            return Ok(HypervisorState::default());
        }
        Ok(HypervisorState {
            hypervisor_type: HYPERVISOR_QEMU.to_string(),
            pid: self.vmm_pid,
            uuid: self.uuid.clone(),
            vm_path: self.vm_path.to_string_lossy().to_string(),
            hotplug_vfio: self.config.machine_info.hotplug_vfio,
            bridges: self.bridges.clone(),
            topology: self.topology.clone(),
            hotplugged_vcpus: self.hotplugged_vcpus.clone(),
            hotplugged_mem_mb: self.hotplugged_mem_mb,
            next_mem_slot: self.next_mem_slot,
            block_pool: Vec::new(),
            share_fs_daemon_pid: self
                .share_fs_daemon
                .as_ref()
                .map(|d| d.pid() as i32)
                .unwrap_or(0),
            config: self.config.clone(),
        })
    }

    async fn restore(_args: Self::ConstructorArgs, state: Self::State) -> Result<Self> {
        let mut inner = QemuInner::new(state.config.clone());
        inner.uuid = state.uuid.clone();
        inner.vm_path = PathBuf::from(&state.vm_path);
        inner.bridges = state.bridges.clone();
        inner.topology = state.topology.clone();
        inner.hotplugged_vcpus = state.hotplugged_vcpus.clone();
        inner.next_cpu_id = state.hotplugged_vcpus.len() as u32;
        inner.hotplugged_mem_mb = state.hotplugged_mem_mb;
        inner.next_mem_slot = state.next_mem_slot;
        inner.vmm_pid = state.pid;

        match state.pid {
            Some(pid) if utils::pid_alive(pid) => {
                inner.state = VmmState::Running;
                // re-dial the monitor; a restored vm without one only loses
                // hotplug until the next connect attempt
                let (event_tx, _event_rx) = mpsc::channel(16);
                let qmp_path = Path::new(&state.vm_path).join(QMP_SOCK);
                match QmpClient::connect(&qmp_path, Duration::from_secs(5), event_tx).await {
                    Ok(qmp) => inner.qmp = Some(qmp),
                    Err(e) => warn!(sl!(), "monitor reconnect failed on restore";
                        "error" => format!("{:#}", e)),
                }
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

    fn prepared_config() -> HypervisorConfig {
        let mut config = HypervisorConfig::default();
        config.boot_info.kernel = "/opt/virtrun/vmlinux".to_string();
        config.boot_info.image = "/opt/virtrun/rootfs.img".to_string();
        config.machine_info.machine_type = "q35".to_string();
        config.device_info.default_bridges = 1;
        config
    }

    #[actix_rt::test]
    async fn test_prepare_vm_mints_uuid_once() {
        let mut inner = QemuInner::new(prepared_config());
        inner.prepare_vm("sb-1", None).await.unwrap();
        let uuid = inner.uuid.clone();
        assert!(!uuid.is_empty());
        assert_eq!(inner.state, VmmState::Created);
        assert_eq!(inner.bridges.len(), 1);

        // a second prepare on the same instance is a caller bug
        assert!(inner.prepare_vm("sb-1", None).await.is_err());

        // a restore-style instance keeps the saved uuid
        let mut restored = QemuInner::new(prepared_config());
        restored.uuid = uuid.clone();
        restored.prepare_vm("sb-1", None).await.unwrap();
        assert_eq!(restored.uuid, uuid);
    }

    #[actix_rt::test]
    async fn test_stop_vm_is_idempotent_and_save_empties() {
        let mut inner = QemuInner::new(prepared_config());
        inner.prepare_vm("sb-2", None).await.unwrap();

        inner.stop_vm(false).await.unwrap();
        inner.stop_vm(false).await.unwrap();
        assert!(inner.stopped);

        let state = inner.save().await.unwrap();
        assert!(state.hypervisor_type.is_empty());
        assert!(state.pid.is_none());
    }

    #[actix_rt::test]
    async fn test_add_device_only_before_start() {
        let mut inner = QemuInner::new(prepared_config());
        inner.prepare_vm("sb-3", None).await.unwrap();
        inner
            .add_device(DeviceType::Socket(crate::device::SocketDevice::default()))
            .await
            .unwrap();
        assert_eq!(inner.devices.len(), 1);

        inner.stop_vm(false).await.unwrap();
        assert!(inner
            .add_device(DeviceType::Socket(crate::device::SocketDevice::default()))
            .await
            .is_err());
    }

    #[actix_rt::test]
    async fn test_check_fails_when_not_running() {
        let inner = QemuInner::new(prepared_config());
        let err = inner.check().await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<HypervisorError>(),
            Some(HypervisorError::NotRunning)
        ));
    }

    #[test]
    fn test_vmm_warning_regex() {
        let caps = VMM_WARNING_RE
            .captures("qemu-system-x86_64: warning: host does not support x2apic")
            .unwrap();
        assert_eq!(&caps["prefix"], "qemu-system-x86_64");
        assert_eq!(&caps["msg"], "host does not support x2apic");

        assert!(VMM_WARNING_RE
            .captures("qemu-system-x86_64: Failed to open file")
            .is_none());
    }

    #[test]
    fn test_generate_uuid_shape() {
        let uuid = generate_uuid();
        assert_eq!(uuid.len(), 36);
        let fields: Vec<&str> = uuid.split('-').collect();
        assert_eq!(fields.len(), 5);
        assert!(fields[2].starts_with('4'));
    }

    #[test]
    fn test_launch_args_carry_monitor_fd() {
        let mut inner = QemuInner::new(prepared_config());
        inner.id = "sb-args".to_string();
        inner.uuid = generate_uuid();
        inner.vm_path = PathBuf::from("/tmp/sb-args");
        let args = inner.build_launch_args().unwrap();
        let joined = args.join(" ");
        assert!(joined.contains("socket,id=qmpmon,fd=3"));
        assert!(joined.contains("-kernel /opt/virtrun/vmlinux"));
        assert!(joined.contains("-append"));
    }
}
