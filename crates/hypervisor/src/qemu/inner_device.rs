// Copyright (c) 2023-2024 The Virtrun Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use anyhow::{anyhow, Context, Result};
use lazy_static::lazy_static;
use regex::Regex;
use serde_json::json;

use crate::device::{
    BlockDevice, DeviceType, NetworkDevice, VfioDevice, VfioDeviceType, VhostUserDevice,
    VhostUserType,
};
use crate::error::HypervisorError;
use crate::pci::{add_to_bridges, remove_from_bridges, BridgeType, PciPath, PciSlot, PciePort};
use crate::qemu::inner::QemuInner;
use crate::{VmmState, VIRTIO_BLOCK_CCW, VIRTIO_BLOCK_PCI, VIRTIO_PMEM, VIRTIO_SCSI};

/// Longest ancestry the guest-path walk will climb.
const MAX_PCIE_TOPO_DEPTH: usize = 10;

lazy_static! {
    /// QOM path of the machine's PCIe root bus.
    static ref ROOT_BUS_RE: Regex = Regex::new(r"^/machine/.*/pcie\.0$").unwrap();
}

impl QemuInner {
    pub async fn hotplug_add_device(&mut self, device: DeviceType) -> Result<DeviceType> {
        if self.state != VmmState::Running {
            return Err(HypervisorError::NotRunning.into());
        }
        match device {
            DeviceType::Block(b) => self.hotplug_block(b).await.map(DeviceType::Block),
            DeviceType::VhostUser(v) => self.hotplug_vhost_user(v).await.map(DeviceType::VhostUser),
            DeviceType::Vfio(v) => self.hotplug_vfio(v).await.map(DeviceType::Vfio),
            DeviceType::Network(n) => self.hotplug_network(n).await.map(DeviceType::Network),
            DeviceType::Memory(m) => {
                let added = self.hotplug_memory_mb(m.size_mb, m.probe).await?;
                Ok(DeviceType::Memory(added))
            }
            other => Err(HypervisorError::Unsupported(format!(
                "hotplug of {} on this backend",
                other
            ))
            .into()),
        }
    }

    pub async fn hotplug_remove_device(&mut self, device: DeviceType) -> Result<()> {
        if self.state != VmmState::Running {
            return Err(HypervisorError::NotRunning.into());
        }
        match device {
            DeviceType::Block(b) => self.unplug_block(b).await,
            DeviceType::VhostUser(v) => self.unplug_vhost_user(v).await,
            DeviceType::Vfio(v) => self.unplug_vfio(v).await,
            DeviceType::Network(n) => self.unplug_network(n).await,
            DeviceType::Memory(_) => {
                warn!(sl!(), "memory hot-remove is unsupported, ignoring");
                Ok(())
            }
            other => Err(HypervisorError::Unsupported(format!(
                "hot-unplug of {} on this backend",
                other
            ))
            .into()),
        }
    }

    // block

    async fn hotplug_block(&mut self, mut device: BlockDevice) -> Result<BlockDevice> {
        let node_name = drive_node_name(device.config.index);
        let driver = if device.config.driver_option.is_empty() {
            self.config.blockdev_info.block_device_driver.clone()
        } else {
            device.config.driver_option.clone()
        };

        if device.config.is_nvdimm || device.config.is_pmem || driver == VIRTIO_PMEM {
            return self.hotplug_block_pmem(device).await;
        }

        self.qmp()?
            .blockdev_add(
                &node_name,
                &device.config.path_on_host,
                device.config.is_readonly,
            )
            .await
            .context("blockdev add")?;

        let plug = match driver.as_str() {
            VIRTIO_SCSI => self.plug_scsi_disk(&mut device, &node_name).await,
            VIRTIO_BLOCK_CCW => self.plug_ccw_disk(&mut device, &node_name).await,
            _ => self.plug_pci_disk(&mut device, &node_name).await,
        };
        if let Err(e) = plug {
            // the backing object must not leak when device add failed
            let _ = self.qmp()?.blockdev_del(&node_name).await;
            return Err(e);
        }
        Ok(device)
    }

    async fn plug_pci_disk(&mut self, device: &mut BlockDevice, node_name: &str) -> Result<()> {
        let bridge_type = self.bridge_type();
        let (bus, bus_addr, slot) =
            add_to_bridges(&mut self.bridges, &device.device_id, bridge_type)?;
        let args = json!({
            "driver": VIRTIO_BLOCK_PCI,
            "id": device.device_id,
            "drive": node_name,
            "bus": bus,
            "addr": format!("{:#x}", slot.value()),
        });
        let added = self.qmp()?.device_add(args).await;
        if let Err(e) = added {
            remove_from_bridges(&mut self.bridges, &device.device_id);
            return Err(e).context("device add");
        }
        device.config.pci_path =
            Some(PciPath::new(vec![PciSlot::new(bus_addr as u8)?, slot])?);
        device.config.virt_path = Some(format!("/dev/{}", virt_drive_name(device.config.index)?));
        Ok(())
    }

    async fn plug_scsi_disk(&mut self, device: &mut BlockDevice, node_name: &str) -> Result<()> {
        let scsi_addr = crate::device::ScsiAddr::from_index(device.config.index);
        self.qmp()?
            .device_add(json!({
                "driver": "scsi-hd",
                "id": device.device_id,
                "drive": node_name,
                "bus": "scsi0.0",
                "channel": 0,
                "scsi-id": scsi_addr.id,
                "lun": scsi_addr.lun,
            }))
            .await
            .context("device add scsi")?;
        device.config.scsi_addr = Some(scsi_addr);
        Ok(())
    }

    async fn plug_ccw_disk(&mut self, device: &mut BlockDevice, node_name: &str) -> Result<()> {
        let (_, _, slot) =
            add_to_bridges(&mut self.bridges, &device.device_id, BridgeType::Ccw)?;
        let devno = format!("fe.0.{:04x}", slot.value());
        let added = self
            .qmp()?
            .device_add(json!({
                "driver": VIRTIO_BLOCK_CCW,
                "id": device.device_id,
                "drive": node_name,
                "devno": devno,
            }))
            .await;
        if let Err(e) = added {
            remove_from_bridges(&mut self.bridges, &device.device_id);
            return Err(e).context("device add ccw");
        }
        device.config.ccw_devno = Some(devno);
        Ok(())
    }

    async fn hotplug_block_pmem(&mut self, mut device: BlockDevice) -> Result<BlockDevice> {
        let memdev = format!("pmem-{}", device.config.index);
        let size = std::fs::metadata(&device.config.path_on_host)
            .with_context(|| format!("stat {}", device.config.path_on_host))?
            .len();
        self.qmp()?
            .object_add(
                "memory-backend-file",
                &memdev,
                json!({
                    "mem-path": device.config.path_on_host,
                    "size": size,
                    "share": true,
                }),
            )
            .await
            .context("memory backend add")?;

        if let Err(e) = self
            .qmp()?
            .device_add(json!({
                "driver": "nvdimm",
                "id": device.device_id,
                "memdev": memdev,
            }))
            .await
        {
            let _ = self.qmp()?.object_del(&memdev).await;
            return Err(e).context("nvdimm device add");
        }
        device.config.is_nvdimm = true;
        Ok(device)
    }

    async fn unplug_block(&mut self, device: BlockDevice) -> Result<()> {
        self.qmp()?
            .device_del(&device.device_id)
            .await
            .context("device del")?;
        if device.config.is_nvdimm || device.config.is_pmem {
            let _ = self
                .qmp()?
                .object_del(&format!("pmem-{}", device.config.index))
                .await;
        } else {
            self.qmp()?
                .blockdev_del(&drive_node_name(device.config.index))
                .await
                .context("blockdev del")?;
        }
        remove_from_bridges(&mut self.bridges, &device.device_id);
        Ok(())
    }

    // vhost-user

    async fn hotplug_vhost_user(&mut self, mut device: VhostUserDevice) -> Result<VhostUserDevice> {
        if device.config.dev_type != VhostUserType::Blk {
            return Err(HypervisorError::Unsupported(format!(
                "hotplug of vhost-user {:?}",
                device.config.dev_type
            ))
            .into());
        }

        let char_id = format!("char-{}", device.device_id);
        self.qmp()?
            .chardev_add_socket(&char_id, &device.config.socket_path)
            .await
            .context("chardev add")?;

        let plug = self.plug_vhost_user_blk(&mut device, &char_id).await;
        if let Err(e) = plug {
            let _ = self.qmp()?.chardev_remove(&char_id).await;
            return Err(e);
        }
        Ok(device)
    }

    async fn plug_vhost_user_blk(
        &mut self,
        device: &mut VhostUserDevice,
        char_id: &str,
    ) -> Result<()> {
        let (bus, path_prefix) = self.allocate_pcie_slot(&device.device_id)?;
        let mut args = json!({
            "driver": "vhost-user-blk-pci",
            "id": device.device_id,
            "chardev": char_id,
            "bus": bus,
        });
        if device.config.num_queues > 0 {
            args["num-queues"] = json!(device.config.num_queues);
        }
        let added = self.qmp()?.device_add(args).await;
        if let Err(e) = added {
            self.release_pcie_slot(&device.device_id);
            return Err(e).context("device add vhost-user-blk");
        }
        let mut slots = path_prefix;
        slots.push(PciSlot::new(0)?);
        device.config.pci_path = Some(PciPath::new(slots)?);
        Ok(())
    }

    async fn unplug_vhost_user(&mut self, device: VhostUserDevice) -> Result<()> {
        self.qmp()?
            .device_del(&device.device_id)
            .await
            .context("device del")?;
        self.qmp()?
            .chardev_remove(&format!("char-{}", device.device_id))
            .await
            .context("chardev remove")?;
        self.release_pcie_slot(&device.device_id);
        Ok(())
    }

    // vfio

    async fn hotplug_vfio(&mut self, mut device: VfioDevice) -> Result<VfioDevice> {
        let target = match device.config.port {
            PciePort::NoPort => self.config.machine_info.hotplug_vfio,
            configured => configured,
        };

        let (bus, _prefix) = match target {
            PciePort::RootPort | PciePort::SwitchPort => {
                let topology = self
                    .topology
                    .as_mut()
                    .ok_or_else(|| anyhow!("no pcie topology was planned for this vm"))?;
                let (port_id, prefix) = topology.reserve_port(target, &device.device_id)?;
                (port_id, prefix)
            }
            _ => {
                let bridge_type = self.bridge_type();
                let (bus, bus_addr, slot) =
                    add_to_bridges(&mut self.bridges, &device.device_id, bridge_type)?;
                (bus, vec![PciSlot::new(bus_addr as u8)?, slot])
            }
        };

        let mut args = match device.config.dev_type {
            VfioDeviceType::Normal => json!({
                "driver": "vfio-pci",
                "id": device.device_id,
                "host": device.config.bus_slot_func,
            }),
            VfioDeviceType::Mediated => json!({
                "driver": "vfio-pci",
                "id": device.device_id,
                "sysfsdev": device.config.sysfs_path,
            }),
            VfioDeviceType::ApMediated => json!({
                "driver": "vfio-ap",
                "id": device.device_id,
                "sysfsdev": device.config.sysfs_path,
            }),
        };
        if device.config.dev_type != VfioDeviceType::ApMediated {
            args["bus"] = json!(bus);
        }

        let added = self.qmp()?.device_add(args).await;
        if let Err(e) = added {
            self.release_pcie_slot(&device.device_id);
            return Err(e).context("device add vfio");
        }

        // the authoritative guest path comes from the device tree, not from
        // our allocation bookkeeping
        if device.config.dev_type != VfioDeviceType::ApMediated {
            device.config.pci_path = Some(self.qom_get_pci_path(&device.device_id).await?);
        }
        Ok(device)
    }

    async fn unplug_vfio(&mut self, device: VfioDevice) -> Result<()> {
        self.qmp()?
            .device_del(&device.device_id)
            .await
            .context("device del")?;
        self.release_pcie_slot(&device.device_id);
        Ok(())
    }

    // network

    async fn hotplug_network(&mut self, mut device: NetworkDevice) -> Result<NetworkDevice> {
        let qmp = self.qmp()?;
        let netdev_id = format!("netdev-{}", device.device_id);

        let mut fd_names = vec![];
        for (i, fd) in device.config.vm_fds.iter().enumerate() {
            let name = format!("fd-{}-{}", device.device_id, i);
            qmp.getfd(&name, *fd).await.context("getfd")?;
            fd_names.push(name);
        }
        let mut vhost_fd_names = vec![];
        for (i, fd) in device.config.vhost_fds.iter().enumerate() {
            let name = format!("vhostfd-{}-{}", device.device_id, i);
            qmp.getfd(&name, *fd).await.context("getfd vhost")?;
            vhost_fd_names.push(name);
        }

        qmp.netdev_add_fds(&netdev_id, &fd_names, &vhost_fd_names)
            .await
            .context("netdev add")?;

        let plug = self.plug_net_device(&mut device, &netdev_id).await;
        if let Err(e) = plug {
            let _ = self.qmp()?.netdev_del(&netdev_id).await;
            return Err(e);
        }
        Ok(device)
    }

    async fn plug_net_device(&mut self, device: &mut NetworkDevice, netdev_id: &str) -> Result<()> {
        let (bus, path_prefix) = self.allocate_pcie_slot(&device.device_id)?;
        let mut args = json!({
            "driver": "virtio-net-pci",
            "id": device.device_id,
            "netdev": netdev_id,
            "bus": bus,
        });
        if let Some(mac) = &device.config.guest_mac {
            args["mac"] = json!(mac.to_string());
        }
        if device.config.queue_num > 1 {
            args["mq"] = json!("on");
            args["vectors"] = json!(2 * device.config.queue_num + 2);
        }
        let added = self.qmp()?.device_add(args).await;
        if let Err(e) = added {
            self.release_pcie_slot(&device.device_id);
            return Err(e).context("device add virtio-net");
        }
        let mut slots = path_prefix;
        slots.push(PciSlot::new(0)?);
        device.config.pci_path = Some(PciPath::new(slots)?);
        Ok(())
    }

    async fn unplug_network(&mut self, device: NetworkDevice) -> Result<()> {
        self.qmp()?
            .device_del(&device.device_id)
            .await
            .context("device del")?;
        self.qmp()?
            .netdev_del(&format!("netdev-{}", device.device_id))
            .await
            .context("netdev del")?;
        self.release_pcie_slot(&device.device_id);
        Ok(())
    }

    /// Prefer a planned hot-plug port, fall back to a bridge slot. Returns
    /// the bus to plug into and the slot chain leading to it.
    fn allocate_pcie_slot(&mut self, dev_id: &str) -> Result<(String, Vec<PciSlot>)> {
        if let Some(topology) = self.topology.as_mut() {
            if !topology.root_ports.is_empty() {
                if let Ok((port_id, prefix)) = topology.reserve_port(PciePort::RootPort, dev_id) {
                    return Ok((port_id, prefix));
                }
            }
        }
        let bridge_type = self.bridge_type();
        let (bus, bus_addr, slot) = add_to_bridges(&mut self.bridges, dev_id, bridge_type)?;
        Ok((bus, vec![PciSlot::new(bus_addr as u8)?, slot]))
    }

    fn release_pcie_slot(&mut self, dev_id: &str) {
        if let Some(topology) = self.topology.as_mut() {
            if topology.release_port(dev_id).is_some() {
                return;
            }
        }
        remove_from_bridges(&mut self.bridges, dev_id);
    }

    /// Resolve a device's guest PCI path by climbing `parent_bus` links in
    /// the device tree until the root bus, collecting the slot at each hop.
    pub(crate) async fn qom_get_pci_path(&self, dev_id: &str) -> Result<PciPath> {
        let qmp = self.qmp()?;
        let mut slots: Vec<PciSlot> = vec![];
        let mut node = format!("/machine/peripheral/{}", dev_id);

        for _ in 0..MAX_PCIE_TOPO_DEPTH {
            let addr = qmp.qom_get(&node, "addr").await.context("qom-get addr")?;
            let devfn = addr
                .as_u64()
                .or_else(|| addr.as_f64().map(|f| f as u64))
                .ok_or_else(|| {
                    HypervisorError::Transport(format!("non-numeric addr for {}", node))
                })?;
            let slot = (devfn >> 3) as u8;
            let function = devfn & 0x7;
            if function != 0 {
                return Err(HypervisorError::Transport(format!(
                    "unexpected function {} on {}",
                    function, node
                ))
                .into());
            }
            slots.push(PciSlot::new(slot)?);

            let bus = qmp
                .qom_get(&node, "parent_bus")
                .await
                .context("qom-get parent_bus")?;
            let bus_path = bus
                .as_str()
                .ok_or_else(|| HypervisorError::Transport("parent_bus is not a path".to_string()))?
                .to_string();
            if ROOT_BUS_RE.is_match(&bus_path) {
                slots.reverse();
                return PciPath::new(slots);
            }
            // the bus hangs off its owning bridge or port device
            node = bus_path
                .rsplit_once('/')
                .map(|(parent, _)| parent.to_string())
                .ok_or_else(|| {
                    HypervisorError::Transport(format!("unparsable bus path {:?}", bus_path))
                })?;
        }
        Err(HypervisorError::Transport(format!(
            "pci topology of {} deeper than {} levels",
            dev_id, MAX_PCIE_TOPO_DEPTH
        ))
        .into())
    }
}

fn drive_node_name(index: u64) -> String {
    format!("drive-{}", index)
}

/// Disk name the guest kernel will assign for a virtio-blk index.
pub(crate) fn virt_drive_name(index: u64) -> Result<String> {
    const PREFIX: &str = "vd";
    let disk_name_len = 32usize;
    let base = 26i64;

    let suff_len = disk_name_len - PREFIX.len();
    let mut disk_letters = vec![0u8; suff_len];
    let mut index = index as i64;

    let mut i = 0usize;
    while i < suff_len && index >= 0 {
        let letter: u8 = b'a' + (index % base) as u8;
        disk_letters[i] = letter;
        index = (index / base) - 1;
        i += 1;
    }
    if index >= 0 {
        return Err(anyhow!("block index out of range"));
    }
    disk_letters.truncate(i);
    disk_letters.reverse();
    Ok(String::from(PREFIX) + std::str::from_utf8(&disk_letters)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::qemu::qmp::QmpClient;
    use crate::HypervisorConfig;
    use serde_json::Value;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::UnixListener;
    use tokio::sync::mpsc;

    /// Minimal monitor endpoint: greeting, capabilities, then qom-get
    /// answers describing root-bus <- port(slot 1) <- dev(slot 0).
    async fn serve_qom_walk(listener: UnixListener, dev_function: u64) {
        let (mut stream, _) = listener.accept().await.unwrap();
        stream
            .write_all(b"{\"QMP\": {\"version\": {}, \"capabilities\": []}}\n")
            .await
            .unwrap();

        let mut buf = vec![0u8; 4096];
        loop {
            let n = match stream.read(&mut buf).await {
                Ok(0) | Err(_) => return,
                Ok(n) => n,
            };
            for line in String::from_utf8_lossy(&buf[..n]).lines() {
                let cmd: Value = serde_json::from_str(line).unwrap();
                let reply = match cmd["execute"].as_str().unwrap() {
                    "qmp_capabilities" => serde_json::json!({ "return": {} }),
                    "qom-get" => {
                        let path = cmd["arguments"]["path"].as_str().unwrap();
                        let property = cmd["arguments"]["property"].as_str().unwrap();
                        let value = match (path, property) {
                            ("/machine/peripheral/dev", "addr") => {
                                serde_json::json!(dev_function)
                            }
                            ("/machine/peripheral/dev", "parent_bus") => {
                                serde_json::json!("/machine/peripheral/rp0/pcie.1")
                            }
                            ("/machine/peripheral/rp0", "addr") => serde_json::json!(1u64 << 3),
                            ("/machine/peripheral/rp0", "parent_bus") => {
                                serde_json::json!("/machine/q35/pcie.0")
                            }
                            other => panic!("unexpected qom-get {:?}", other),
                        };
                        serde_json::json!({ "return": value })
                    }
                    other => panic!("unexpected command {}", other),
                };
                stream
                    .write_all(format!("{}\n", reply).as_bytes())
                    .await
                    .unwrap();
            }
        }
    }

    async fn inner_with_monitor(sock_name: &str, dev_function: u64) -> QemuInner {
        let dir = std::env::temp_dir().join(format!("qemu-dev-ut-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let sock = dir.join(sock_name);
        let _ = std::fs::remove_file(&sock);
        let listener = UnixListener::bind(&sock).unwrap();
        tokio::spawn(serve_qom_walk(listener, dev_function));

        let (event_tx, _event_rx) = mpsc::channel(8);
        let qmp = QmpClient::connect(&sock, Duration::from_secs(5), event_tx)
            .await
            .unwrap();
        let mut inner = QemuInner::new(HypervisorConfig::default());
        inner.qmp = Some(qmp);
        inner
    }

    #[tokio::test]
    async fn test_qom_walk_yields_port_then_device_slot() {
        let inner = inner_with_monitor("qom-ok.sock", 0).await;
        let path = inner.qom_get_pci_path("dev").await.unwrap();
        assert_eq!(path.to_string(), "01/00");
    }

    #[tokio::test]
    async fn test_qom_walk_rejects_nonzero_function() {
        // devfn 1 means slot 0 function 1
        let inner = inner_with_monitor("qom-func.sock", 1).await;
        let err = inner.qom_get_pci_path("dev").await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<HypervisorError>(),
            Some(HypervisorError::Transport(_))
        ));
    }

    #[test]
    fn test_virt_drive_name() {
        for &(input, output) in [
            (0u64, "vda"),
            (25, "vdz"),
            (26, "vdaa"),
            (27, "vdab"),
            (704, "vdaac"),
            (18277, "vdzzz"),
        ]
        .iter()
        {
            assert_eq!(virt_drive_name(input).unwrap(), output);
        }
    }

    #[test]
    fn test_root_bus_regex() {
        assert!(ROOT_BUS_RE.is_match("/machine/q35/pcie.0"));
        assert!(ROOT_BUS_RE.is_match("/machine/unattached/pcie.0"));
        assert!(!ROOT_BUS_RE.is_match("/machine/peripheral/rp0/pcie.1"));
        assert!(!ROOT_BUS_RE.is_match("/machine/q35/pcie.0/child"));
    }
}
