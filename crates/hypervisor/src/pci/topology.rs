// Copyright (c) 2023-2024 The Virtrun Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

use crate::error::HypervisorError;
use crate::pci::PciSlot;

/// Hard limit on hot-plug capable PCIe ports of either flavor.
pub const MAX_PCIE_PORTS: u32 = 16;

/// Assumed 64-bit BAR footprint when no pass-through device declares one.
const DEFAULT_PCIE_BAR_MIB: u64 = 2;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MachineType {
    Q35,
    Virt,
    Pseries,
    Ccw,
    MicroVm,
}

impl FromStr for MachineType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "q35" | "pc" => Ok(MachineType::Q35),
            "virt" => Ok(MachineType::Virt),
            "pseries" => Ok(MachineType::Pseries),
            "s390-ccw-virtio" => Ok(MachineType::Ccw),
            "microvm" => Ok(MachineType::MicroVm),
            _ => Err(anyhow!("unknown machine type {:?}", s)),
        }
    }
}

impl MachineType {
    pub fn is_pcie_native(&self) -> bool {
        matches!(self, MachineType::Q35 | MachineType::Virt)
    }
}

/// Where a hot- or cold-plugged PCIe device lands.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PciePort {
    NoPort,
    RootPort,
    SwitchPort,
    BridgePort,
}

impl Default for PciePort {
    fn default() -> Self {
        PciePort::NoPort
    }
}

impl FromStr for PciePort {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "" | "no-port" => Ok(PciePort::NoPort),
            "root-port" => Ok(PciePort::RootPort),
            "switch-port" => Ok(PciePort::SwitchPort),
            "bridge-port" => Ok(PciePort::BridgePort),
            _ => Err(anyhow!("unknown pcie port target {:?}", s)),
        }
    }
}

impl fmt::Display for PciePort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PciePort::NoPort => "no-port",
            PciePort::RootPort => "root-port",
            PciePort::SwitchPort => "switch-port",
            PciePort::BridgePort => "bridge-port",
        };
        write!(f, "{}", s)
    }
}

/// One hot-plug capable port. A port slot holds at most one device.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PciePortDevice {
    pub id: String,
    /// Slot of the port on its parent bus.
    pub slot: u32,
    /// Device currently occupying the port.
    pub allocated: Option<String>,
}

/// Planned PCIe layout: flat root ports, or one root port carrying an
/// upstream port fanning out into downstream (switch) ports.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PcieTopology {
    pub root_ports: Vec<PciePortDevice>,
    pub upstream_port: Option<String>,
    pub switch_ports: Vec<PciePortDevice>,
    /// 64-bit MMIO aperture to expose through fw-cfg, MiB. Only set for
    /// firmware that consumes it.
    pub mmio64_aperture_mib: Option<u64>,
}

/// Planner inputs, harvested from the hypervisor configuration and the
/// devices declared before boot.
pub struct TopologyInputs<'a> {
    pub machine_type: MachineType,
    pub hotplug_vfio: PciePort,
    pub coldplug_vfio: PciePort,
    pub root_port_count: u32,
    pub switch_port_count: u32,
    /// Total PCIe functions across the declared VFIO IOMMU groups.
    pub vfio_pcie_function_count: u32,
    /// Sysfs paths of declared pass-through devices, scanned for BAR sizes.
    pub vfio_sysfs_paths: &'a [String],
    pub vhost_user_blk_count: u32,
    pub endpoint_count: u32,
    pub virtio_mem: bool,
    pub firmware: &'a str,
    /// First free slot on the root bus for port placement.
    pub base_slot: u32,
}

impl PcieTopology {
    /// Compute the port layout per the declared demand. Returns `None` when
    /// the machine needs no ports.
    pub fn plan(inputs: &TopologyInputs<'_>) -> Result<Option<PcieTopology>> {
        let num_needed = inputs.endpoint_count
            + inputs.vhost_user_blk_count
            + if inputs.virtio_mem { 1 } else { 0 }
            + inputs.vfio_pcie_function_count;

        let no_vfio_ports = inputs.hotplug_vfio == PciePort::NoPort
            && inputs.coldplug_vfio == PciePort::NoPort;

        if no_vfio_ports && inputs.machine_type == MachineType::Q35 {
            return Ok(None);
        }

        let mut topology = PcieTopology::default();
        if inputs.firmware.to_lowercase().contains("ovmf") {
            topology.mmio64_aperture_mib =
                Some(compute_mmio64_aperture_mib(inputs, num_needed as u64));
        }

        let wants_root_port = inputs.hotplug_vfio == PciePort::RootPort
            || inputs.coldplug_vfio == PciePort::RootPort;
        let wants_switch_port = inputs.hotplug_vfio == PciePort::SwitchPort
            || inputs.coldplug_vfio == PciePort::SwitchPort;

        if wants_root_port && inputs.machine_type.is_pcie_native() {
            let count = inputs.root_port_count.max(num_needed);
            if count > MAX_PCIE_PORTS {
                return Err(HypervisorError::ResourceExhausted(format!(
                    "{} pcie root ports needed, the limit is {}",
                    count, MAX_PCIE_PORTS
                ))
                .into());
            }
            for i in 0..count {
                topology.root_ports.push(PciePortDevice {
                    id: format!("rp{}", i),
                    slot: inputs.base_slot + i,
                    allocated: None,
                });
            }
        } else if wants_switch_port {
            let count = inputs.switch_port_count.max(num_needed);
            if count > MAX_PCIE_PORTS {
                return Err(HypervisorError::ResourceExhausted(format!(
                    "{} pcie switch ports needed, the limit is {}",
                    count, MAX_PCIE_PORTS
                ))
                .into());
            }
            // one root port hosts the upstream port fanning out downstream
            topology.root_ports.push(PciePortDevice {
                id: "swrp0".to_string(),
                slot: inputs.base_slot,
                allocated: None,
            });
            topology.upstream_port = Some("swup0".to_string());
            for i in 0..count {
                topology.switch_ports.push(PciePortDevice {
                    id: format!("swdp{}", i),
                    slot: i,
                    allocated: None,
                });
            }
        } else if inputs.machine_type == MachineType::Virt
            && (inputs.endpoint_count > 0 || inputs.vhost_user_blk_count > 0)
        {
            // native hot-plug on virt still needs ports even when VFIO
            // placement asked for none
            let count = (inputs.endpoint_count + inputs.vhost_user_blk_count).min(MAX_PCIE_PORTS);
            for i in 0..count {
                topology.root_ports.push(PciePortDevice {
                    id: format!("rp{}", i),
                    slot: inputs.base_slot + i,
                    allocated: None,
                });
            }
        }

        if topology.root_ports.is_empty() && topology.switch_ports.is_empty() {
            return Ok(None);
        }
        Ok(Some(topology))
    }

    /// Claim the next free port of the wanted flavor for `dev_id`. Returns
    /// the port id and the slot chain leading to the port, root-most first.
    pub fn reserve_port(&mut self, target: PciePort, dev_id: &str) -> Result<(String, Vec<PciSlot>)> {
        match target {
            PciePort::RootPort => {
                let port = self
                    .root_ports
                    .iter_mut()
                    .find(|p| p.allocated.is_none())
                    .ok_or_else(|| {
                        HypervisorError::ResourceExhausted("no free pcie root port".to_string())
                    })?;
                port.allocated = Some(dev_id.to_string());
                Ok((port.id.clone(), vec![PciSlot::new(port.slot as u8)?]))
            }
            PciePort::SwitchPort => {
                let root_slot = self
                    .root_ports
                    .first()
                    .map(|p| p.slot)
                    .ok_or_else(|| anyhow!("switch topology has no root port"))?;
                let port = self
                    .switch_ports
                    .iter_mut()
                    .find(|p| p.allocated.is_none())
                    .ok_or_else(|| {
                        HypervisorError::ResourceExhausted("no free pcie switch port".to_string())
                    })?;
                port.allocated = Some(dev_id.to_string());
                Ok((
                    port.id.clone(),
                    vec![PciSlot::new(root_slot as u8)?, PciSlot::new(port.slot as u8)?],
                ))
            }
            _ => Err(anyhow!("target {} does not use planned ports", target)),
        }
    }

    /// Free whichever port holds `dev_id`.
    pub fn release_port(&mut self, dev_id: &str) -> Option<String> {
        for port in self.root_ports.iter_mut().chain(self.switch_ports.iter_mut()) {
            if port.allocated.as_deref() == Some(dev_id) {
                port.allocated = None;
                return Some(port.id.clone());
            }
        }
        None
    }
}

fn compute_mmio64_aperture_mib(inputs: &TopologyInputs<'_>, num_needed: u64) -> u64 {
    let per_device = max_bar_size_mib(inputs.vfio_sysfs_paths);
    (per_device * num_needed.max(1)).next_power_of_two()
}

/// Largest memory BAR among the declared pass-through devices, MiB. Each
/// line of a device's sysfs `resource` file is `start end flags`; I/O port
/// resources (flags bit 8) are skipped.
fn max_bar_size_mib(sysfs_paths: &[String]) -> u64 {
    const IORESOURCE_IO: u64 = 0x100;
    let mut max_mib = DEFAULT_PCIE_BAR_MIB;
    for dev in sysfs_paths {
        let resource = Path::new(dev).join("resource");
        let content = match std::fs::read_to_string(&resource) {
            Ok(c) => c,
            Err(_) => continue,
        };
        for line in content.lines() {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() != 3 {
                continue;
            }
            let parse = |s: &str| u64::from_str_radix(s.trim_start_matches("0x"), 16).ok();
            if let (Some(start), Some(end), Some(flags)) =
                (parse(fields[0]), parse(fields[1]), parse(fields[2]))
            {
                if flags & IORESOURCE_IO != 0 || end <= start {
                    continue;
                }
                max_mib = max_mib.max((end - start + 1) >> 20);
            }
        }
    }
    max_mib
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inputs<'a>() -> TopologyInputs<'a> {
        TopologyInputs {
            machine_type: MachineType::Q35,
            hotplug_vfio: PciePort::NoPort,
            coldplug_vfio: PciePort::NoPort,
            root_port_count: 0,
            switch_port_count: 0,
            vfio_pcie_function_count: 0,
            vfio_sysfs_paths: &[],
            vhost_user_blk_count: 0,
            endpoint_count: 0,
            virtio_mem: false,
            firmware: "",
            base_slot: 2,
        }
    }

    #[test]
    fn test_q35_without_vfio_ports_plans_nothing() {
        let i = inputs();
        assert!(PcieTopology::plan(&i).unwrap().is_none());
    }

    #[test]
    fn test_root_port_demand() {
        // 3 pass-through functions + 2 endpoints + virtio-mem against a
        // configured floor of 4 ports
        let mut i = inputs();
        i.hotplug_vfio = PciePort::RootPort;
        i.root_port_count = 4;
        i.vfio_pcie_function_count = 3;
        i.endpoint_count = 2;
        i.virtio_mem = true;
        let topology = PcieTopology::plan(&i).unwrap().unwrap();
        assert_eq!(topology.root_ports.len(), 6);
        assert!(topology.switch_ports.is_empty());
    }

    #[test]
    fn test_root_port_demand_above_limit_fails() {
        let mut i = inputs();
        i.hotplug_vfio = PciePort::RootPort;
        i.vfio_pcie_function_count = 17;
        let err = PcieTopology::plan(&i).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<HypervisorError>(),
            Some(HypervisorError::ResourceExhausted(_))
        ));
    }

    #[test]
    fn test_switch_port_layout() {
        let mut i = inputs();
        i.hotplug_vfio = PciePort::SwitchPort;
        i.switch_port_count = 2;
        i.vfio_pcie_function_count = 3;
        let topology = PcieTopology::plan(&i).unwrap().unwrap();
        assert_eq!(topology.root_ports.len(), 1);
        assert!(topology.upstream_port.is_some());
        assert_eq!(topology.switch_ports.len(), 3);
    }

    #[test]
    fn test_virt_machine_gets_ports_for_endpoints() {
        let mut i = inputs();
        i.machine_type = MachineType::Virt;
        i.endpoint_count = 2;
        i.vhost_user_blk_count = 1;
        let topology = PcieTopology::plan(&i).unwrap().unwrap();
        assert_eq!(topology.root_ports.len(), 3);
    }

    #[test]
    fn test_reserve_and_release_port() {
        let mut i = inputs();
        i.hotplug_vfio = PciePort::RootPort;
        i.root_port_count = 2;
        let mut topology = PcieTopology::plan(&i).unwrap().unwrap();

        let (id_a, path_a) = topology.reserve_port(PciePort::RootPort, "dev-a").unwrap();
        let (id_b, _) = topology.reserve_port(PciePort::RootPort, "dev-b").unwrap();
        assert_ne!(id_a, id_b);
        assert_eq!(path_a.len(), 1);

        let err = topology.reserve_port(PciePort::RootPort, "dev-c").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<HypervisorError>(),
            Some(HypervisorError::ResourceExhausted(_))
        ));

        assert_eq!(topology.release_port("dev-a"), Some(id_a));
        assert!(topology.reserve_port(PciePort::RootPort, "dev-c").is_ok());
    }

    #[test]
    fn test_ovmf_gets_aperture() {
        let mut i = inputs();
        i.machine_type = MachineType::Virt;
        i.endpoint_count = 1;
        i.firmware = "/usr/share/OVMF/OVMF_CODE.fd";
        let topology = PcieTopology::plan(&i).unwrap().unwrap();
        let aperture = topology.mmio64_aperture_mib.unwrap();
        assert!(aperture >= 2);
        assert!(aperture.is_power_of_two());
    }
}
