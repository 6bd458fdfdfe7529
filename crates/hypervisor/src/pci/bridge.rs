// Copyright (c) 2023-2024 The Virtrun Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use std::collections::HashMap;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::error::HypervisorError;
use crate::pci::PciSlot;

/// Device slots per bridge.
pub const PCI_BRIDGE_SLOTS: u32 = 32;
/// First usable device slot on a PCI bridge; 0 and 1 are claimed by the
/// platform.
pub const PCI_BRIDGE_START_ADDR: u32 = 2;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BridgeType {
    Pci,
    Pcie,
    Ccw,
}

impl Default for BridgeType {
    fn default() -> Self {
        BridgeType::Pci
    }
}

impl BridgeType {
    fn first_slot(&self) -> u32 {
        match self {
            BridgeType::Pci | BridgeType::Pcie => PCI_BRIDGE_START_ADDR,
            BridgeType::Ccw => 0,
        }
    }
}

/// A secondary bus attached to the root bus at VM create time. Holds a
/// slot -> device-id map; every slot carries at most one device.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Bridge {
    pub id: String,
    #[serde(rename = "type")]
    pub bridge_type: BridgeType,
    /// Slot of the bridge itself on its parent bus.
    pub addr: u32,
    pub devices: HashMap<u32, String>,
}

impl Bridge {
    pub fn new(id: &str, bridge_type: BridgeType, addr: u32) -> Self {
        Self {
            id: id.to_string(),
            bridge_type,
            addr,
            devices: HashMap::new(),
        }
    }

    /// Claim the lowest free slot for `dev_id`.
    pub fn add_device(&mut self, dev_id: &str) -> Result<PciSlot> {
        let first = self.bridge_type.first_slot();
        for slot in first..PCI_BRIDGE_SLOTS {
            if !self.devices.contains_key(&slot) {
                self.devices.insert(slot, dev_id.to_string());
                return Ok(PciSlot::new(slot as u8)?);
            }
        }
        Err(HypervisorError::ResourceExhausted(format!(
            "bridge {} has no free slots for device {}",
            self.id, dev_id
        ))
        .into())
    }

    /// Free the slot holding `dev_id`. Unknown devices are tolerated.
    pub fn remove_device(&mut self, dev_id: &str) -> Option<u32> {
        let slot = self
            .devices
            .iter()
            .find(|(_, id)| id.as_str() == dev_id)
            .map(|(slot, _)| *slot);
        if let Some(slot) = slot {
            self.devices.remove(&slot);
        }
        slot
    }
}

/// First bridge of the wanted type with a free slot claims the device.
/// Returns the bridge id, the bridge's own slot on its parent bus, and the
/// claimed device slot.
pub fn add_to_bridges(
    bridges: &mut [Bridge],
    dev_id: &str,
    bridge_type: BridgeType,
) -> Result<(String, u32, PciSlot)> {
    for bridge in bridges.iter_mut() {
        if bridge.bridge_type != bridge_type {
            continue;
        }
        if let Ok(slot) = bridge.add_device(dev_id) {
            return Ok((bridge.id.clone(), bridge.addr, slot));
        }
    }
    Err(HypervisorError::ResourceExhausted(format!(
        "no {:?} bridge with a free slot for device {}",
        bridge_type, dev_id
    ))
    .into())
}

/// Release `dev_id` from whichever bridge holds it.
pub fn remove_from_bridges(bridges: &mut [Bridge], dev_id: &str) -> Option<(String, u32)> {
    for bridge in bridges.iter_mut() {
        if let Some(slot) = bridge.remove_device(dev_id) {
            return Some((bridge.id.clone(), slot));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_allocation_starts_at_two() {
        let mut bridge = Bridge::new("pci-bridge-0", BridgeType::Pci, 2);
        assert_eq!(bridge.add_device("a").unwrap().to_string(), "02");
        assert_eq!(bridge.add_device("b").unwrap().to_string(), "03");
        assert_eq!(bridge.add_device("c").unwrap().to_string(), "04");

        // freeing the middle slot makes it the next candidate
        assert_eq!(bridge.remove_device("b"), Some(3));
        assert_eq!(bridge.add_device("d").unwrap().to_string(), "03");
    }

    #[test]
    fn test_slot_exhaustion() {
        let mut bridge = Bridge::new("pci-bridge-0", BridgeType::Pci, 2);
        for i in PCI_BRIDGE_START_ADDR..PCI_BRIDGE_SLOTS {
            bridge.add_device(&format!("dev-{}", i)).unwrap();
        }
        let err = bridge.add_device("one-too-many").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<HypervisorError>(),
            Some(HypervisorError::ResourceExhausted(_))
        ));
    }

    #[test]
    fn test_each_slot_holds_one_device() {
        let mut bridge = Bridge::new("pci-bridge-0", BridgeType::Pci, 2);
        let mut seen = std::collections::HashSet::new();
        for i in 0..10 {
            let slot = bridge.add_device(&format!("dev-{}", i)).unwrap();
            assert!(seen.insert(slot.value()));
        }
    }

    #[test]
    fn test_remove_unknown_device_is_tolerated() {
        let mut bridge = Bridge::new("pci-bridge-0", BridgeType::Pci, 2);
        assert_eq!(bridge.remove_device("ghost"), None);
    }

    #[test]
    fn test_ccw_allocation_starts_at_zero() {
        let mut bridge = Bridge::new("ccw-0", BridgeType::Ccw, 0);
        assert_eq!(bridge.add_device("a").unwrap().value(), 0);
    }

    #[test]
    fn test_add_to_bridges_spills_over() {
        let mut bridges = vec![
            Bridge::new("b0", BridgeType::Pci, 2),
            Bridge::new("b1", BridgeType::Pci, 3),
        ];
        for i in PCI_BRIDGE_START_ADDR..PCI_BRIDGE_SLOTS {
            bridges[0].add_device(&format!("pre-{}", i)).unwrap();
        }
        let (bus, bus_addr, slot) = add_to_bridges(&mut bridges, "spill", BridgeType::Pci).unwrap();
        assert_eq!(bus, "b1");
        assert_eq!(bus_addr, 3);
        assert_eq!(slot.to_string(), "02");

        let (bus, slot) = remove_from_bridges(&mut bridges, "spill").unwrap();
        assert_eq!(bus, "b1");
        assert_eq!(slot, 2);
    }
}
