// Copyright (c) 2023-2024 The Virtrun Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use std::fmt;
use std::str::FromStr;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

/// Highest slot number on a PCI bus.
pub const MAX_PCI_SLOT: u8 = 31;

/// A device slot on one bus, 0..=31. Displays as two hex digits, the form
/// the monitor and the guest agent both consume.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PciSlot(u8);

impl PciSlot {
    pub fn new(slot: u8) -> Result<Self> {
        if slot > MAX_PCI_SLOT {
            return Err(anyhow!("pci slot {} out of range 0..={}", slot, MAX_PCI_SLOT));
        }
        Ok(PciSlot(slot))
    }

    pub fn value(&self) -> u8 {
        self.0
    }
}

impl fmt::Display for PciSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02x}", self.0)
    }
}

impl FromStr for PciSlot {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let v = u8::from_str_radix(s, 16).map_err(|e| anyhow!("parse pci slot {:?}: {}", s, e))?;
        PciSlot::new(v)
    }
}

/// The chain of bridge/port slots leading to a device, root-most first.
/// Serializes as slash-joined hex slots, e.g. "02/0a".
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PciPath {
    slots: Vec<PciSlot>,
}

impl PciPath {
    pub fn new(slots: Vec<PciSlot>) -> Result<Self> {
        if slots.is_empty() {
            return Err(anyhow!("pci path must contain at least one slot"));
        }
        Ok(PciPath { slots })
    }

    pub fn from_slots(slots: &[u8]) -> Result<Self> {
        PciPath::new(
            slots
                .iter()
                .map(|s| PciSlot::new(*s))
                .collect::<Result<Vec<_>>>()?,
        )
    }

    pub fn slots(&self) -> &[PciSlot] {
        &self.slots
    }

    /// Slot on the root bus.
    pub fn root_slot(&self) -> Option<PciSlot> {
        self.slots.first().copied()
    }

    /// Slot on the device's direct parent bus.
    pub fn device_slot(&self) -> Option<PciSlot> {
        self.slots.last().copied()
    }

    /// Representation handed to the guest agent.
    pub fn to_agent_slots(&self) -> Vec<u32> {
        self.slots.iter().map(|s| s.value() as u32).collect()
    }
}

impl fmt::Display for PciPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.slots.iter().map(|s| s.to_string()).collect();
        write!(f, "{}", parts.join("/"))
    }
}

impl FromStr for PciPath {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        PciPath::new(
            s.split('/')
                .map(PciSlot::from_str)
                .collect::<Result<Vec<_>>>()?,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pci_slot_bounds() {
        assert!(PciSlot::new(0).is_ok());
        assert!(PciSlot::new(31).is_ok());
        assert!(PciSlot::new(32).is_err());
    }

    #[test]
    fn test_pci_path_display_round_trip() {
        let path = PciPath::from_slots(&[0x02, 0x0a]).unwrap();
        assert_eq!(path.to_string(), "02/0a");
        assert_eq!("02/0a".parse::<PciPath>().unwrap(), path);
        assert_eq!(path.root_slot().unwrap().value(), 2);
        assert_eq!(path.device_slot().unwrap().value(), 10);
    }

    #[test]
    fn test_pci_path_rejects_bad_input() {
        assert!("".parse::<PciPath>().is_err());
        assert!("zz".parse::<PciPath>().is_err());
        assert!("02/40".parse::<PciPath>().is_err());
        assert!(PciPath::new(vec![]).is_err());
    }

    #[test]
    fn test_agent_slots() {
        let path = PciPath::from_slots(&[1, 0]).unwrap();
        assert_eq!(path.to_agent_slots(), vec![1, 0]);
    }
}
