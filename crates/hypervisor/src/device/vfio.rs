// Copyright (c) 2023-2024 The Virtrun Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use serde::{Deserialize, Serialize};

use crate::pci::{PciPath, PciePort};

/// Flavor of the pass-through device; each flavor plugs with a different
/// monitor command.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum VfioDeviceType {
    /// Whole PCI function bound to the vfio-pci driver.
    Normal,
    /// Mediated PCI device addressed by its sysfs node.
    Mediated,
    /// Mediated s390 AP queue.
    ApMediated,
}

impl Default for VfioDeviceType {
    fn default() -> Self {
        VfioDeviceType::Normal
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct VfioConfig {
    /// Host bus/device/function, e.g. "0000:3a:00.0".
    pub bus_slot_func: String,

    pub dev_type: VfioDeviceType,

    /// Sysfs node of the device (mediated flavors address by this).
    pub sysfs_path: String,

    /// Where the device lands in the guest.
    pub port: PciePort,

    /// Guest PCI location, queried back from the monitor after plugging.
    pub pci_path: Option<PciPath>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct VfioDevice {
    pub device_id: String,
    pub config: VfioConfig,
}

impl VfioDevice {
    pub fn new(device_id: &str, config: VfioConfig) -> Self {
        Self {
            device_id: device_id.to_string(),
            config,
        }
    }
}
