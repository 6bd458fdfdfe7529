// Copyright (c) 2023-2024 The Virtrun Authors
//
// SPDX-License-Identifier: Apache-2.0
//

mod bridge;
mod path;
mod topology;

pub use bridge::{
    add_to_bridges, remove_from_bridges, Bridge, BridgeType, PCI_BRIDGE_SLOTS,
    PCI_BRIDGE_START_ADDR,
};
pub use path::{PciPath, PciSlot};
pub use topology::{
    MachineType, PciePort, PciePortDevice, PcieTopology, TopologyInputs, MAX_PCIE_PORTS,
};
