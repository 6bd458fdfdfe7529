// Copyright (c) 2023-2024 The Virtrun Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::pci::PciPath;

/// A guest MAC address.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address(pub [u8; 6]);

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let a = &self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            a[0], a[1], a[2], a[3], a[4], a[5]
        )
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Host-side interface backing this endpoint (tap name).
    pub host_dev_name: String,

    /// Interface name proposed to the guest.
    pub virt_iface_name: String,

    pub guest_mac: Option<Address>,

    /// Queue pair count; multiqueue needs one tap fd per queue.
    pub queue_num: usize,

    /// Already-opened tap fds handed to the VMM.
    #[serde(skip)]
    pub vm_fds: Vec<i32>,

    /// Already-opened vhost fds handed to the VMM.
    #[serde(skip)]
    pub vhost_fds: Vec<i32>,

    /// Apply the configured receive rate limiter.
    pub rx_rate_limited: bool,

    /// Apply the configured transmit rate limiter.
    pub tx_rate_limited: bool,

    /// Guest PCI location, filled at hot-plug time.
    pub pci_path: Option<PciPath>,

    /// Index of the endpoint within the sandbox.
    pub index: u64,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct NetworkDevice {
    pub device_id: String,
    pub config: NetworkConfig,
}

impl NetworkDevice {
    pub fn new(device_id: &str, config: NetworkConfig) -> Self {
        Self {
            device_id: device_id.to_string(),
            config,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_display() {
        let addr = Address([0x02, 0x42, 0xac, 0x11, 0x00, 0x02]);
        assert_eq!(addr.to_string(), "02:42:ac:11:00:02");
    }
}
