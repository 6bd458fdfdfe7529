// Copyright (c) 2023-2024 The Virtrun Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use serde::{Deserialize, Serialize};

use crate::pci::PciPath;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum VhostUserType {
    Blk,
    Scsi,
    Net,
    Fs,
}

impl Default for VhostUserType {
    fn default() -> Self {
        VhostUserType::Blk
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct VhostUserConfig {
    /// UNIX socket of the out-of-process backend.
    pub socket_path: String,

    pub dev_type: VhostUserType,

    pub num_queues: usize,

    pub queue_size: u32,

    /// Guest PCI location, filled at hot-plug time.
    pub pci_path: Option<PciPath>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct VhostUserDevice {
    pub device_id: String,
    pub config: VhostUserConfig,
}

impl VhostUserDevice {
    pub fn new(device_id: &str, config: VhostUserConfig) -> Self {
        Self {
            device_id: device_id.to_string(),
            config,
        }
    }
}
