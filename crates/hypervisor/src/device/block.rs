// Copyright (c) 2023-2024 The Virtrun Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use serde::{Deserialize, Serialize};

use crate::pci::PciPath;

/// SCSI target of a disk behind a virtio-scsi controller, derived from the
/// sandbox block index.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScsiAddr {
    pub id: u32,
    pub lun: u32,
}

impl ScsiAddr {
    /// One controller addresses 256 LUNs per target.
    pub fn from_index(index: u64) -> Self {
        ScsiAddr {
            id: (index / 256) as u32,
            lun: (index % 256) as u32,
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct BlockConfig {
    /// Path of the drive.
    pub path_on_host: String,

    /// On-disk format, e.g. "raw".
    pub format: String,

    /// If set to true, the drive is opened in read-only mode.
    pub is_readonly: bool,

    /// Sandbox-wide block index backing guest naming (vda, vdb, ...).
    pub index: u64,

    /// Driver variant, one of the `VIRTIO_BLOCK_*` / `VIRTIO_SCSI` /
    /// `VIRTIO_PMEM` selectors.
    pub driver_option: String,

    /// The disk backs guest swap.
    pub is_swap: bool,

    /// Expose as a persistent-memory device.
    pub is_pmem: bool,

    /// Expose as an nvdimm module.
    pub is_nvdimm: bool,

    /// Guest PCI location, filled at hot-plug time.
    pub pci_path: Option<PciPath>,

    /// SCSI address, filled when `driver_option` is virtio-scsi.
    pub scsi_addr: Option<ScsiAddr>,

    /// CCW device number, filled on s390 machines.
    pub ccw_devno: Option<String>,

    /// Device node inside the guest, e.g. "/dev/vdb".
    pub virt_path: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct BlockDevice {
    pub device_id: String,
    pub config: BlockConfig,
}

impl BlockDevice {
    pub fn new(device_id: &str, config: BlockConfig) -> Self {
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
    fn test_scsi_addr_from_index() {
        assert_eq!(ScsiAddr::from_index(0), ScsiAddr { id: 0, lun: 0 });
        assert_eq!(ScsiAddr::from_index(255), ScsiAddr { id: 0, lun: 255 });
        assert_eq!(ScsiAddr::from_index(256), ScsiAddr { id: 1, lun: 0 });
    }
}
