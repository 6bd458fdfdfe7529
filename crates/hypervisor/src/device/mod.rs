// Copyright (c) 2023-2024 The Virtrun Authors
//
// SPDX-License-Identifier: Apache-2.0
//

mod block;
pub use block::{BlockConfig, BlockDevice, ScsiAddr};
mod network;
pub use network::{Address, NetworkConfig, NetworkDevice};
mod vfio;
pub use vfio::{VfioConfig, VfioDevice, VfioDeviceType};
mod vhost_user;
pub use vhost_user::{VhostUserConfig, VhostUserDevice, VhostUserType};
mod vsock;
pub use vsock::{HybridVsockConfig, SocketDevice, VsockConfig};
mod share_fs_device;
pub use share_fs_device::ShareFsDeviceConfig;
mod memory;
pub use memory::MemoryConfig;

use std::fmt;

use serde::{Deserialize, Serialize};

/// A hot-pluggable vCPU.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CpuDevice {
    pub id: String,
}

/// Everything the hypervisor boundary can attach or detach.
#[derive(Debug, Clone)]
pub enum DeviceType {
    Block(BlockDevice),
    Network(NetworkDevice),
    Vfio(VfioDevice),
    VhostUser(VhostUserDevice),
    Vsock(VsockConfig),
    HybridVsock(HybridVsockConfig),
    Socket(SocketDevice),
    ShareFs(ShareFsDeviceConfig),
    Memory(MemoryConfig),
    Cpu(CpuDevice),
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}
