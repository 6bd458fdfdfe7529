// Copyright (c) 2023-2024 The Virtrun Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use hypervisor::device::BlockDevice;
use serde::{Deserialize, Serialize};

/// Persistent subset of the resource manager.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ResourceState {
    /// Swap drives provisioned for the guest, with their backing files.
    pub swap_devices: Vec<BlockDevice>,
    pub current_vcpu: u32,
    pub current_mem_mb: u32,
}
