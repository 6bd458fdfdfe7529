// Copyright (c) 2023-2024 The Virtrun Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use serde::{Deserialize, Serialize};

use crate::config::HypervisorConfig;
use crate::pci::{Bridge, PciePort, PcieTopology};

/// The persistent subset of a hypervisor backend, flattened by `save_state`
/// without touching the live VMM.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct HypervisorState {
    /// Kind tag, one of the `HYPERVISOR_*` constants.
    pub hypervisor_type: String,
    /// VMM process id; `None` when no VM is running.
    pub pid: Option<i32>,
    /// VM UUID; reused verbatim on restore.
    pub uuid: String,
    /// Per-sandbox VM directory.
    pub vm_path: String,
    pub hotplug_vfio: PciePort,
    pub bridges: Vec<Bridge>,
    pub topology: Option<PcieTopology>,
    /// Monitor ids of hot-plugged vCPUs, oldest first.
    pub hotplugged_vcpus: Vec<String>,
    pub hotplugged_mem_mb: u32,
    pub next_mem_slot: u32,
    /// Zero means "daemon not running".
    pub share_fs_daemon_pid: i32,
    /// Partitioning backends only: slot -> backing file of the block pool.
    pub block_pool: Vec<Option<String>>,
    pub config: HypervisorConfig,
}
