// Copyright (c) 2023-2024 The Virtrun Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use std::collections::BTreeSet;

use hypervisor::HypervisorState;
use resource::ResourceState;
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SandboxStatus {
    /// Exists in memory only; nothing has been materialized yet.
    Unmaterialized,
    Ready,
    Running,
    Paused,
    Stopped,
}

impl Default for SandboxStatus {
    fn default() -> Self {
        SandboxStatus::Unmaterialized
    }
}

/// Persistent subset of the sandbox itself.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SandboxState {
    pub status: SandboxStatus,
    /// Block indexes handed out to devices, first-fit allocated.
    pub block_index_set: BTreeSet<u32>,
    pub sandbox_controller_id: String,
    pub overhead_controller_id: String,
    pub guest_mem_block_size_mb: u32,
    pub guest_supports_mem_hotplug_probe: bool,
}

/// The full on-disk record of one sandbox.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PersistRecord {
    pub sandbox: SandboxState,
    pub hypervisor: Option<HypervisorState>,
    pub resource: Option<ResourceState>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_round_trip() {
        let mut record = PersistRecord::default();
        record.sandbox.status = SandboxStatus::Running;
        record.sandbox.block_index_set.insert(0);
        record.sandbox.block_index_set.insert(2);
        record.sandbox.guest_mem_block_size_mb = 128;

        let text = serde_json::to_string(&record).unwrap();
        let parsed: PersistRecord = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed.sandbox.status, SandboxStatus::Running);
        assert_eq!(
            parsed.sandbox.block_index_set.iter().copied().collect::<Vec<_>>(),
            vec![0, 2]
        );
    }
}
