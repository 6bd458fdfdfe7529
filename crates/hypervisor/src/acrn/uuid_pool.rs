// Copyright (c) 2023-2024 The Virtrun Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use anyhow::{anyhow, Result};

use crate::error::HypervisorError;

/// The only UUIDs the partitioning hypervisor accepts at boot, index =
/// position. The table is fixed at build time.
pub const ACRN_UUIDS: [&str; 8] = [
    "a7ada506-1ab0-4b6b-a0da-e513ca9b8c2f",
    "dbeae168-26e4-4084-9227-622193e56325",
    "18ed60cd-e9ea-4bf4-8f87-8523fc8347a3",
    "3f90b6f8-449a-4e72-b99c-063a889fc422",
    "1ae8587b-e599-4b59-8260-6d14ac166a55",
    "75f3b94b-49ed-48fc-b019-577ef45adf2b",
    "ca62cf3c-8359-47e8-a3f7-de2d682dfb02",
    "e3189497-c3f6-4b97-9e2c-18ac0ab9064d",
];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SlotState {
    Free,
    Busy,
}

/// First-fit allocator over the fixed UUID table. Busy slots always equal
/// the VMs this process has launched; the pool is re-derived rather than
/// persisted.
#[derive(Debug)]
pub struct UuidPool {
    slots: [SlotState; ACRN_UUIDS.len()],
    /// Platform cap from `GET_PLATFORM_INFO`; slots beyond it never
    /// allocate.
    capacity: usize,
}

impl Default for UuidPool {
    fn default() -> Self {
        Self::new()
    }
}

impl UuidPool {
    pub fn new() -> Self {
        Self {
            slots: [SlotState::Free; ACRN_UUIDS.len()],
            capacity: ACRN_UUIDS.len(),
        }
    }

    pub fn set_capacity(&mut self, capacity: usize) {
        self.capacity = capacity.min(ACRN_UUIDS.len());
    }

    /// Claim the lowest free slot.
    pub fn next_available(&mut self) -> Result<&'static str> {
        for i in 0..self.capacity {
            if self.slots[i] == SlotState::Free {
                self.slots[i] = SlotState::Busy;
                return Ok(ACRN_UUIDS[i]);
            }
        }
        Err(HypervisorError::ResourceExhausted(
            "all partitioning-hypervisor uuids are in use".to_string(),
        )
        .into())
    }

    /// Claim a specific uuid, used when restoring a running VM.
    pub fn mark_busy(&mut self, uuid: &str) -> Result<()> {
        let idx = self.index_of(uuid)?;
        self.slots[idx] = SlotState::Busy;
        Ok(())
    }

    pub fn release(&mut self, uuid: &str) -> Result<()> {
        let idx = self.index_of(uuid)?;
        self.slots[idx] = SlotState::Free;
        Ok(())
    }

    pub fn is_busy(&self, uuid: &str) -> bool {
        self.index_of(uuid)
            .map(|i| self.slots[i] == SlotState::Busy)
            .unwrap_or(false)
    }

    pub fn index_of(&self, uuid: &str) -> Result<usize> {
        ACRN_UUIDS
            .iter()
            .position(|u| *u == uuid)
            .ok_or_else(|| anyhow!("uuid {:?} is not in the fixed table", uuid))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_fit_and_recycling() {
        let mut pool = UuidPool::new();
        let first = pool.next_available().unwrap();
        assert_eq!(first, ACRN_UUIDS[0]);
        assert!(pool.is_busy(first));

        pool.release(first).unwrap();
        assert!(!pool.is_busy(first));

        // a freed slot is handed out again
        assert_eq!(pool.next_available().unwrap(), ACRN_UUIDS[0]);
    }

    #[test]
    fn test_exhaustion() {
        let mut pool = UuidPool::new();
        for expected in ACRN_UUIDS.iter() {
            assert_eq!(pool.next_available().unwrap(), *expected);
        }
        let err = pool.next_available().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<HypervisorError>(),
            Some(HypervisorError::ResourceExhausted(_))
        ));
    }

    #[test]
    fn test_capacity_cap() {
        let mut pool = UuidPool::new();
        pool.set_capacity(2);
        pool.next_available().unwrap();
        pool.next_available().unwrap();
        assert!(pool.next_available().is_err());
    }

    #[test]
    fn test_mark_busy_for_restore() {
        let mut pool = UuidPool::new();
        pool.mark_busy(ACRN_UUIDS[3]).unwrap();
        for i in [0usize, 1, 2] {
            assert_eq!(pool.next_available().unwrap(), ACRN_UUIDS[i]);
        }
        // index 3 is skipped
        assert_eq!(pool.next_available().unwrap(), ACRN_UUIDS[4]);
        assert!(pool.mark_busy("not-a-pool-uuid").is_err());
    }
}
