// Copyright (c) 2023-2024 The Virtrun Authors
//
// SPDX-License-Identifier: Apache-2.0
//

#[macro_use]
extern crate slog;

logging::logger_with_subsystem!(sl, "resource");

pub mod cpu_mem;
mod manager;
mod manager_inner;
pub mod network;
mod resource_persist;

pub use manager::ResourceManager;
pub use resource_persist::ResourceState;

use anyhow::Result;

/// What happened to the container whose resources triggered reconciliation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResourceUpdateOp {
    Add,
    Del,
    Update,
}

/// The cgroup-side collaborator. Construction and backend selection live
/// outside this crate; reconciliation only pushes the computed sets.
pub trait ResourceController: Send + Sync {
    /// Replace the sandbox-level cpuset/memset with the given union.
    fn update_cpuset(&self, cpus: &str, mems: &str) -> Result<()>;
}

/// Controller that records nothing; used when the sandbox runs without a
/// cgroup backend and in tests.
#[derive(Debug, Default)]
pub struct NoopResourceController;

impl ResourceController for NoopResourceController {
    fn update_cpuset(&self, _cpus: &str, _mems: &str) -> Result<()> {
        Ok(())
    }
}
