// Copyright (c) 2023-2024 The Virtrun Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use thiserror::Error;

/// Failure kinds surfaced across the hypervisor boundary. Callers match on
/// the kind through `anyhow::Error::downcast_ref`.
#[derive(Error, Debug)]
pub enum HypervisorError {
    /// Missing or conflicting assets, unknown hypervisor kind, bad values.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Shared-FS cache mode outside the allowed set.
    #[error("invalid shared-fs cache mode {0:?}")]
    InvalidCacheMode(String),

    /// Lifecycle precondition violation.
    #[error("vm is not running")]
    NotRunning,

    #[error("vm is already stopped")]
    AlreadyStopped,

    /// Monitor or transport level failure, including unexpected reply types.
    #[error("monitor transport: {0}")]
    Transport(String),

    #[error("{0} timed out")]
    Timeout(String),

    /// Operation not implemented by the current backend or guest.
    #[error("unsupported operation: {0}")]
    Unsupported(String),

    /// No more UUIDs, bridge slots, PCIe ports or vCPUs.
    #[error("resources exhausted: {0}")]
    ResourceExhausted(String),

    /// The monitor reported an unrecoverable guest condition.
    #[error("guest failure: {0}")]
    GuestFailure(String),

    /// File or process supervision failure.
    #[error("io failure: {0}")]
    Io(String),
}
