// Copyright (c) 2023-2024 The Virtrun Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use serde::{Deserialize, Serialize};

/// One hot-plugged memory module.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct MemoryConfig {
    pub slot: u32,
    pub size_mb: u32,
    /// Guest physical address, filled when the caller asked to probe.
    pub addr: u64,
    /// The guest onlines this module by probing the address instead of ACPI.
    pub probe: bool,
}
