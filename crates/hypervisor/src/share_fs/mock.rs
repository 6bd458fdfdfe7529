// Copyright (c) 2023-2024 The Virtrun Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use anyhow::Result;
use async_trait::async_trait;

use crate::share_fs::ShareFsDaemon;

/// Daemon stand-in doing no I/O; returns a fixed pid.
#[derive(Debug, Default)]
pub struct MockShareFsDaemon {
    pid: Option<u32>,
}

impl MockShareFsDaemon {
    pub const PID: u32 = 9999;

    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ShareFsDaemon for MockShareFsDaemon {
    async fn start(&mut self) -> Result<u32> {
        self.pid = Some(Self::PID);
        Ok(Self::PID)
    }

    async fn stop(&mut self) -> Result<()> {
        self.pid = None;
        Ok(())
    }

    fn pid(&self) -> u32 {
        self.pid.unwrap_or(0)
    }
}
