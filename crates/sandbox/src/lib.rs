// Copyright (c) 2023-2024 The Virtrun Authors
//
// SPDX-License-Identifier: Apache-2.0
//

#[macro_use]
extern crate slog;

logging::logger_with_subsystem!(sl, "sandbox");

mod config;
mod console_watcher;
pub mod health_check;
mod hooks;
pub mod sandbox;
mod sandbox_persist;

pub use config::{NetworkEnv, SandboxConfig};
pub use hooks::Hook;
pub use sandbox::VirtSandbox;
pub use sandbox_persist::{PersistRecord, SandboxState, SandboxStatus};

use anyhow::Result;
use async_trait::async_trait;

/// Sandbox lifetime management as seen by the runtime above.
#[async_trait]
pub trait Sandbox: Send + Sync {
    async fn start(&self) -> Result<()>;
    /// With `force`, teardown continues past non-fatal step failures.
    async fn stop(&self, force: bool) -> Result<()>;
    async fn pause(&self) -> Result<()>;
    async fn resume(&self) -> Result<()>;
    async fn cleanup(&self) -> Result<()>;
    async fn status(&self) -> SandboxStatus;
}
