// Copyright (c) 2023-2024 The Virtrun Authors
//
// SPDX-License-Identifier: Apache-2.0
//

mod mock;
mod virtiofsd;

pub use mock::MockShareFsDaemon;
pub use virtiofsd::Virtiofsd;

use anyhow::Result;
use async_trait::async_trait;

use crate::config::{VIRTIO_FS_CACHE_ALWAYS, VIRTIO_FS_CACHE_AUTO, VIRTIO_FS_CACHE_NEVER};
use crate::error::HypervisorError;

/// The fd number the daemon finds its listening socket at, first slot of
/// the standard extra-fd convention.
pub const SHARE_FS_DAEMON_FD: i32 = 3;

/// An out-of-process helper exporting a host directory tree to the guest.
/// Owned by the hypervisor for its lifetime; a pid of zero means "not
/// running".
#[async_trait]
pub trait ShareFsDaemon: Send + Sync {
    /// Spawn the daemon and begin observing it. Returns the pid.
    async fn start(&mut self) -> Result<u32>;
    /// SIGKILL the daemon and remove its socket. Idempotent.
    async fn stop(&mut self) -> Result<()>;
    fn pid(&self) -> u32;
}

/// Normalize and validate a cache mode; the empty string selects auto.
pub fn validate_cache_mode(mode: &str) -> Result<String> {
    match mode {
        "" => Ok(VIRTIO_FS_CACHE_AUTO.to_string()),
        VIRTIO_FS_CACHE_NEVER | VIRTIO_FS_CACHE_AUTO | VIRTIO_FS_CACHE_ALWAYS => {
            Ok(mode.to_string())
        }
        other => Err(HypervisorError::InvalidCacheMode(other.to_string()).into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_cache_mode() {
        assert_eq!(validate_cache_mode("").unwrap(), "auto");
        assert_eq!(validate_cache_mode("never").unwrap(), "never");
        assert_eq!(validate_cache_mode("always").unwrap(), "always");
        let err = validate_cache_mode("write-through").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<HypervisorError>(),
            Some(HypervisorError::InvalidCacheMode(_))
        ));
    }
}
