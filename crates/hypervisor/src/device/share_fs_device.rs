// Copyright (c) 2023-2024 The Virtrun Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use serde::{Deserialize, Serialize};

/// The in-VM half of the shared filesystem: a vhost-user-fs device wired to
/// the daemon socket.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ShareFsDeviceConfig {
    /// Daemon vhost-user socket path.
    pub sock_path: String,

    /// Tag the guest mounts by.
    pub mount_tag: String,

    /// Host directory exported to the guest.
    pub host_path: String,

    /// One of the `SHARED_FS_*` selectors.
    pub fs_type: String,

    pub queue_size: u32,

    pub queue_num: u32,
}
