// Copyright (c) 2023-2024 The Virtrun Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use serde::{Deserialize, Serialize};

/// Agent transport over vhost-vsock.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct VsockConfig {
    /// Guest context id claimed for this VM.
    pub guest_cid: u32,

    /// Open fd of /dev/vhost-vsock with the context id set; handed to the
    /// VMM and never serialized.
    #[serde(skip)]
    pub vhost_fd: i32,
}

/// Agent transport over a host UNIX socket multiplexing guest ports.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct HybridVsockConfig {
    pub guest_cid: u32,

    /// Host-side UNIX socket path.
    pub uds_path: String,
}

/// A plain socket device for backends without vsock support; the agent is
/// reached through a serial channel behind this host path.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SocketDevice {
    pub device_id: String,
    pub host_path: String,
    pub name: String,
}
