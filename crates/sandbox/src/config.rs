// Copyright (c) 2023-2024 The Virtrun Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use std::collections::HashMap;

use hypervisor::{DeviceType, HypervisorConfig};

use crate::hooks::Hook;

/// Network-facing knobs of one sandbox.
#[derive(Clone, Debug, Default)]
pub struct NetworkEnv {
    /// Network namespace the endpoints live in.
    pub netns: Option<String>,
    /// Launch without building any endpoints.
    pub disable_new_network: bool,
    /// The container engine above expects interfaces to appear through
    /// device hot-plug; reject backends that cannot.
    pub requires_net_hotplug: bool,
}

/// Everything needed to materialize one sandbox.
#[derive(Clone, Debug, Default)]
pub struct SandboxConfig {
    pub hostname: String,
    /// One of the `hypervisor::HYPERVISOR_*` kind tags.
    pub hypervisor_name: String,
    pub hypervisor_config: HypervisorConfig,
    pub agent_config: agent::AgentConfig,
    pub network: NetworkEnv,
    /// Shared-memory size handed to the agent, bytes.
    pub shm_size: u64,
    pub annotations: HashMap<String, String>,
    /// Size the VM once at create time and refuse later updates.
    pub static_resource_mgmt: bool,
    /// Constrain only the sandbox controller, not per-container ones.
    pub sandbox_cgroup_only: bool,
    /// Build the agent's seccomp filter at create instead of per-exec.
    pub static_seccomp: bool,
    /// SELinux label for the VMM process.
    pub selinux_label: String,
    pub prestart_hooks: Vec<Hook>,
    /// Devices declared by containers before boot (VFIO, vhost-user-blk);
    /// cold-plugged right after the VM is created.
    pub coldplug_devices: Vec<DeviceType>,
}
