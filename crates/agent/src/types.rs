// Copyright (c) 2023-2024 The Virtrun Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct Empty {}

impl Empty {
    pub fn new() -> Self {
        Self::default()
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CheckRequest {}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct HealthCheckResponse {
    pub status: u32,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct VersionCheckResponse {
    pub grpc_version: String,
    pub agent_version: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Storage {
    pub driver: String,
    pub driver_options: Vec<String>,
    pub source: String,
    pub fs_type: String,
    pub options: Vec<String>,
    pub mount_point: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CreateSandboxRequest {
    pub hostname: String,
    pub dns: Vec<String>,
    pub storages: Vec<Storage>,
    pub sandbox_pidns: bool,
    pub sandbox_id: String,
    pub guest_hook_path: String,
    pub kernel_modules: Vec<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DestroySandboxRequest {}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct OnlineCPUMemRequest {
    pub wait: bool,
    pub nb_cpus: u32,
    pub cpu_only: bool,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct MemHotplugByProbeRequest {
    /// Physical addresses of the hot-added memory sections.
    pub mem_hotplug_probe_addr: Vec<u64>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ContainerID {
    pub container_id: String,
}

impl ContainerID {
    pub fn new(id: &str) -> Self {
        Self {
            container_id: id.to_string(),
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ContainerProcessID {
    pub container_id: String,
    pub exec_id: String,
}

impl ContainerProcessID {
    pub fn new(container_id: &str, exec_id: &str) -> Self {
        Self {
            container_id: container_id.to_string(),
            exec_id: exec_id.to_string(),
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct LinuxCpu {
    pub shares: Option<u64>,
    pub quota: Option<i64>,
    pub period: Option<u64>,
    pub cpus: String,
    pub mems: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct LinuxMemory {
    pub limit: Option<i64>,
    pub swap: Option<i64>,
    pub swappiness: Option<u64>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct HugepageLimit {
    pub page_size: String,
    pub limit: u64,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct LinuxResources {
    pub cpu: Option<LinuxCpu>,
    pub memory: Option<LinuxMemory>,
    pub hugepage_limits: Vec<HugepageLimit>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct LinuxDeviceInfo {
    pub id: String,
    pub container_path: String,
    pub field_type: String,
    pub vm_path: String,
    pub options: Vec<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Process {
    pub terminal: bool,
    pub args: Vec<String>,
    pub env: Vec<String>,
    pub cwd: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CreateContainerRequest {
    pub process_id: ContainerProcessID,
    pub storages: Vec<Storage>,
    pub devices: Vec<LinuxDeviceInfo>,
    pub oci: Option<serde_json::Value>,
    pub sandbox_pidns: bool,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RemoveContainerRequest {
    pub container_id: String,
    pub timeout: u32,
}

impl RemoveContainerRequest {
    pub fn new(id: &str, timeout: u32) -> Self {
        Self {
            container_id: id.to_string(),
            timeout,
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ExecProcessRequest {
    pub process_id: ContainerProcessID,
    pub process: Option<Process>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SignalProcessRequest {
    pub process_id: ContainerProcessID,
    pub signal: u32,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct WaitProcessRequest {
    pub process_id: ContainerProcessID,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct WaitProcessResponse {
    pub status: i32,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct UpdateContainerRequest {
    pub container_id: String,
    pub resources: LinuxResources,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct StatsContainerRequest {
    pub container_id: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct StatsContainerResponse {
    pub cgroup_stats: Option<serde_json::Value>,
    pub network_stats: Vec<serde_json::Value>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct WriteStreamRequest {
    pub process_id: ContainerProcessID,
    pub data: Vec<u8>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct WriteStreamResponse {
    pub length: u32,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ReadStreamRequest {
    pub process_id: ContainerProcessID,
    pub len: u32,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ReadStreamResponse {
    pub data: Vec<u8>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CloseStdinRequest {
    pub process_id: ContainerProcessID,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TtyWinResizeRequest {
    pub process_id: ContainerProcessID,
    pub row: u32,
    pub column: u32,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct IPAddress {
    pub family: u32,
    pub address: String,
    pub mask: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Interface {
    pub device: String,
    pub name: String,
    pub ip_addresses: Vec<IPAddress>,
    pub mtu: u64,
    pub hw_addr: String,
    /// Guest PCI path of the device backing this interface, if any.
    pub pci_addr: String,
    pub field_type: String,
    pub raw_flags: u32,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Interfaces {
    pub interfaces: Vec<Interface>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Route {
    pub dest: String,
    pub gateway: String,
    pub device: String,
    pub source: String,
    pub scope: u32,
    pub family: u32,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Routes {
    pub routes: Vec<Route>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct UpdateInterfaceRequest {
    pub interface: Option<Interface>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct UpdateRoutesRequest {
    pub route: Option<Routes>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ListInterfacesRequest {}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ListRoutesRequest {}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ARPNeighbor {
    pub to_ip_address: Option<IPAddress>,
    pub device: String,
    pub ll_addr: String,
    pub state: i32,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ARPNeighbors {
    pub neighbors: Vec<ARPNeighbor>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AddArpNeighborRequest {
    pub neighbors: Option<ARPNeighbors>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AddSwapRequest {
    /// Slot chain of the swap block device, root-most first.
    pub pci_path: Vec<u32>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct GetGuestDetailsRequest {
    pub mem_block_size: bool,
    pub mem_hotplug_probe: bool,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct GuestDetailsResponse {
    pub mem_block_size_bytes: u64,
    pub support_mem_hotplug_probe: bool,
    pub support_seccomp: bool,
    pub agent_version: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct UpdateMountsRequest {
    pub storages: Vec<Storage>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct GetOOMEventRequest {}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct OomEventResponse {
    pub container_id: String,
}

/// File content travels in chunks of at most this size.
pub const FILE_CHUNK_SIZE: usize = 1024 * 1024;

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CopyFileRequest {
    pub path: String,
    pub file_size: i64,
    pub file_mode: u32,
    pub dir_mode: u32,
    pub uid: i32,
    pub gid: i32,
    pub offset: i64,
    pub data: Vec<u8>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct GetIPTablesRequest {
    pub is_ipv6: bool,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct GetIPTablesResponse {
    pub data: Vec<u8>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SetIPTablesRequest {
    pub is_ipv6: bool,
    pub data: Vec<u8>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SetIPTablesResponse {
    pub data: Vec<u8>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SetPolicyRequest {
    pub policy: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct VolumeStatsRequest {
    pub volume_guest_path: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct VolumeStatsResponse {
    pub data: Option<serde_json::Value>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ResizeVolumeRequest {
    pub volume_guest_path: String,
    pub size: u64,
}
