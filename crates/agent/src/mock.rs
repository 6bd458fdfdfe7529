// Copyright (c) 2023-2024 The Virtrun Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use anyhow::Result;
use async_trait::async_trait;

use crate::types::*;
use crate::{Agent, AgentConfig, AgentManager, HealthService};

/// No-I/O agent answering every call with defaults; the injection point for
/// orchestrator tests.
#[derive(Debug, Default)]
pub struct MockAgent {}

impl MockAgent {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AgentManager for MockAgent {
    async fn init(&self) -> Result<bool> {
        Ok(false)
    }

    async fn start(&self, _address: &str) -> Result<()> {
        Ok(())
    }

    async fn stop(&self) {}

    async fn agent_sock(&self) -> Result<String> {
        Ok("vsock://3:1024".to_string())
    }

    async fn agent_config(&self) -> AgentConfig {
        AgentConfig::default()
    }
}

#[async_trait]
impl HealthService for MockAgent {
    async fn check(&self, _req: CheckRequest) -> Result<HealthCheckResponse> {
        Ok(HealthCheckResponse { status: 1 })
    }

    async fn version(&self, _req: CheckRequest) -> Result<VersionCheckResponse> {
        Ok(VersionCheckResponse {
            grpc_version: "1".to_string(),
            agent_version: "mock".to_string(),
        })
    }
}

macro_rules! impl_mock_agent {
    ($(($name: ident, $req: ty, $resp: ty)),* $(,)?) => {
        #[async_trait]
        impl Agent for MockAgent {
            $(async fn $name(&self, _req: $req) -> Result<$resp> {
                Ok(<$resp>::default())
            })*
        }
    };
}

impl_mock_agent!(
    (create_sandbox, CreateSandboxRequest, Empty),
    (destroy_sandbox, DestroySandboxRequest, Empty),
    (online_cpu_mem, OnlineCPUMemRequest, Empty),
    (mem_hotplug_by_probe, MemHotplugByProbeRequest, Empty),
    (add_swap, AddSwapRequest, Empty),
    (create_container, CreateContainerRequest, Empty),
    (start_container, ContainerID, Empty),
    (stop_container, ContainerID, Empty),
    (remove_container, RemoveContainerRequest, Empty),
    (pause_container, ContainerID, Empty),
    (resume_container, ContainerID, Empty),
    (update_container, UpdateContainerRequest, Empty),
    (stats_container, StatsContainerRequest, StatsContainerResponse),
    (exec_process, ExecProcessRequest, Empty),
    (signal_process, SignalProcessRequest, Empty),
    (wait_process, WaitProcessRequest, WaitProcessResponse),
    (write_stdin, WriteStreamRequest, WriteStreamResponse),
    (read_stdout, ReadStreamRequest, ReadStreamResponse),
    (read_stderr, ReadStreamRequest, ReadStreamResponse),
    (close_stdin, CloseStdinRequest, Empty),
    (tty_win_resize, TtyWinResizeRequest, Empty),
    (update_interface, UpdateInterfaceRequest, Empty),
    (update_routes, UpdateRoutesRequest, Empty),
    (list_interfaces, ListInterfacesRequest, Interfaces),
    (list_routes, ListRoutesRequest, Routes),
    (add_arp_neighbors, AddArpNeighborRequest, Empty),
    (get_guest_details, GetGuestDetailsRequest, GuestDetailsResponse),
    (update_mounts, UpdateMountsRequest, Empty),
    (get_oom_event, GetOOMEventRequest, OomEventResponse),
    (copy_file, CopyFileRequest, Empty),
    (get_ip_tables, GetIPTablesRequest, GetIPTablesResponse),
    (set_ip_tables, SetIPTablesRequest, SetIPTablesResponse),
    (set_policy, SetPolicyRequest, Empty),
    (get_volume_stats, VolumeStatsRequest, VolumeStatsResponse),
    (resize_volume, ResizeVolumeRequest, Empty),
);
