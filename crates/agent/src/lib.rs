// Copyright (c) 2023-2024 The Virtrun Authors
//
// SPDX-License-Identifier: Apache-2.0
//

#[macro_use]
extern crate slog;

logging::logger_with_subsystem!(sl, "agent");

mod client;
pub mod mock;
pub mod sock;
pub mod types;

pub use client::VirtAgent;
pub use types::*;

use anyhow::Result;
use async_trait::async_trait;
use thiserror::Error;

/// Default guest port the agent server listens on.
pub const DEFAULT_AGENT_VSOCK_PORT: u32 = 1024;
/// Default guest port the agent forwards its logs to.
pub const DEFAULT_AGENT_LOG_PORT: u32 = 1025;

#[derive(Error, Debug)]
pub enum AgentError {
    /// The facade has been marked dead; no further calls are possible.
    #[error("agent is dead")]
    Dead,
    #[error("agent request {0} timed out")]
    Timeout(String),
    #[error("agent transport: {0}")]
    Transport(String),
    #[error("agent returned unexpected payload for {0}")]
    UnexpectedPayload(String),
}

/// Client-side agent configuration.
#[derive(Clone, Debug)]
pub struct AgentConfig {
    pub debug: bool,
    pub enable_tracing: bool,
    /// Static tracing keeps the trace collector alive across the sandbox
    /// lifetime; the VM must then not shut down on its own.
    pub static_tracing: bool,
    /// Keep one connection for the sandbox lifetime instead of dialing per
    /// call.
    pub long_live_conn: bool,
    pub server_port: u32,
    pub log_port: u32,
    pub dial_timeout_ms: u32,
    pub request_timeout_ms: u32,
    pub health_check_request_timeout_ms: u32,
    pub kernel_modules: Vec<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            debug: false,
            enable_tracing: false,
            static_tracing: false,
            long_live_conn: true,
            server_port: DEFAULT_AGENT_VSOCK_PORT,
            log_port: DEFAULT_AGENT_LOG_PORT,
            dial_timeout_ms: 10_000,
            request_timeout_ms: 60_000,
            health_check_request_timeout_ms: 30_000,
            kernel_modules: vec![],
        }
    }
}

/// Connection lifecycle of the agent facade.
#[async_trait]
pub trait AgentManager: Send + Sync {
    /// Negotiate client-side behavior from the configuration. Returns true
    /// when VM shutdown must stay disabled after the workload exits.
    async fn init(&self) -> Result<bool>;
    /// Record the transport address and, for long-lived connections, dial it.
    async fn start(&self, address: &str) -> Result<()>;
    /// Drop the connection and mark the facade dead.
    async fn stop(&self);
    async fn agent_sock(&self) -> Result<String>;
    async fn agent_config(&self) -> AgentConfig;
}

#[async_trait]
pub trait HealthService: Send + Sync {
    async fn check(&self, req: CheckRequest) -> Result<HealthCheckResponse>;
    async fn version(&self, req: CheckRequest) -> Result<VersionCheckResponse>;
}

/// The in-guest agent, one typed method per wire operation.
#[async_trait]
pub trait Agent: AgentManager + HealthService + Send + Sync {
    // sandbox
    async fn create_sandbox(&self, req: CreateSandboxRequest) -> Result<Empty>;
    async fn destroy_sandbox(&self, req: DestroySandboxRequest) -> Result<Empty>;

    // resources
    async fn online_cpu_mem(&self, req: OnlineCPUMemRequest) -> Result<Empty>;
    async fn mem_hotplug_by_probe(&self, req: MemHotplugByProbeRequest) -> Result<Empty>;
    async fn add_swap(&self, req: AddSwapRequest) -> Result<Empty>;

    // container
    async fn create_container(&self, req: CreateContainerRequest) -> Result<Empty>;
    async fn start_container(&self, req: ContainerID) -> Result<Empty>;
    async fn stop_container(&self, req: ContainerID) -> Result<Empty>;
    async fn remove_container(&self, req: RemoveContainerRequest) -> Result<Empty>;
    async fn pause_container(&self, req: ContainerID) -> Result<Empty>;
    async fn resume_container(&self, req: ContainerID) -> Result<Empty>;
    async fn update_container(&self, req: UpdateContainerRequest) -> Result<Empty>;
    async fn stats_container(&self, req: StatsContainerRequest) -> Result<StatsContainerResponse>;

    // process
    async fn exec_process(&self, req: ExecProcessRequest) -> Result<Empty>;
    async fn signal_process(&self, req: SignalProcessRequest) -> Result<Empty>;
    async fn wait_process(&self, req: WaitProcessRequest) -> Result<WaitProcessResponse>;
    async fn write_stdin(&self, req: WriteStreamRequest) -> Result<WriteStreamResponse>;
    async fn read_stdout(&self, req: ReadStreamRequest) -> Result<ReadStreamResponse>;
    async fn read_stderr(&self, req: ReadStreamRequest) -> Result<ReadStreamResponse>;
    async fn close_stdin(&self, req: CloseStdinRequest) -> Result<Empty>;
    async fn tty_win_resize(&self, req: TtyWinResizeRequest) -> Result<Empty>;

    // network
    async fn update_interface(&self, req: UpdateInterfaceRequest) -> Result<Empty>;
    async fn update_routes(&self, req: UpdateRoutesRequest) -> Result<Empty>;
    async fn list_interfaces(&self, req: ListInterfacesRequest) -> Result<Interfaces>;
    async fn list_routes(&self, req: ListRoutesRequest) -> Result<Routes>;
    async fn add_arp_neighbors(&self, req: AddArpNeighborRequest) -> Result<Empty>;

    // guest
    async fn get_guest_details(&self, req: GetGuestDetailsRequest) -> Result<GuestDetailsResponse>;
    async fn update_mounts(&self, req: UpdateMountsRequest) -> Result<Empty>;
    async fn get_oom_event(&self, req: GetOOMEventRequest) -> Result<OomEventResponse>;
    async fn copy_file(&self, req: CopyFileRequest) -> Result<Empty>;
    async fn get_ip_tables(&self, req: GetIPTablesRequest) -> Result<GetIPTablesResponse>;
    async fn set_ip_tables(&self, req: SetIPTablesRequest) -> Result<SetIPTablesResponse>;
    async fn set_policy(&self, req: SetPolicyRequest) -> Result<Empty>;
    async fn get_volume_stats(&self, req: VolumeStatsRequest) -> Result<VolumeStatsResponse>;
    async fn resize_volume(&self, req: ResizeVolumeRequest) -> Result<Empty>;
}

/// Push a file into the guest in bounded chunks; the agent reassembles by
/// offset.
pub async fn copy_file_to_guest(
    agent: &dyn Agent,
    path: &str,
    data: &[u8],
    file_mode: u32,
    uid: i32,
    gid: i32,
) -> Result<()> {
    let mut offset = 0usize;
    loop {
        let end = (offset + FILE_CHUNK_SIZE).min(data.len());
        agent
            .copy_file(CopyFileRequest {
                path: path.to_string(),
                file_size: data.len() as i64,
                file_mode,
                dir_mode: 0o750,
                uid,
                gid,
                offset: offset as i64,
                data: data[offset..end].to_vec(),
            })
            .await?;
        if end >= data.len() {
            return Ok(());
        }
        offset = end;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_copy_file_chunks() {
        let agent = mock::MockAgent::new();
        // empty file still sends one (empty) chunk
        copy_file_to_guest(&agent, "/etc/hosts", &[], 0o644, 0, 0)
            .await
            .unwrap();

        let big = vec![0u8; FILE_CHUNK_SIZE + 7];
        copy_file_to_guest(&agent, "/etc/hosts", &big, 0o644, 0, 0)
            .await
            .unwrap();
    }
}
