// Copyright (c) 2023-2024 The Virtrun Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::sync::Mutex;

use crate::sock::{connect_address, Address};
use crate::types::*;
use crate::{Agent, AgentConfig, AgentError, AgentManager, HealthService};

/// Liveness probes get a tighter deadline than regular requests.
const CHECK_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Upper bound on a reply frame; a larger one indicates a corrupt stream.
const MAX_FRAME_LEN: u32 = 8 * 1024 * 1024;

struct VirtAgentInner {
    config: AgentConfig,
    address: Option<Address>,
    conn: Option<UnixStream>,
    dead: bool,
}

/// Serializing agent client. One request is in flight at a time; the shared
/// lock also serializes connect and disconnect.
#[derive(Clone)]
pub struct VirtAgent {
    inner: Arc<Mutex<VirtAgentInner>>,
}

impl VirtAgent {
    pub fn new(config: AgentConfig) -> Self {
        Self {
            inner: Arc::new(Mutex::new(VirtAgentInner {
                config,
                address: None,
                conn: None,
                dead: false,
            })),
        }
    }

    /// Mark the facade dead; every further call fails with `AgentError::Dead`.
    pub async fn mark_dead(&self) {
        let mut inner = self.inner.lock().await;
        inner.dead = true;
        inner.conn = None;
    }

    async fn call(&self, method: &str, params: Value, timeout: Option<Duration>) -> Result<Value> {
        let mut inner = self.inner.lock().await;
        if inner.dead {
            return Err(AgentError::Dead.into());
        }

        let address = inner
            .address
            .clone()
            .ok_or_else(|| anyhow!("agent not started"))?;
        let dial_timeout = Duration::from_millis(inner.config.dial_timeout_ms as u64);
        let long_live = inner.config.long_live_conn;

        if inner.conn.is_none() {
            let stream = connect_address(&address, dial_timeout)
                .await
                .map_err(|e| AgentError::Transport(e.to_string()))?;
            inner.conn = Some(stream);
        }

        let result = match timeout {
            Some(t) => {
                let rpc = tokio::time::timeout(t, do_roundtrip(&mut inner, method, &params)).await;
                match rpc {
                    Ok(r) => r,
                    Err(_) => {
                        // the stream may have a half-written frame on it, drop it
                        inner.conn = None;
                        return Err(AgentError::Timeout(method.to_string()).into());
                    }
                }
            }
            None => do_roundtrip(&mut inner, method, &params).await,
        };

        if result.is_err() {
            inner.conn = None;
        } else if !long_live {
            inner.conn = None;
        }

        result
    }
}

async fn do_roundtrip(inner: &mut VirtAgentInner, method: &str, params: &Value) -> Result<Value> {
    let conn = inner
        .conn
        .as_mut()
        .ok_or_else(|| anyhow!("no agent connection"))?;

    let body = serde_json::to_vec(&serde_json::json!({
        "method": method,
        "params": params,
    }))?;

    conn.write_all(&(body.len() as u32).to_be_bytes())
        .await
        .map_err(|e| AgentError::Transport(e.to_string()))?;
    conn.write_all(&body)
        .await
        .map_err(|e| AgentError::Transport(e.to_string()))?;

    let mut len_buf = [0u8; 4];
    conn.read_exact(&mut len_buf)
        .await
        .map_err(|e| AgentError::Transport(e.to_string()))?;
    let len = u32::from_be_bytes(len_buf);
    if len > MAX_FRAME_LEN {
        return Err(AgentError::Transport(format!("oversized reply frame {}", len)).into());
    }
    let mut payload = vec![0u8; len as usize];
    conn.read_exact(&mut payload)
        .await
        .map_err(|e| AgentError::Transport(e.to_string()))?;

    let reply: Value = serde_json::from_slice(&payload)
        .map_err(|_| AgentError::UnexpectedPayload(method.to_string()))?;
    if let Some(err) = reply.get("error") {
        return Err(anyhow!("agent {} failed: {}", method, err));
    }
    reply
        .get("ok")
        .cloned()
        .ok_or_else(|| AgentError::UnexpectedPayload(method.to_string()).into())
}

#[async_trait]
impl AgentManager for VirtAgent {
    async fn init(&self) -> Result<bool> {
        let inner = self.inner.lock().await;
        // static tracing keeps the trace collector alive past the workload,
        // so the VM must not power itself down
        let disable_vm_shutdown = inner.config.static_tracing;
        info!(sl!(), "agent init";
            "long_live_conn" => inner.config.long_live_conn,
            "disable_vm_shutdown" => disable_vm_shutdown);
        Ok(disable_vm_shutdown)
    }

    async fn start(&self, address: &str) -> Result<()> {
        let parsed = Address::parse(address).context("parse agent address")?;
        let mut inner = self.inner.lock().await;
        if inner.dead {
            return Err(AgentError::Dead.into());
        }
        info!(sl!(), "connect agent"; "address" => address);
        inner.address = Some(parsed.clone());
        if inner.config.long_live_conn {
            let dial_timeout = Duration::from_millis(inner.config.dial_timeout_ms as u64);
            let stream = connect_address(&parsed, dial_timeout)
                .await
                .map_err(|e| AgentError::Transport(e.to_string()))?;
            inner.conn = Some(stream);
        }
        Ok(())
    }

    async fn stop(&self) {
        let mut inner = self.inner.lock().await;
        inner.conn = None;
        inner.dead = true;
    }

    async fn agent_sock(&self) -> Result<String> {
        let inner = self.inner.lock().await;
        inner
            .address
            .as_ref()
            .map(|a| a.uri())
            .ok_or_else(|| anyhow!("agent not started"))
    }

    async fn agent_config(&self) -> AgentConfig {
        self.inner.lock().await.config.clone()
    }
}

macro_rules! impl_agent {
    ($(($name: ident, $req: ty, $resp: ty, $timeout: expr)),* $(,)?) => {
        #[async_trait]
        impl Agent for VirtAgent {
            $(async fn $name(&self, req: $req) -> Result<$resp> {
                let params = serde_json::to_value(&req)?;
                let reply = self.call(stringify!($name), params, $timeout).await?;
                serde_json::from_value(reply)
                    .map_err(|_| AgentError::UnexpectedPayload(stringify!($name).to_string()).into())
            })*
        }
    };
}

impl_agent!(
    (create_sandbox, CreateSandboxRequest, Empty, Some(DEFAULT_TIMEOUT)),
    (destroy_sandbox, DestroySandboxRequest, Empty, Some(DEFAULT_TIMEOUT)),
    (online_cpu_mem, OnlineCPUMemRequest, Empty, Some(DEFAULT_TIMEOUT)),
    (mem_hotplug_by_probe, MemHotplugByProbeRequest, Empty, Some(DEFAULT_TIMEOUT)),
    (add_swap, AddSwapRequest, Empty, Some(DEFAULT_TIMEOUT)),
    (create_container, CreateContainerRequest, Empty, Some(DEFAULT_TIMEOUT)),
    (start_container, ContainerID, Empty, Some(DEFAULT_TIMEOUT)),
    (stop_container, ContainerID, Empty, Some(DEFAULT_TIMEOUT)),
    (remove_container, RemoveContainerRequest, Empty, Some(DEFAULT_TIMEOUT)),
    (pause_container, ContainerID, Empty, Some(DEFAULT_TIMEOUT)),
    (resume_container, ContainerID, Empty, Some(DEFAULT_TIMEOUT)),
    (update_container, UpdateContainerRequest, Empty, Some(DEFAULT_TIMEOUT)),
    (stats_container, StatsContainerRequest, StatsContainerResponse, Some(DEFAULT_TIMEOUT)),
    (exec_process, ExecProcessRequest, Empty, Some(DEFAULT_TIMEOUT)),
    (signal_process, SignalProcessRequest, Empty, Some(DEFAULT_TIMEOUT)),
    (wait_process, WaitProcessRequest, WaitProcessResponse, None),
    (write_stdin, WriteStreamRequest, WriteStreamResponse, Some(DEFAULT_TIMEOUT)),
    (read_stdout, ReadStreamRequest, ReadStreamResponse, Some(DEFAULT_TIMEOUT)),
    (read_stderr, ReadStreamRequest, ReadStreamResponse, Some(DEFAULT_TIMEOUT)),
    (close_stdin, CloseStdinRequest, Empty, Some(DEFAULT_TIMEOUT)),
    (tty_win_resize, TtyWinResizeRequest, Empty, Some(DEFAULT_TIMEOUT)),
    (update_interface, UpdateInterfaceRequest, Empty, Some(DEFAULT_TIMEOUT)),
    (update_routes, UpdateRoutesRequest, Empty, Some(DEFAULT_TIMEOUT)),
    (list_interfaces, ListInterfacesRequest, Interfaces, Some(DEFAULT_TIMEOUT)),
    (list_routes, ListRoutesRequest, Routes, Some(DEFAULT_TIMEOUT)),
    (add_arp_neighbors, AddArpNeighborRequest, Empty, Some(DEFAULT_TIMEOUT)),
    (get_guest_details, GetGuestDetailsRequest, GuestDetailsResponse, Some(DEFAULT_TIMEOUT)),
    (update_mounts, UpdateMountsRequest, Empty, Some(DEFAULT_TIMEOUT)),
    (get_oom_event, GetOOMEventRequest, OomEventResponse, None),
    (copy_file, CopyFileRequest, Empty, Some(DEFAULT_TIMEOUT)),
    (get_ip_tables, GetIPTablesRequest, GetIPTablesResponse, Some(DEFAULT_TIMEOUT)),
    (set_ip_tables, SetIPTablesRequest, SetIPTablesResponse, Some(DEFAULT_TIMEOUT)),
    (set_policy, SetPolicyRequest, Empty, Some(DEFAULT_TIMEOUT)),
    (get_volume_stats, VolumeStatsRequest, VolumeStatsResponse, Some(DEFAULT_TIMEOUT)),
    (resize_volume, ResizeVolumeRequest, Empty, Some(DEFAULT_TIMEOUT)),
);

#[async_trait]
impl HealthService for VirtAgent {
    async fn check(&self, req: CheckRequest) -> Result<HealthCheckResponse> {
        let params = serde_json::to_value(&req)?;
        let reply = self.call("check", params, Some(CHECK_TIMEOUT)).await?;
        serde_json::from_value(reply)
            .map_err(|_| AgentError::UnexpectedPayload("check".to_string()).into())
    }

    async fn version(&self, req: CheckRequest) -> Result<VersionCheckResponse> {
        let params = serde_json::to_value(&req)?;
        let reply = self.call("version", params, Some(CHECK_TIMEOUT)).await?;
        serde_json::from_value(reply)
            .map_err(|_| AgentError::UnexpectedPayload("version".to_string()).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_call_fails_when_dead() {
        let client = VirtAgent::new(AgentConfig::default());
        client.mark_dead().await;
        let err = client
            .online_cpu_mem(OnlineCPUMemRequest::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<AgentError>(),
            Some(AgentError::Dead)
        ));
    }

    #[tokio::test]
    async fn test_call_fails_when_not_started() {
        let client = VirtAgent::new(AgentConfig::default());
        assert!(client.check(CheckRequest::default()).await.is_err());
    }

    #[tokio::test]
    async fn test_init_reflects_static_tracing() {
        let client = VirtAgent::new(AgentConfig {
            static_tracing: true,
            ..Default::default()
        });
        assert!(client.init().await.unwrap());

        let client = VirtAgent::new(AgentConfig::default());
        assert!(!client.init().await.unwrap());
    }
}
