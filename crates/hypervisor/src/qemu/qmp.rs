// Copyright (c) 2023-2024 The Virtrun Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use std::os::unix::io::{AsRawFd, RawFd};
use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, Result};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::sync::{mpsc, oneshot};

use crate::error::HypervisorError;

/// Upper bound on one command round trip.
const QMP_EXECUTE_TIMEOUT: Duration = Duration::from_secs(30);

pub const EVENT_GUEST_PANICKED: &str = "GUEST_PANICKED";
pub const EVENT_SHUTDOWN: &str = "SHUTDOWN";
pub const EVENT_POWERDOWN: &str = "POWERDOWN";

/// Guest run states reported by `query-status` that mean the VM is beyond
/// recovery.
pub const STATUS_INTERNAL_ERROR: &str = "internal-error";
pub const STATUS_GUEST_PANICKED: &str = "guest-panicked";

/// An asynchronous monitor notification, delivered outside the
/// command/reply stream.
#[derive(Clone, Debug)]
pub struct QmpEvent {
    pub name: String,
    pub data: Value,
}

struct Request {
    execute: String,
    arguments: Option<Value>,
    /// File descriptor travelling with the command via SCM_RIGHTS.
    fd: Option<RawFd>,
    resp_tx: oneshot::Sender<Result<Value>>,
}

/// Typed client over the VMM control socket. An actor task owns the socket;
/// commands are serialized with a single outstanding request, events are
/// pushed to a separate subscriber channel.
#[derive(Clone, Debug)]
pub struct QmpClient {
    req_tx: mpsc::Sender<Request>,
}

impl QmpClient {
    /// Dial the monitor socket, run the capabilities handshake, spawn the
    /// actor. Asynchronous events go to `event_tx`.
    pub async fn connect(
        path: &Path,
        timeout: Duration,
        event_tx: mpsc::Sender<QmpEvent>,
    ) -> Result<Self> {
        let setup = async {
            let stream = UnixStream::connect(path).await.map_err(|e| {
                HypervisorError::Transport(format!("connect monitor {:?}: {}", path, e))
            })?;
            let raw_fd = stream.as_raw_fd();
            let (read_half, write_half) = stream.into_split();
            let mut lines = BufReader::new(read_half).lines();

            // greeting carries the "QMP" key
            let greeting = next_message(&mut lines).await?;
            if greeting.get("QMP").is_none() {
                return Err(HypervisorError::Transport(format!(
                    "unexpected monitor greeting: {}",
                    greeting
                ))
                .into());
            }

            // the reader task owns the socket's read side: events go to the
            // subscriber, everything else is the reply to the single
            // outstanding command
            let (reply_tx, reply_rx) = mpsc::channel::<Value>(1);
            tokio::spawn(read_loop(lines, reply_tx, event_tx));

            let mut actor = QmpActor {
                write_half,
                raw_fd,
                reply_rx,
            };
            actor
                .roundtrip(&json!({ "execute": "qmp_capabilities" }), None)
                .await?;
            Ok::<QmpActor, anyhow::Error>(actor)
        };

        let actor = tokio::time::timeout(timeout, setup)
            .await
            .map_err(|_| HypervisorError::Timeout("monitor handshake".to_string()))??;

        let (req_tx, req_rx) = mpsc::channel(1);
        tokio::spawn(actor.run(req_rx));
        Ok(QmpClient { req_tx })
    }

    pub async fn execute(&self, cmd: &str, arguments: Option<Value>) -> Result<Value> {
        self.do_execute(cmd, arguments, None).await
    }

    async fn execute_with_fd(&self, cmd: &str, arguments: Option<Value>, fd: RawFd) -> Result<Value> {
        self.do_execute(cmd, arguments, Some(fd)).await
    }

    async fn do_execute(
        &self,
        cmd: &str,
        arguments: Option<Value>,
        fd: Option<RawFd>,
    ) -> Result<Value> {
        let (resp_tx, resp_rx) = oneshot::channel();
        self.req_tx
            .send(Request {
                execute: cmd.to_string(),
                arguments,
                fd,
                resp_tx,
            })
            .await
            .map_err(|_| HypervisorError::Transport("monitor channel closed".to_string()))?;

        match tokio::time::timeout(QMP_EXECUTE_TIMEOUT, resp_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => {
                Err(HypervisorError::Transport("monitor channel closed".to_string()).into())
            }
            Err(_) => Err(HypervisorError::Timeout(format!("monitor command {}", cmd)).into()),
        }
    }

    // vm run state

    pub async fn query_status(&self) -> Result<StatusInfo> {
        let v = self.execute("query-status", None).await?;
        serde_json::from_value(v)
            .map_err(|e| HypervisorError::Transport(format!("query-status reply: {}", e)).into())
    }

    pub async fn stop_vm(&self) -> Result<()> {
        self.execute("stop", None).await.map(|_| ())
    }

    pub async fn cont_vm(&self) -> Result<()> {
        self.execute("cont", None).await.map(|_| ())
    }

    // devices

    pub async fn device_add(&self, args: Value) -> Result<()> {
        self.execute("device_add", Some(args)).await.map(|_| ())
    }

    pub async fn device_del(&self, id: &str) -> Result<()> {
        self.execute("device_del", Some(json!({ "id": id })))
            .await
            .map(|_| ())
    }

    pub async fn blockdev_add(&self, node_name: &str, filename: &str, read_only: bool) -> Result<()> {
        self.execute(
            "blockdev-add",
            Some(json!({
                "node-name": node_name,
                "driver": "raw",
                "read-only": read_only,
                "file": {
                    "driver": "file",
                    "filename": filename,
                },
            })),
        )
        .await
        .map(|_| ())
    }

    pub async fn blockdev_del(&self, node_name: &str) -> Result<()> {
        self.execute("blockdev-del", Some(json!({ "node-name": node_name })))
            .await
            .map(|_| ())
    }

    pub async fn chardev_add_socket(&self, id: &str, socket_path: &str) -> Result<()> {
        self.execute(
            "chardev-add",
            Some(json!({
                "id": id,
                "backend": {
                    "type": "socket",
                    "data": {
                        "addr": {
                            "type": "unix",
                            "data": { "path": socket_path },
                        },
                        "server": false,
                    },
                },
            })),
        )
        .await
        .map(|_| ())
    }

    pub async fn chardev_remove(&self, id: &str) -> Result<()> {
        self.execute("chardev-remove", Some(json!({ "id": id })))
            .await
            .map(|_| ())
    }

    /// Hand a host fd to the VMM under `name` for a later netdev_add.
    pub async fn getfd(&self, name: &str, fd: RawFd) -> Result<()> {
        self.execute_with_fd("getfd", Some(json!({ "fdname": name })), fd)
            .await
            .map(|_| ())
    }

    pub async fn netdev_add_fds(
        &self,
        id: &str,
        fd_names: &[String],
        vhost_fd_names: &[String],
    ) -> Result<()> {
        let mut args = json!({
            "type": "tap",
            "id": id,
            "fds": fd_names.join(":"),
        });
        if !vhost_fd_names.is_empty() {
            args["vhost"] = json!("on");
            args["vhostfds"] = json!(vhost_fd_names.join(":"));
        }
        self.execute("netdev_add", Some(args)).await.map(|_| ())
    }

    pub async fn netdev_del(&self, id: &str) -> Result<()> {
        self.execute("netdev_del", Some(json!({ "id": id })))
            .await
            .map(|_| ())
    }

    pub async fn object_add(&self, qom_type: &str, id: &str, props: Value) -> Result<()> {
        let mut args = json!({
            "qom-type": qom_type,
            "id": id,
        });
        if let (Some(args_map), Some(props_map)) = (args.as_object_mut(), props.as_object()) {
            for (k, v) in props_map {
                args_map.insert(k.clone(), v.clone());
            }
        }
        self.execute("object-add", Some(args)).await.map(|_| ())
    }

    pub async fn object_del(&self, id: &str) -> Result<()> {
        self.execute("object-del", Some(json!({ "id": id })))
            .await
            .map(|_| ())
    }

    // queries

    pub async fn query_hotpluggable_cpus(&self) -> Result<Vec<HotpluggableCpu>> {
        let v = self.execute("query-hotpluggable-cpus", None).await?;
        serde_json::from_value(v).map_err(|e| {
            HypervisorError::Transport(format!("query-hotpluggable-cpus reply: {}", e)).into()
        })
    }

    pub async fn query_cpus_fast(&self) -> Result<Vec<CpuInfoFast>> {
        let v = self.execute("query-cpus-fast", None).await?;
        serde_json::from_value(v)
            .map_err(|e| HypervisorError::Transport(format!("query-cpus-fast reply: {}", e)).into())
    }

    pub async fn query_memory_devices(&self) -> Result<Vec<MemoryDeviceInfo>> {
        let v = self.execute("query-memory-devices", None).await?;
        let raw: Vec<RawMemoryDevice> = serde_json::from_value(v).map_err(|e| {
            HypervisorError::Transport(format!("query-memory-devices reply: {}", e))
        })?;
        Ok(raw.into_iter().map(|d| d.data).collect())
    }

    pub async fn qom_get(&self, path: &str, property: &str) -> Result<Value> {
        self.execute(
            "qom-get",
            Some(json!({ "path": path, "property": property })),
        )
        .await
    }

    pub async fn qom_set(&self, path: &str, property: &str, value: Value) -> Result<()> {
        self.execute(
            "qom-set",
            Some(json!({ "path": path, "property": property, "value": value })),
        )
        .await
        .map(|_| ())
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct StatusInfo {
    pub status: String,
    pub running: bool,
}

#[derive(Clone, Debug, Default, Deserialize, serde::Serialize)]
pub struct CpuProperties {
    #[serde(rename = "socket-id", skip_serializing_if = "Option::is_none")]
    pub socket_id: Option<i64>,
    #[serde(rename = "die-id", skip_serializing_if = "Option::is_none")]
    pub die_id: Option<i64>,
    #[serde(rename = "core-id", skip_serializing_if = "Option::is_none")]
    pub core_id: Option<i64>,
    #[serde(rename = "thread-id", skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<i64>,
    #[serde(rename = "node-id", skip_serializing_if = "Option::is_none")]
    pub node_id: Option<i64>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct HotpluggableCpu {
    #[serde(rename = "type")]
    pub driver: String,
    #[serde(rename = "vcpus-count")]
    pub vcpus_count: u32,
    /// Set when a device already occupies the slot.
    #[serde(rename = "qom-path")]
    pub qom_path: Option<String>,
    pub props: CpuProperties,
}

#[derive(Clone, Debug, Deserialize)]
pub struct CpuInfoFast {
    #[serde(rename = "cpu-index")]
    pub cpu_index: u32,
    #[serde(rename = "thread-id")]
    pub thread_id: u32,
    #[serde(rename = "qom-path")]
    pub qom_path: String,
}

#[derive(Debug, Deserialize)]
struct RawMemoryDevice {
    #[serde(rename = "type")]
    #[allow(dead_code)]
    kind: String,
    data: MemoryDeviceInfo,
}

#[derive(Clone, Debug, Deserialize)]
pub struct MemoryDeviceInfo {
    pub id: Option<String>,
    pub addr: u64,
    pub slot: Option<i64>,
    pub size: u64,
}

struct QmpActor {
    write_half: tokio::net::unix::OwnedWriteHalf,
    raw_fd: RawFd,
    reply_rx: mpsc::Receiver<Value>,
}

impl QmpActor {
    async fn run(mut self, mut req_rx: mpsc::Receiver<Request>) {
        while let Some(req) = req_rx.recv().await {
            let mut frame = json!({ "execute": req.execute });
            if let Some(args) = req.arguments {
                frame["arguments"] = args;
            }
            let result = self.roundtrip(&frame, req.fd).await;
            let fatal = result.is_err();
            let _ = req.resp_tx.send(result);
            if fatal {
                break;
            }
        }
        debug!(sl!(), "monitor actor finished");
    }

    /// Write one command and wait for its reply frame.
    async fn roundtrip(&mut self, frame: &Value, fd: Option<RawFd>) -> Result<Value> {
        let mut bytes = serde_json::to_vec(frame)
            .map_err(|e| HypervisorError::Transport(format!("encode command: {}", e)))?;
        bytes.push(b'\n');

        match fd {
            Some(fd) => send_with_fd(self.raw_fd, &bytes, fd).await?,
            None => self
                .write_half
                .write_all(&bytes)
                .await
                .map_err(|e| HypervisorError::Transport(format!("write command: {}", e)))?,
        }

        let reply = self
            .reply_rx
            .recv()
            .await
            .ok_or_else(|| HypervisorError::Transport("monitor closed".to_string()))?;
        if let Some(ret) = reply.get("return") {
            return Ok(ret.clone());
        }
        if let Some(err) = reply.get("error") {
            let desc = err
                .get("desc")
                .and_then(|d| d.as_str())
                .unwrap_or("unknown monitor error");
            return Err(HypervisorError::Transport(desc.to_string()).into());
        }
        Err(HypervisorError::Transport(format!("unexpected monitor reply: {}", reply)).into())
    }
}

/// Route incoming frames: events to the subscriber, reply frames to the
/// single outstanding command.
async fn read_loop(
    mut lines: tokio::io::Lines<BufReader<tokio::net::unix::OwnedReadHalf>>,
    reply_tx: mpsc::Sender<Value>,
    event_tx: mpsc::Sender<QmpEvent>,
) {
    loop {
        let msg = match next_message(&mut lines).await {
            Ok(msg) => msg,
            Err(_) => {
                debug!(sl!(), "monitor reader finished");
                return;
            }
        };
        if let Some(name) = msg.get("event") {
            let event = QmpEvent {
                name: name.as_str().unwrap_or_default().to_string(),
                data: msg.get("data").cloned().unwrap_or(Value::Null),
            };
            // a gone subscriber only loses events
            let _ = event_tx.send(event).await;
            continue;
        }
        if reply_tx.send(msg).await.is_err() {
            return;
        }
    }
}

async fn next_message(
    lines: &mut tokio::io::Lines<BufReader<tokio::net::unix::OwnedReadHalf>>,
) -> Result<Value> {
    loop {
        let line = lines
            .next_line()
            .await
            .map_err(|e| HypervisorError::Transport(format!("read monitor: {}", e)))?
            .ok_or_else(|| HypervisorError::Transport("monitor closed".to_string()))?;
        if line.trim().is_empty() {
            continue;
        }
        return serde_json::from_str(&line)
            .map_err(|e| anyhow!(HypervisorError::Transport(format!("bad monitor json: {}", e))));
    }
}

/// Write `bytes` with `fd` attached as SCM_RIGHTS ancillary data. The
/// socket is non-blocking; short waits cover a momentarily full buffer.
async fn send_with_fd(socket_fd: RawFd, bytes: &[u8], fd: RawFd) -> Result<()> {
    use nix::sys::socket::{sendmsg, ControlMessage, MsgFlags};
    use std::io::IoSlice;

    let fds = [fd];
    for _ in 0..100 {
        let iov = [IoSlice::new(bytes)];
        let cmsg = [ControlMessage::ScmRights(&fds)];
        match sendmsg::<()>(socket_fd, &iov, &cmsg, MsgFlags::empty(), None) {
            Ok(_) => return Ok(()),
            Err(nix::errno::Errno::EAGAIN) => {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            Err(e) => {
                return Err(HypervisorError::Transport(format!("sendmsg with fd: {}", e)).into())
            }
        }
    }
    Err(HypervisorError::Timeout("monitor write with fd".to_string()).into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::UnixListener;

    async fn serve_one_session(listener: UnixListener) {
        let (mut stream, _) = listener.accept().await.unwrap();
        stream
            .write_all(b"{\"QMP\": {\"version\": {}, \"capabilities\": []}}\n")
            .await
            .unwrap();

        let mut buf = vec![0u8; 4096];
        loop {
            let n = match stream.read(&mut buf).await {
                Ok(0) | Err(_) => return,
                Ok(n) => n,
            };
            let text = String::from_utf8_lossy(&buf[..n]);
            for line in text.lines() {
                let cmd: Value = serde_json::from_str(line).unwrap();
                let reply = match cmd["execute"].as_str().unwrap() {
                    "qmp_capabilities" => json!({ "return": {} }),
                    "query-status" => {
                        json!({ "return": { "status": "running", "running": true } })
                    }
                    "device_add" => json!({ "return": {} }),
                    "device_del" => {
                        json!({ "error": { "class": "DeviceNotFound", "desc": "no such device" } })
                    }
                    other => json!({ "error": { "class": "CommandNotFound",
                                                 "desc": format!("unknown {}", other) } }),
                };
                stream
                    .write_all(format!("{}\n", reply).as_bytes())
                    .await
                    .unwrap();
            }
        }
    }

    #[tokio::test]
    async fn test_handshake_and_commands() {
        let dir = std::env::temp_dir().join(format!("qmp-ut-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let sock = dir.join("qmp.sock");
        let _ = std::fs::remove_file(&sock);
        let listener = UnixListener::bind(&sock).unwrap();
        tokio::spawn(serve_one_session(listener));

        let (event_tx, _event_rx) = mpsc::channel(8);
        let client = QmpClient::connect(&sock, Duration::from_secs(5), event_tx)
            .await
            .unwrap();

        let status = client.query_status().await.unwrap();
        assert_eq!(status.status, "running");
        assert!(status.running);

        client
            .device_add(json!({ "driver": "virtio-blk-pci", "id": "blk0" }))
            .await
            .unwrap();

        let err = client.device_del("ghost").await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<HypervisorError>(),
            Some(HypervisorError::Transport(_))
        ));

        let _ = std::fs::remove_file(&sock);
    }

    #[tokio::test]
    async fn test_connect_times_out_without_listener() {
        let (event_tx, _event_rx) = mpsc::channel(8);
        let err = QmpClient::connect(
            Path::new("/nonexistent/qmp.sock"),
            Duration::from_millis(200),
            event_tx,
        )
        .await
        .unwrap_err();
        assert!(err.downcast_ref::<HypervisorError>().is_some());
    }
}
