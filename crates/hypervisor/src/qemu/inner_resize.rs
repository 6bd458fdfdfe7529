// Copyright (c) 2023-2024 The Virtrun Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use anyhow::{Context, Result};
use serde_json::json;

use crate::device::MemoryConfig;
use crate::error::HypervisorError;
use crate::pci::MachineType;
use crate::qemu::inner::QemuInner;
use crate::VmmState;

/// Monitor id of the virtio-mem module when it backs memory resize.
const VIRTIO_MEM_DEV_ID: &str = "virtiomem0";

impl QemuInner {
    /// Boot vCPUs plus whatever has been hot-plugged since.
    fn current_vcpus(&self) -> u32 {
        self.config.boot_vcpus() + self.hotplugged_vcpus.len() as u32
    }

    fn current_memory_mb(&self) -> u32 {
        self.config.memory_info.default_memory + self.hotplugged_mem_mb
    }

    pub async fn resize_vcpu(&mut self, _old_vcpus: u32, new_vcpus: u32) -> Result<(u32, u32)> {
        if self.state != VmmState::Running {
            return Err(HypervisorError::NotRunning.into());
        }

        let current = self.current_vcpus();
        let max = self.config.cpu_info.default_maxvcpus.max(1);
        let boot = self.config.boot_vcpus();

        let mut target = new_vcpus;
        if target > max {
            warn!(sl!(), "vcpu request clamped to the configured maximum";
                "requested" => new_vcpus, "max" => max);
            target = max;
        }
        if target < boot {
            warn!(sl!(), "vcpu request clamped to the boot count";
                "requested" => new_vcpus, "boot" => boot);
            target = boot;
        }

        if target == current {
            return Ok((current, current));
        }

        if target > current {
            let added = self.hotplug_vcpus(target - current).await?;
            let now = current + added;
            if now < target {
                // partial growth is reported together with the exhaustion
                warn!(sl!(), "fewer vcpus hotplugged than requested";
                    "requested" => target - current, "added" => added);
                return Err(HypervisorError::ResourceExhausted(format!(
                    "only {} of {} vcpus could be added",
                    added,
                    target - current
                ))
                .into());
            }
            Ok((current, now))
        } else {
            let removed = self.unplug_vcpus(current - target).await?;
            Ok((current, current - removed))
        }
    }

    /// Fill inactive hot-pluggable slots one by one; a failing slot is
    /// skipped, growth continues on the next.
    async fn hotplug_vcpus(&mut self, count: u32) -> Result<u32> {
        let machine = self.machine_type();
        let slots = self
            .qmp()?
            .query_hotpluggable_cpus()
            .await
            .context("query hotpluggable cpus")?;

        let mut added = 0u32;
        for slot in slots.iter().filter(|s| s.qom_path.is_none()) {
            if added >= count {
                break;
            }
            let cpu_id = format!("cpu-{}", self.next_cpu_id);
            let mut args = json!({
                "driver": slot.driver,
                "id": cpu_id,
            });

            let props = &slot.props;
            if let Some(core) = props.core_id {
                args["core-id"] = json!(core);
            }
            // socket/die/thread topology only exists on pc-style machines
            if machine == MachineType::Q35 {
                if let Some(socket) = props.socket_id {
                    args["socket-id"] = json!(socket);
                }
                if let Some(die) = props.die_id {
                    args["die-id"] = json!(die);
                }
                if let Some(thread) = props.thread_id {
                    args["thread-id"] = json!(thread);
                }
            }
            if let Some(node) = props.node_id {
                args["node-id"] = json!(node);
            }

            let plugged = self.qmp()?.device_add(args).await;
            match plugged {
                Ok(()) => {
                    self.next_cpu_id += 1;
                    self.hotplugged_vcpus.push(cpu_id);
                    added += slot.vcpus_count.max(1);
                }
                Err(e) => {
                    warn!(sl!(), "hotplug of one vcpu slot failed, continuing";
                        "error" => format!("{:#}", e));
                }
            }
        }
        Ok(added)
    }

    /// Unplug most-recently-added first.
    async fn unplug_vcpus(&mut self, count: u32) -> Result<u32> {
        let mut removed = 0u32;
        while removed < count {
            let cpu_id = match self.hotplugged_vcpus.last() {
                Some(id) => id.clone(),
                None => break,
            };
            self.qmp()?
                .device_del(&cpu_id)
                .await
                .with_context(|| format!("device del {}", cpu_id))?;
            self.hotplugged_vcpus.pop();
            removed += 1;
        }
        Ok(removed)
    }

    pub async fn resize_memory(
        &mut self,
        req_mem_mb: u32,
        block_size_mb: u32,
        probe: bool,
    ) -> Result<(u32, Option<MemoryConfig>)> {
        if self.state != VmmState::Running {
            return Err(HypervisorError::NotRunning.into());
        }

        let current = self.current_memory_mb();
        let max = self.config.memory_info.default_max_memory;

        let mut target = req_mem_mb;
        if max > 0 && target > max {
            warn!(sl!(), "memory request clamped to the configured maximum";
                "requested" => req_mem_mb, "max" => max);
            target = max;
        }

        if target == current {
            return Ok((current, None));
        }

        if self.config.memory_info.enable_virtio_mem {
            // one module absorbs the whole delta
            let requested_bytes =
                (target.saturating_sub(self.config.memory_info.default_memory) as u64) << 20;
            self.qmp()?
                .qom_set(
                    &format!("/machine/peripheral/{}", VIRTIO_MEM_DEV_ID),
                    "requested-size",
                    json!(requested_bytes),
                )
                .await
                .context("set virtio-mem requested-size")?;
            self.hotplugged_mem_mb = target - self.config.memory_info.default_memory;
            return Ok((target, None));
        }

        if target < current {
            warn!(sl!(), "memory hot-remove is unsupported";
                "requested" => req_mem_mb, "current" => current);
            return Ok((current, None));
        }

        let mut delta = target - current;
        if block_size_mb > 0 {
            // ACPI plugs whole blocks only
            delta = (delta + block_size_mb - 1) / block_size_mb * block_size_mb;
        }

        let added = self.hotplug_memory_mb(delta, probe).await?;
        Ok((current + delta, Some(added)))
    }

    /// Add one memory module of `size_mb` at the next free slot.
    pub(crate) async fn hotplug_memory_mb(
        &mut self,
        size_mb: u32,
        probe: bool,
    ) -> Result<MemoryConfig> {
        let existing = self
            .qmp()?
            .query_memory_devices()
            .await
            .context("query memory devices")?;
        let slot = existing
            .iter()
            .filter_map(|d| d.slot)
            .max()
            .map(|s| (s + 1) as u32)
            .unwrap_or(0)
            .max(self.next_mem_slot);

        let memdev = format!("mem{}", slot);
        let dimm = format!("dimm{}", slot);
        let mut props = json!({ "size": (size_mb as u64) << 20 });
        if self.config.memory_info.enable_mem_prealloc {
            props["prealloc"] = json!(true);
        }
        if self.config.memory_info.shared_mem {
            props["share"] = json!(true);
        }
        self.qmp()?
            .object_add("memory-backend-ram", &memdev, props)
            .await
            .context("memory backend add")?;

        let added = self
            .qmp()?
            .device_add(json!({
                "driver": "pc-dimm",
                "id": dimm,
                "memdev": memdev,
                "slot": slot,
            }))
            .await;
        if let Err(e) = added {
            let _ = self.qmp()?.object_del(&memdev).await;
            return Err(e).context("pc-dimm device add");
        }

        let mut config = MemoryConfig {
            slot,
            size_mb,
            addr: 0,
            probe,
        };
        if probe {
            // the agent onlines probed modules by physical address
            let devices = self
                .qmp()?
                .query_memory_devices()
                .await
                .context("query memory devices after add")?;
            config.addr = devices
                .iter()
                .find(|d| d.id.as_deref() == Some(dimm.as_str()))
                .map(|d| d.addr)
                .unwrap_or(0);
        }

        self.next_mem_slot = slot + 1;
        self.hotplugged_mem_mb += size_mb;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::qemu::inner::QemuInner;
    use crate::qemu::qmp::QmpClient;
    use crate::HypervisorConfig;
    use serde_json::{json, Value};
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::UnixListener;
    use tokio::sync::mpsc;

    /// Monitor endpoint with three empty hot-pluggable cpu slots.
    async fn serve_cpu_slots(listener: UnixListener) {
        let (mut stream, _) = listener.accept().await.unwrap();
        stream
            .write_all(b"{\"QMP\": {\"version\": {}, \"capabilities\": []}}\n")
            .await
            .unwrap();

        let mut buf = vec![0u8; 8192];
        loop {
            let n = match stream.read(&mut buf).await {
                Ok(0) | Err(_) => return,
                Ok(n) => n,
            };
            for line in String::from_utf8_lossy(&buf[..n]).lines() {
                let cmd: Value = serde_json::from_str(line).unwrap();
                let reply = match cmd["execute"].as_str().unwrap() {
                    "qmp_capabilities" => json!({ "return": {} }),
                    "query-hotpluggable-cpus" => json!({ "return": [
                        { "type": "host-x86_64-cpu", "vcpus-count": 1,
                          "qom-path": "/machine/unattached/device[0]",
                          "props": { "socket-id": 0, "core-id": 0, "thread-id": 0 } },
                        { "type": "host-x86_64-cpu", "vcpus-count": 1,
                          "props": { "socket-id": 0, "core-id": 1, "thread-id": 0 } },
                        { "type": "host-x86_64-cpu", "vcpus-count": 1,
                          "props": { "socket-id": 0, "core-id": 2, "thread-id": 0 } },
                        { "type": "host-x86_64-cpu", "vcpus-count": 1,
                          "props": { "socket-id": 0, "core-id": 3, "thread-id": 0 } },
                    ] }),
                    "device_add" | "device_del" => json!({ "return": {} }),
                    other => panic!("unexpected command {}", other),
                };
                stream
                    .write_all(format!("{}\n", reply).as_bytes())
                    .await
                    .unwrap();
            }
        }
    }

    async fn running_inner(sock_name: &str) -> QemuInner {
        let dir = std::env::temp_dir().join(format!("qemu-resize-ut-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let sock = dir.join(sock_name);
        let _ = std::fs::remove_file(&sock);
        let listener = UnixListener::bind(&sock).unwrap();
        tokio::spawn(serve_cpu_slots(listener));

        let (event_tx, _event_rx) = mpsc::channel(8);
        let qmp = QmpClient::connect(&sock, Duration::from_secs(5), event_tx)
            .await
            .unwrap();

        let mut config = HypervisorConfig::default();
        config.cpu_info.default_vcpus = 1.0;
        config.cpu_info.default_maxvcpus = 4;
        config.memory_info.default_memory = 256;
        config.memory_info.default_max_memory = 16384;
        let mut inner = QemuInner::new(config);
        inner.state = VmmState::Running;
        inner.qmp = Some(qmp);
        inner
    }

    #[tokio::test]
    async fn test_resize_vcpu_clamps_to_max_with_growth() {
        let mut inner = running_inner("cpu-grow.sock").await;
        // far beyond the configured maximum of 4; clamps, never errors
        let (old, new) = inner.resize_vcpu(1, 64).await.unwrap();
        assert_eq!((old, new), (1, 4));
        assert_eq!(inner.hotplugged_vcpus.len(), 3);

        // shrink unplugs most-recently-added first
        let (old, new) = inner.resize_vcpu(4, 2).await.unwrap();
        assert_eq!((old, new), (4, 2));
        assert_eq!(inner.hotplugged_vcpus.len(), 1);
        assert_eq!(inner.hotplugged_vcpus[0], "cpu-0");
    }

    #[tokio::test]
    async fn test_resize_vcpu_noop_when_equal() {
        let mut inner = running_inner("cpu-equal.sock").await;
        let (old, new) = inner.resize_vcpu(1, 1).await.unwrap();
        assert_eq!((old, new), (1, 1));
        assert!(inner.hotplugged_vcpus.is_empty());
    }

    #[tokio::test]
    async fn test_resize_memory_equal_is_silent() {
        // no monitor wired at all: an equal-size request must not need one
        let mut config = HypervisorConfig::default();
        config.memory_info.default_memory = 256;
        let mut inner = QemuInner::new(config);
        inner.state = VmmState::Running;
        let (current, added) = inner.resize_memory(256, 128, false).await.unwrap();
        assert_eq!(current, 256);
        assert!(added.is_none());
    }

    #[tokio::test]
    async fn test_resize_memory_not_running() {
        let mut inner = QemuInner::new(HypervisorConfig::default());
        let err = inner.resize_memory(512, 128, false).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<HypervisorError>(),
            Some(HypervisorError::NotRunning)
        ));
    }
}
