// Copyright (c) 2023-2024 The Virtrun Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use std::path::PathBuf;
use std::sync::Arc;

use agent::{AddSwapRequest, Agent};
use anyhow::{anyhow, Context, Result};
use hypervisor::device::{BlockConfig, BlockDevice, DeviceType};
use hypervisor::Hypervisor;
use tokio::sync::RwLock;

/// Swap drives use indexes far above container disks so guest names never
/// collide.
const SWAP_INDEX_BASE: u64 = 0xF000;

/// Guest swap backing files and their hot-plugged drives, one sandbox each.
#[derive(Clone)]
pub struct SwapResource {
    swap_dir: PathBuf,
    devices: Arc<RwLock<Vec<BlockDevice>>>,
    provisioned_mb: Arc<RwLock<u32>>,
}

impl SwapResource {
    pub fn new(sid: &str) -> Self {
        Self {
            swap_dir: persist::run_storage_path(sid).join("swap"),
            devices: Arc::new(RwLock::new(Vec::new())),
            provisioned_mb: Arc::new(RwLock::new(0)),
        }
    }

    pub async fn provisioned_mb(&self) -> u32 {
        *self.provisioned_mb.read().await
    }

    pub async fn devices(&self) -> Vec<BlockDevice> {
        self.devices.read().await.clone()
    }

    pub(crate) async fn set_devices(&self, devices: Vec<BlockDevice>) {
        let mut provisioned = 0;
        for d in &devices {
            if let Ok(meta) = std::fs::metadata(&d.config.path_on_host) {
                provisioned += (meta.len() >> 20) as u32;
            }
        }
        *self.provisioned_mb.write().await = provisioned;
        *self.devices.write().await = devices;
    }

    /// Grow guest swap to `want_mb` by building one more swap file and
    /// hot-plugging it as a swap-tagged drive the agent then enables.
    pub async fn provision(
        &self,
        want_mb: u32,
        hypervisor: &dyn Hypervisor,
        agent: &dyn Agent,
    ) -> Result<()> {
        let provisioned = self.provisioned_mb().await;
        if want_mb <= provisioned {
            return Ok(());
        }
        let delta_mb = want_mb - provisioned;

        tokio::fs::create_dir_all(&self.swap_dir)
            .await
            .context("create swap dir")?;

        let seq = self.devices.read().await.len() as u64;
        let path = self.swap_dir.join(format!("swap{}", seq));
        create_swap_file(&path, (delta_mb as u64) << 20)
            .await
            .with_context(|| format!("create swap file {}", path.display()))?;

        let device = BlockDevice::new(
            &format!("swap-{}", seq),
            BlockConfig {
                path_on_host: path.to_string_lossy().to_string(),
                format: "raw".to_string(),
                index: SWAP_INDEX_BASE + seq,
                is_swap: true,
                ..Default::default()
            },
        );

        let plugged = hypervisor
            .hotplug_add_device(DeviceType::Block(device))
            .await
            .context("hotplug swap drive")?;
        let plugged = match plugged {
            DeviceType::Block(b) => b,
            other => return Err(anyhow!("unexpected hotplug result {}", other)),
        };

        let pci_path = plugged
            .config
            .pci_path
            .as_ref()
            .map(|p| p.to_agent_slots())
            .unwrap_or_default();
        agent
            .add_swap(AddSwapRequest { pci_path })
            .await
            .context("agent add swap")?;

        info!(sl!(), "guest swap grown";
            "file" => path.display().to_string(), "mb" => delta_mb);
        self.devices.write().await.push(plugged);
        *self.provisioned_mb.write().await = want_mb;
        Ok(())
    }

    /// Remove the backing files; called on sandbox stop.
    pub async fn clean(&self) {
        for device in self.devices.read().await.iter() {
            if let Err(e) = tokio::fs::remove_file(&device.config.path_on_host).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(sl!(), "remove swap file";
                        "file" => device.config.path_on_host.as_str(),
                        "error" => format!("{}", e));
                }
            }
        }
        let _ = tokio::fs::remove_dir(&self.swap_dir).await;
    }
}

/// A sparse file of at least ten pages plus one, formatted by mkswap.
async fn create_swap_file(path: &PathBuf, size_bytes: u64) -> Result<()> {
    let page_size = nix::unistd::sysconf(nix::unistd::SysconfVar::PAGE_SIZE)
        .ok()
        .flatten()
        .unwrap_or(4096) as u64;
    let size = std::cmp::max(size_bytes, 10 * page_size) + page_size;

    let file = tokio::fs::File::create(path).await.context("create file")?;
    file.set_len(size).await.context("truncate file")?;
    drop(file);

    let output = tokio::process::Command::new("mkswap")
        .arg(path)
        .output()
        .await
        .context("run mkswap")?;
    if !output.status.success() {
        let _ = tokio::fs::remove_file(path).await;
        return Err(anyhow!(
            "mkswap failed: {}",
            String::from_utf8_lossy(&output.stderr)
        ));
    }
    Ok(())
}
