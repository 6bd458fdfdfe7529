// Copyright (c) 2023-2024 The Virtrun Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use hypervisor::pci::PciPath;
use hypervisor::DeviceType;

/// The device side of endpoint construction: whoever owns the hypervisor
/// decides whether a descriptor cold-plugs or hot-plugs.
#[async_trait]
pub trait DeviceReceiver: Send + Sync {
    async fn receive_device(&self, device: DeviceType) -> Result<DeviceType>;
    async fn return_device(&self, device: DeviceType) -> Result<()>;
}

/// One guest-visible network interface backed by a host construct.
#[async_trait]
pub trait Endpoint: Send + Sync {
    async fn name(&self) -> String;
    async fn hardware_addr(&self) -> String;
    async fn endpoint_type(&self) -> String;
    async fn pci_path(&self) -> Option<PciPath>;
    async fn set_pci_path(&self, path: PciPath);
}

/// The network collaborator. Endpoint construction (veth/tap/macvlan
/// specifics) lives outside this workspace; the sandbox consumes this seam.
#[async_trait]
pub trait Network: Send + Sync {
    /// Build endpoints and hand their devices to the receiver. With
    /// `scan_existing`, pick up interfaces that appeared since the last
    /// scan (the post-boot path of hot-plug capable VMMs).
    async fn add_endpoints(
        &self,
        receiver: &dyn DeviceReceiver,
        scan_existing: bool,
    ) -> Result<Vec<Arc<dyn Endpoint>>>;
    async fn remove_endpoints(
        &self,
        receiver: &dyn DeviceReceiver,
        scan_existing: bool,
    ) -> Result<()>;
    /// Execute a closure inside the network namespace.
    async fn run(&self, f: Box<dyn FnOnce() -> Result<()> + Send>) -> Result<()>;
    async fn endpoints(&self) -> Vec<Arc<dyn Endpoint>>;
    async fn endpoints_num(&self) -> usize;
    fn network_id(&self) -> String;
}

/// A network with no endpoints; the placeholder for sandboxes launched with
/// networking disabled and for tests.
#[derive(Debug, Default)]
pub struct NoopNetwork {
    id: String,
}

impl NoopNetwork {
    pub fn new(id: &str) -> Self {
        Self { id: id.to_string() }
    }
}

#[async_trait]
impl Network for NoopNetwork {
    async fn add_endpoints(
        &self,
        _receiver: &dyn DeviceReceiver,
        _scan_existing: bool,
    ) -> Result<Vec<Arc<dyn Endpoint>>> {
        Ok(vec![])
    }

    async fn remove_endpoints(
        &self,
        _receiver: &dyn DeviceReceiver,
        _scan_existing: bool,
    ) -> Result<()> {
        Ok(())
    }

    async fn run(&self, f: Box<dyn FnOnce() -> Result<()> + Send>) -> Result<()> {
        f()
    }

    async fn endpoints(&self) -> Vec<Arc<dyn Endpoint>> {
        vec![]
    }

    async fn endpoints_num(&self) -> usize {
        0
    }

    fn network_id(&self) -> String {
        self.id.clone()
    }
}
