// Copyright (c) 2023-2024 The Virtrun Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use std::sync::Arc;
use std::time::Duration;

use hypervisor::Hypervisor;
use tokio::sync::{mpsc, Mutex};

const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(30);
/// Consecutive failures before the sandbox is declared gone.
const HEALTH_CHECK_FAILURES: u32 = 3;

/// Periodic VMM liveness probe. On sustained failure a stop request is
/// enqueued for the sandbox owner; the monitor never tears down anything
/// itself.
pub struct HealthCheck {
    stop_tx: Mutex<Option<mpsc::Sender<()>>>,
}

impl Default for HealthCheck {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthCheck {
    pub fn new() -> Self {
        Self {
            stop_tx: Mutex::new(None),
        }
    }

    pub async fn start(
        &self,
        id: &str,
        hypervisor: Arc<dyn Hypervisor>,
        abnormal_tx: mpsc::Sender<()>,
    ) {
        let id = id.to_string();
        let (stop_tx, mut stop_rx) = mpsc::channel(1);
        *self.stop_tx.lock().await = Some(stop_tx);

        tokio::spawn(async move {
            let mut failures = 0u32;
            loop {
                tokio::select! {
                    _ = stop_rx.recv() => {
                        debug!(sl!(), "health check stopped"; "sandbox" => id.as_str());
                        return;
                    }
                    _ = tokio::time::sleep(HEALTH_CHECK_INTERVAL) => {}
                }

                match hypervisor.check().await {
                    Ok(()) => failures = 0,
                    Err(e) => {
                        failures += 1;
                        warn!(sl!(), "sandbox health check failed";
                            "sandbox" => id.as_str(), "failures" => failures,
                            "error" => format!("{:#}", e));
                        if failures >= HEALTH_CHECK_FAILURES {
                            let _ = abnormal_tx.send(()).await;
                            return;
                        }
                    }
                }
            }
        });
    }

    pub async fn stop(&self) {
        if let Some(tx) = self.stop_tx.lock().await.take() {
            let _ = tx.send(()).await;
        }
    }
}
