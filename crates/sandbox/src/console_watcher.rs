// Copyright (c) 2023-2024 The Virtrun Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use anyhow::{anyhow, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::UnixStream;
use tokio::sync::{oneshot, Mutex};

use hypervisor::CONSOLE_PROTO_UNIX;

/// Streams guest console output into the host log until stopped.
pub(crate) struct ConsoleWatcher {
    stop_tx: Mutex<Option<oneshot::Sender<()>>>,
}

impl ConsoleWatcher {
    pub fn new() -> Self {
        Self {
            stop_tx: Mutex::new(None),
        }
    }

    pub async fn start(&self, sid: &str, proto: &str, url: &str) -> Result<()> {
        if proto != CONSOLE_PROTO_UNIX {
            return Err(anyhow!("unsupported console protocol {:?}", proto));
        }
        let stream = UnixStream::connect(url).await?;
        let (stop_tx, mut stop_rx) = oneshot::channel();
        *self.stop_tx.lock().await = Some(stop_tx);

        let sid = sid.to_string();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stream).lines();
            loop {
                tokio::select! {
                    _ = &mut stop_rx => return,
                    line = lines.next_line() => match line {
                        Ok(Some(line)) => {
                            info!(sl!(), "console"; "sandbox" => sid.as_str(), "vmconsole" => line);
                        }
                        _ => return,
                    }
                }
            }
        });
        Ok(())
    }

    pub async fn stop(&self) {
        if let Some(tx) = self.stop_tx.lock().await.take() {
            let _ = tx.send(());
        }
    }
}
