// Copyright (c) 2023-2024 The Virtrun Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use std::os::unix::io::{AsRawFd, RawFd};
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use nix::sys::signal::{kill, Signal};
use nix::unistd::{Gid, Pid, Uid};
use tokio::sync::mpsc;

use crate::error::HypervisorError;
use crate::share_fs::{validate_cache_mode, ShareFsDaemon, SHARE_FS_DAEMON_FD};

/// Supervisor of the virtiofs daemon serving one sandbox's shared tree.
pub struct Virtiofsd {
    daemon_path: String,
    socket_path: String,
    shared_dir: String,
    cache_mode: String,
    extra_args: Vec<String>,
    debug: bool,
    pid: Option<u32>,
    /// Fires once when the daemon exits; the receiver typically stops the
    /// sandbox.
    on_quit: Option<mpsc::Sender<()>>,
}

impl Virtiofsd {
    pub fn new(
        daemon_path: &str,
        socket_path: &str,
        shared_dir: &str,
        cache_mode: &str,
        extra_args: Vec<String>,
        debug: bool,
    ) -> Self {
        Self {
            daemon_path: daemon_path.to_string(),
            socket_path: socket_path.to_string(),
            shared_dir: shared_dir.to_string(),
            cache_mode: cache_mode.to_string(),
            extra_args,
            debug,
            pid: None,
            on_quit: None,
        }
    }

    pub fn set_on_quit(&mut self, tx: mpsc::Sender<()>) {
        self.on_quit = Some(tx);
    }

    fn validate(&self) -> Result<String> {
        if self.daemon_path.is_empty() {
            return Err(
                HypervisorError::Config("shared-fs daemon path is not set".to_string()).into(),
            );
        }
        if self.socket_path.is_empty() {
            return Err(
                HypervisorError::Config("shared-fs socket path is not set".to_string()).into(),
            );
        }
        if !Path::new(&self.shared_dir).exists() {
            return Err(HypervisorError::Config(format!(
                "shared dir {:?} does not exist",
                self.shared_dir
            ))
            .into());
        }
        validate_cache_mode(&self.cache_mode)
    }

    /// Bind the vhost-user socket the VMM will connect to. The file outlives
    /// the daemon; ownership follows the socket's parent directory so a
    /// non-root VMM can still connect while the daemon runs as root.
    fn create_listener(&self) -> Result<std::os::unix::net::UnixListener> {
        let path = Path::new(&self.socket_path);
        if path.exists() {
            std::fs::remove_file(path).context("remove stale shared-fs socket")?;
        }
        let listener = std::os::unix::net::UnixListener::bind(path)
            .with_context(|| format!("bind shared-fs socket {:?}", self.socket_path))?;

        if let Some(parent) = path.parent() {
            let meta = std::fs::metadata(parent).context("stat socket parent dir")?;
            use std::os::unix::fs::MetadataExt;
            nix::unistd::chown(
                path,
                Some(Uid::from_raw(meta.uid())),
                Some(Gid::from_raw(meta.gid())),
            )
            .context("chown shared-fs socket")?;
        }
        Ok(listener)
    }
}

#[async_trait]
impl ShareFsDaemon for Virtiofsd {
    async fn start(&mut self) -> Result<u32> {
        let cache_mode = self.validate()?;

        let listener = self.create_listener()?;
        let listener_fd: RawFd = listener.as_raw_fd();
        let dup_fd = nix::unistd::dup(listener_fd).context("dup shared-fs listener")?;

        let mut cmd = tokio::process::Command::new(&self.daemon_path);
        cmd.arg("--syslog")
            .arg(format!("--cache={}", cache_mode))
            .arg(format!("--shared-dir={}", self.shared_dir))
            .arg(format!("--fd={}", SHARE_FS_DAEMON_FD))
            .args(&self.extra_args)
            .stdin(std::process::Stdio::null());
        if self.debug {
            cmd.arg("--log-level=debug");
        }

        // place the inherited dup at the fd the daemon expects
        unsafe {
            cmd.pre_exec(move || {
                if libc::dup2(dup_fd, SHARE_FS_DAEMON_FD) < 0 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| HypervisorError::Io(format!("spawn shared-fs daemon: {}", e)))?;

        // the child holds its own copies now
        nix::unistd::close(dup_fd).context("close duped shared-fs listener")?;
        drop(listener);

        let pid = child
            .id()
            .ok_or_else(|| anyhow!("shared-fs daemon exited before its pid was read"))?;
        self.pid = Some(pid);
        info!(sl!(), "shared-fs daemon started";
            "pid" => pid, "socket" => self.socket_path.as_str());

        let on_quit = self.on_quit.clone();
        let socket_path = self.socket_path.clone();
        tokio::spawn(async move {
            let status = child.wait().await;
            warn!(sl!(), "shared-fs daemon exited";
                "pid" => pid, "status" => format!("{:?}", status),
                "socket" => socket_path);
            if let Some(tx) = on_quit {
                let _ = tx.send(()).await;
            }
        });

        Ok(pid)
    }

    async fn stop(&mut self) -> Result<()> {
        let pid = match self.pid.take() {
            Some(pid) if pid != 0 => pid,
            _ => {
                warn!(sl!(), "shared-fs daemon not running, nothing to stop");
                return Ok(());
            }
        };

        if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGKILL) {
            if e != nix::errno::Errno::ESRCH {
                return Err(anyhow!("kill shared-fs daemon {}: {}", pid, e));
            }
        }

        if let Err(e) = std::fs::remove_file(&self.socket_path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(sl!(), "remove shared-fs socket failed";
                    "socket" => self.socket_path.as_str(), "error" => format!("{}", e));
            }
        }
        Ok(())
    }

    fn pid(&self) -> u32 {
        self.pid.unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_start_rejects_missing_configuration() {
        let mut daemon = Virtiofsd::new("", "/tmp/vfs.sock", "/tmp", "auto", vec![], false);
        assert!(daemon.start().await.is_err());

        let mut daemon = Virtiofsd::new("/usr/libexec/virtiofsd", "", "/tmp", "auto", vec![], false);
        assert!(daemon.start().await.is_err());

        let mut daemon = Virtiofsd::new(
            "/usr/libexec/virtiofsd",
            "/tmp/vfs.sock",
            "/definitely/not/there",
            "auto",
            vec![],
            false,
        );
        assert!(daemon.start().await.is_err());
    }

    #[tokio::test]
    async fn test_start_rejects_bad_cache_mode() {
        let mut daemon = Virtiofsd::new(
            "/usr/libexec/virtiofsd",
            "/tmp/vfs.sock",
            "/tmp",
            "write-back",
            vec![],
            false,
        );
        let err = daemon.start().await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<HypervisorError>(),
            Some(HypervisorError::InvalidCacheMode(_))
        ));
    }

    #[tokio::test]
    async fn test_stop_without_start_is_noop() {
        let mut daemon = Virtiofsd::new(
            "/usr/libexec/virtiofsd",
            "/tmp/vfs.sock",
            "/tmp",
            "auto",
            vec![],
            false,
        );
        assert!(daemon.stop().await.is_ok());
        assert_eq!(daemon.pid(), 0);
    }
}
