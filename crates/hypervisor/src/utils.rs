// Copyright (c) 2023-2024 The Virtrun Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use std::collections::HashSet;
use std::os::unix::io::RawFd;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use nix::fcntl::{fcntl, FcntlArg, FdFlag};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

use crate::error::HypervisorError;

/// How long process supervision waits for an exit before escalating.
pub const WAIT_FOR_EXIT_TIMEOUT: Duration = Duration::from_secs(15);
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Threads of a process, from /proc.
pub fn get_child_threads(pid: u32) -> HashSet<u32> {
    let mut result = HashSet::new();
    let path_name = format!("/proc/{}/task", pid);
    let path = std::path::Path::new(path_name.as_str());
    if path.is_dir() {
        if let Ok(dir) = path.read_dir() {
            for entity in dir {
                if let Ok(entity) = entity.as_ref() {
                    let file_name = entity.file_name();
                    let file_name = file_name.to_str().unwrap_or_default();
                    if let Ok(tid) = file_name.parse::<u32>() {
                        result.insert(tid);
                    }
                }
            }
        }
    }
    result
}

/// Null-signal liveness probe.
pub fn pid_alive(pid: i32) -> bool {
    kill(Pid::from_raw(pid), None).is_ok()
}

/// Keep `fd` open across exec for a spawned child.
pub fn clear_cloexec(fd: RawFd) -> Result<()> {
    let flags = fcntl(fd, FcntlArg::F_GETFD).context("F_GETFD")?;
    let mut flags = FdFlag::from_bits_truncate(flags);
    flags.remove(FdFlag::FD_CLOEXEC);
    fcntl(fd, FcntlArg::F_SETFD(flags)).context("F_SETFD")?;
    Ok(())
}

/// Poll until `pid` exits or the supervision timeout elapses.
pub async fn wait_for_exit(pid: i32) -> Result<()> {
    let deadline = tokio::time::Instant::now() + WAIT_FOR_EXIT_TIMEOUT;
    while tokio::time::Instant::now() < deadline {
        if !pid_alive(pid) {
            return Ok(());
        }
        tokio::time::sleep(EXIT_POLL_INTERVAL).await;
    }
    Err(HypervisorError::Timeout(format!("waiting for pid {} to exit", pid)).into())
}

/// Send `signal`, poll for exit, escalate to SIGKILL on timeout. Exiting
/// between probe and signal is treated as success.
pub async fn wait_with_signal(pid: i32, signal: Signal) -> Result<()> {
    if !pid_alive(pid) {
        return Ok(());
    }
    if let Err(e) = kill(Pid::from_raw(pid), signal) {
        if e != nix::errno::Errno::ESRCH {
            return Err(anyhow!("send {} to {}: {}", signal, pid, e));
        }
        return Ok(());
    }

    if wait_for_exit(pid).await.is_ok() {
        return Ok(());
    }

    warn!(sl!(), "pid {} ignored {}, escalating to SIGKILL", pid, signal);
    let _ = kill(Pid::from_raw(pid), Signal::SIGKILL);
    wait_for_exit(pid).await
}

const VHOST_VSOCK_DEV: &str = "/dev/vhost-vsock";
// _IOW(VHOST_VIRTIO, 0x60, __u64)
const VHOST_VSOCK_SET_GUEST_CID: libc::c_ulong = 0x4008_af60;
const VSOCK_FIRST_USABLE_CID: u32 = 3;

/// Claim a free vsock context id: open the vhost device and try random cids
/// until one sticks. Returns the cid and the fd holding the claim.
pub fn generate_vhost_vsock_cid() -> Result<(u32, RawFd)> {
    use nix::fcntl::{open, OFlag};
    use nix::sys::stat::Mode;
    use rand::Rng;

    let fd = open(
        VHOST_VSOCK_DEV,
        OFlag::O_RDWR | OFlag::O_CLOEXEC,
        Mode::empty(),
    )
    .map_err(|e| HypervisorError::Io(format!("open {}: {}", VHOST_VSOCK_DEV, e)))?;

    let mut rng = rand::thread_rng();
    for _ in 0..50 {
        let cid: u32 = rng.gen_range(VSOCK_FIRST_USABLE_CID..u32::MAX);
        let cid64 = cid as u64;
        let ret = unsafe { libc::ioctl(fd, VHOST_VSOCK_SET_GUEST_CID, &cid64) };
        if ret == 0 {
            return Ok((cid, fd));
        }
        let errno = nix::errno::Errno::last();
        if errno != nix::errno::Errno::EADDRINUSE {
            let _ = nix::unistd::close(fd);
            return Err(HypervisorError::Io(format!("set guest cid: {}", errno)).into());
        }
    }
    let _ = nix::unistd::close(fd);
    Err(HypervisorError::ResourceExhausted("no free vsock context id".to_string()).into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_child_threads_of_self() {
        let threads = get_child_threads(std::process::id());
        assert!(!threads.is_empty());
    }

    #[test]
    fn test_pid_alive() {
        assert!(pid_alive(std::process::id() as i32));
        // pid 0 addresses the caller's process group; use an unlikely pid
        assert!(!pid_alive(i32::MAX - 1));
    }

    #[tokio::test]
    async fn test_wait_with_signal_on_gone_pid() {
        assert!(wait_with_signal(i32::MAX - 1, Signal::SIGTERM).await.is_ok());
    }
}
