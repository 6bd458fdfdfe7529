// Copyright (c) 2023-2024 The Virtrun Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use std::os::unix::io::{FromRawFd, RawFd};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use nix::sys::socket::{connect, socket, AddressFamily, SockFlag, SockType, VsockAddr};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use url::Url;

const VSOCK_SCHEME: &str = "vsock";
const HYBRID_VSOCK_SCHEME: &str = "hvsock";

/// Transport address of the in-guest agent.
#[derive(Clone, Debug, PartialEq)]
pub enum Address {
    /// Plain vsock: `vsock://<cid>:<port>`.
    Vsock { cid: u32, port: u32 },
    /// Hybrid vsock: `hvsock://<uds path>:<port>`; the listener is a UNIX
    /// socket on the host multiplexing guest ports.
    HybridVsock { uds: String, port: u32 },
}

impl Address {
    pub fn parse(address: &str) -> Result<Address> {
        let url = Url::parse(address).context("parse agent address")?;
        match url.scheme() {
            VSOCK_SCHEME => {
                let cid = url
                    .host_str()
                    .ok_or_else(|| anyhow!("missing vsock cid in {:?}", address))?
                    .parse::<u32>()
                    .context("parse vsock cid")?;
                let port = url
                    .port()
                    .ok_or_else(|| anyhow!("missing vsock port in {:?}", address))?;
                Ok(Address::Vsock {
                    cid,
                    port: port as u32,
                })
            }
            HYBRID_VSOCK_SCHEME => {
                // path and port are joined with ':' in the path component
                let path = url.path();
                let (uds, port) = path
                    .rsplit_once(':')
                    .ok_or_else(|| anyhow!("missing port in hybrid vsock address {:?}", address))?;
                Ok(Address::HybridVsock {
                    uds: uds.to_string(),
                    port: port.parse::<u32>().context("parse hybrid vsock port")?,
                })
            }
            _ => Err(anyhow!("unsupported agent address scheme {:?}", address)),
        }
    }

    pub fn uri(&self) -> String {
        match self {
            Address::Vsock { cid, port } => format!("{}://{}:{}", VSOCK_SCHEME, cid, port),
            Address::HybridVsock { uds, port } => {
                format!("{}://{}:{}", HYBRID_VSOCK_SCHEME, uds, port)
            }
        }
    }
}

/// Dial the agent transport. The returned stream is always represented as a
/// tokio `UnixStream`: both AF_UNIX and AF_VSOCK yield SOCK_STREAM fds, so a
/// connected vsock fd registers with the reactor the same way.
pub async fn connect_address(address: &Address, timeout: Duration) -> Result<UnixStream> {
    match address {
        Address::Vsock { cid, port } => connect_vsock(*cid, *port, timeout).await,
        Address::HybridVsock { uds, port } => connect_hybrid_vsock(uds, *port, timeout).await,
    }
}

async fn connect_vsock(cid: u32, port: u32, timeout: Duration) -> Result<UnixStream> {
    let join = tokio::task::spawn_blocking(move || -> Result<RawFd> {
        let fd = socket(
            AddressFamily::Vsock,
            SockType::Stream,
            SockFlag::SOCK_CLOEXEC,
            None,
        )
        .context("create vsock socket")?;
        let addr = VsockAddr::new(cid, port);
        connect(fd, &addr).map_err(|e| {
            let _ = nix::unistd::close(fd);
            anyhow!("connect vsock cid {} port {}: {}", cid, port, e)
        })?;
        Ok(fd)
    });
    let fd = tokio::time::timeout(timeout, join)
        .await
        .context("vsock connect timed out")??
        .context("vsock connect")?;

    let std_stream = unsafe { std::os::unix::net::UnixStream::from_raw_fd(fd) };
    std_stream
        .set_nonblocking(true)
        .context("set vsock stream nonblocking")?;
    UnixStream::from_std(std_stream).context("register vsock stream")
}

async fn connect_hybrid_vsock(uds: &str, port: u32, timeout: Duration) -> Result<UnixStream> {
    let fut = async {
        let stream = UnixStream::connect(uds)
            .await
            .with_context(|| format!("connect hybrid vsock {:?}", uds))?;

        // multiplexer handshake: "CONNECT <port>\n" expects "OK <assigned>\n"
        let mut reader = BufReader::new(stream);
        reader
            .get_mut()
            .write_all(format!("CONNECT {}\n", port).as_bytes())
            .await
            .context("hybrid vsock CONNECT")?;
        let mut line = String::new();
        reader
            .read_line(&mut line)
            .await
            .context("hybrid vsock handshake reply")?;
        if !line.starts_with("OK ") {
            return Err(anyhow!("hybrid vsock handshake rejected: {:?}", line.trim()));
        }
        Ok(reader.into_inner())
    };

    tokio::time::timeout(timeout, fut)
        .await
        .context("hybrid vsock connect timed out")?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_vsock_address() {
        let addr = Address::parse("vsock://31513974:1024").unwrap();
        assert_eq!(
            addr,
            Address::Vsock {
                cid: 31513974,
                port: 1024
            }
        );
        assert_eq!(addr.uri(), "vsock://31513974:1024");
    }

    #[test]
    fn test_parse_hybrid_vsock_address() {
        let addr = Address::parse("hvsock:///run/virtrun/vm/s1/console.sock:1024").unwrap();
        assert_eq!(
            addr,
            Address::HybridVsock {
                uds: "/run/virtrun/vm/s1/console.sock".to_string(),
                port: 1024
            }
        );
    }

    #[test]
    fn test_parse_rejects_unknown_scheme() {
        assert!(Address::parse("tcp://1.2.3.4:80").is_err());
        assert!(Address::parse("vsock://nocid:1024").is_err());
        assert!(Address::parse("hvsock:///run/no-port").is_err());
    }
}
