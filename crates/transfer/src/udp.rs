//! UDP forwarding between a local loopback socket and a fixed upstream.

use async_trait::async_trait;
use common::Result;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Reference upstream the forwarder pair points at.
pub const UPSTREAM_ADDRESS: &str = "114.114.114.114";
/// Reference upstream port.
pub const UPSTREAM_PORT: u16 = 53;

const MAX_DATAGRAM: usize = 65_536;

/// Options for a single forwarder socket.
#[derive(Debug, Clone)]
pub struct ForwardOptions {
    /// Local address to bind (loopback, v4 or v6).
    pub local: SocketAddr,
    /// How long to wait for the upstream's reply.
    pub reply_timeout: Duration,
}

impl ForwardOptions {
    pub fn new(local: SocketAddr) -> Self {
        Self {
            local,
            reply_timeout: Duration::from_secs(3),
        }
    }
}

/// A running forwarder socket.
pub struct ForwardHandle {
    local: SocketAddr,
    task: JoinHandle<()>,
}

impl ForwardHandle {
    /// The address the socket actually bound.
    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    /// Best-effort teardown; never fails.
    pub fn end(&self) {
        self.task.abort();
    }
}

impl Drop for ForwardHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Factory seam so the concrete forwarding library is replaceable.
#[async_trait]
pub trait UdpForwarder: Send + Sync {
    /// Bind a local socket and forward its datagrams to the upstream.
    async fn create(
        &self,
        upstream_port: u16,
        upstream_address: IpAddr,
        options: ForwardOptions,
    ) -> Result<ForwardHandle>;
}

/// Forwarder that relays each datagram over an ephemeral upstream socket and
/// returns the reply to the original sender.
pub struct LoopbackForwarder;

#[async_trait]
impl UdpForwarder for LoopbackForwarder {
    async fn create(
        &self,
        upstream_port: u16,
        upstream_address: IpAddr,
        options: ForwardOptions,
    ) -> Result<ForwardHandle> {
        let socket = Arc::new(UdpSocket::bind(options.local).await?);
        let local = socket.local_addr()?;
        let upstream = SocketAddr::new(upstream_address, upstream_port);
        info!(local = %local, upstream = %upstream, "udp forwarder started");

        let task = tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM];
            loop {
                match socket.recv_from(&mut buf).await {
                    Ok((len, sender)) => {
                        let payload = buf[..len].to_vec();
                        let socket = Arc::clone(&socket);
                        let reply_timeout = options.reply_timeout;
                        tokio::spawn(async move {
                            if let Err(e) =
                                relay_datagram(&socket, upstream, sender, payload, reply_timeout)
                                    .await
                            {
                                debug!(sender = %sender, error = %e, "datagram relay failed");
                            }
                        });
                    }
                    Err(e) => {
                        warn!(local = %local, error = %e, "udp receive failed");
                        break;
                    }
                }
            }
        });

        Ok(ForwardHandle { local, task })
    }
}

/// Send one datagram upstream and pass the reply back to the sender.
async fn relay_datagram(
    socket: &UdpSocket,
    upstream: SocketAddr,
    sender: SocketAddr,
    payload: Vec<u8>,
    reply_timeout: Duration,
) -> std::io::Result<()> {
    let bind: SocketAddr = if upstream.is_ipv4() {
        "0.0.0.0:0".parse().expect("literal addr")
    } else {
        "[::]:0".parse().expect("literal addr")
    };
    let outbound = UdpSocket::bind(bind).await?;
    outbound.send_to(&payload, upstream).await?;

    let mut reply = vec![0u8; MAX_DATAGRAM];
    match timeout(reply_timeout, outbound.recv(&mut reply)).await {
        Ok(Ok(len)) => {
            socket.send_to(&reply[..len], sender).await?;
            Ok(())
        }
        Ok(Err(e)) => Err(e),
        Err(_) => Err(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "upstream reply timed out",
        )),
    }
}
