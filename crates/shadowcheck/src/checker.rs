//! Handshake probe implementations.

use async_trait::async_trait;
use common::Result;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, warn};

/// SOCKS5 greeting: version 5, one auth method, no authentication.
const GREETING: [u8; 3] = [0x05, 0x01, 0x00];

/// Expected method-selection reply: version 5, no authentication.
const ACCEPT: [u8; 2] = [0x05, 0x00];

/// Default probe deadline.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);

/// Reachability probe for one target.
///
/// `Ok(true)` means the port accepted a connection and answered the upstream
/// handshake; `Ok(false)` covers connection refused, timeout and handshake
/// mismatch. `Err` is reserved for faults inside the checker itself.
#[async_trait]
pub trait HandshakeChecker: Send + Sync {
    /// Probe `address:port`, bounded by the checker's deadline.
    async fn check(&self, address: IpAddr, port: u16) -> Result<bool>;
}

/// Probe that performs the SOCKS5 method-selection exchange.
pub struct Socks5Checker {
    deadline: Duration,
}

impl Socks5Checker {
    /// Create a checker with an explicit per-probe deadline.
    pub fn new(deadline: Duration) -> Self {
        Self { deadline }
    }

    async fn exchange(addr: SocketAddr) -> std::io::Result<bool> {
        let mut stream = TcpStream::connect(addr).await?;
        stream.write_all(&GREETING).await?;
        let mut reply = [0u8; 2];
        stream.read_exact(&mut reply).await?;
        Ok(reply == ACCEPT)
    }
}

impl Default for Socks5Checker {
    fn default() -> Self {
        Self::new(DEFAULT_TIMEOUT)
    }
}

#[async_trait]
impl HandshakeChecker for Socks5Checker {
    async fn check(&self, address: IpAddr, port: u16) -> Result<bool> {
        let addr = SocketAddr::new(address, port);
        let start = Instant::now();

        match timeout(self.deadline, Self::exchange(addr)).await {
            Ok(Ok(true)) => {
                debug!(target = %addr, duration_ms = start.elapsed().as_millis() as u64, "handshake probe passed");
                Ok(true)
            }
            Ok(Ok(false)) => {
                warn!(target = %addr, "handshake probe got an unexpected reply");
                Ok(false)
            }
            Ok(Err(e)) => {
                warn!(target = %addr, error = %e, "handshake probe failed to connect");
                Ok(false)
            }
            Err(_) => {
                warn!(target = %addr, deadline_ms = self.deadline.as_millis() as u64, "handshake probe timed out");
                Ok(false)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn checker() -> Socks5Checker {
        Socks5Checker::new(Duration::from_millis(500))
    }

    /// Listener that reads the greeting and answers with the given bytes.
    async fn spawn_replying_listener(reply: &'static [u8]) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let mut greeting = [0u8; 3];
                if stream.read_exact(&mut greeting).await.is_ok() {
                    let _ = stream.write_all(reply).await;
                }
            }
        });
        port
    }

    #[tokio::test]
    async fn test_closed_port_is_unhealthy() {
        let checker = checker();
        // Reserve a port, then free it so nothing is listening.
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        assert!(!checker.check("127.0.0.1".parse().unwrap(), port).await.unwrap());
    }

    #[tokio::test]
    async fn test_handshake_reply_is_healthy() {
        let port = spawn_replying_listener(&[0x05, 0x00]).await;
        let checker = checker();
        assert!(checker.check("127.0.0.1".parse().unwrap(), port).await.unwrap());
    }

    #[tokio::test]
    async fn test_wrong_reply_is_unhealthy() {
        // An HTTP server would never answer 05 00.
        let port = spawn_replying_listener(b"HT").await;
        let checker = checker();
        assert!(!checker.check("127.0.0.1".parse().unwrap(), port).await.unwrap());
    }

    #[tokio::test]
    async fn test_rejecting_method_is_unhealthy() {
        // 0xFF means "no acceptable methods".
        let port = spawn_replying_listener(&[0x05, 0xFF]).await;
        let checker = checker();
        assert!(!checker.check("127.0.0.1".parse().unwrap(), port).await.unwrap());
    }

    #[tokio::test]
    async fn test_silent_listener_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            // Accept and hold the socket without ever replying.
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });

        let checker = Socks5Checker::new(Duration::from_millis(100));
        let start = Instant::now();
        assert!(!checker.check("127.0.0.1".parse().unwrap(), port).await.unwrap());
        assert!(start.elapsed() < Duration::from_millis(500));
    }
}
