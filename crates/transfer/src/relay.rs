//! TCP relay: accepts local connections and splices each onto a balanced
//! target.

use crate::events::{EventSender, TransferEvent};
use balance::{Balancer, Target};
use common::{catalog, Error, Result};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{copy_bidirectional, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Reply written to clients accepted while the registry is empty.
const NOT_READY: &[u8] = b"socket transfer not ready!";

/// Accepting side of the transfer core.
///
/// One accept loop task owns the listener; each accepted connection gets its
/// own splice task. Closing the relay only stops new accepts; in-flight
/// sessions run to completion on their own tasks.
pub struct TcpRelay {
    bind: IpAddr,
    balancer: Arc<Balancer>,
    events: EventSender,
    bytes: Arc<AtomicU64>,
    shutdown: Option<watch::Sender<bool>>,
    accept_task: Option<JoinHandle<()>>,
}

impl TcpRelay {
    pub(crate) fn new(
        bind: IpAddr,
        balancer: Arc<Balancer>,
        events: EventSender,
        bytes: Arc<AtomicU64>,
    ) -> Self {
        Self {
            bind,
            balancer,
            events,
            bytes,
            shutdown: None,
            accept_task: None,
        }
    }

    /// Bind the listener and start accepting. Resolves with the bound port.
    pub(crate) async fn listen(&mut self, address: IpAddr, port: u16) -> Result<u16> {
        let listener = TcpListener::bind(SocketAddr::new(address, port))
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::AddrInUse => {
                    Error::PortInUse(format!("{}{}", catalog::lookup("port_already_used"), port))
                }
                _ => Error::StartFailure(format!(
                    "{}: {}",
                    catalog::lookup("failed_to_start_socket_transfer"),
                    e
                )),
            })?;
        let bound = listener.local_addr()?.port();
        info!(address = %address, port = bound, "socket transfer listening");

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        self.shutdown = Some(shutdown_tx);
        self.accept_task = Some(tokio::spawn(Self::accept_loop(
            listener,
            shutdown_rx,
            self.bind,
            Arc::clone(&self.balancer),
            self.events.clone(),
            Arc::clone(&self.bytes),
        )));
        Ok(bound)
    }

    async fn accept_loop(
        listener: TcpListener,
        mut shutdown: watch::Receiver<bool>,
        bind: IpAddr,
        balancer: Arc<Balancer>,
        events: EventSender,
        bytes: Arc<AtomicU64>,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    debug!("accept loop stopping");
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok((client, peer)) => {
                        Self::dispatch(client, peer, bind, &balancer, &events, &bytes);
                    }
                    Err(e) => {
                        error!(error = %e, "listener accept failed");
                        events.emit(TransferEvent::SocketTransferError {
                            error: e.to_string(),
                        });
                    }
                }
            }
        }
    }

    /// Pick a target for an accepted client and hand the pair to a splice
    /// task. Never blocks the accept loop.
    fn dispatch(
        mut client: TcpStream,
        peer: SocketAddr,
        bind: IpAddr,
        balancer: &Arc<Balancer>,
        events: &EventSender,
        bytes: &Arc<AtomicU64>,
    ) {
        let Some(target) = balancer.pick_one() else {
            warn!(peer = %peer, "no target available, refusing connection");
            events.emit(TransferEvent::LoadBalancerError {
                error: Error::NoTarget.to_string(),
            });
            tokio::spawn(async move {
                let _ = client.write_all(NOT_READY).await;
                // Dropping the stream closes the connection.
            });
            return;
        };

        balancer.on_open(&target);
        let balancer = Arc::clone(balancer);
        let bytes = Arc::clone(bytes);
        tokio::spawn(async move {
            Self::splice(client, peer, bind, target, &balancer, &bytes).await;
        });
    }

    async fn splice(
        mut client: TcpStream,
        peer: SocketAddr,
        bind: IpAddr,
        target: Target,
        balancer: &Balancer,
        bytes: &AtomicU64,
    ) {
        let remote_addr = SocketAddr::new(bind, target.id);
        let mut remote = match TcpStream::connect(remote_addr).await {
            Ok(stream) => stream,
            Err(e) => {
                // No failover: the client tears itself down on its own error
                // path, but the connection count must come back down.
                let err = Error::RemoteDialFailure {
                    port: target.id,
                    message: e.to_string(),
                };
                warn!(port = target.id, error = %err, "remote dial failed");
                balancer.on_close(&target);
                return;
            }
        };

        debug!(peer = %peer, port = target.id, "session established");
        match copy_bidirectional(&mut client, &mut remote).await {
            Ok((to_remote, to_client)) => {
                bytes.fetch_add(to_remote + to_client, Ordering::Relaxed);
                debug!(
                    peer = %peer,
                    port = target.id,
                    sent = to_remote,
                    recv = to_client,
                    "session ended"
                );
            }
            Err(e) => {
                warn!(peer = %peer, port = target.id, error = %e, "session ended with error");
            }
        }
        balancer.on_close(&target);
    }

    /// Stop accepting and wait for the accept loop to wind down.
    pub(crate) async fn close(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(true);
        }
        if let Some(task) = self.accept_task.take() {
            let _ = task.await;
        }
    }

    /// Synchronous teardown for drop paths.
    pub(crate) fn abort(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(true);
        }
        if let Some(task) = self.accept_task.take() {
            task.abort();
        }
    }
}

impl Drop for TcpRelay {
    fn drop(&mut self) {
        self.abort();
    }
}
