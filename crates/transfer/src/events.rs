//! Supervisor event surface.
//!
//! Events are delivered over a single mpsc channel whose receiver the
//! embedder takes once. Variant names map to the wire names the desktop
//! shell subscribes to; those strings are frozen.

use balance::Target;
use std::fmt;
use tokio::sync::mpsc;
use tracing::debug;

/// Buffered events before emission starts dropping.
pub(crate) const EVENT_CHANNEL_SIZE: usize = 64;

/// An event re-emitted by the supervisor.
#[derive(Debug, Clone)]
pub enum TransferEvent {
    /// No target was available for an accepted connection.
    LoadBalancerError { error: String },

    /// Client-side splice error. Part of the public surface but not emitted
    /// by the current relay (errors are logged instead).
    ServerLocalError { error: String },

    /// Remote-side splice error, with the target port. Same status as
    /// [`TransferEvent::ServerLocalError`].
    ServerRemoteError { error: String, port: u16 },

    /// Listener-level failure.
    SocketTransferError { error: String },

    /// The handshake checker itself faulted during a scan.
    HealthCheckError { error: String },

    /// Targets that failed both probe passes and were pruned.
    HealthCheckFailed { targets: Vec<Target> },
}

impl TransferEvent {
    /// The wire name of this event.
    ///
    /// `error:health:heck` is a historical misspelling, kept because
    /// subscribers match on the literal string.
    pub fn name(&self) -> &'static str {
        match self {
            TransferEvent::LoadBalancerError { .. } => "error:loadbalancer",
            TransferEvent::ServerLocalError { .. } => "error:server:local",
            TransferEvent::ServerRemoteError { .. } => "error:server:remote",
            TransferEvent::SocketTransferError { .. } => "error:socket:transfer",
            TransferEvent::HealthCheckError { .. } => "error:health:heck",
            TransferEvent::HealthCheckFailed { .. } => "health:check:failed",
        }
    }
}

impl fmt::Display for TransferEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Cloneable emission handle shared by the relay and the health scan.
#[derive(Clone)]
pub(crate) struct EventSender {
    tx: mpsc::Sender<TransferEvent>,
}

impl EventSender {
    pub(crate) fn channel() -> (Self, mpsc::Receiver<TransferEvent>) {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_SIZE);
        (Self { tx }, rx)
    }

    /// Emit without blocking; a full or closed channel drops the event.
    pub(crate) fn emit(&self, event: TransferEvent) {
        if let Err(e) = self.tx.try_send(event) {
            debug!(error = %e, "event dropped");
        }
    }
}
