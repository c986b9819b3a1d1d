//! Common error types for Socket Transfer components.

use std::fmt;

/// A specialized Result type for Socket Transfer operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for Socket Transfer operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Listen port is already bound by another process.
    #[error("{0}")]
    PortInUse(String),

    /// Any other listener bind/start failure.
    #[error("{0}")]
    StartFailure(String),

    /// The balancer had no target to hand out.
    #[error("no target available")]
    NoTarget,

    /// Outbound dial to a target failed.
    #[error("remote dial failed for target {port}: {message}")]
    RemoteDialFailure { port: u16, message: String },

    /// The handshake checker itself faulted (not a mere unhealthy verdict).
    #[error("checker error: {0}")]
    Checker(String),

    #[error("unlisten timeout")]
    UnlistenTimeout,

    /// Heartbeat value rejected by validation.
    #[error("invalid heartbeat: {0}")]
    HeartbeatInvalid(String),

    /// Illegal lifecycle transition (e.g. listen() on a closed server).
    #[error("invalid state: {0}")]
    State(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Create a new checker error.
    pub fn checker(msg: impl fmt::Display) -> Self {
        Error::Checker(msg.to_string())
    }

    /// Create a new heartbeat validation error.
    pub fn heartbeat(msg: impl fmt::Display) -> Self {
        Error::HeartbeatInvalid(msg.to_string())
    }

    /// Create a new lifecycle state error.
    pub fn state(msg: impl fmt::Display) -> Self {
        Error::State(msg.to_string())
    }

    /// Create a new configuration error.
    pub fn config(msg: impl fmt::Display) -> Self {
        Error::Config(msg.to_string())
    }
}
