//! Protocol-aware reachability probing for Socket Transfer targets.
//!
//! Targets are local proxy instances; an open TCP port is necessary but not
//! sufficient evidence that one is alive, because an unrelated service may
//! be squatting on the port. The probe therefore speaks the opening bytes of
//! the proxy handshake and only reports healthy when the reply matches.
//!
//! # Example
//!
//! ```no_run
//! use shadowcheck::{HandshakeChecker, Socks5Checker};
//! use std::time::Duration;
//!
//! # async fn example() -> common::Result<()> {
//! let checker = Socks5Checker::new(Duration::from_secs(3));
//! let alive = checker.check("127.0.0.1".parse().unwrap(), 1081).await?;
//! # Ok(())
//! # }
//! ```

pub mod checker;

pub use checker::{HandshakeChecker, Socks5Checker};
