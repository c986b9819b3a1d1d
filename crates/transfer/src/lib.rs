//! Socket Transfer core.
//!
//! A local TCP relay that forwards each accepted connection to one of
//! several backend targets chosen by a pluggable balancing strategy,
//! a periodic handshake-aware health scan that prunes unreachable targets,
//! and a UDP forwarder pair bridging loopback sockets to a fixed upstream.
//!
//! # Components
//!
//! - **Supervisor** ([`SocketTransfer`]): lifecycle owner of the timer,
//!   listener, UDP sockets, event channel and counters.
//! - **Relay** (`relay`): accept loop and per-connection splicing with byte
//!   accounting.
//! - **UDP pair** (`udp`): v4 + v6 loopback sockets relaying datagrams to
//!   the upstream resolver.
//! - **Options / config** (`options`, `config`): programmatic construction
//!   options and the optional on-disk YAML file.
//!
//! # Example
//!
//! ```no_run
//! use balance::Target;
//! use transfer::{SocketTransfer, TransferOptions};
//!
//! # async fn example() -> common::Result<()> {
//! let mut server = SocketTransfer::new(TransferOptions::new(vec![
//!     Target::new(1081),
//!     Target::new(1082),
//! ]))
//! .await?;
//!
//! let port = server.listen(None).await?;
//! println!("relaying on port {port}");
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod events;
pub mod options;
mod relay;
pub mod supervisor;
pub mod udp;

pub use config::{Config, ConfigError};
pub use events::TransferEvent;
pub use options::{Heartbeat, TransferOptions, DEFAULT_HEARTBEAT_MS, DEFAULT_PORT, HEARTBEAT_FLOOR};
pub use supervisor::SocketTransfer;
pub use udp::{ForwardHandle, ForwardOptions, LoopbackForwarder, UdpForwarder};
