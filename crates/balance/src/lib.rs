//! Target registry and load balancing for the Socket Transfer relay.
//!
//! A [`Balancer`] owns the ordered set of backend [`Target`]s together with
//! whatever bookkeeping its strategy needs (round-robin cursor, smooth
//! weighted-round-robin residues, live connection counts). Registry and
//! strategy state live under one lock so a pick and its bookkeeping are
//! atomic; the lock is never held across network I/O.
//!
//! # Example
//!
//! ```
//! use balance::{Balancer, Strategy, Target};
//!
//! let balancer = Balancer::new(
//!     Strategy::Polling,
//!     vec![Target::new(1081), Target::new(1082)],
//! );
//!
//! let first = balancer.pick_one().unwrap();
//! let second = balancer.pick_one().unwrap();
//! assert_ne!(first.id, second.id);
//! ```

pub mod balancer;
pub mod target;

pub use balancer::{Balancer, Strategy};
pub use target::Target;
