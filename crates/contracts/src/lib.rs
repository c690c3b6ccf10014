//! # Contracts
//!
//! Frozen interface contracts shared by the relay crates: frames, configuration,
//! the transport session boundary and the error taxonomy.
//! All business crates can only depend on this crate, reverse dependencies are prohibited.
//!
//! ## Time Model
//! - Queue ages and ack latencies use monotonic `tokio::time::Instant`
//! - Externally visible timestamps are unix milliseconds

mod config;
mod error;
mod frame;
mod session;

pub use config::*;
pub use error::*;
pub use frame::*;
pub use session::*;
