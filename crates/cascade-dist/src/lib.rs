//! Packet distribution substrate for cascade.
//!
//! This crate provides:
//! - A `Transport` seam with loopback, in-process and TCP implementations
//! - A credit-limited `Distributor` with cluster-wide termination detection
//! - The `Exchange` driving loop that redistribution and dedup plug into

mod config;
mod distributor;
mod error;
mod exchange;
mod local;
mod loopback;
mod tcp;
mod transport;

pub use config::DistConfig;
pub use distributor::{DistStats, Distributor};
pub use error::DistError;
pub use exchange::{Exchange, Pickup, run_exchange};
pub use local::{LocalCluster, LocalTransport};
pub use loopback::Loopback;
pub use tcp::TcpTransport;
pub use transport::{SendOutcome, SendRequest, Transport};
