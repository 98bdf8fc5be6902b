//! Error types for the distribution substrate.

use thiserror::Error;

/// Errors raised by transports and the distributor.
///
/// None of these are recoverable: a worker that sees one cannot stay in
/// step with the rest of the cluster.
#[derive(Debug, Error)]
pub enum DistError {
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A packet does not match the configured packet size.
    #[error("packet of {got} bytes, expected {expected}")]
    PacketSize { expected: usize, got: usize },

    /// Destination rank outside the cluster.
    #[error("rank {rank} out of range for cluster of {size}")]
    InvalidRank { rank: usize, size: usize },

    /// `no_more_sends` was called twice.
    #[error("no_more_sends called twice")]
    NoMoreSendsTwice,

    /// A send was attempted after `no_more_sends`.
    #[error("send after no_more_sends")]
    SendAfterNoMoreSends,

    /// A peer went away.
    #[error("peer {peer} disconnected")]
    Disconnected { peer: usize },

    /// Connection setup failed.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// In-flight sends did not complete after quiescence.
    #[error("{pending} sends still in flight after drain")]
    DrainTimeout { pending: usize },

    /// The cluster violated the termination protocol.
    #[error("protocol violation: {0}")]
    Protocol(String),
}
