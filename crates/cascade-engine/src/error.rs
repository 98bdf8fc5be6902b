//! Error types for the evaluation engine.

use cascade_dist::DistError;
use cascade_wire::WireError;
use thiserror::Error;

/// Errors that can occur while evaluating rules or moving facts.
#[derive(Debug, Error)]
pub enum EngineError {
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Distribution error.
    #[error("distribution error: {0}")]
    Dist(#[from] DistError),

    /// Wire format error.
    #[error("wire format error: {0}")]
    Wire(#[from] WireError),

    /// A rule uses a construct the evaluator does not handle.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// A filter was reached before the atom that binds its variables.
    #[error("filter on unbound variable: {0}")]
    UnboundFilter(String),

    /// A record does not fit in one packet.
    #[error("{columns} columns do not fit in a {packet_size}-byte packet")]
    PacketTooSmall { columns: usize, packet_size: usize },

    /// A received packet could not be decoded.
    #[error("corrupt packet: {0}")]
    CorruptPacket(String),

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl EngineError {
    /// Whether the error only invalidates the rule being evaluated.
    ///
    /// Recoverable errors are raised the same way on every rank, since they
    /// depend only on rule structure, so skipping the rule keeps the cluster
    /// in step.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            EngineError::Unsupported(_)
                | EngineError::UnboundFilter(_)
                | EngineError::PacketTooSmall { .. }
        )
    }
}
