//! Error types for the wire formats.

use thiserror::Error;

/// Errors that can occur while decoding rules, conditions or data files.
#[derive(Debug, Error)]
pub enum WireError {
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The buffer ended before a fixed-width field could be read.
    #[error("truncated {context}: needed {needed} bytes, {available} available")]
    Truncated {
        context: &'static str,
        needed: usize,
        available: usize,
    },

    /// A size prefix is smaller than a block header or runs past its parent.
    #[error("bad {kind} block length {declared} ({available} bytes available)")]
    BadLength {
        kind: &'static str,
        declared: usize,
        available: usize,
    },

    /// Unknown type discriminant.
    #[error("unknown {kind} tag {tag}")]
    UnknownTag { kind: &'static str, tag: u8 },

    /// A block's payload was not fully consumed by its children.
    #[error("{extra} trailing bytes in {kind} block")]
    TrailingBytes { kind: &'static str, extra: usize },

    /// A block holds the wrong number of children.
    #[error("{kind} block has {found} children")]
    Arity { kind: &'static str, found: usize },

    /// Nesting deeper than the decoder allows.
    #[error("nesting deeper than {0} levels")]
    TooDeep(usize),

    /// A data file ended in the middle of a record.
    #[error("data file ends with a partial record of {0} bytes")]
    PartialRecord(usize),

    /// A rule inside a stream could not be decoded; the stream skipped it.
    #[error("malformed record at byte {offset}: {source}")]
    Malformed {
        offset: usize,
        #[source]
        source: Box<WireError>,
    },
}
