//! Snapshot parse error implementation

use thiserror::Error;

/// Errors produced while deserializing a snapshot.
///
/// Every variant carries the absolute byte offset (already adjusted by the
/// caller-supplied blob offset) at which the problem was detected.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ParseError {
    /// The stream cursor would move past the end of the blob.
    #[error("unexpected end of stream at offset {offset:#x}")]
    EndOfStream {
        /// Offset at which the read was attempted.
        offset: u64,
    },
    /// A variable-length integer does not fit the expected width, or a
    /// tagged word was found where a small integer was required.
    #[error("invalid encoding at offset {offset:#x}: {reason}")]
    InvalidEncoding {
        /// Offset of the offending value.
        offset: u64,
        /// Human-readable description of the violation.
        reason: String,
    },
    /// The blob is not a snapshot this parser understands: bad magic, bad
    /// version, unknown kind, or an architecture that cannot be derived
    /// from the features string.
    #[error("format mismatch at offset {offset:#x}: {reason}")]
    FormatMismatch {
        /// Offset of the offending header field.
        offset: u64,
        /// Human-readable description of the mismatch.
        reason: String,
    },
    /// A cluster maps to a class kind with no deserialization handler.
    #[error("cluster handler {name:?} is not implemented (offset {offset:#x})")]
    UnimplementedHandler {
        /// Offset of the cluster's class id.
        offset: u64,
        /// Resolved handler name.
        name: String,
    },
    /// An internal consistency check failed. Raised only in strict mode;
    /// otherwise the same condition is logged as a warning and parsing
    /// continues with a best-effort placeholder.
    #[error("inconsistency at offset {offset:#x}: {reason}")]
    Inconsistency {
        /// Offset at which the check failed.
        offset: u64,
        /// Description of the failed check.
        reason: String,
    },
}

impl ParseError {
    /// Absolute byte offset the error was detected at.
    pub const fn offset(&self) -> u64 {
        match self {
            Self::EndOfStream { offset }
            | Self::InvalidEncoding { offset, .. }
            | Self::FormatMismatch { offset, .. }
            | Self::UnimplementedHandler { offset, .. }
            | Self::Inconsistency { offset, .. } => *offset,
        }
    }
}
