//! Protocol error types for the UDS protocol layer.
//!
//! Structured error types for protocol-level failures, enabling callers
//! to distinguish failure modes without exposing internal details.

use std::io;

use berth_core::messages::WireError;
use thiserror::Error;

/// Protocol errors for the UDS protocol layer.
///
/// # Error Classification
///
/// - **Framing errors**: issues with frame encoding/decoding
/// - **Connection errors**: I/O and connection lifecycle issues
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame exceeds the maximum allowed size.
    ///
    /// Detected from the length prefix BEFORE the payload is read, so
    /// an oversized frame never allocates its full claimed size.
    #[error("frame too large: {size} bytes exceeds maximum {max} bytes")]
    FrameTooLarge {
        /// Actual frame size from the length prefix.
        size: usize,
        /// Maximum allowed frame size.
        max: usize,
    },

    /// Frame data is invalid or corrupted.
    #[error("invalid frame: {reason}")]
    InvalidFrame {
        /// Description of the framing error.
        reason: String,
    },

    /// The peer closed the connection before the operation completed.
    #[error("connection closed")]
    ConnectionClosed,

    /// Timeout waiting for a response or operation.
    #[error("operation timed out after {duration_ms} ms")]
    Timeout {
        /// Duration in milliseconds before timeout.
        duration_ms: u64,
    },

    /// Underlying I/O error from the transport layer.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Message payload could not be serialized or deserialized.
    #[error("serialization error: {reason}")]
    Serialization {
        /// Description of the serialization failure.
        reason: String,
    },
}

impl ProtocolError {
    /// Create a timeout error.
    #[must_use]
    pub const fn timeout(duration_ms: u64) -> Self {
        Self::Timeout { duration_ms }
    }

    /// Returns `true` if this error indicates a recoverable connection
    /// issue where retrying the connection may succeed.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::ConnectionClosed)
    }

    /// Returns `true` if this error indicates a protocol violation.
    ///
    /// Protocol violations indicate bugs in the peer implementation or
    /// malicious behavior; the connection should be terminated.
    #[must_use]
    pub const fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            Self::FrameTooLarge { .. } | Self::InvalidFrame { .. } | Self::Serialization { .. }
        )
    }
}

impl From<WireError> for ProtocolError {
    fn from(err: WireError) -> Self {
        match err {
            WireError::FrameTooLarge { size, max } => Self::FrameTooLarge { size, max },
            WireError::Decode { reason } | WireError::Encode { reason } => {
                Self::Serialization { reason }
            },
        }
    }
}

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;
