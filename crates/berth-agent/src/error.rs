//! Client-side error types.

use berth_core::correlator::CorrelationError;
use berth_core::messages::{ErrorCode, WireError};
use thiserror::Error;

/// Errors from agent-side protocol operations.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The daemon socket does not exist or refused the connection.
    #[error("daemon is not running")]
    DaemonNotRunning,

    /// I/O error during communication.
    #[error("I/O error: {0}")]
    Io(std::io::Error),

    /// The call did not complete within its bound.
    #[error("request timed out after {duration_ms} ms")]
    Timeout {
        /// The bound in milliseconds.
        duration_ms: u64,
    },

    /// The persistent channel closed with the request outstanding.
    #[error("channel closed")]
    ChannelClosed,

    /// Message encoding or decoding failed.
    #[error(transparent)]
    Wire(#[from] WireError),

    /// The daemon answered with a structured error.
    #[error("daemon error ({code:?}): {message}")]
    Daemon {
        /// Machine-readable error code.
        code: ErrorCode,
        /// Human-readable description.
        message: String,
    },

    /// The daemon answered with something other than the expected
    /// response shape.
    #[error("unexpected response: {reason}")]
    UnexpectedResponse {
        /// Description of the mismatch.
        reason: String,
    },

    /// The client is not docked.
    #[error("not docked; call dock() first")]
    NotDocked,
}

impl ClientError {
    /// Returns `true` for authentication failures that require a
    /// re-handshake rather than a retry with the same credentials.
    #[must_use]
    pub const fn is_session_invalid(&self) -> bool {
        matches!(
            self,
            Self::Daemon {
                code: ErrorCode::Unauthorized | ErrorCode::NotFound,
                ..
            }
        )
    }

    /// Returns `true` for transport-level failures where reconnecting
    /// and retrying may succeed.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. } | Self::ChannelClosed | Self::DaemonNotRunning | Self::Io(_)
        )
    }
}

impl From<std::io::Error> for ClientError {
    fn from(err: std::io::Error) -> Self {
        if matches!(
            err.kind(),
            std::io::ErrorKind::NotFound | std::io::ErrorKind::ConnectionRefused
        ) {
            Self::DaemonNotRunning
        } else {
            Self::Io(err)
        }
    }
}

impl From<CorrelationError> for ClientError {
    fn from(err: CorrelationError) -> Self {
        match err {
            CorrelationError::Timeout { timeout_ms } => Self::Timeout {
                duration_ms: timeout_ms,
            },
            CorrelationError::ChannelClosed => Self::ChannelClosed,
            CorrelationError::DuplicateRequestId { request_id } => Self::UnexpectedResponse {
                reason: format!("duplicate request id: {request_id}"),
            },
        }
    }
}
