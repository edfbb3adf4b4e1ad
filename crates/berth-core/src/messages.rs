//! Wire message envelopes for both transports.
//!
//! All messages are JSON inside 4-byte big-endian length-prefixed
//! frames. The same operation payloads travel over both transports:
//! the synchronous transport sends one [`WireRequest`] and reads one
//! [`WireResponse`]; the persistent channel wraps them in
//! [`ChannelRequest`]/[`ChannelReply`] envelopes carrying a
//! caller-generated `request_id`.
//!
//! # Wire Format
//!
//! ```text
//! +----------------------------+------------------+
//! | Length (4 bytes, BE)       | JSON payload     |
//! +----------------------------+------------------+
//! ```
//!
//! - Maximum frame size: 16 MiB
//! - Establish-phase frames are capped at 64 KiB: the establish call is
//!   unauthenticated, and a large frame there is memory and CPU spent
//!   before any credential check.
//!
//! # Security Considerations
//!
//! - Externally-supplied messages use `deny_unknown_fields`.
//! - Operation kinds are a closed enum; dispatch is exhaustive at
//!   compile time rather than an open string-keyed table.

use std::collections::BTreeSet;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::compliance::{ComplianceKind, ComplianceOutcome};
use crate::patron::PatronCredentials;
use crate::session::{DockSession, DockStatus, OperationCategory};
use crate::token::HandshakeToken;

/// Maximum frame size in bytes (16 MiB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Maximum frame size during the unauthenticated establish phase
/// (64 KiB).
pub const MAX_ESTABLISH_FRAME_SIZE: usize = 64 * 1024;

/// Protocol version spoken by this implementation.
pub const PROTOCOL_VERSION: u32 = 1;

/// Maximum accepted `agent_id` length.
pub const MAX_AGENT_ID_LEN: usize = 128;

/// Errors from message encoding and decoding.
#[derive(Debug, Error)]
pub enum WireError {
    /// Frame exceeds the applicable size limit.
    #[error("frame too large: {size} bytes exceeds maximum {max} bytes")]
    FrameTooLarge {
        /// Actual frame size.
        size: usize,
        /// Applicable limit.
        max: usize,
    },

    /// Frame is not a valid message of the expected type.
    #[error("invalid message: {reason}")]
    Decode {
        /// Description of the decode failure.
        reason: String,
    },

    /// Message could not be serialized.
    #[error("failed to serialize message: {reason}")]
    Encode {
        /// Description of the encode failure.
        reason: String,
    },
}

impl WireError {
    /// Returns `true` if the decode failure was an unrecognized
    /// operation or envelope tag (as opposed to malformed payload
    /// fields).
    #[must_use]
    pub fn is_unknown_variant(&self) -> bool {
        matches!(self, Self::Decode { reason } if reason.contains("unknown variant"))
    }
}

// ============================================================================
// Establish
// ============================================================================

/// Configuration the agent declares at establish time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct AgentDescriptor {
    /// Endpoint on the agent side that receives compliance callbacks.
    /// Required: an agent that cannot take compliance traffic is not
    /// allowed to dock.
    pub compliance_endpoint: String,

    /// Free-form agent metadata, recorded on the session.
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// Request to establish a new dock session. Unauthenticated; the
/// handshake token is the *result* of this call.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EstablishRequest {
    /// Protocol version requested by the agent.
    pub protocol_version: u32,

    /// Caller-supplied logical identity.
    pub agent_id: String,

    /// Operation categories the agent supports. Advisory.
    #[serde(default)]
    pub capabilities: BTreeSet<OperationCategory>,

    /// Agent configuration descriptor.
    pub config: AgentDescriptor,
}

/// A structured establish-validation failure. Raised before any
/// session state is created; nothing partial is ever persisted.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("invalid establish request: {field}: {reason}")]
pub struct EstablishValidationError {
    /// Offending field.
    pub field: &'static str,
    /// What was wrong with it.
    pub reason: String,
}

impl EstablishRequest {
    /// Build a well-formed request for the current protocol version.
    #[must_use]
    pub fn new(agent_id: impl Into<String>, config: AgentDescriptor) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            agent_id: agent_id.into(),
            capabilities: BTreeSet::new(),
            config,
        }
    }

    /// Declare supported operation categories.
    #[must_use]
    pub fn with_capabilities(mut self, capabilities: BTreeSet<OperationCategory>) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Validate the request before any session is created.
    ///
    /// # Errors
    ///
    /// Returns a structured validation error naming the offending
    /// field.
    pub fn validate(&self) -> Result<(), EstablishValidationError> {
        if self.protocol_version != PROTOCOL_VERSION {
            return Err(EstablishValidationError {
                field: "protocol_version",
                reason: format!(
                    "version {} not supported, server speaks version {PROTOCOL_VERSION}",
                    self.protocol_version
                ),
            });
        }
        if self.agent_id.trim().is_empty() {
            return Err(EstablishValidationError {
                field: "agent_id",
                reason: "must be non-empty".to_string(),
            });
        }
        if self.agent_id.len() > MAX_AGENT_ID_LEN {
            return Err(EstablishValidationError {
                field: "agent_id",
                reason: format!("exceeds {MAX_AGENT_ID_LEN} bytes"),
            });
        }
        if self.config.compliance_endpoint.trim().is_empty() {
            return Err(EstablishValidationError {
                field: "config.compliance_endpoint",
                reason: "must be non-empty".to_string(),
            });
        }
        Ok(())
    }
}

/// Logical endpoint names for each operation, returned at establish.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OperationEndpoints {
    /// Heartbeat operation.
    pub heartbeat: String,
    /// Deposit operation.
    pub deposit: String,
    /// Patron verification operation.
    pub patron: String,
    /// Compliance request operation.
    pub compliance: String,
    /// Session completion operation.
    pub complete: String,
}

impl Default for OperationEndpoints {
    fn default() -> Self {
        Self {
            heartbeat: "heartbeat".to_string(),
            deposit: "deposit".to_string(),
            patron: "verify_patron".to_string(),
            compliance: "compliance".to_string(),
            complete: "complete".to_string(),
        }
    }
}

/// Successful establish response carrying the session credentials.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EstablishResponse {
    /// Session identifier.
    pub dock_id: String,

    /// Shared secret required on every subsequent call.
    pub handshake_token: HandshakeToken,

    /// Channel identifier for binding the persistent channel.
    pub secure_channel_id: String,

    /// Session status after establish (always `PENDING`).
    pub status: DockStatus,

    /// Operation endpoint names.
    pub endpoints: OperationEndpoints,
}

// ============================================================================
// Operations
// ============================================================================

/// Data deposit payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DepositRequest {
    /// Opaque business payload; the envelope does not interpret it.
    pub payload: serde_json::Value,
}

/// Heartbeat payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HeartbeatRequest {
    /// Client timestamp; the idempotency key for duplicate delivery.
    pub sent_at: DateTime<Utc>,
}

/// Compliance request payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ComplianceRequest {
    /// Kind of request.
    pub kind: ComplianceKind,

    /// Field to correct; required for `rectification`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,

    /// Corrected value; required for `rectification`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,
}

/// Completion payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CompleteRequest {
    /// Final result recorded on the session.
    pub result: serde_json::Value,
}

/// Closed set of operations accepted after establish.
///
/// An operation kind outside this enum fails at decode time; there is
/// no open dispatch table to probe.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Operation {
    /// Verify a patron and bind the grant to the session.
    VerifyPatron(PatronCredentials),
    /// Deposit data.
    Deposit(DepositRequest),
    /// Compliance request; requires a verified patron.
    Compliance(ComplianceRequest),
    /// Liveness heartbeat.
    Heartbeat(HeartbeatRequest),
    /// Complete the session with a final result.
    Complete(CompleteRequest),
    /// Read-only session status.
    Status,
}

impl Operation {
    /// The capability category this operation falls under.
    #[must_use]
    pub const fn category(&self) -> OperationCategory {
        match self {
            Self::VerifyPatron(_) => OperationCategory::Patron,
            Self::Deposit(_) => OperationCategory::Deposit,
            Self::Compliance(_) => OperationCategory::Compliance,
            Self::Heartbeat(_) | Self::Complete(_) | Self::Status => {
                OperationCategory::Lifecycle
            },
        }
    }

    /// Short name for logging.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::VerifyPatron(_) => "verify_patron",
            Self::Deposit(_) => "deposit",
            Self::Compliance(_) => "compliance",
            Self::Heartbeat(_) => "heartbeat",
            Self::Complete(_) => "complete",
            Self::Status => "status",
        }
    }
}

/// An authenticated operation call: identifiers plus the operation
/// fields flattened beside them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationRequest {
    /// Session identifier.
    pub dock_id: String,

    /// Presented handshake token, compared in constant time.
    pub handshake_token: String,

    /// The operation itself.
    #[serde(flatten)]
    pub operation: Operation,
}

// ============================================================================
// Responses
// ============================================================================

/// Error codes for structured error responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Malformed request; safe to retry after fixing the input.
    InvalidRequest,
    /// Unknown or expired session. Do not retry; re-establish.
    NotFound,
    /// Token mismatch. Do not retry; re-establish.
    Unauthorized,
    /// Operation kind not recognized.
    UnsupportedOperation,
    /// Compliance request without a verified patron.
    PatronNotVerified,
    /// Patron credentials outside the replay window.
    StaleCredentials,
    /// Deposit payload exceeds the configured cap.
    PayloadTooLarge,
    /// Channel id does not match the session's issued id.
    ChannelMismatch,
    /// Internal failure; the request caused no session mutation.
    Internal,
}

/// Structured error envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Human-readable description.
    pub error: String,

    /// Machine-readable code for caller branching.
    pub code: ErrorCode,
}

impl ErrorResponse {
    /// Build an error response.
    #[must_use]
    pub fn new(code: ErrorCode, error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            code,
        }
    }
}

/// Public view of a session (no token material).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSnapshot {
    /// Session identifier.
    pub dock_id: String,
    /// Declared agent identity.
    pub agent_id: String,
    /// Current status.
    pub status: DockStatus,
    /// Whether a persistent channel is bound.
    pub channel_bound: bool,
    /// Whether a patron verification has succeeded.
    pub patron_verified: bool,
    /// Verified patron id, if any.
    pub patron_id: Option<String>,
    /// Deposits accepted so far.
    pub deposits: u64,
    /// Establish time.
    pub created_at: DateTime<Utc>,
    /// Most recent heartbeat.
    pub last_heartbeat: DateTime<Utc>,
    /// Completion time, once completed.
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<&DockSession> for SessionSnapshot {
    fn from(session: &DockSession) -> Self {
        Self {
            dock_id: session.dock_id.clone(),
            agent_id: session.agent_id.clone(),
            status: session.status,
            channel_bound: session.secure_channel_id.is_some(),
            patron_verified: session.patron_verified,
            patron_id: session.patron_id.clone(),
            deposits: session.deposits,
            created_at: session.created_at,
            last_heartbeat: session.last_heartbeat,
            completed_at: session.completed_at,
        }
    }
}

/// Typed result of a successful operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OperationResponse {
    /// Outcome of a patron verification. `verified=false` is a normal
    /// outcome, not an error.
    PatronVerification {
        /// Whether the credentials matched.
        verified: bool,
        /// Patron id, on success.
        patron_id: Option<String>,
        /// Granted permissions, on success.
        permissions: BTreeSet<String>,
    },

    /// Deposit accepted.
    Deposit {
        /// Always `true` in a success envelope.
        accepted: bool,
        /// Total deposits on the session, this one included.
        deposits: u64,
    },

    /// Compliance request outcome.
    Compliance(ComplianceOutcome),

    /// Heartbeat acknowledged.
    HeartbeatAck {
        /// Instant the next heartbeat must arrive by.
        deadline: DateTime<Utc>,
    },

    /// Session completed.
    Completed {
        /// Completion timestamp recorded on the session.
        completed_at: DateTime<Utc>,
    },

    /// Session status snapshot.
    Status(SessionSnapshot),
}

// ============================================================================
// Connection-level envelopes
// ============================================================================

/// Request to bind a persistent-channel connection to a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChannelBindRequest {
    /// Session identifier.
    pub dock_id: String,

    /// Presented handshake token.
    pub handshake_token: String,

    /// Channel id issued at establish time.
    pub channel_id: String,
}

/// Everything a client can send at the top of a connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WireRequest {
    /// Establish a new session.
    Establish(EstablishRequest),
    /// One authenticated operation (synchronous transport).
    Operation(OperationRequest),
    /// Switch this connection into persistent-channel mode.
    ChannelBind(ChannelBindRequest),
}

/// Everything the server can send back.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WireResponse {
    /// Establish succeeded.
    Established(EstablishResponse),
    /// Operation succeeded.
    Ok(OperationResponse),
    /// Structured failure.
    Error(ErrorResponse),
    /// Channel bind succeeded; correlated envelopes may now flow.
    ChannelBound {
        /// The bound channel id.
        channel_id: String,
    },
}

/// Correlated request over the persistent channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChannelRequest {
    /// Caller-generated id, unique within the channel's lifetime.
    pub request_id: String,

    /// The wrapped operation call.
    pub operation: OperationRequest,
}

/// Correlated reply over the persistent channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelReply {
    /// Echo of the request's id.
    pub request_id: String,

    /// The wrapped response (`Ok` or `Error`).
    pub response: WireResponse,
}

// ============================================================================
// Encode/decode helpers
// ============================================================================

/// Serialize a message to frame bytes.
///
/// # Errors
///
/// Returns [`WireError::Encode`] if serialization fails.
pub fn encode_message<T: Serialize>(message: &T) -> Result<Bytes, WireError> {
    serde_json::to_vec(message)
        .map(Bytes::from)
        .map_err(|e| WireError::Encode {
            reason: e.to_string(),
        })
}

/// Deserialize a message from frame bytes with size validation.
///
/// # Errors
///
/// Returns [`WireError::FrameTooLarge`] if the frame exceeds
/// `max_size`, or [`WireError::Decode`] if it is not a valid message
/// of type `T`.
pub fn decode_message<T: for<'de> Deserialize<'de>>(
    frame: &[u8],
    max_size: usize,
) -> Result<T, WireError> {
    if frame.len() > max_size {
        return Err(WireError::FrameTooLarge {
            size: frame.len(),
            max: max_size,
        });
    }
    serde_json::from_slice(frame).map_err(|e| WireError::Decode {
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor() -> AgentDescriptor {
        AgentDescriptor {
            compliance_endpoint: "agent/compliance".to_string(),
            metadata: serde_json::json!({"build": "test"}),
        }
    }

    #[test]
    fn establish_request_round_trips() {
        let req = EstablishRequest::new("agent-1", descriptor()).with_capabilities(
            BTreeSet::from([OperationCategory::Deposit, OperationCategory::Patron]),
        );
        let bytes = encode_message(&WireRequest::Establish(req)).unwrap();
        let parsed: WireRequest = decode_message(&bytes, MAX_ESTABLISH_FRAME_SIZE).unwrap();

        let WireRequest::Establish(parsed) = parsed else {
            panic!("expected establish request");
        };
        assert_eq!(parsed.agent_id, "agent-1");
        assert_eq!(parsed.protocol_version, PROTOCOL_VERSION);
        assert!(parsed.capabilities.contains(&OperationCategory::Patron));
    }

    #[test]
    fn establish_validation_rejects_empty_agent_id() {
        let req = EstablishRequest::new("   ", descriptor());
        let err = req.validate().unwrap_err();
        assert_eq!(err.field, "agent_id");
    }

    #[test]
    fn establish_validation_rejects_missing_compliance_endpoint() {
        let req = EstablishRequest::new(
            "agent-1",
            AgentDescriptor {
                compliance_endpoint: String::new(),
                metadata: serde_json::Value::Null,
            },
        );
        let err = req.validate().unwrap_err();
        assert_eq!(err.field, "config.compliance_endpoint");
    }

    #[test]
    fn establish_validation_rejects_version_mismatch() {
        let mut req = EstablishRequest::new("agent-1", descriptor());
        req.protocol_version = 99;
        let err = req.validate().unwrap_err();
        assert_eq!(err.field, "protocol_version");
        assert!(err.to_string().contains("99"));
    }

    #[test]
    fn establish_rejects_unknown_fields() {
        let json = br#"{"type":"establish","protocol_version":1,"agent_id":"a","config":{"compliance_endpoint":"x"},"extra":true}"#;
        let result: Result<WireRequest, _> = decode_message(json, MAX_ESTABLISH_FRAME_SIZE);
        assert!(result.is_err());
    }

    #[test]
    fn operation_request_flattens_op_fields() {
        let req = OperationRequest {
            dock_id: "dock-1".to_string(),
            handshake_token: "tok".to_string(),
            operation: Operation::Heartbeat(HeartbeatRequest { sent_at: Utc::now() }),
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["dock_id"], "dock-1");
        assert_eq!(json["op"], "heartbeat");
        assert!(json.get("sent_at").is_some());

        let parsed: OperationRequest = serde_json::from_value(json).unwrap();
        assert!(matches!(parsed.operation, Operation::Heartbeat(_)));
    }

    #[test]
    fn unknown_operation_kind_fails_decode_as_unknown_variant() {
        let json = br#"{"dock_id":"d","handshake_token":"t","op":"launch_missiles"}"#;
        let err = decode_message::<OperationRequest>(json, MAX_FRAME_SIZE).unwrap_err();
        assert!(err.is_unknown_variant(), "got: {err}");
    }

    #[test]
    fn oversized_frame_is_rejected_before_parse() {
        let frame = vec![b'x'; MAX_ESTABLISH_FRAME_SIZE + 1];
        let err = decode_message::<WireRequest>(&frame, MAX_ESTABLISH_FRAME_SIZE).unwrap_err();
        assert!(matches!(
            err,
            WireError::FrameTooLarge { size, max }
                if size == MAX_ESTABLISH_FRAME_SIZE + 1 && max == MAX_ESTABLISH_FRAME_SIZE
        ));
    }

    #[test]
    fn channel_envelopes_round_trip() {
        let request = ChannelRequest {
            request_id: "r1".to_string(),
            operation: OperationRequest {
                dock_id: "dock-1".to_string(),
                handshake_token: "tok".to_string(),
                operation: Operation::Status,
            },
        };
        let bytes = encode_message(&request).unwrap();
        let parsed: ChannelRequest = decode_message(&bytes, MAX_FRAME_SIZE).unwrap();
        assert_eq!(parsed.request_id, "r1");
        assert!(matches!(parsed.operation.operation, Operation::Status));

        let reply = ChannelReply {
            request_id: "r1".to_string(),
            response: WireResponse::Error(ErrorResponse::new(ErrorCode::NotFound, "gone")),
        };
        let bytes = encode_message(&reply).unwrap();
        let parsed: ChannelReply = decode_message(&bytes, MAX_FRAME_SIZE).unwrap();
        assert_eq!(parsed.request_id, "r1");
        assert!(matches!(
            parsed.response,
            WireResponse::Error(ErrorResponse {
                code: ErrorCode::NotFound,
                ..
            })
        ));
    }

    #[test]
    fn error_code_serializes_screaming() {
        let json = serde_json::to_string(&ErrorCode::PatronNotVerified).unwrap();
        assert_eq!(json, r#""PATRON_NOT_VERIFIED""#);
    }

    #[test]
    fn operation_category_mapping() {
        let op = Operation::Compliance(ComplianceRequest {
            kind: ComplianceKind::Erasure,
            field: None,
            value: None,
        });
        assert_eq!(op.category(), OperationCategory::Compliance);
        assert_eq!(op.name(), "compliance");
        assert_eq!(Operation::Status.category(), OperationCategory::Lifecycle);
    }

    #[test]
    fn compliance_response_nests_outcome() {
        let resp = OperationResponse::Compliance(ComplianceOutcome::Erased { removed: 2 });
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["kind"], "compliance");
        assert_eq!(json["outcome"], "erased");

        let parsed: OperationResponse = serde_json::from_value(json).unwrap();
        assert!(matches!(
            parsed,
            OperationResponse::Compliance(ComplianceOutcome::Erased { removed: 2 })
        ));
    }

    #[test]
    fn default_endpoints_name_every_operation() {
        let endpoints = OperationEndpoints::default();
        assert_eq!(endpoints.patron, "verify_patron");
        assert_eq!(endpoints.complete, "complete");
    }
}
