//! Operation dispatch.
//!
//! Every call after establish goes through [`OperationRouter`]:
//!
//! 1. Session lookup. An unknown id gets a generic "session not found"
//!    response; the router never reveals whether the id once existed
//!    or expired.
//! 2. Handshake token comparison in constant time. A mismatch is
//!    `UNAUTHORIZED` and must not reveal which character differs.
//! 3. Terminal-status check. Terminal sessions accept only the
//!    read-only status query; everything else is answered as if the
//!    session were gone.
//! 4. Exhaustive dispatch over the closed [`Operation`] enum to one
//!    business handler per variant.
//!
//! Handlers are all-or-nothing with respect to session mutation: a
//! handler failure leaves the stored session exactly as it was.
//!
//! Capabilities declared at establish time are advisory: an operation
//! outside the declared set is logged, not rejected.

use thiserror::Error;
use tracing::{debug, warn};

use berth_core::messages::{
    ChannelBindRequest, ErrorCode, ErrorResponse, Operation, OperationRequest, OperationResponse,
    WireResponse,
};
use berth_core::patron::PatronError;
use berth_core::session::SessionError;
use berth_core::store::StoreError;

use crate::handlers;
use crate::state::SharedState;

/// Dispatch-level failures, mapped onto wire error codes.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// Unknown or expired session. The response is deliberately
    /// generic.
    #[error("session not found")]
    NotFound,

    /// Handshake token mismatch.
    #[error("invalid handshake token")]
    Unauthorized,

    /// Compliance request on a session without a verified patron.
    #[error("patron not verified on this session")]
    PatronNotVerified,

    /// Patron credentials outside the replay window.
    #[error(transparent)]
    StaleCredentials(#[from] PatronError),

    /// Deposit payload over the configured cap.
    #[error("deposit payload of {size} bytes exceeds maximum {max} bytes")]
    PayloadTooLarge {
        /// Serialized payload size.
        size: usize,
        /// Configured cap.
        max: usize,
    },

    /// Channel id does not match the one issued at establish.
    #[error("channel id does not match this session")]
    ChannelMismatch,

    /// Malformed request content.
    #[error("invalid request: {reason}")]
    InvalidRequest {
        /// What was wrong with the request.
        reason: String,
    },

    /// Internal failure; no session mutation occurred.
    #[error("internal error: {reason}")]
    Internal {
        /// Failure description, not echoed verbatim to peers.
        reason: String,
    },
}

impl DispatchError {
    /// The wire error code for this failure.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::NotFound => ErrorCode::NotFound,
            Self::Unauthorized => ErrorCode::Unauthorized,
            Self::PatronNotVerified => ErrorCode::PatronNotVerified,
            Self::StaleCredentials(_) => ErrorCode::StaleCredentials,
            Self::PayloadTooLarge { .. } => ErrorCode::PayloadTooLarge,
            Self::ChannelMismatch => ErrorCode::ChannelMismatch,
            Self::InvalidRequest { .. } => ErrorCode::InvalidRequest,
            Self::Internal { .. } => ErrorCode::Internal,
        }
    }

    /// Render the structured error envelope.
    #[must_use]
    pub fn into_response(self) -> ErrorResponse {
        let message = match &self {
            // Internal details stay in the logs.
            Self::Internal { .. } => "internal error".to_string(),
            other => other.to_string(),
        };
        ErrorResponse::new(self.code(), message)
    }
}

impl From<StoreError> for DispatchError {
    fn from(err: StoreError) -> Self {
        match err {
            // An expired (terminal) session answers exactly like a
            // missing one.
            StoreError::SessionNotFound | StoreError::Session(SessionError::Terminal { .. }) => {
                Self::NotFound
            },
            StoreError::Session(e @ SessionError::InvalidTransition { .. }) => Self::Internal {
                reason: e.to_string(),
            },
            StoreError::DuplicateSession { dock_id } => Self::Internal {
                reason: format!("duplicate session: {dock_id}"),
            },
        }
    }
}

/// Validates and routes authenticated operations.
#[derive(Clone)]
pub struct OperationRouter {
    state: SharedState,
}

impl OperationRouter {
    /// Create a router over the shared daemon state.
    #[must_use]
    pub const fn new(state: SharedState) -> Self {
        Self { state }
    }

    /// The shared state this router dispatches against.
    #[must_use]
    pub fn state(&self) -> &SharedState {
        &self.state
    }

    /// Dispatch one operation call, producing a wire response.
    ///
    /// Never panics; failures become structured error envelopes.
    #[must_use]
    pub fn dispatch(&self, request: &OperationRequest) -> WireResponse {
        match self.route(request) {
            Ok(response) => WireResponse::Ok(response),
            Err(err) => {
                debug!(
                    dock_id = %request.dock_id,
                    op = request.operation.name(),
                    error = %err,
                    "operation rejected"
                );
                WireResponse::Error(err.into_response())
            },
        }
    }

    fn route(&self, request: &OperationRequest) -> Result<OperationResponse, DispatchError> {
        let session = self
            .state
            .store()
            .get(&request.dock_id)
            .map_err(|_| DispatchError::NotFound)?;

        // Constant-time comparison; a mismatch is a hard
        // authentication failure, not something to retry.
        if !session.handshake_token.verify(&request.handshake_token) {
            warn!(dock_id = %request.dock_id, "handshake token mismatch");
            return Err(DispatchError::Unauthorized);
        }

        // Terminal sessions accept only the read-only status query.
        if session.status.is_terminal() && !matches!(request.operation, Operation::Status) {
            return Err(DispatchError::NotFound);
        }

        // Advisory capability check (declared set is not an allow-list).
        let category = request.operation.category();
        if !session.capabilities.is_empty() && !session.capabilities.contains(&category) {
            warn!(
                dock_id = %request.dock_id,
                op = request.operation.name(),
                ?category,
                "operation outside the session's declared capabilities"
            );
        }

        match &request.operation {
            Operation::VerifyPatron(credentials) => {
                handlers::verify_patron(&self.state, &request.dock_id, credentials)
            },
            Operation::Deposit(deposit) => {
                handlers::deposit(&self.state, &request.dock_id, deposit)
            },
            Operation::Compliance(compliance) => {
                handlers::compliance(&self.state, &request.dock_id, &session, compliance)
            },
            Operation::Heartbeat(heartbeat) => {
                handlers::heartbeat(&self.state, &request.dock_id, heartbeat)
            },
            Operation::Complete(complete) => {
                handlers::complete(&self.state, &request.dock_id, complete)
            },
            Operation::Status => handlers::status(&self.state, &request.dock_id),
        }
    }

    /// Bind a persistent-channel connection to a session.
    ///
    /// Validates the token and the channel id issued at establish
    /// time, then records the binding on the session.
    ///
    /// # Errors
    ///
    /// [`DispatchError::NotFound`], [`DispatchError::Unauthorized`],
    /// or [`DispatchError::ChannelMismatch`].
    pub fn bind_channel(&self, request: &ChannelBindRequest) -> Result<String, DispatchError> {
        let session = self
            .state
            .store()
            .get(&request.dock_id)
            .map_err(|_| DispatchError::NotFound)?;

        if !session.handshake_token.verify(&request.handshake_token) {
            warn!(dock_id = %request.dock_id, "handshake token mismatch on channel bind");
            return Err(DispatchError::Unauthorized);
        }
        if session.status.is_terminal() {
            return Err(DispatchError::NotFound);
        }
        if session.issued_channel_id != request.channel_id {
            return Err(DispatchError::ChannelMismatch);
        }

        let channel_id = request.channel_id.clone();
        self.state.store().update(&request.dock_id, &mut |s| {
            s.ensure_live()?;
            s.secure_channel_id = Some(channel_id.clone());
            Ok(())
        })?;

        debug!(dock_id = %request.dock_id, "persistent channel bound");
        Ok(request.channel_id.clone())
    }
}
