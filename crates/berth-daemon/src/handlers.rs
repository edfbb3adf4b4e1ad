//! Business handlers for dock operations.
//!
//! Each handler applies its session mutation through the store's
//! atomic per-id update, records an audit event, and publishes a
//! lifecycle event where one applies. A handler that fails leaves the
//! stored session untouched.

use chrono::Utc;
use tracing::{error, info, warn};

use berth_core::audit::AuditRecord;
use berth_core::compliance::{ComplianceKind, ComplianceOutcome};
use berth_core::events::SessionEvent;
use berth_core::messages::{
    CompleteRequest, ComplianceRequest, DepositRequest, EstablishRequest, EstablishResponse,
    HeartbeatRequest, OperationEndpoints, OperationResponse, SessionSnapshot,
};
use berth_core::patron::{verify_credentials, PatronCredentials, VerifyOutcome};
use berth_core::session::{DockSession, DockStatus};

use crate::dispatch::DispatchError;
use crate::state::SharedState;

/// Establish a new dock session.
///
/// Validation happens before any state is created: a rejected request
/// never persists a partial session.
///
/// # Errors
///
/// [`DispatchError::InvalidRequest`] for validation failures,
/// [`DispatchError::Internal`] if the credential issuer fails closed.
pub fn establish(
    state: &SharedState,
    request: &EstablishRequest,
) -> Result<EstablishResponse, DispatchError> {
    request
        .validate()
        .map_err(|e| DispatchError::InvalidRequest {
            reason: e.to_string(),
        })?;

    let credentials = state.issuer().issue().map_err(|e| {
        // RNG failure: refuse to issue rather than degrade.
        error!(error = %e, "credential issuance failed; refusing establish");
        DispatchError::Internal {
            reason: e.to_string(),
        }
    })?;

    let now = Utc::now();
    let session = DockSession::new(
        &request.agent_id,
        request.capabilities.clone(),
        request.config.metadata.clone(),
        credentials,
        now,
    );

    let response = EstablishResponse {
        dock_id: session.dock_id.clone(),
        handshake_token: session.handshake_token.clone(),
        secure_channel_id: session.issued_channel_id.clone(),
        status: session.status,
        endpoints: OperationEndpoints::default(),
    };
    let dock_id = session.dock_id.clone();

    state.store().create(session)?;

    state.audit_sink().record(AuditRecord::new(
        "session_established",
        now,
        serde_json::json!({
            "dock_id": dock_id.clone(),
            "agent_id": request.agent_id.clone(),
            "capabilities": request.capabilities.clone(),
        }),
    ));
    state.events().publish(SessionEvent::Created {
        dock_id: dock_id.clone(),
        agent_id: request.agent_id.clone(),
    });
    info!(dock_id = %dock_id, agent_id = %request.agent_id, "session established");

    Ok(response)
}

/// Refresh a session's liveness deadline.
///
/// Idempotent on `(dock_id, sent_at)`: redelivery never extends the
/// deadline past the newest timestamp's effect.
pub(crate) fn heartbeat(
    state: &SharedState,
    dock_id: &str,
    request: &HeartbeatRequest,
) -> Result<OperationResponse, DispatchError> {
    let now = Utc::now();
    let mut promoted = false;
    let updated = state.store().update(dock_id, &mut |session| {
        promoted = session.record_heartbeat(request.sent_at, now)?;
        Ok(())
    })?;

    if promoted {
        state.events().publish(SessionEvent::Activated {
            dock_id: dock_id.to_string(),
        });
    }

    Ok(OperationResponse::HeartbeatAck {
        deadline: updated.reap_deadline(state.config().session_timeout_chrono()),
    })
}

/// Verify patron credentials and bind the grant to the session.
///
/// A credential mismatch is a normal outcome (`verified=false`); only
/// a stale timestamp is a hard rejection.
pub(crate) fn verify_patron(
    state: &SharedState,
    dock_id: &str,
    credentials: &PatronCredentials,
) -> Result<OperationResponse, DispatchError> {
    let now = Utc::now();
    let outcome = verify_credentials(
        state.oracle(),
        credentials,
        now,
        state.config().replay_window(),
    )?;

    match outcome {
        VerifyOutcome::Mismatch => {
            state.audit_sink().record(AuditRecord::new(
                "patron_verification_failed",
                now,
                serde_json::json!({
                    "dock_id": dock_id,
                    "identity": credentials.identity.clone(),
                }),
            ));
            warn!(dock_id, identity = %credentials.identity, "patron verification failed");
            Ok(OperationResponse::PatronVerification {
                verified: false,
                patron_id: None,
                permissions: Default::default(),
            })
        },
        VerifyOutcome::Verified(grant) => {
            let mut promoted = false;
            state.store().update(dock_id, &mut |session| {
                let was_pending = session.status == DockStatus::Pending;
                session.bind_patron(&grant.patron_id, grant.permissions.clone(), now)?;
                promoted = was_pending;
                Ok(())
            })?;

            state.audit_sink().record(AuditRecord::new(
                "patron_verified",
                now,
                serde_json::json!({
                    "dock_id": dock_id,
                    "patron_id": grant.patron_id.clone(),
                }),
            ));
            if promoted {
                state.events().publish(SessionEvent::Activated {
                    dock_id: dock_id.to_string(),
                });
            }
            state.events().publish(SessionEvent::PatronVerified {
                dock_id: dock_id.to_string(),
                patron_id: grant.patron_id.clone(),
            });
            info!(dock_id, patron_id = %grant.patron_id, "patron verified");

            Ok(OperationResponse::PatronVerification {
                verified: true,
                patron_id: Some(grant.patron_id),
                permissions: grant.permissions,
            })
        },
    }
}

/// Accept a data deposit.
pub(crate) fn deposit(
    state: &SharedState,
    dock_id: &str,
    request: &DepositRequest,
) -> Result<OperationResponse, DispatchError> {
    let size = serde_json::to_vec(&request.payload)
        .map_err(|e| DispatchError::Internal {
            reason: e.to_string(),
        })?
        .len();
    let max = state.config().max_deposit_bytes;
    if size > max {
        return Err(DispatchError::PayloadTooLarge { size, max });
    }

    let now = Utc::now();
    let mut promoted = false;
    let updated = state.store().update(dock_id, &mut |session| {
        promoted = session.mark_active(now)?;
        session.deposits += 1;
        Ok(())
    })?;

    if promoted {
        state.events().publish(SessionEvent::Activated {
            dock_id: dock_id.to_string(),
        });
    }
    state.audit_sink().record(AuditRecord::new(
        "deposit_accepted",
        now,
        serde_json::json!({
            "dock_id": dock_id,
            "bytes": size,
            "deposits": updated.deposits,
        }),
    ));

    Ok(OperationResponse::Deposit {
        accepted: true,
        deposits: updated.deposits,
    })
}

/// Handle a compliance request.
///
/// Requires a verified patron on the session; the rejection itself is
/// still audit-logged. Every request, whatever its outcome, appends an
/// audit entry carrying requester identity, request type, and
/// timestamp.
pub(crate) fn compliance(
    state: &SharedState,
    dock_id: &str,
    session: &DockSession,
    request: &ComplianceRequest,
) -> Result<OperationResponse, DispatchError> {
    let now = Utc::now();
    let audit_base = serde_json::json!({
        "dock_id": dock_id,
        "requester": session.agent_id.clone(),
        "request_type": request.kind.to_string(),
    });

    let record_outcome = |outcome: &str, patron_id: Option<&str>| {
        let mut data = audit_base.clone();
        if let Some(map) = data.as_object_mut() {
            map.insert("outcome".to_string(), outcome.into());
            if let Some(patron_id) = patron_id {
                map.insert("patron_id".to_string(), patron_id.into());
            }
        }
        state
            .audit_sink()
            .record(AuditRecord::new("compliance_request", now, data));
    };

    if !session.patron_verified {
        record_outcome("denied_patron_not_verified", None);
        return Err(DispatchError::PatronNotVerified);
    }
    let Some(patron_id) = session.patron_id.as_deref() else {
        record_outcome("denied_patron_not_verified", None);
        return Err(DispatchError::PatronNotVerified);
    };

    let outcome = match request.kind {
        ComplianceKind::Access | ComplianceKind::Portability => ComplianceOutcome::Export {
            entries: state.patron_data().export(patron_id),
        },
        ComplianceKind::Erasure => ComplianceOutcome::Erased {
            removed: state.patron_data().erase(patron_id),
        },
        ComplianceKind::Rectification => {
            let (Some(field), Some(value)) = (&request.field, &request.value) else {
                record_outcome("invalid_request", Some(patron_id));
                return Err(DispatchError::InvalidRequest {
                    reason: "rectification requires `field` and `value`".to_string(),
                });
            };
            ComplianceOutcome::Rectified {
                applied: state.patron_data().rectify(patron_id, field, value.clone()),
            }
        },
    };

    record_outcome("ok", Some(patron_id));
    info!(dock_id, kind = %request.kind, "compliance request handled");
    Ok(OperationResponse::Compliance(outcome))
}

/// Complete the session with a final result.
pub(crate) fn complete(
    state: &SharedState,
    dock_id: &str,
    request: &CompleteRequest,
) -> Result<OperationResponse, DispatchError> {
    let now = Utc::now();
    let updated = state.store().update(dock_id, &mut |session| {
        session.result = Some(request.result.clone());
        session.transition(DockStatus::Completed, now)
    })?;

    state.audit_sink().record(AuditRecord::new(
        "session_completed",
        now,
        serde_json::json!({ "dock_id": dock_id }),
    ));
    state.events().publish(SessionEvent::Completed {
        dock_id: dock_id.to_string(),
    });
    info!(dock_id, "session completed");

    Ok(OperationResponse::Completed {
        completed_at: updated.completed_at.unwrap_or(now),
    })
}

/// Read-only session status.
pub(crate) fn status(
    state: &SharedState,
    dock_id: &str,
) -> Result<OperationResponse, DispatchError> {
    let session = state
        .store()
        .get(dock_id)
        .map_err(|_| DispatchError::NotFound)?;
    Ok(OperationResponse::Status(SessionSnapshot::from(&session)))
}
