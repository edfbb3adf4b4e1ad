//! Dock session model and lifecycle rules.
//!
//! A [`DockSession`] is the authoritative record of one agent's
//! attachment to the daemon. Sessions move through a monotonic status
//! machine:
//!
//! ```text
//! PENDING ──▶ ACTIVE ──▶ COMPLETED
//!    │           │
//!    └───────────┴──────▶ TIMEOUT / ERROR   (terminal)
//! ```
//!
//! # Invariants
//!
//! - Status transitions are monotonic: nothing leaves `COMPLETED`,
//!   `TIMEOUT`, or `ERROR`, and no transition skips backward.
//! - `PENDING → ACTIVE` happens on the first successful heartbeat or
//!   operation; `ACTIVE → COMPLETED` only via the explicit completion
//!   call; demotion to `TIMEOUT` only via the heartbeat reaper.
//! - Heartbeat refresh is idempotent on `(dock_id, timestamp)`: a
//!   duplicate or older timestamp never extends the deadline beyond the
//!   newest timestamp's effect.
//! - `patron_verified` can only be set through a successful verification
//!   bound to this session; it is never copied between sessions.

use std::collections::BTreeSet;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::token::{HandshakeToken, IssuedCredentials};

/// Lifecycle status of a dock session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DockStatus {
    /// Established but not yet heartbeated or operated on.
    #[serde(rename = "PENDING")]
    Pending,

    /// Live: heartbeats or operations observed within the timeout.
    #[serde(rename = "ACTIVE")]
    Active,

    /// Closed by the agent's explicit completion call. Terminal.
    #[serde(rename = "COMPLETED")]
    Completed,

    /// Demoted by the reaper after heartbeat silence. Terminal.
    #[serde(rename = "TIMEOUT")]
    TimedOut,

    /// Failed irrecoverably. Terminal.
    #[serde(rename = "ERROR")]
    Error,
}

impl DockStatus {
    /// Returns `true` for statuses that accept no further mutation.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::TimedOut | Self::Error)
    }

    /// Returns `true` if a transition from `self` to `next` is allowed.
    ///
    /// `PENDING → COMPLETED` is permitted directly so an agent that
    /// never went live can still close out cleanly.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Active)
                | (Self::Pending, Self::Completed)
                | (Self::Pending, Self::TimedOut)
                | (Self::Pending, Self::Error)
                | (Self::Active, Self::Completed)
                | (Self::Active, Self::TimedOut)
                | (Self::Active, Self::Error)
        )
    }
}

impl std::fmt::Display for DockStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "PENDING",
            Self::Active => "ACTIVE",
            Self::Completed => "COMPLETED",
            Self::TimedOut => "TIMEOUT",
            Self::Error => "ERROR",
        };
        f.write_str(s)
    }
}

/// Categories of operations an agent can declare support for.
///
/// Declared at establish time. Advisory: used for routing diagnostics,
/// not enforced as a hard allow-list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationCategory {
    /// Patron verification.
    Patron,
    /// Data deposits.
    Deposit,
    /// Compliance requests.
    Compliance,
    /// Heartbeat, status, and completion.
    Lifecycle,
}

/// Session lifecycle violations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// The requested status transition is not in the lifecycle graph.
    #[error("invalid session transition: {from} -> {to}")]
    InvalidTransition {
        /// Status before the attempted transition.
        from: DockStatus,
        /// Requested next status.
        to: DockStatus,
    },

    /// The session is terminal and accepts no further operations.
    #[error("session is terminal ({status}); no further operations accepted")]
    Terminal {
        /// The terminal status the session is in.
        status: DockStatus,
    },
}

/// Authoritative record of one agent's attachment to the daemon.
#[derive(Debug, Clone)]
pub struct DockSession {
    /// Opaque unique session identifier, immutable after establish.
    pub dock_id: String,

    /// Caller-supplied logical identity. Not authenticated beyond the
    /// handshake token.
    pub agent_id: String,

    /// Shared secret required on every subsequent call.
    pub handshake_token: HandshakeToken,

    /// Channel identifier issued at establish time. The agent must
    /// present it when binding its persistent channel.
    pub issued_channel_id: String,

    /// Channel identifier actually bound to this session. Absent until
    /// the agent opens its persistent channel; stays absent for
    /// sessions that only use the synchronous transport.
    pub secure_channel_id: Option<String>,

    /// Current lifecycle status.
    pub status: DockStatus,

    /// Operation categories the agent declared at establish time.
    pub capabilities: BTreeSet<OperationCategory>,

    /// Establish timestamp.
    pub created_at: DateTime<Utc>,

    /// Most recent heartbeat (or establish time, before the first one).
    pub last_heartbeat: DateTime<Utc>,

    /// Completion timestamp, once `COMPLETED`.
    pub completed_at: Option<DateTime<Utc>>,

    /// Verified patron identity, once a verification succeeds.
    pub patron_id: Option<String>,

    /// Whether a patron verification has succeeded on this session.
    pub patron_verified: bool,

    /// Permissions granted by the successful verification.
    pub permissions: BTreeSet<String>,

    /// Final payload recorded by the completion call.
    pub result: Option<serde_json::Value>,

    /// Number of deposits accepted on this session.
    pub deposits: u64,

    /// Free-form agent metadata captured at establish time.
    pub metadata: serde_json::Value,
}

impl DockSession {
    /// Create a new `PENDING` session from freshly issued credentials.
    #[must_use]
    pub fn new(
        agent_id: impl Into<String>,
        capabilities: BTreeSet<OperationCategory>,
        metadata: serde_json::Value,
        credentials: IssuedCredentials,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            dock_id: credentials.dock_id,
            agent_id: agent_id.into(),
            handshake_token: credentials.handshake_token,
            issued_channel_id: credentials.channel_id,
            secure_channel_id: None,
            status: DockStatus::Pending,
            capabilities,
            created_at: now,
            last_heartbeat: now,
            completed_at: None,
            patron_id: None,
            patron_verified: false,
            permissions: BTreeSet::new(),
            result: None,
            deposits: 0,
            metadata,
        }
    }

    /// Apply a status transition, enforcing monotonicity.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Terminal`] if the session is already in
    /// a terminal status, or [`SessionError::InvalidTransition`] if the
    /// transition is not in the lifecycle graph.
    pub fn transition(&mut self, next: DockStatus, now: DateTime<Utc>) -> Result<(), SessionError> {
        if self.status.is_terminal() {
            return Err(SessionError::Terminal {
                status: self.status,
            });
        }
        if !self.status.can_transition_to(next) {
            return Err(SessionError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        if next == DockStatus::Completed {
            self.completed_at = Some(now);
        }
        Ok(())
    }

    /// Reject any mutation on a terminal session.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Terminal`] if the session is terminal.
    pub fn ensure_live(&self) -> Result<(), SessionError> {
        if self.status.is_terminal() {
            return Err(SessionError::Terminal {
                status: self.status,
            });
        }
        Ok(())
    }

    /// Promote `PENDING` to `ACTIVE`. No-op when already `ACTIVE`.
    ///
    /// Returns `true` if a promotion happened (callers publish the
    /// activation event exactly once).
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Terminal`] if the session is terminal.
    pub fn mark_active(&mut self, now: DateTime<Utc>) -> Result<bool, SessionError> {
        self.ensure_live()?;
        if self.status == DockStatus::Pending {
            self.transition(DockStatus::Active, now)?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Record a heartbeat carrying the client's send timestamp.
    ///
    /// Idempotent on the timestamp: duplicate delivery of the same
    /// heartbeat (e.g. from a naive retry) never double-extends the
    /// deadline, and an older timestamp never rewinds it. Timestamps
    /// from the future are clamped to `now` so a skewed client cannot
    /// buy itself extra lifetime.
    ///
    /// Returns `true` if the heartbeat promoted the session out of
    /// `PENDING`.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Terminal`] if the session is terminal.
    pub fn record_heartbeat(
        &mut self,
        sent_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool, SessionError> {
        self.ensure_live()?;
        let effective = sent_at.min(now);
        if effective > self.last_heartbeat {
            self.last_heartbeat = effective;
        }
        self.mark_active(now)
    }

    /// The instant at which this session becomes eligible for reaping.
    #[must_use]
    pub fn reap_deadline(&self, timeout: Duration) -> DateTime<Utc> {
        self.last_heartbeat + timeout
    }

    /// Returns `true` if the session has been silent past `timeout`.
    #[must_use]
    pub fn is_stale(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        !self.status.is_terminal() && now - self.last_heartbeat > timeout
    }

    /// Bind a successful patron verification to this session.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Terminal`] if the session is terminal.
    pub fn bind_patron(
        &mut self,
        patron_id: impl Into<String>,
        permissions: BTreeSet<String>,
        now: DateTime<Utc>,
    ) -> Result<(), SessionError> {
        self.ensure_live()?;
        self.patron_id = Some(patron_id.into());
        self.patron_verified = true;
        self.permissions = permissions;
        self.mark_active(now)?;
        Ok(())
    }
}
