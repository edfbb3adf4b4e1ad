//! Shared daemon state.
//!
//! One [`DaemonState`] bundle is built at startup and shared across
//! connection handlers and the reaper behind an `Arc`. The session
//! store is the only shared mutable resource; everything else is
//! either immutable configuration or append/publish-only.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use secrecy::ExposeSecret;

use berth_core::audit::{AuditSink, InMemoryAuditLog};
use berth_core::compliance::{InMemoryPatronData, PatronDataStore};
use berth_core::config::BerthConfig;
use berth_core::events::EventBus;
use berth_core::patron::{CredentialOracle, InMemoryCredentialOracle};
use berth_core::store::{InMemorySessionStore, SessionStore};
use berth_core::token::TokenIssuer;

/// Shared daemon state handle.
pub type SharedState = Arc<DaemonState>;

/// Everything the handlers and the reaper operate on.
pub struct DaemonState {
    config: BerthConfig,
    store: Arc<dyn SessionStore>,
    audit: Arc<InMemoryAuditLog>,
    events: EventBus,
    oracle: Arc<dyn CredentialOracle>,
    patron_data: Arc<dyn PatronDataStore>,
    issuer: TokenIssuer,
    started_at: DateTime<Utc>,
}

impl DaemonState {
    /// Build daemon state from configuration.
    ///
    /// Patron identities from the config are registered with the
    /// credential oracle; the secrets themselves are not retained.
    #[must_use]
    pub fn new(config: BerthConfig) -> Self {
        let oracle = InMemoryCredentialOracle::new();
        for seed in &config.patrons {
            oracle.register(
                &seed.identity,
                seed.secret.expose_secret(),
                &seed.patron_id,
                seed.permissions.iter().cloned().collect(),
            );
        }

        let audit = Arc::new(InMemoryAuditLog::with_capacity(config.audit_capacity));

        Self {
            config,
            store: Arc::new(InMemorySessionStore::new()),
            audit,
            events: EventBus::new(),
            oracle: Arc::new(oracle),
            patron_data: Arc::new(InMemoryPatronData::new()),
            issuer: TokenIssuer::new(),
            started_at: Utc::now(),
        }
    }

    /// Shared handle to this state.
    #[must_use]
    pub fn shared(self) -> SharedState {
        Arc::new(self)
    }

    /// Daemon configuration.
    #[must_use]
    pub const fn config(&self) -> &BerthConfig {
        &self.config
    }

    /// The session store.
    #[must_use]
    pub fn store(&self) -> &dyn SessionStore {
        self.store.as_ref()
    }

    /// The audit log.
    #[must_use]
    pub fn audit(&self) -> &InMemoryAuditLog {
        &self.audit
    }

    /// The audit log as a sink.
    #[must_use]
    pub fn audit_sink(&self) -> &dyn AuditSink {
        self.audit.as_ref()
    }

    /// The lifecycle event bus.
    #[must_use]
    pub const fn events(&self) -> &EventBus {
        &self.events
    }

    /// The credential-verification oracle.
    #[must_use]
    pub fn oracle(&self) -> &dyn CredentialOracle {
        self.oracle.as_ref()
    }

    /// The patron-scoped data store.
    #[must_use]
    pub fn patron_data(&self) -> &dyn PatronDataStore {
        self.patron_data.as_ref()
    }

    /// The credential issuer.
    #[must_use]
    pub const fn issuer(&self) -> &TokenIssuer {
        &self.issuer
    }

    /// Daemon start time.
    #[must_use]
    pub const fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }
}
