//! Compliance request types and the patron-scoped data store.
//!
//! Compliance operations act on data keyed by a verified patron
//! identity: `access` and `portability` export it read-only, `erasure`
//! removes it, and `rectification` corrects a single field. Gating on
//! patron verification happens in the dispatcher; this module only
//! defines the request shapes and the store the handlers act on.

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of compliance request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComplianceKind {
    /// Read-only export of patron-scoped data.
    Access,
    /// Removal of patron-scoped data.
    Erasure,
    /// Machine-portable export of patron-scoped data.
    Portability,
    /// Correction of one stored field.
    Rectification,
}

impl std::fmt::Display for ComplianceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Access => "access",
            Self::Erasure => "erasure",
            Self::Portability => "portability",
            Self::Rectification => "rectification",
        };
        f.write_str(s)
    }
}

/// One patron-scoped data entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatronEntry {
    /// Field key.
    pub key: String,

    /// Stored value.
    pub value: serde_json::Value,

    /// When the value was recorded.
    pub recorded_at: DateTime<Utc>,
}

/// Outcome of a compliance request, returned to the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ComplianceOutcome {
    /// Export produced by `access` or `portability`.
    Export {
        /// All entries recorded for the patron.
        entries: Vec<PatronEntry>,
    },

    /// Confirmation of an `erasure`; the data itself is not returned.
    Erased {
        /// Number of entries removed.
        removed: usize,
    },

    /// Result of a `rectification`.
    Rectified {
        /// `true` if the field existed and was corrected.
        applied: bool,
    },
}

/// Store of patron-scoped data acted on by compliance handlers.
pub trait PatronDataStore: Send + Sync {
    /// Record an entry for a patron.
    fn insert(&self, patron_id: &str, entry: PatronEntry);

    /// Export all entries for a patron, read-only.
    fn export(&self, patron_id: &str) -> Vec<PatronEntry>;

    /// Remove all entries for a patron; returns the removed count.
    fn erase(&self, patron_id: &str) -> usize;

    /// Correct one field; returns `false` if the field does not exist.
    fn rectify(&self, patron_id: &str, key: &str, value: serde_json::Value) -> bool;
}

/// In-memory patron data store.
#[derive(Debug, Default)]
pub struct InMemoryPatronData {
    entries: RwLock<HashMap<String, BTreeMap<String, PatronEntry>>>,
}

impl InMemoryPatronData {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl PatronDataStore for InMemoryPatronData {
    fn insert(&self, patron_id: &str, entry: PatronEntry) {
        let mut entries = self.entries.write().expect("lock poisoned");
        entries
            .entry(patron_id.to_string())
            .or_default()
            .insert(entry.key.clone(), entry);
    }

    fn export(&self, patron_id: &str) -> Vec<PatronEntry> {
        let entries = self.entries.read().expect("lock poisoned");
        entries
            .get(patron_id)
            .map(|fields| fields.values().cloned().collect())
            .unwrap_or_default()
    }

    fn erase(&self, patron_id: &str) -> usize {
        let mut entries = self.entries.write().expect("lock poisoned");
        entries.remove(patron_id).map_or(0, |fields| fields.len())
    }

    fn rectify(&self, patron_id: &str, key: &str, value: serde_json::Value) -> bool {
        let mut entries = self.entries.write().expect("lock poisoned");
        match entries.get_mut(patron_id).and_then(|fields| fields.get_mut(key)) {
            Some(entry) => {
                entry.value = value;
                true
            },
            None => false,
        }
    }
}
