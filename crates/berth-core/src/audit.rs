//! Append-only audit log.
//!
//! Audit records are the shape external collaborators consume:
//! `{event_type, timestamp, data}`. The log is write-once from the
//! router's perspective: entries are only appended, never mutated, and
//! capacity is enforced by evicting the oldest entries.

use std::collections::VecDeque;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Default capacity of the in-memory audit log.
pub const DEFAULT_AUDIT_CAPACITY: usize = 1024;

/// One audit event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    /// Event type, e.g. `session_established` or `compliance_request`.
    pub event_type: String,

    /// When the event was recorded.
    pub timestamp: DateTime<Utc>,

    /// Free-form event payload.
    pub data: serde_json::Value,
}

impl AuditRecord {
    /// Build a record stamped with the given time.
    #[must_use]
    pub fn new(
        event_type: impl Into<String>,
        timestamp: DateTime<Utc>,
        data: serde_json::Value,
    ) -> Self {
        Self {
            event_type: event_type.into(),
            timestamp,
            data,
        }
    }
}

/// Sink for audit events.
///
/// Implementations must be append-only: a recorded event is never
/// altered afterwards.
pub trait AuditSink: Send + Sync {
    /// Append one record.
    fn record(&self, record: AuditRecord);
}

/// Bounded in-memory audit log.
///
/// Oldest entries are evicted once capacity is reached; entries are
/// never mutated in place.
#[derive(Debug)]
pub struct InMemoryAuditLog {
    entries: Mutex<VecDeque<AuditRecord>>,
    capacity: usize,
}

impl InMemoryAuditLog {
    /// Create a log with the default capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_AUDIT_CAPACITY)
    }

    /// Create a log holding at most `capacity` entries.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity: capacity.max(1),
        }
    }

    /// Snapshot of all retained entries, oldest first.
    #[must_use]
    pub fn snapshot(&self) -> Vec<AuditRecord> {
        self.entries
            .lock()
            .expect("lock poisoned")
            .iter()
            .cloned()
            .collect()
    }

    /// Number of retained entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().expect("lock poisoned").len()
    }

    /// Returns `true` if no entries are retained.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for InMemoryAuditLog {
    fn default() -> Self {
        Self::new()
    }
}

impl AuditSink for InMemoryAuditLog {
    fn record(&self, record: AuditRecord) {
        let mut entries = self.entries.lock().expect("lock poisoned");
        while entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(record);
    }
}
