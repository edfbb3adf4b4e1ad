//! Request correlation for the persistent channel.
//!
//! The channel carries unrelated traffic interleaved; a caller matches
//! replies to requests by a caller-generated `request_id`. The
//! correlator owns the `request_id -> pending waiter` map and enforces
//! the delivery contract:
//!
//! - at most one reply is ever delivered per request id; duplicates and
//!   late replies are discarded, never double-delivered;
//! - every wait is bounded; a timed-out waiter removes its map entry so
//!   abandoned requests cannot accumulate;
//! - closing the channel fails *all* pending waiters immediately with
//!   [`CorrelationError::ChannelClosed`] instead of letting each one
//!   ride out its own timeout.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::oneshot;

/// Errors surfaced to a waiting caller.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CorrelationError {
    /// No reply arrived within the bounded wait.
    #[error("timed out after {timeout_ms} ms waiting for reply")]
    Timeout {
        /// The wait bound in milliseconds.
        timeout_ms: u64,
    },

    /// The channel closed before a reply arrived.
    #[error("channel closed before a reply arrived")]
    ChannelClosed,

    /// A waiter was already registered under this request id.
    #[error("request id already pending: {request_id}")]
    DuplicateRequestId {
        /// The conflicting id.
        request_id: String,
    },
}

/// Pending-waiter map for one channel.
///
/// Cloneable handle; all clones share the same map. Generic over the
/// reply type so the daemon and agent sides can reuse it.
#[derive(Debug)]
pub struct Correlator<R> {
    pending: Arc<Mutex<HashMap<String, oneshot::Sender<R>>>>,
}

impl<R> Clone for Correlator<R> {
    fn clone(&self) -> Self {
        Self {
            pending: Arc::clone(&self.pending),
        }
    }
}

impl<R: Send + 'static> Default for Correlator<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: Send + 'static> Correlator<R> {
    /// Create an empty correlator.
    #[must_use]
    pub fn new() -> Self {
        Self {
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Register a waiter for `request_id`.
    ///
    /// # Errors
    ///
    /// Returns [`CorrelationError::DuplicateRequestId`] if a waiter is
    /// already pending under that id.
    pub fn register(&self, request_id: impl Into<String>) -> Result<PendingReply<R>, CorrelationError> {
        let request_id = request_id.into();
        let (tx, rx) = oneshot::channel();

        let mut pending = self.pending.lock().expect("lock poisoned");
        if pending.contains_key(&request_id) {
            return Err(CorrelationError::DuplicateRequestId { request_id });
        }
        pending.insert(request_id.clone(), tx);
        drop(pending);

        Ok(PendingReply {
            request_id,
            rx,
            correlator: self.clone(),
        })
    }

    /// Deliver a reply to the waiter registered under `request_id`.
    ///
    /// Returns `false` when no waiter is pending (duplicate or late
    /// reply); the reply is discarded in that case.
    pub fn resolve(&self, request_id: &str, reply: R) -> bool {
        let sender = self
            .pending
            .lock()
            .expect("lock poisoned")
            .remove(request_id);
        match sender {
            // A send error means the waiter gave up between removal and
            // delivery; the reply is dropped either way.
            Some(tx) => tx.send(reply).is_ok(),
            None => {
                tracing::debug!(request_id, "discarding reply with no pending waiter");
                false
            },
        }
    }

    /// Fail every pending waiter immediately with
    /// [`CorrelationError::ChannelClosed`].
    ///
    /// Returns the number of waiters failed.
    pub fn fail_all(&self) -> usize {
        let mut pending = self.pending.lock().expect("lock poisoned");
        let count = pending.len();
        // Dropping the senders resolves every receiver with a closed
        // error in the same tick.
        pending.clear();
        count
    }

    /// Number of requests currently awaiting replies.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.lock().expect("lock poisoned").len()
    }

    fn abandon(&self, request_id: &str) {
        self.pending
            .lock()
            .expect("lock poisoned")
            .remove(request_id);
    }
}

/// A registered waiter. Await the reply with [`PendingReply::recv`].
#[derive(Debug)]
pub struct PendingReply<R> {
    request_id: String,
    rx: oneshot::Receiver<R>,
    correlator: Correlator<R>,
}

impl<R: Send + 'static> PendingReply<R> {
    /// The request id this waiter is registered under.
    #[must_use]
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Wait for the matching reply, bounded by `timeout`.
    ///
    /// On timeout the map entry is removed, so a reply arriving later
    /// is discarded rather than leaking a waiter.
    ///
    /// # Errors
    ///
    /// [`CorrelationError::Timeout`] if no reply arrives in time, or
    /// [`CorrelationError::ChannelClosed`] if the channel failed all
    /// waiters.
    pub async fn recv(self, timeout: Duration) -> Result<R, CorrelationError> {
        match tokio::time::timeout(timeout, self.rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_closed)) => Err(CorrelationError::ChannelClosed),
            Err(_elapsed) => {
                self.correlator.abandon(&self.request_id);
                Err(CorrelationError::Timeout {
                    timeout_ms: timeout.as_millis() as u64,
                })
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reply_reaches_matching_waiter() {
        let correlator: Correlator<String> = Correlator::new();
        let waiter = correlator.register("r1").unwrap();

        assert!(correlator.resolve("r1", "hello".to_string()));
        let reply = waiter.recv(Duration::from_secs(1)).await.unwrap();
        assert_eq!(reply, "hello");
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn reply_for_unknown_id_is_discarded() {
        let correlator: Correlator<String> = Correlator::new();
        let waiter = correlator.register("r1").unwrap();

        assert!(!correlator.resolve("r2", "stray".to_string()));
        // The registered waiter is unaffected.
        assert_eq!(correlator.pending_count(), 1);
        correlator.resolve("r1", "real".to_string());
        assert_eq!(waiter.recv(Duration::from_secs(1)).await.unwrap(), "real");
    }

    #[tokio::test]
    async fn duplicate_reply_is_not_double_delivered() {
        let correlator: Correlator<String> = Correlator::new();
        let waiter = correlator.register("r1").unwrap();

        assert!(correlator.resolve("r1", "first".to_string()));
        assert!(!correlator.resolve("r1", "second".to_string()));
        assert_eq!(waiter.recv(Duration::from_secs(1)).await.unwrap(), "first");
    }

    #[tokio::test]
    async fn duplicate_registration_is_rejected() {
        let correlator: Correlator<String> = Correlator::new();
        let _waiter = correlator.register("r1").unwrap();
        assert!(matches!(
            correlator.register("r1"),
            Err(CorrelationError::DuplicateRequestId { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_removes_the_map_entry() {
        let correlator: Correlator<String> = Correlator::new();
        let waiter = correlator.register("r1").unwrap();

        let err = waiter.recv(Duration::from_millis(50)).await.unwrap_err();
        assert!(matches!(err, CorrelationError::Timeout { timeout_ms: 50 }));
        assert_eq!(correlator.pending_count(), 0);

        // A late reply after the timeout is discarded.
        assert!(!correlator.resolve("r1", "late".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn channel_loss_fails_all_waiters_immediately() {
        let correlator: Correlator<String> = Correlator::new();
        let w1 = correlator.register("r1").unwrap();
        let w2 = correlator.register("r2").unwrap();
        let w3 = correlator.register("r3").unwrap();

        assert_eq!(correlator.fail_all(), 3);

        // All three fail with ChannelClosed well before their own
        // timeouts; a generous bound is given but never consumed.
        let start = tokio::time::Instant::now();
        for waiter in [w1, w2, w3] {
            let err = waiter.recv(Duration::from_secs(3600)).await.unwrap_err();
            assert_eq!(err, CorrelationError::ChannelClosed);
        }
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test]
    async fn fail_all_on_empty_map_is_zero() {
        let correlator: Correlator<()> = Correlator::new();
        assert_eq!(correlator.fail_all(), 0);
    }
}
