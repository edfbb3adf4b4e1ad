//! Session lifecycle event fan-out.
//!
//! The dispatcher and the reaper publish lifecycle changes onto a
//! broadcast bus; audit and notification collaborators subscribe.
//! Publishing is explicit message passing, not callback registration:
//! a slow or absent subscriber never blocks the publisher.

use serde::Serialize;
use tokio::sync::broadcast;

/// Default buffered capacity of the event bus.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Lifecycle change of one dock session.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    /// A new session was established.
    Created {
        /// Session identifier.
        dock_id: String,
        /// Declared agent identity.
        agent_id: String,
    },

    /// A session left `PENDING` on its first heartbeat or operation.
    Activated {
        /// Session identifier.
        dock_id: String,
    },

    /// A patron verification succeeded on the session.
    PatronVerified {
        /// Session identifier.
        dock_id: String,
        /// Verified patron identity.
        patron_id: String,
    },

    /// The agent completed the session.
    Completed {
        /// Session identifier.
        dock_id: String,
    },

    /// The reaper demoted the session after heartbeat silence.
    TimedOut {
        /// Session identifier.
        dock_id: String,
        /// Seconds since the last heartbeat when reaped.
        idle_secs: i64,
    },

    /// The session failed irrecoverably.
    Failed {
        /// Session identifier.
        dock_id: String,
        /// Failure description.
        reason: String,
    },
}

impl SessionEvent {
    /// The dock id the event concerns.
    #[must_use]
    pub fn dock_id(&self) -> &str {
        match self {
            Self::Created { dock_id, .. }
            | Self::Activated { dock_id }
            | Self::PatronVerified { dock_id, .. }
            | Self::Completed { dock_id }
            | Self::TimedOut { dock_id, .. }
            | Self::Failed { dock_id, .. } => dock_id,
        }
    }
}

/// Broadcast bus for [`SessionEvent`]s.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<SessionEvent>,
}

impl EventBus {
    /// Create a bus with the default capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_EVENT_CAPACITY)
    }

    /// Create a bus buffering up to `capacity` events per subscriber.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish an event to all current subscribers.
    ///
    /// Publishing with no subscribers is not an error; the event is
    /// simply dropped.
    pub fn publish(&self, event: SessionEvent) {
        if self.sender.send(event).is_err() {
            tracing::trace!("no lifecycle event subscribers");
        }
    }

    /// Subscribe to lifecycle events from this point onward.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.publish(SessionEvent::Created {
            dock_id: "dock-1".to_string(),
            agent_id: "agent-1".to_string(),
        });
        bus.publish(SessionEvent::Completed {
            dock_id: "dock-1".to_string(),
        });

        assert!(matches!(rx.recv().await.unwrap(), SessionEvent::Created { .. }));
        assert!(matches!(
            rx.recv().await.unwrap(),
            SessionEvent::Completed { .. }
        ));
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_silent() {
        let bus = EventBus::new();
        bus.publish(SessionEvent::Activated {
            dock_id: "dock-1".to_string(),
        });
        // A late subscriber sees nothing from before it joined.
        let mut rx = bus.subscribe();
        bus.publish(SessionEvent::Completed {
            dock_id: "dock-1".to_string(),
        });
        assert!(matches!(
            rx.recv().await.unwrap(),
            SessionEvent::Completed { .. }
        ));
    }

    #[test]
    fn event_exposes_dock_id() {
        let event = SessionEvent::TimedOut {
            dock_id: "dock-9".to_string(),
            idle_secs: 301,
        };
        assert_eq!(event.dock_id(), "dock-9");
    }

    #[test]
    fn events_serialize_tagged() {
        let event = SessionEvent::PatronVerified {
            dock_id: "dock-1".to_string(),
            patron_id: "patron-1".to_string(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""event":"patron_verified""#));
    }
}
