//! Heartbeat reaper.
//!
//! The reaper is the *only* path by which a session is demoted for
//! inactivity; handlers never time sessions out themselves. It runs on
//! a fixed period, independent of request handling, and sweeps every
//! non-terminal session: `PENDING` sessions that never went live are
//! reaped under the same rule as `ACTIVE` ones.
//!
//! Each sweep snapshots candidate ids first and then demotes them one
//! at a time through the store's atomic update, so a slow mutation on
//! one session never delays reaping of the others, and a heartbeat
//! racing the sweep wins (the staleness check is repeated inside the
//! update).

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use berth_core::audit::AuditRecord;
use berth_core::events::SessionEvent;
use berth_core::session::DockStatus;
use berth_core::store::SessionFilter;

use crate::state::SharedState;

/// Background task demoting heartbeat-silent sessions to `TIMEOUT`.
pub struct HeartbeatReaper {
    state: SharedState,
}

impl HeartbeatReaper {
    /// Create a reaper over the shared daemon state.
    ///
    /// Period and timeout come from the state's configuration.
    #[must_use]
    pub const fn new(state: SharedState) -> Self {
        Self { state }
    }

    /// Run the sweep loop until `shutdown` flips to `true`.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let period = self.state.config().reaper_period();
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        info!(period_secs = period.as_secs(), "heartbeat reaper started");

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let reaped = self.sweep(Utc::now());
                    if reaped > 0 {
                        debug!(reaped, "reaper sweep complete");
                    }
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("heartbeat reaper stopped");
                        return;
                    }
                },
            }
        }
    }

    /// Sweep once: demote every stale non-terminal session.
    ///
    /// Returns the number of sessions demoted. Exposed for tests and
    /// callable without a runtime.
    pub fn sweep(&self, now: DateTime<Utc>) -> usize {
        let timeout = self.state.config().session_timeout_chrono();

        // Snapshot candidates without holding any per-session state;
        // the authoritative staleness decision happens inside each
        // atomic update.
        let candidates: Vec<String> = self
            .state
            .store()
            .list(&SessionFilter::live())
            .into_iter()
            .filter(|s| s.is_stale(now, timeout))
            .map(|s| s.dock_id)
            .collect();

        let mut reaped = 0;
        for dock_id in candidates {
            let mut demoted = false;
            let result = self.state.store().update(&dock_id, &mut |session| {
                // Re-check under the lock: a heartbeat that landed
                // between snapshot and update keeps the session alive.
                if session.is_stale(now, timeout) {
                    session.transition(DockStatus::TimedOut, now)?;
                    demoted = true;
                }
                Ok(())
            });

            match result {
                Ok(session) if demoted => {
                    let idle_secs = (now - session.last_heartbeat).num_seconds();
                    warn!(dock_id = %dock_id, idle_secs, "session timed out");
                    self.state.audit_sink().record(AuditRecord::new(
                        "session_timeout",
                        now,
                        serde_json::json!({
                            "dock_id": dock_id.clone(),
                            "idle_secs": idle_secs,
                        }),
                    ));
                    self.state.events().publish(SessionEvent::TimedOut {
                        dock_id,
                        idle_secs,
                    });
                    reaped += 1;
                },
                Ok(_) => {},
                // Session vanished or turned terminal between snapshot
                // and update; nothing to do.
                Err(e) => debug!(dock_id = %dock_id, error = %e, "skipping reap"),
            }
        }
        reaped
    }
}
