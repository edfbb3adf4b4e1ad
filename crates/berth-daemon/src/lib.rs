//! berth-daemon - coordinating server for the agent docking protocol.
//!
//! The daemon accepts agent connections on a Unix domain socket,
//! establishes dock sessions, validates the handshake token on every
//! subsequent call, dispatches typed operations to business handlers,
//! and demotes heartbeat-silent sessions via a background reaper.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────┐   frames    ┌──────────────────┐
//! │ SocketManager  │──────────▶│ connection_handler │
//! └───────────────┘            └────────┬─────────┘
//!                                       │ OperationRequest
//!                                       ▼
//!                              ┌──────────────────┐
//!                              │ OperationRouter   │── token check
//!                              └────────┬─────────┘   (constant time)
//!                                       │
//!                    ┌──────────────────┼──────────────────┐
//!                    ▼                  ▼                  ▼
//!               handlers          SessionStore        audit/events
//!
//!               HeartbeatReaper ──▶ SessionStore (independent task)
//! ```

pub mod dispatch;
pub mod handlers;
pub mod protocol;
pub mod reaper;
pub mod state;

pub use dispatch::OperationRouter;
pub use reaper::HeartbeatReaper;
pub use state::{DaemonState, SharedState};
