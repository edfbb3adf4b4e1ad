//! UDS protocol and framing module.
//!
//! The protocol stack is organized in layers:
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │         Application Messages             │  JSON envelopes
//! ├─────────────────────────────────────────┤
//! │              Framing                     │  Length-prefixed
//! ├─────────────────────────────────────────┤
//! │            UDS Transport                 │  Unix socket
//! └─────────────────────────────────────────┘
//! ```
//!
//! - [`error`]: protocol error types ([`ProtocolError`], [`ProtocolResult`])
//! - [`server`]: socket manager and framed connections
//! - [`connection_handler`]: per-connection request loop and the
//!   persistent-channel mode

pub mod connection_handler;
pub mod error;
pub mod server;

pub use connection_handler::{handle_connection, serve};
pub use error::{ProtocolError, ProtocolResult};
pub use server::{Connection, ConnectionPermit, SocketManager, SocketManagerConfig};
