//! berth-agent - the remote worker side of the docking protocol.
//!
//! The agent establishes a session with the daemon, keeps it alive
//! with a heartbeat loop, opens a persistent channel for correlated
//! operations (reconnecting with a fixed delay on loss), and performs
//! a graceful session-completion handshake on shutdown.
//!
//! # State Machine
//!
//! ```text
//! DISCONNECTED ──▶ HANDSHAKING ──▶ DOCKED ──▶ DISCONNECTING ──▶ DISCONNECTED
//!                       ▲                          │
//!                       └───── redock (session ────┘
//!                              invalid observed)
//! ```

pub mod channel;
pub mod client;
pub mod error;
pub mod transport;

pub use channel::ChannelHandle;
pub use client::{AgentClient, AgentSettings, AgentState};
pub use error::ClientError;
