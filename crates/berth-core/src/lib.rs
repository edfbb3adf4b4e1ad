//! berth-core - shared types for the berth docking protocol.
//!
//! This crate holds everything both sides of the dock protocol agree on:
//! the session data model and its lifecycle rules, the wire message
//! envelopes, credential issuance and verification, the session store
//! contract, the audit log, lifecycle event fan-out, and the request
//! correlator used by the persistent-channel transport.
//!
//! # Crate Layout
//!
//! - [`token`]: credential issuance (dock id, handshake token, channel id)
//! - [`session`]: the [`session::DockSession`] model and status machine
//! - [`store`]: the [`store::SessionStore`] contract and in-memory impl
//! - [`messages`]: wire envelopes for both transports
//! - [`patron`]: patron credential verification
//! - [`compliance`]: compliance request types and patron data store
//! - [`audit`]: append-only audit log
//! - [`events`]: session lifecycle event bus
//! - [`correlator`]: request-id correlation for the persistent channel
//! - [`config`]: TOML configuration

pub mod audit;
pub mod compliance;
pub mod config;
pub mod correlator;
pub mod events;
pub mod messages;
pub mod patron;
pub mod session;
pub mod store;
pub mod token;

pub use config::BerthConfig;
pub use session::{DockSession, DockStatus};
pub use store::{SessionStore, StoreError};
pub use token::{HandshakeToken, TokenIssuer};
