//! Credential issuance for dock sessions.
//!
//! Every session is identified by three values minted at establish time:
//! an opaque dock id, a high-entropy handshake token, and a channel id
//! used to bind a persistent-channel connection to the session. All
//! three are drawn from the operating system CSPRNG.
//!
//! # Security Considerations
//!
//! - Tokens carry 256 bits of entropy; guessing one within a session's
//!   practical lifetime is infeasible.
//! - If the randomness source is unavailable the issuer fails closed:
//!   no credentials are produced, weak or not.
//! - [`HandshakeToken`] never appears in `Debug` output and is only
//!   compared in constant time.

use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use thiserror::Error;
use uuid::Uuid;

/// Entropy carried by a handshake token, in bytes.
pub const TOKEN_ENTROPY_BYTES: usize = 32;

/// Errors from credential issuance.
#[derive(Debug, Error)]
pub enum TokenError {
    /// The OS randomness source refused to produce bytes.
    ///
    /// The issuer fails closed on this error; callers must not fall
    /// back to a weaker source.
    #[error("randomness source unavailable: {reason}")]
    RngUnavailable {
        /// Description of the RNG failure.
        reason: String,
    },
}

/// High-entropy shared secret proving continued ownership of a session.
///
/// The token is issued once at establish time and never rotated within
/// a session. It is presented on every subsequent call and compared in
/// constant time against the stored value.
#[derive(Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HandshakeToken(String);

impl HandshakeToken {
    /// Wrap an already-issued token value (e.g. received at establish).
    #[must_use]
    pub fn from_value(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Constant-time comparison against a presented token value.
    ///
    /// Returns `true` only on an exact match. The comparison does not
    /// reveal which byte differs, preventing timing side-channel
    /// enumeration of the token.
    #[must_use]
    pub fn verify(&self, presented: &str) -> bool {
        self.0.as_bytes().ct_eq(presented.as_bytes()).into()
    }

    /// Expose the raw token value for transmission to the peer.
    ///
    /// Only the establish response and outgoing operation envelopes
    /// should ever need this.
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for HandshakeToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("HandshakeToken(redacted)")
    }
}

/// Credentials minted for a newly established session.
#[derive(Debug, Clone)]
pub struct IssuedCredentials {
    /// Opaque session identifier, unique across all issuances.
    pub dock_id: String,

    /// Shared secret required on every subsequent call.
    pub handshake_token: HandshakeToken,

    /// Identifier the agent presents when binding its persistent
    /// channel to the session.
    pub channel_id: String,
}

/// Mints session credentials from the OS CSPRNG.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokenIssuer;

impl TokenIssuer {
    /// Create a new issuer.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Issue a fresh set of session credentials.
    ///
    /// # Errors
    ///
    /// Returns [`TokenError::RngUnavailable`] if the OS randomness
    /// source fails. No partial credentials are produced.
    pub fn issue(&self) -> Result<IssuedCredentials, TokenError> {
        let dock_id = format!("dock-{}", random_uuid()?.simple());
        let channel_id = format!("chan-{}", random_uuid()?.simple());

        let mut secret = [0u8; TOKEN_ENTROPY_BYTES];
        fill_random(&mut secret)?;

        Ok(IssuedCredentials {
            dock_id,
            handshake_token: HandshakeToken(hex::encode(secret)),
            channel_id,
        })
    }
}

/// Fill a buffer from the OS CSPRNG, failing closed on error.
fn fill_random(buf: &mut [u8]) -> Result<(), TokenError> {
    OsRng
        .try_fill_bytes(buf)
        .map_err(|e| TokenError::RngUnavailable {
            reason: e.to_string(),
        })
}

/// Build a v4-format UUID from explicitly checked OS randomness.
///
/// `Uuid::new_v4` aborts on RNG failure; drawing the bytes ourselves
/// keeps the fail-closed contract in the issuer's hands.
fn random_uuid() -> Result<Uuid, TokenError> {
    let mut bytes = [0u8; 16];
    fill_random(&mut bytes)?;
    Ok(uuid::Builder::from_random_bytes(bytes).into_uuid())
}
