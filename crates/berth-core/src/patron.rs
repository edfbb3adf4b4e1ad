//! Patron credential verification.
//!
//! A session acts on behalf of a patron only after the agent presents
//! `{identity, secret, timestamp, signature}` and every check passes:
//!
//! 1. The timestamp must fall inside a short validity window (replay
//!    mitigation). Outside the window is a hard rejection, not a
//!    verification failure.
//! 2. The signature must equal HMAC-SHA256 over `identity` and the
//!    timestamp, keyed by the secret, proving the tuple was not
//!    spliced together from parts.
//! 3. The credential digest must match the oracle's stored digest for
//!    that identity.
//!
//! A failed check in steps 2-3 is a normal outcome (`verified=false`),
//! distinct from a malformed request. All digest and signature
//! comparisons are constant-time.

use std::collections::{BTreeSet, HashMap};
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// Domain separator for credential digests.
const DIGEST_DOMAIN: &[u8] = b"berth.patron.credential.v1";

/// Credentials presented by an agent to verify a patron.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PatronCredentials {
    /// Patron identity being claimed.
    pub identity: String,

    /// Shared secret for that identity.
    pub secret: String,

    /// Client timestamp; must be fresh (replay window).
    pub timestamp: DateTime<Utc>,

    /// Hex-encoded HMAC-SHA256 over `identity` and `timestamp`,
    /// keyed by `secret`.
    pub signature: String,
}

/// Grant bound to a session after a successful verification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatronGrant {
    /// Verified patron identity.
    pub patron_id: String,

    /// Permissions scoped to the verifying session.
    pub permissions: BTreeSet<String>,
}

/// Stored verification material for one identity.
#[derive(Debug, Clone)]
pub struct PatronRecord {
    /// Expected credential digest for the identity.
    pub credential_digest: [u8; 32],

    /// Patron id granted on success.
    pub patron_id: String,

    /// Permissions granted on success.
    pub permissions: BTreeSet<String>,
}

/// Hard errors from verification (not `verified=false` outcomes).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PatronError {
    /// The credential timestamp is outside the validity window.
    ///
    /// This is a hard rejection: the router must not retry it
    /// automatically.
    #[error("credential timestamp is {age_secs}s old, outside the {window_secs}s validity window")]
    StaleTimestamp {
        /// Absolute age of the timestamp in seconds.
        age_secs: i64,
        /// Configured validity window in seconds.
        window_secs: i64,
    },
}

/// Outcome of a verification attempt that passed the replay check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyOutcome {
    /// Credentials matched; the grant should be bound to the session.
    Verified(PatronGrant),

    /// Credentials did not match. A normal outcome, reported to the
    /// caller as `verified=false`.
    Mismatch,
}

/// Credential-verification oracle: opaque pass/fail plus identity.
pub trait CredentialOracle: Send + Sync {
    /// Look up the stored record for an identity, if any.
    fn lookup(&self, identity: &str) -> Option<PatronRecord>;
}

/// In-memory credential oracle.
#[derive(Debug, Default)]
pub struct InMemoryCredentialOracle {
    records: RwLock<HashMap<String, PatronRecord>>,
}

impl InMemoryCredentialOracle {
    /// Create an empty oracle.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an identity with its secret and grant.
    ///
    /// The secret itself is not retained; only its digest is stored.
    pub fn register(
        &self,
        identity: impl Into<String>,
        secret: &str,
        patron_id: impl Into<String>,
        permissions: BTreeSet<String>,
    ) {
        let identity = identity.into();
        let record = PatronRecord {
            credential_digest: credential_digest(&identity, secret),
            patron_id: patron_id.into(),
            permissions,
        };
        self.records
            .write()
            .expect("lock poisoned")
            .insert(identity, record);
    }
}

impl CredentialOracle for InMemoryCredentialOracle {
    fn lookup(&self, identity: &str) -> Option<PatronRecord> {
        self.records
            .read()
            .expect("lock poisoned")
            .get(identity)
            .cloned()
    }
}

/// Digest of the credential tuple, compared against the oracle's
/// stored value.
#[must_use]
pub fn credential_digest(identity: &str, secret: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(DIGEST_DOMAIN);
    hasher.update([identity.len() as u8]);
    hasher.update(identity.as_bytes());
    hasher.update(secret.as_bytes());
    hasher.finalize().into()
}

/// Signature binding identity and timestamp under the secret.
///
/// Clients compute this when building [`PatronCredentials`].
#[must_use]
pub fn credential_signature(secret: &str, identity: &str, timestamp: DateTime<Utc>) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("HMAC-SHA256 accepts any key length");
    mac.update(identity.as_bytes());
    mac.update(b"\n");
    mac.update(timestamp.timestamp().to_string().as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Verify presented credentials against the oracle.
///
/// # Errors
///
/// Returns [`PatronError::StaleTimestamp`] when the timestamp falls
/// outside `window`; mismatched credentials are an `Ok` outcome, not
/// an error.
pub fn verify_credentials(
    oracle: &dyn CredentialOracle,
    credentials: &PatronCredentials,
    now: DateTime<Utc>,
    window: chrono::Duration,
) -> Result<VerifyOutcome, PatronError> {
    // Replay window first; this never consults the oracle.
    let age = now - credentials.timestamp;
    let age_secs = age.num_seconds().abs();
    if age_secs > window.num_seconds() {
        return Err(PatronError::StaleTimestamp {
            age_secs,
            window_secs: window.num_seconds(),
        });
    }

    // Signature check: proves the tuple was assembled by a holder of
    // the secret, fresh for this timestamp.
    let expected_signature = credential_signature(
        &credentials.secret,
        &credentials.identity,
        credentials.timestamp,
    );
    let Ok(presented) = hex::decode(&credentials.signature) else {
        return Ok(VerifyOutcome::Mismatch);
    };
    let Ok(expected) = hex::decode(&expected_signature) else {
        return Ok(VerifyOutcome::Mismatch);
    };
    let signature_ok: bool = presented.ct_eq(&expected).into();

    // Digest check against the stored expected hash. Looked up even
    // when the signature failed so both paths do comparable work.
    let record = oracle.lookup(&credentials.identity);
    let digest = credential_digest(&credentials.identity, &credentials.secret);
    let digest_ok = record.as_ref().is_some_and(|r| {
        let matches: bool = digest.ct_eq(&r.credential_digest).into();
        matches
    });

    if !(signature_ok && digest_ok) {
        return Ok(VerifyOutcome::Mismatch);
    }

    let record = record.expect("digest_ok implies record present");
    Ok(VerifyOutcome::Verified(PatronGrant {
        patron_id: record.patron_id,
        permissions: record.permissions,
    }))
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;

    fn oracle_with(identity: &str, secret: &str) -> InMemoryCredentialOracle {
        let oracle = InMemoryCredentialOracle::new();
        oracle.register(
            identity,
            secret,
            format!("patron-{identity}"),
            BTreeSet::from(["read".to_string(), "erase".to_string()]),
        );
        oracle
    }

    fn credentials(identity: &str, secret: &str, timestamp: DateTime<Utc>) -> PatronCredentials {
        PatronCredentials {
            identity: identity.to_string(),
            secret: secret.to_string(),
            timestamp,
            signature: credential_signature(secret, identity, timestamp),
        }
    }

    #[test]
    fn valid_credentials_verify() {
        let oracle = oracle_with("alice", "s3cret");
        let now = Utc::now();
        let creds = credentials("alice", "s3cret", now);

        let outcome = verify_credentials(&oracle, &creds, now, Duration::seconds(60)).unwrap();
        let VerifyOutcome::Verified(grant) = outcome else {
            panic!("expected verified outcome");
        };
        assert_eq!(grant.patron_id, "patron-alice");
        assert!(grant.permissions.contains("erase"));
    }

    #[test]
    fn stale_timestamp_is_hard_rejection() {
        let oracle = oracle_with("alice", "s3cret");
        let now = Utc::now();
        // Credentials stamped ten minutes ago against a 60s window.
        let creds = credentials("alice", "s3cret", now - Duration::minutes(10));

        let err = verify_credentials(&oracle, &creds, now, Duration::seconds(60)).unwrap_err();
        assert!(matches!(err, PatronError::StaleTimestamp { .. }));
    }

    #[test]
    fn future_timestamp_outside_window_is_rejected() {
        let oracle = oracle_with("alice", "s3cret");
        let now = Utc::now();
        let creds = credentials("alice", "s3cret", now + Duration::minutes(10));

        assert!(verify_credentials(&oracle, &creds, now, Duration::seconds(60)).is_err());
    }

    #[test]
    fn wrong_secret_is_mismatch_not_error() {
        let oracle = oracle_with("alice", "s3cret");
        let now = Utc::now();
        let creds = credentials("alice", "wrong", now);

        let outcome = verify_credentials(&oracle, &creds, now, Duration::seconds(60)).unwrap();
        assert_eq!(outcome, VerifyOutcome::Mismatch);
    }

    #[test]
    fn unknown_identity_is_mismatch() {
        let oracle = oracle_with("alice", "s3cret");
        let now = Utc::now();
        let creds = credentials("mallory", "s3cret", now);

        let outcome = verify_credentials(&oracle, &creds, now, Duration::seconds(60)).unwrap();
        assert_eq!(outcome, VerifyOutcome::Mismatch);
    }

    #[test]
    fn spliced_signature_is_mismatch() {
        let oracle = oracle_with("alice", "s3cret");
        let now = Utc::now();
        let mut creds = credentials("alice", "s3cret", now);
        // Signature computed for a different timestamp.
        creds.signature = credential_signature("s3cret", "alice", now - Duration::seconds(30));

        let outcome = verify_credentials(&oracle, &creds, now, Duration::seconds(60)).unwrap();
        assert_eq!(outcome, VerifyOutcome::Mismatch);
    }

    #[test]
    fn malformed_signature_hex_is_mismatch() {
        let oracle = oracle_with("alice", "s3cret");
        let now = Utc::now();
        let mut creds = credentials("alice", "s3cret", now);
        creds.signature = "not-hex!".to_string();

        let outcome = verify_credentials(&oracle, &creds, now, Duration::seconds(60)).unwrap();
        assert_eq!(outcome, VerifyOutcome::Mismatch);
    }

    #[test]
    fn digest_is_stable_and_identity_separated() {
        // "ab" + "c" must not collide with "a" + "bc".
        assert_ne!(credential_digest("ab", "c"), credential_digest("a", "bc"));
        assert_eq!(
            credential_digest("alice", "s3cret"),
            credential_digest("alice", "s3cret")
        );
    }
}
