//! Workspace configuration.
//!
//! A single TOML file configures both the daemon and the agent. All
//! fields have defaults so an empty file (or no file) is a valid
//! configuration.
//!
//! ```toml
//! socket_path = "/run/berth/dock.sock"
//! heartbeat_interval_secs = 30
//! session_timeout_secs = 300
//! reaper_period_secs = 60
//!
//! [[patrons]]
//! identity = "alice"
//! secret = "s3cret"
//! patron_id = "patron-alice"
//! permissions = ["read", "erase"]
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use secrecy::SecretString;
use serde::Deserialize;
use thiserror::Error;

/// Default subdirectory under the runtime directory.
const DEFAULT_SUBDIR: &str = "berth";

/// Default socket filename.
const DEFAULT_SOCKET_NAME: &str = "dock.sock";

/// Errors from configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    /// The file is not valid TOML for this schema.
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Get the default dock socket path based on environment.
///
/// Priority:
/// 1. `XDG_RUNTIME_DIR/berth/dock.sock` if `XDG_RUNTIME_DIR` is set
/// 2. `/tmp/berth/dock.sock` as fallback
#[must_use]
pub fn default_socket_path() -> PathBuf {
    std::env::var("XDG_RUNTIME_DIR").map_or_else(
        |_| {
            PathBuf::from("/tmp")
                .join(DEFAULT_SUBDIR)
                .join(DEFAULT_SOCKET_NAME)
        },
        |runtime_dir| {
            PathBuf::from(runtime_dir)
                .join(DEFAULT_SUBDIR)
                .join(DEFAULT_SOCKET_NAME)
        },
    )
}

/// Seed record registering one patron identity with the daemon's
/// credential oracle at startup.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PatronSeed {
    /// Identity presented by agents.
    pub identity: String,

    /// Shared secret for the identity. Held as a secret; only its
    /// digest survives oracle registration.
    pub secret: SecretString,

    /// Patron id granted on successful verification.
    pub patron_id: String,

    /// Permissions granted on successful verification.
    #[serde(default)]
    pub permissions: Vec<String>,
}

/// Configuration shared by the daemon and the agent.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct BerthConfig {
    /// Dock socket path.
    pub socket_path: PathBuf,

    /// Agent heartbeat period, seconds.
    pub heartbeat_interval_secs: u64,

    /// Heartbeat silence after which a session is reaped, seconds.
    pub session_timeout_secs: u64,

    /// Reaper sweep period, seconds.
    pub reaper_period_secs: u64,

    /// Patron credential replay window, seconds.
    pub replay_window_secs: u64,

    /// Agent channel reconnect delay, seconds. Fixed delay, matching
    /// the original client behavior.
    pub reconnect_delay_secs: u64,

    /// Per-request timeout on both transports, seconds.
    pub request_timeout_secs: u64,

    /// Maximum concurrent daemon connections.
    pub max_connections: usize,

    /// Maximum serialized deposit payload size, bytes.
    pub max_deposit_bytes: usize,

    /// Audit log capacity, entries.
    pub audit_capacity: usize,

    /// Patron identities seeded into the credential oracle.
    pub patrons: Vec<PatronSeed>,
}

impl Default for BerthConfig {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
            heartbeat_interval_secs: 30,
            session_timeout_secs: 300,
            reaper_period_secs: 60,
            replay_window_secs: 60,
            reconnect_delay_secs: 5,
            request_timeout_secs: 30,
            max_connections: 100,
            max_deposit_bytes: 32 * 1024,
            audit_capacity: 1024,
            patrons: Vec::new(),
        }
    }
}

impl BerthConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&raw)?)
    }

    /// Load from a file if it exists, defaults otherwise.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] only for an existing-but-invalid file.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Heartbeat period as a [`Duration`].
    #[must_use]
    pub const fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    /// Session timeout as a [`Duration`].
    #[must_use]
    pub const fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout_secs)
    }

    /// Reaper period as a [`Duration`].
    #[must_use]
    pub const fn reaper_period(&self) -> Duration {
        Duration::from_secs(self.reaper_period_secs)
    }

    /// Replay window as a signed [`chrono::Duration`].
    #[must_use]
    pub fn replay_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.replay_window_secs as i64)
    }

    /// Session timeout as a signed [`chrono::Duration`].
    #[must_use]
    pub fn session_timeout_chrono(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.session_timeout_secs as i64)
    }

    /// Reconnect delay as a [`Duration`].
    #[must_use]
    pub const fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }

    /// Request timeout as a [`Duration`].
    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}
