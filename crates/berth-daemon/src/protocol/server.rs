//! UDS socket manager and framed connections.
//!
//! # Security Considerations
//!
//! - Socket permissions are set AFTER binding to ensure correctness.
//! - The parent directory is created with mode 0700.
//! - Stale socket files are removed before binding.
//! - Peers with a different UID than the socket owner are refused at
//!   accept time, before any frame is read.
//! - Connections start with the establish-phase frame cap (64 KiB) and
//!   are upgraded to the full cap only after a successful request.

use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::{debug, info, warn};

use berth_core::messages::{MAX_ESTABLISH_FRAME_SIZE, MAX_FRAME_SIZE};

use super::error::{ProtocolError, ProtocolResult};

/// Socket permissions (owner + group read/write).
const SOCKET_MODE: u32 = 0o660;

/// Parent directory permissions (owner only).
const DIRECTORY_MODE: u32 = 0o700;

/// Configuration for the socket manager.
#[derive(Debug, Clone)]
pub struct SocketManagerConfig {
    /// Dock socket path.
    pub socket_path: PathBuf,

    /// Maximum concurrent connections.
    pub max_connections: usize,
}

impl SocketManagerConfig {
    /// Create a config for the given socket path.
    #[must_use]
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            max_connections: 100,
        }
    }

    /// Set the maximum concurrent connections.
    #[must_use]
    pub const fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }
}

/// Permit held for the lifetime of one accepted connection.
///
/// Dropping the permit releases the connection slot.
#[derive(Debug)]
pub struct ConnectionPermit {
    _permit: OwnedSemaphorePermit,
}

/// A framed connection with length-prefixed frames.
pub struct Connection {
    framed: Framed<UnixStream, LengthDelimitedCodec>,
}

impl Connection {
    /// Wrap a stream with the establish-phase frame cap.
    #[must_use]
    pub fn new(stream: UnixStream) -> Self {
        let codec = LengthDelimitedCodec::builder()
            .length_field_length(4)
            .max_frame_length(MAX_ESTABLISH_FRAME_SIZE)
            .new_codec();
        Self {
            framed: Framed::new(stream, codec),
        }
    }

    /// Raise the frame cap to the full limit.
    ///
    /// Called once the connection has passed its first successful
    /// request; until then the stricter establish-phase cap applies.
    pub fn upgrade_to_full_frame_size(&mut self) {
        self.framed.codec_mut().set_max_frame_length(MAX_FRAME_SIZE);
    }

    /// Read the next frame. `Ok(None)` means the peer closed cleanly.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Io`] for transport failures, including
    /// frames whose length prefix exceeds the current cap.
    pub async fn next_frame(&mut self) -> ProtocolResult<Option<Bytes>> {
        match self.framed.next().await {
            Some(Ok(frame)) => Ok(Some(frame.freeze())),
            Some(Err(e)) => Err(ProtocolError::Io(e)),
            None => Ok(None),
        }
    }

    /// Send one frame.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Io`] for transport failures.
    pub async fn send_frame(&mut self, frame: Bytes) -> ProtocolResult<()> {
        self.framed.send(frame).await.map_err(ProtocolError::Io)
    }

    /// Consume the connection, exposing the framed transport for
    /// split reader/writer operation in channel mode.
    #[must_use]
    pub fn into_framed(self) -> Framed<UnixStream, LengthDelimitedCodec> {
        self.framed
    }
}

/// Binds the dock socket and accepts connections.
pub struct SocketManager {
    config: SocketManagerConfig,
    listener: UnixListener,
    connection_sem: Arc<Semaphore>,
    owner_uid: u32,
}

impl SocketManager {
    /// Create and bind the socket manager.
    ///
    /// This will:
    /// 1. Create the parent directory if needed (mode 0700)
    /// 2. Remove any stale socket file
    /// 3. Bind the socket
    /// 4. Set socket permissions to 0660
    ///
    /// # Errors
    ///
    /// Returns an I/O error if any step fails.
    pub fn bind(config: SocketManagerConfig) -> std::io::Result<Self> {
        if let Some(parent) = config.socket_path.parent() {
            std::fs::create_dir_all(parent)?;
            std::fs::set_permissions(parent, std::fs::Permissions::from_mode(DIRECTORY_MODE))?;
        }

        // Remove a stale socket left by an unclean shutdown.
        match std::fs::remove_file(&config.socket_path) {
            Ok(()) => debug!(path = %config.socket_path.display(), "removed stale socket"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {},
            Err(e) => return Err(e),
        }

        let listener = UnixListener::bind(&config.socket_path)?;
        std::fs::set_permissions(
            &config.socket_path,
            std::fs::Permissions::from_mode(SOCKET_MODE),
        )?;
        let owner_uid = std::fs::metadata(&config.socket_path)?.uid();

        info!(
            path = %config.socket_path.display(),
            max_connections = config.max_connections,
            "dock socket bound"
        );

        let connection_sem = Arc::new(Semaphore::new(config.max_connections));
        Ok(Self {
            config,
            listener,
            connection_sem,
            owner_uid,
        })
    }

    /// The socket path this manager is bound to.
    #[must_use]
    pub fn socket_path(&self) -> &Path {
        &self.config.socket_path
    }

    /// Accept the next connection, waiting for a free connection slot.
    ///
    /// Peers whose UID differs from the socket owner are refused and
    /// the accept loop continues; the refusal is logged without
    /// echoing anything to the peer.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::ConnectionClosed`] if the semaphore is
    /// closed, or [`ProtocolError::Io`] for accept failures.
    pub async fn accept(&self) -> ProtocolResult<(Connection, ConnectionPermit)> {
        let permit = Arc::clone(&self.connection_sem)
            .acquire_owned()
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)?;

        loop {
            let (stream, _addr) = self.listener.accept().await?;

            match stream.peer_cred() {
                Ok(cred) if cred.uid() == self.owner_uid => {
                    return Ok((Connection::new(stream), ConnectionPermit { _permit: permit }));
                },
                Ok(cred) => {
                    warn!(peer_uid = cred.uid(), "refusing connection from foreign uid");
                },
                Err(e) => {
                    warn!(error = %e, "failed to read peer credentials; refusing connection");
                },
            }
        }
    }
}
