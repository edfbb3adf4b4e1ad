//! The agent docking state machine.
//!
//! [`AgentClient`] drives the full session lifecycle: establish, store
//! credentials, keep the session alive with a heartbeat loop, maintain
//! the persistent channel (reconnecting with a fixed delay on loss),
//! and complete the session best-effort on shutdown.
//!
//! Heartbeat failures are logged and retried; they never tear down
//! local state, because only the server-side reaper may declare a
//! timeout. Authentication failures are different: the session is
//! gone, and the only recovery is [`AgentClient::redock`].

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use berth_core::config::BerthConfig;
use berth_core::messages::{
    AgentDescriptor, ChannelBindRequest, CompleteRequest, ComplianceRequest, DepositRequest,
    EstablishRequest, EstablishResponse, HeartbeatRequest, Operation, OperationRequest,
    OperationResponse, WireRequest, WireResponse,
};
use berth_core::patron::{credential_signature, PatronCredentials};
use berth_core::session::OperationCategory;
use berth_core::token::HandshakeToken;

use crate::channel::ChannelHandle;
use crate::error::ClientError;
use crate::transport;

/// Docking state of the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    /// No session; nothing running.
    Disconnected,
    /// Establish call in flight.
    Handshaking,
    /// Session live; heartbeat loop and channel keeper running.
    Docked,
    /// Graceful shutdown in progress.
    Disconnecting,
}

/// Credentials held for the current session.
#[derive(Debug, Clone)]
pub struct DockCredentials {
    /// Session identifier.
    pub dock_id: String,
    /// Handshake token presented on every call.
    pub handshake_token: HandshakeToken,
    /// Channel id for binding the persistent channel.
    pub channel_id: String,
}

impl From<&EstablishResponse> for DockCredentials {
    fn from(response: &EstablishResponse) -> Self {
        Self {
            dock_id: response.dock_id.clone(),
            handshake_token: response.handshake_token.clone(),
            channel_id: response.secure_channel_id.clone(),
        }
    }
}

/// Agent-side settings.
#[derive(Debug, Clone)]
pub struct AgentSettings {
    /// Daemon socket path.
    pub socket_path: PathBuf,
    /// Logical agent identity.
    pub agent_id: String,
    /// Declared operation categories.
    pub capabilities: BTreeSet<OperationCategory>,
    /// Compliance endpoint declared at establish time.
    pub compliance_endpoint: String,
    /// Free-form metadata declared at establish time.
    pub metadata: serde_json::Value,
    /// Heartbeat period.
    pub heartbeat_interval: Duration,
    /// Fixed channel reconnect delay.
    pub reconnect_delay: Duration,
    /// Per-request timeout.
    pub request_timeout: Duration,
}

impl AgentSettings {
    /// Build settings from shared configuration.
    #[must_use]
    pub fn from_config(config: &BerthConfig, agent_id: impl Into<String>) -> Self {
        Self {
            socket_path: config.socket_path.clone(),
            agent_id: agent_id.into(),
            capabilities: BTreeSet::from([
                OperationCategory::Patron,
                OperationCategory::Deposit,
                OperationCategory::Compliance,
                OperationCategory::Lifecycle,
            ]),
            compliance_endpoint: "agent/compliance".to_string(),
            metadata: serde_json::Value::Null,
            heartbeat_interval: config.heartbeat_interval(),
            reconnect_delay: config.reconnect_delay(),
            request_timeout: config.request_timeout(),
        }
    }
}

/// Shared slot holding the current channel, if one is open.
type ChannelSlot = Arc<RwLock<Option<ChannelHandle>>>;

/// The agent docking client.
pub struct AgentClient {
    settings: AgentSettings,
    state: AgentState,
    credentials: Option<DockCredentials>,
    channel: ChannelSlot,
    heartbeat_task: Option<JoinHandle<()>>,
    keeper_task: Option<JoinHandle<()>>,
    shutdown: Option<watch::Sender<bool>>,
}

impl AgentClient {
    /// Create a client in `DISCONNECTED`.
    #[must_use]
    pub fn new(settings: AgentSettings) -> Self {
        Self {
            settings,
            state: AgentState::Disconnected,
            credentials: None,
            channel: Arc::new(RwLock::new(None)),
            heartbeat_task: None,
            keeper_task: None,
            shutdown: None,
        }
    }

    /// Current docking state.
    #[must_use]
    pub const fn state(&self) -> AgentState {
        self.state
    }

    /// Credentials for the current session, once docked.
    #[must_use]
    pub fn credentials(&self) -> Option<&DockCredentials> {
        self.credentials.as_ref()
    }

    /// Establish a session and start the background loops.
    ///
    /// # Errors
    ///
    /// Transport failures or a daemon rejection; the client returns to
    /// `DISCONNECTED` in that case.
    pub async fn dock(&mut self) -> Result<(), ClientError> {
        if self.state != AgentState::Disconnected {
            return Err(ClientError::UnexpectedResponse {
                reason: format!("dock() called in state {:?}", self.state),
            });
        }
        self.state = AgentState::Handshaking;
        info!(agent_id = %self.settings.agent_id, "docking");

        let request = WireRequest::Establish(
            EstablishRequest::new(
                &self.settings.agent_id,
                AgentDescriptor {
                    compliance_endpoint: self.settings.compliance_endpoint.clone(),
                    metadata: self.settings.metadata.clone(),
                },
            )
            .with_capabilities(self.settings.capabilities.clone()),
        );

        let response = transport::call(
            &self.settings.socket_path,
            &request,
            self.settings.request_timeout,
        )
        .await;

        let established = match response {
            Ok(WireResponse::Established(established)) => established,
            Ok(WireResponse::Error(err)) => {
                self.state = AgentState::Disconnected;
                return Err(ClientError::Daemon {
                    code: err.code,
                    message: err.error,
                });
            },
            Ok(other) => {
                self.state = AgentState::Disconnected;
                return Err(ClientError::UnexpectedResponse {
                    reason: format!("expected establish response, got {other:?}"),
                });
            },
            Err(e) => {
                self.state = AgentState::Disconnected;
                return Err(e);
            },
        };

        let credentials = DockCredentials::from(&established);
        info!(dock_id = %credentials.dock_id, "docked");

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        self.heartbeat_task = Some(spawn_heartbeat_loop(
            self.settings.clone(),
            credentials.clone(),
            shutdown_rx.clone(),
        ));
        self.keeper_task = Some(spawn_channel_keeper(
            self.settings.clone(),
            credentials.clone(),
            Arc::clone(&self.channel),
            shutdown_rx,
        ));
        self.shutdown = Some(shutdown_tx);
        self.credentials = Some(credentials);
        self.state = AgentState::Docked;
        Ok(())
    }

    /// Issue one operation, preferring the persistent channel and
    /// falling back to the synchronous transport when the channel is
    /// absent or lost mid-call.
    ///
    /// # Errors
    ///
    /// [`ClientError::NotDocked`] before [`AgentClient::dock`], or the
    /// underlying transport/daemon failure.
    pub async fn operation(&self, operation: Operation) -> Result<OperationResponse, ClientError> {
        let credentials = self.credentials.as_ref().ok_or(ClientError::NotDocked)?;
        let request = OperationRequest {
            dock_id: credentials.dock_id.clone(),
            handshake_token: credentials.handshake_token.expose().to_string(),
            operation,
        };

        if let Some(channel) = &*self.channel.read().await {
            match channel.request(request.clone(), self.settings.request_timeout).await {
                Err(ClientError::ChannelClosed) => {
                    debug!("channel lost mid-call; falling back to synchronous transport");
                },
                other => return other,
            }
        }

        let response = transport::call(
            &self.settings.socket_path,
            &WireRequest::Operation(request),
            self.settings.request_timeout,
        )
        .await?;
        transport::expect_ok(response)
    }

    /// Verify a patron with freshly stamped, signed credentials.
    ///
    /// # Errors
    ///
    /// See [`AgentClient::operation`].
    pub async fn verify_patron(
        &self,
        identity: &str,
        secret: &str,
    ) -> Result<OperationResponse, ClientError> {
        let timestamp = Utc::now();
        let credentials = PatronCredentials {
            identity: identity.to_string(),
            secret: secret.to_string(),
            timestamp,
            signature: credential_signature(secret, identity, timestamp),
        };
        self.operation(Operation::VerifyPatron(credentials)).await
    }

    /// Deposit a payload.
    ///
    /// # Errors
    ///
    /// See [`AgentClient::operation`].
    pub async fn deposit(
        &self,
        payload: serde_json::Value,
    ) -> Result<OperationResponse, ClientError> {
        self.operation(Operation::Deposit(DepositRequest { payload }))
            .await
    }

    /// Issue a compliance request.
    ///
    /// # Errors
    ///
    /// See [`AgentClient::operation`].
    pub async fn compliance(
        &self,
        request: ComplianceRequest,
    ) -> Result<OperationResponse, ClientError> {
        self.operation(Operation::Compliance(request)).await
    }

    /// Query the session status.
    ///
    /// # Errors
    ///
    /// See [`AgentClient::operation`].
    pub async fn status(&self) -> Result<OperationResponse, ClientError> {
        self.operation(Operation::Status).await
    }

    /// Gracefully leave the dock.
    ///
    /// Stops the heartbeat loop, closes the channel, and calls
    /// `complete` with the final result. Completion is best-effort:
    /// a failure is logged and the client still disconnects locally.
    pub async fn undock(&mut self, result: serde_json::Value) {
        if self.state != AgentState::Docked {
            self.teardown().await;
            return;
        }
        self.state = AgentState::Disconnecting;
        info!("undocking");

        if let Some(shutdown) = &self.shutdown {
            shutdown.send(true).ok();
        }
        // Close the channel before completing so the completion call
        // travels the synchronous transport.
        self.channel.write().await.take();

        if let Some(credentials) = &self.credentials {
            let request = WireRequest::Operation(OperationRequest {
                dock_id: credentials.dock_id.clone(),
                handshake_token: credentials.handshake_token.expose().to_string(),
                operation: Operation::Complete(CompleteRequest { result }),
            });
            match transport::call(
                &self.settings.socket_path,
                &request,
                self.settings.request_timeout,
            )
            .await
            {
                Ok(WireResponse::Ok(_)) => info!("session completed"),
                Ok(WireResponse::Error(err)) => {
                    warn!(code = ?err.code, error = %err.error, "completion rejected; disconnecting anyway");
                },
                Ok(_) | Err(_) => {
                    warn!("completion call failed; disconnecting anyway");
                },
            }
        }

        self.teardown().await;
    }

    /// Drop local session state and re-establish.
    ///
    /// The recovery path for authentication failures ("session
    /// invalid, re-establishing"): no completion call is attempted,
    /// because the old session is already gone server-side.
    ///
    /// # Errors
    ///
    /// See [`AgentClient::dock`].
    pub async fn redock(&mut self) -> Result<(), ClientError> {
        warn!("session invalid, re-establishing");
        self.teardown().await;
        self.dock().await
    }

    async fn teardown(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            shutdown.send(true).ok();
        }
        if let Some(task) = self.heartbeat_task.take() {
            task.abort();
        }
        if let Some(task) = self.keeper_task.take() {
            task.abort();
        }
        self.channel.write().await.take();
        self.credentials = None;
        self.state = AgentState::Disconnected;
    }
}

/// Heartbeat loop: fixed period, failures logged and retried.
fn spawn_heartbeat_loop(
    settings: AgentSettings,
    credentials: DockCredentials,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(settings.heartbeat_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick fires immediately and doubles as the
        // PENDING -> ACTIVE promotion.
        loop {
            tokio::select! {
                _ = interval.tick() => {},
                _ = shutdown.changed() => return,
            }

            let request = WireRequest::Operation(OperationRequest {
                dock_id: credentials.dock_id.clone(),
                handshake_token: credentials.handshake_token.expose().to_string(),
                operation: Operation::Heartbeat(HeartbeatRequest { sent_at: Utc::now() }),
            });
            match transport::call(&settings.socket_path, &request, settings.request_timeout).await
            {
                Ok(WireResponse::Ok(OperationResponse::HeartbeatAck { deadline })) => {
                    debug!(%deadline, "heartbeat acknowledged");
                },
                Ok(WireResponse::Error(err)) => {
                    // Only the server-side reaper declares timeouts;
                    // locally we just log and keep trying.
                    warn!(code = ?err.code, error = %err.error, "heartbeat rejected");
                },
                Ok(other) => warn!(?other, "unexpected heartbeat response"),
                Err(e) => warn!(error = %e, "heartbeat failed"),
            }
        }
    })
}

/// Channel keeper: opens the persistent channel and reopens it after a
/// fixed delay whenever it drops.
fn spawn_channel_keeper(
    settings: AgentSettings,
    credentials: DockCredentials,
    slot: ChannelSlot,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            if *shutdown.borrow() {
                return;
            }

            let bind = ChannelBindRequest {
                dock_id: credentials.dock_id.clone(),
                handshake_token: credentials.handshake_token.expose().to_string(),
                channel_id: credentials.channel_id.clone(),
            };
            match ChannelHandle::open(&settings.socket_path, bind, settings.request_timeout).await
            {
                Ok(handle) => {
                    *slot.write().await = Some(handle);
                    debug!("channel open");

                    // Wait for loss without holding the slot lock; an
                    // undock that empties the slot also ends the wait.
                    loop {
                        let is_gone = {
                            let slot = slot.read().await;
                            match slot.as_ref() {
                                Some(handle) => handle.is_closed(),
                                None => true,
                            }
                        };
                        if is_gone {
                            break;
                        }
                        tokio::select! {
                            () = tokio::time::sleep(Duration::from_millis(200)) => {},
                            _ = shutdown.changed() => return,
                        }
                    }
                    slot.write().await.take();
                    warn!("persistent channel lost; scheduling reconnect");
                },
                Err(e) => {
                    warn!(error = %e, "failed to open persistent channel");
                },
            }

            // Fixed reconnect delay, deliberately not exponential.
            tokio::select! {
                () = tokio::time::sleep(settings.reconnect_delay) => {},
                _ = shutdown.changed() => return,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> AgentSettings {
        AgentSettings::from_config(&BerthConfig::default(), "agent-unit")
    }

    #[test]
    fn new_client_is_disconnected() {
        let client = AgentClient::new(settings());
        assert_eq!(client.state(), AgentState::Disconnected);
        assert!(client.credentials().is_none());
    }

    #[tokio::test]
    async fn operation_before_dock_is_rejected() {
        let client = AgentClient::new(settings());
        let err = client.status().await.unwrap_err();
        assert!(matches!(err, ClientError::NotDocked));
    }

    #[tokio::test]
    async fn dock_against_missing_daemon_returns_to_disconnected() {
        let mut s = settings();
        s.socket_path = PathBuf::from("/nonexistent/berth/dock.sock");
        let mut client = AgentClient::new(s);

        let err = client.dock().await.unwrap_err();
        assert!(matches!(err, ClientError::DaemonNotRunning));
        assert_eq!(client.state(), AgentState::Disconnected);
    }

    #[tokio::test]
    async fn dock_in_wrong_state_is_rejected() {
        let mut s = settings();
        s.socket_path = PathBuf::from("/nonexistent/berth/dock.sock");
        let mut client = AgentClient::new(s);
        client.state = AgentState::Docked;

        let err = client.dock().await.unwrap_err();
        assert!(matches!(err, ClientError::UnexpectedResponse { .. }));
    }

    #[test]
    fn settings_from_config_carry_timing() {
        let config: BerthConfig = toml::from_str(
            "heartbeat_interval_secs = 7\nreconnect_delay_secs = 3\nrequest_timeout_secs = 9\n",
        )
        .unwrap();
        let s = AgentSettings::from_config(&config, "agent-x");
        assert_eq!(s.heartbeat_interval, Duration::from_secs(7));
        assert_eq!(s.reconnect_delay, Duration::from_secs(3));
        assert_eq!(s.request_timeout, Duration::from_secs(9));
        assert_eq!(s.agent_id, "agent-x");
    }
}
