//! Agent client scenarios: full docking loop against a real daemon,
//! and channel-loss fail-fast against an abruptly dropped server.

use std::path::{Path, PathBuf};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tempfile::TempDir;
use tokio::net::UnixListener;
use tokio::sync::watch;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use berth_agent::{AgentClient, AgentSettings, AgentState, ChannelHandle, ClientError};
use berth_core::config::BerthConfig;
use berth_core::messages::{
    decode_message, encode_message, ChannelBindRequest, ChannelRequest, Operation,
    OperationRequest, OperationResponse, WireRequest, WireResponse, MAX_FRAME_SIZE,
};
use berth_core::session::DockStatus;
use berth_daemon::protocol::{serve, SocketManager, SocketManagerConfig};
use berth_daemon::{DaemonState, SharedState};

struct TestDaemon {
    state: SharedState,
    socket_path: PathBuf,
    _shutdown: watch::Sender<bool>,
    _tmp: TempDir,
}

async fn start_daemon(config: BerthConfig) -> TestDaemon {
    let tmp = TempDir::new().unwrap();
    let socket_path = tmp.path().join("dock.sock");
    let state = DaemonState::new(config).shared();
    let manager = SocketManager::bind(SocketManagerConfig::new(&socket_path)).unwrap();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(serve(manager, state.clone(), shutdown_rx));
    TestDaemon {
        state,
        socket_path,
        _shutdown: shutdown_tx,
        _tmp: tmp,
    }
}

fn agent_settings(socket_path: &Path, agent_id: &str) -> AgentSettings {
    let mut settings = AgentSettings::from_config(&BerthConfig::default(), agent_id);
    settings.socket_path = socket_path.to_path_buf();
    settings.request_timeout = Duration::from_secs(5);
    settings
}

#[tokio::test]
async fn full_docking_loop() {
    let config: BerthConfig = toml::from_str(
        r#"
        [[patrons]]
        identity = "alice"
        secret = "s3cret"
        patron_id = "patron-alice"
        permissions = ["read"]
        "#,
    )
    .unwrap();
    let daemon = start_daemon(config).await;

    let mut client = AgentClient::new(agent_settings(&daemon.socket_path, "agent-e2e"));
    client.dock().await.unwrap();
    assert_eq!(client.state(), AgentState::Docked);
    let dock_id = client.credentials().unwrap().dock_id.clone();

    // Verify a patron, then deposit.
    let OperationResponse::PatronVerification { verified, .. } =
        client.verify_patron("alice", "s3cret").await.unwrap()
    else {
        panic!("expected verification response");
    };
    assert!(verified);

    let OperationResponse::Deposit { accepted, deposits } = client
        .deposit(serde_json::json!({"rows": [1, 2, 3]}))
        .await
        .unwrap()
    else {
        panic!("expected deposit response");
    };
    assert!(accepted);
    assert_eq!(deposits, 1);

    // Graceful undock completes the session server-side.
    client.undock(serde_json::json!({"summary": "done"})).await;
    assert_eq!(client.state(), AgentState::Disconnected);
    assert!(client.credentials().is_none());

    let session = daemon.state.store().get(&dock_id).unwrap();
    assert_eq!(session.status, DockStatus::Completed);
    assert_eq!(session.result, Some(serde_json::json!({"summary": "done"})));
}

#[tokio::test]
async fn wrong_token_after_dock_is_session_invalid() {
    let daemon = start_daemon(BerthConfig::default()).await;
    let mut client = AgentClient::new(agent_settings(&daemon.socket_path, "agent-e2e"));
    client.dock().await.unwrap();

    // Simulate a stale credential set by removing the session.
    let dock_id = client.credentials().unwrap().dock_id.clone();
    daemon.state.store().remove(&dock_id).unwrap();

    let err = client.status().await.unwrap_err();
    assert!(err.is_session_invalid());

    // Recovery is a re-handshake.
    client.redock().await.unwrap();
    assert_eq!(client.state(), AgentState::Docked);
    assert_ne!(client.credentials().unwrap().dock_id, dock_id);
    client.undock(serde_json::Value::Null).await;
}

#[tokio::test]
async fn heartbeats_keep_the_session_alive() {
    let config: BerthConfig = toml::from_str(
        "heartbeat_interval_secs = 1\nsession_timeout_secs = 2\nreaper_period_secs = 1\n",
    )
    .unwrap();
    let daemon = start_daemon(config).await;
    let (reaper_tx, reaper_rx) = watch::channel(false);
    tokio::spawn(berth_daemon::HeartbeatReaper::new(daemon.state.clone()).run(reaper_rx));

    let mut settings = agent_settings(&daemon.socket_path, "agent-hb");
    settings.heartbeat_interval = Duration::from_secs(1);
    let mut client = AgentClient::new(settings);
    client.dock().await.unwrap();
    let dock_id = client.credentials().unwrap().dock_id.clone();

    // Strictly more frequent heartbeats than the timeout: never reaped.
    tokio::time::sleep(Duration::from_secs(4)).await;
    let session = daemon.state.store().get(&dock_id).unwrap();
    assert_eq!(session.status, DockStatus::Active);

    client.undock(serde_json::Value::Null).await;
    reaper_tx.send(true).ok();
}

/// A server that accepts one channel, acknowledges the bind, swallows
/// `expected_requests` envelopes, and then drops the connection.
async fn fake_channel_server(socket_path: PathBuf, expected_requests: usize) {
    let listener = UnixListener::bind(&socket_path).unwrap();
    let (stream, _) = listener.accept().await.unwrap();
    let codec = LengthDelimitedCodec::builder()
        .length_field_length(4)
        .max_frame_length(MAX_FRAME_SIZE)
        .new_codec();
    let mut framed = Framed::new(stream, codec);

    let frame = framed.next().await.unwrap().unwrap().freeze();
    let request: WireRequest = decode_message(&frame, MAX_FRAME_SIZE).unwrap();
    let WireRequest::ChannelBind(bind) = request else {
        panic!("expected channel bind");
    };
    framed
        .send(
            encode_message(&WireResponse::ChannelBound {
                channel_id: bind.channel_id,
            })
            .unwrap(),
        )
        .await
        .unwrap();

    for _ in 0..expected_requests {
        let frame = framed.next().await.unwrap().unwrap().freeze();
        let _: ChannelRequest = decode_message(&frame, MAX_FRAME_SIZE).unwrap();
    }
    // Drop without replying: every pending waiter must fail now.
}

#[tokio::test]
async fn channel_loss_fails_all_pending_waiters_immediately() {
    let tmp = TempDir::new().unwrap();
    let socket_path = tmp.path().join("fake.sock");
    let server = tokio::spawn(fake_channel_server(socket_path.clone(), 3));

    let bind = ChannelBindRequest {
        dock_id: "dock-test".to_string(),
        handshake_token: "token".to_string(),
        channel_id: "chan-test".to_string(),
    };
    // Give the listener a moment to bind.
    let channel = {
        let mut attempts = 0;
        loop {
            match ChannelHandle::open(&socket_path, bind.clone(), Duration::from_secs(1)).await {
                Ok(channel) => break channel,
                Err(_) if attempts < 50 => {
                    attempts += 1;
                    tokio::time::sleep(Duration::from_millis(20)).await;
                },
                Err(e) => panic!("could not open channel: {e}"),
            }
        }
    };

    let operation = || OperationRequest {
        dock_id: "dock-test".to_string(),
        handshake_token: "token".to_string(),
        operation: Operation::Status,
    };

    // Three requests outstanding, each with a generous timeout that
    // must never be consumed.
    let started = std::time::Instant::now();
    let (r1, r2, r3) = tokio::join!(
        channel.request(operation(), Duration::from_secs(30)),
        channel.request(operation(), Duration::from_secs(30)),
        channel.request(operation(), Duration::from_secs(30)),
    );

    for result in [r1, r2, r3] {
        assert!(
            matches!(result, Err(ClientError::ChannelClosed)),
            "expected ChannelClosed, got {result:?}"
        );
    }
    assert!(
        started.elapsed() < Duration::from_secs(5),
        "waiters failed by disconnect, not by their own timeouts"
    );
    assert_eq!(channel.pending_requests(), 0);
    tokio::time::timeout(Duration::from_secs(1), channel.wait_closed())
        .await
        .expect("channel close should be observed promptly");
    assert!(channel.is_closed());

    server.await.unwrap();
}
