//! Per-connection request handling.
//!
//! A connection starts in request/response mode: each frame is one
//! [`WireRequest`], answered with one [`WireResponse`]. A successful
//! `ChannelBind` switches the connection into persistent-channel mode,
//! where frames are [`ChannelRequest`] envelopes answered out of order
//! by [`ChannelReply`] envelopes carrying the same `request_id`.
//!
//! # Security Considerations
//!
//! - The establish-phase frame cap applies until the first successful
//!   request; only then is the full cap enabled.
//! - A frame that does not decode is answered with a structured error
//!   and the connection is closed (protocol violation).
//! - Channel mode requires a valid token and the channel id issued at
//!   establish time; nothing unauthenticated reaches a handler.

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use berth_core::messages::{
    decode_message, encode_message, ChannelReply, ChannelRequest, ErrorCode, ErrorResponse,
    WireError, WireRequest, WireResponse, MAX_ESTABLISH_FRAME_SIZE, MAX_FRAME_SIZE,
};

use super::error::{ProtocolError, ProtocolResult};
use super::server::{Connection, ConnectionPermit, SocketManager};
use crate::dispatch::OperationRouter;
use crate::handlers;
use crate::state::SharedState;

/// Buffered replies per channel connection before the writer applies
/// backpressure.
const CHANNEL_REPLY_BUFFER: usize = 64;

/// Map a decode failure onto the wire error envelope.
fn decode_error_response(err: &WireError) -> ErrorResponse {
    if err.is_unknown_variant() {
        ErrorResponse::new(ErrorCode::UnsupportedOperation, "unsupported operation type")
    } else {
        ErrorResponse::new(ErrorCode::InvalidRequest, format!("malformed request: {err}"))
    }
}

/// Handle one accepted connection to completion.
///
/// # Errors
///
/// Returns a [`ProtocolError`] for transport-level failures. Clean
/// peer disconnects are `Ok`.
pub async fn handle_connection(
    mut conn: Connection,
    _permit: ConnectionPermit,
    state: SharedState,
) -> ProtocolResult<()> {
    let router = OperationRouter::new(state);
    // Until the first successful request the stricter establish-phase
    // cap applies to decoding as well as framing.
    let mut decode_limit = MAX_ESTABLISH_FRAME_SIZE;

    loop {
        let Some(frame) = conn.next_frame().await? else {
            return Ok(());
        };

        let request = match decode_message::<WireRequest>(&frame, decode_limit) {
            Ok(request) => request,
            Err(e) => {
                warn!(error = %e, "undecodable frame; closing connection");
                let response = WireResponse::Error(decode_error_response(&e));
                conn.send_frame(encode_message(&response)?).await?;
                return Ok(());
            },
        };

        match request {
            WireRequest::Establish(establish) => {
                let response = match handlers::establish(router.state(), &establish) {
                    Ok(established) => {
                        decode_limit = MAX_FRAME_SIZE;
                        conn.upgrade_to_full_frame_size();
                        WireResponse::Established(established)
                    },
                    Err(e) => WireResponse::Error(e.into_response()),
                };
                conn.send_frame(encode_message(&response)?).await?;
            },
            WireRequest::Operation(operation) => {
                let response = router.dispatch(&operation);
                if matches!(response, WireResponse::Ok(_)) {
                    decode_limit = MAX_FRAME_SIZE;
                    conn.upgrade_to_full_frame_size();
                }
                conn.send_frame(encode_message(&response)?).await?;
            },
            WireRequest::ChannelBind(bind) => match router.bind_channel(&bind) {
                Ok(channel_id) => {
                    conn.upgrade_to_full_frame_size();
                    conn.send_frame(encode_message(&WireResponse::ChannelBound {
                        channel_id: channel_id.clone(),
                    })?)
                    .await?;
                    debug!(dock_id = %bind.dock_id, "connection entering channel mode");
                    return run_channel(conn, router, &bind.dock_id).await;
                },
                Err(e) => {
                    conn.send_frame(encode_message(&WireResponse::Error(e.into_response()))?)
                        .await?;
                },
            },
        }
    }
}

/// Persistent-channel mode: correlated envelopes, out-of-order replies.
async fn run_channel(
    conn: Connection,
    router: OperationRouter,
    dock_id: &str,
) -> ProtocolResult<()> {
    let (mut sink, mut stream) = conn.into_framed().split();
    let (reply_tx, mut reply_rx) = mpsc::channel::<ChannelReply>(CHANNEL_REPLY_BUFFER);

    // Writer half: serializes replies from concurrent handler tasks.
    let writer = tokio::spawn(async move {
        while let Some(reply) = reply_rx.recv().await {
            let frame = match encode_message(&reply) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!(error = %e, "failed to encode channel reply");
                    continue;
                },
            };
            if sink.send(frame).await.is_err() {
                // Peer gone; remaining replies have nowhere to go.
                break;
            }
        }
    });

    while let Some(frame) = stream.next().await {
        let frame = match frame {
            Ok(frame) => frame.freeze(),
            Err(e) => {
                debug!(dock_id, error = %e, "channel read failed");
                break;
            },
        };

        let request = match decode_message::<ChannelRequest>(&frame, MAX_FRAME_SIZE) {
            Ok(request) => request,
            Err(e) => {
                // Salvage the request id if there is one so the caller
                // fails fast instead of waiting out its timeout.
                if let Some(request_id) = salvage_request_id(&frame) {
                    let reply = ChannelReply {
                        request_id,
                        response: WireResponse::Error(decode_error_response(&e)),
                    };
                    let _ = reply_tx.send(reply).await;
                    continue;
                }
                warn!(dock_id, error = %e, "undecodable channel frame; closing channel");
                break;
            },
        };

        // One task per request: replies may complete out of order, and
        // a slow operation never blocks the read loop.
        let router = router.clone();
        let reply_tx = reply_tx.clone();
        tokio::spawn(async move {
            let response = router.dispatch(&request.operation);
            let reply = ChannelReply {
                request_id: request.request_id,
                response,
            };
            // A closed writer means the channel is gone; the client's
            // correlator fails its waiters on disconnect.
            let _ = reply_tx.send(reply).await;
        });
    }

    drop(reply_tx);
    let _ = writer.await;
    debug!(dock_id, "channel closed");
    Ok(())
}

/// Best-effort extraction of `request_id` from an undecodable channel
/// frame.
fn salvage_request_id(frame: &Bytes) -> Option<String> {
    serde_json::from_slice::<serde_json::Value>(frame)
        .ok()?
        .get("request_id")?
        .as_str()
        .map(str::to_string)
}

/// Accept loop: hand each connection to its own task.
///
/// Runs until `shutdown` flips to `true` or the listener fails.
///
/// # Errors
///
/// Returns a [`ProtocolError`] if accepting fails irrecoverably.
pub async fn serve(
    manager: SocketManager,
    state: SharedState,
    mut shutdown: watch::Receiver<bool>,
) -> ProtocolResult<()> {
    info!(path = %manager.socket_path().display(), "dock server accepting connections");
    loop {
        tokio::select! {
            accepted = manager.accept() => {
                let (conn, permit) = accepted?;
                let state = state.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(conn, permit, state).await {
                        if e.is_protocol_violation() {
                            warn!(error = %e, "connection terminated on protocol violation");
                        } else {
                            debug!(error = %e, "connection ended");
                        }
                    }
                });
            },
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!("dock server shutting down");
                    return Ok(());
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use tempfile::TempDir;
    use tokio::net::UnixStream;

    use berth_core::config::BerthConfig;
    use berth_core::messages::{
        AgentDescriptor, ChannelBindRequest, EstablishRequest, EstablishResponse, Operation,
        OperationRequest, OperationResponse,
    };

    use super::*;
    use crate::state::DaemonState;

    use super::super::server::SocketManagerConfig;

    async fn start_server(tmp: &TempDir) -> (SharedState, std::path::PathBuf, watch::Sender<bool>) {
        let socket_path = tmp.path().join("dock.sock");
        let state = DaemonState::new(BerthConfig::default()).shared();
        let manager = SocketManager::bind(SocketManagerConfig::new(&socket_path)).unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(serve(manager, state.clone(), shutdown_rx));
        (state, socket_path, shutdown_tx)
    }

    async fn call(conn: &mut Connection, request: &WireRequest) -> WireResponse {
        conn.send_frame(encode_message(request).unwrap())
            .await
            .unwrap();
        let frame = conn.next_frame().await.unwrap().unwrap();
        decode_message(&frame, MAX_FRAME_SIZE).unwrap()
    }

    async fn connect(path: &Path) -> Connection {
        Connection::new(UnixStream::connect(path).await.unwrap())
    }

    async fn establish_over(conn: &mut Connection) -> EstablishResponse {
        let request = WireRequest::Establish(EstablishRequest::new(
            "agent-itest",
            AgentDescriptor {
                compliance_endpoint: "agent/compliance".to_string(),
                metadata: serde_json::Value::Null,
            },
        ));
        let WireResponse::Established(established) = call(conn, &request).await else {
            panic!("expected establish response");
        };
        established
    }

    #[tokio::test]
    async fn establish_then_operate_over_one_connection() {
        let tmp = TempDir::new().unwrap();
        let (_state, path, _shutdown) = start_server(&tmp).await;

        let mut conn = connect(&path).await;
        let established = establish_over(&mut conn).await;

        let request = WireRequest::Operation(OperationRequest {
            dock_id: established.dock_id.clone(),
            handshake_token: established.handshake_token.expose().to_string(),
            operation: Operation::Status,
        });
        let WireResponse::Ok(OperationResponse::Status(snapshot)) = call(&mut conn, &request).await
        else {
            panic!("expected status snapshot");
        };
        assert_eq!(snapshot.dock_id, established.dock_id);
    }

    #[tokio::test]
    async fn invalid_establish_returns_structured_error() {
        let tmp = TempDir::new().unwrap();
        let (_state, path, _shutdown) = start_server(&tmp).await;

        let mut conn = connect(&path).await;
        let request = WireRequest::Establish(EstablishRequest::new(
            "",
            AgentDescriptor {
                compliance_endpoint: "x".to_string(),
                metadata: serde_json::Value::Null,
            },
        ));
        let WireResponse::Error(err) = call(&mut conn, &request).await else {
            panic!("expected error response");
        };
        assert_eq!(err.code, ErrorCode::InvalidRequest);
    }

    #[tokio::test]
    async fn unknown_operation_tag_maps_to_unsupported() {
        let tmp = TempDir::new().unwrap();
        let (_state, path, _shutdown) = start_server(&tmp).await;

        let mut conn = connect(&path).await;
        let raw = Bytes::from_static(
            br#"{"type":"operation","dock_id":"d","handshake_token":"t","op":"teleport"}"#,
        );
        conn.send_frame(raw).await.unwrap();
        let frame = conn.next_frame().await.unwrap().unwrap();
        let response: WireResponse = decode_message(&frame, MAX_FRAME_SIZE).unwrap();

        let WireResponse::Error(err) = response else {
            panic!("expected error response");
        };
        assert_eq!(err.code, ErrorCode::UnsupportedOperation);
    }

    #[tokio::test]
    async fn channel_mode_correlates_out_of_order() {
        let tmp = TempDir::new().unwrap();
        let (_state, path, _shutdown) = start_server(&tmp).await;

        // Establish on one connection, bind a channel on another.
        let mut setup = connect(&path).await;
        let established = establish_over(&mut setup).await;

        let mut chan = connect(&path).await;
        let bind = WireRequest::ChannelBind(ChannelBindRequest {
            dock_id: established.dock_id.clone(),
            handshake_token: established.handshake_token.expose().to_string(),
            channel_id: established.secure_channel_id.clone(),
        });
        let WireResponse::ChannelBound { channel_id } = call(&mut chan, &bind).await else {
            panic!("expected channel bound");
        };
        assert_eq!(channel_id, established.secure_channel_id);

        // Three correlated requests in a burst.
        for request_id in ["r1", "r2", "r3"] {
            let envelope = ChannelRequest {
                request_id: request_id.to_string(),
                operation: OperationRequest {
                    dock_id: established.dock_id.clone(),
                    handshake_token: established.handshake_token.expose().to_string(),
                    operation: Operation::Status,
                },
            };
            chan.send_frame(encode_message(&envelope).unwrap())
                .await
                .unwrap();
        }

        let mut seen = std::collections::BTreeSet::new();
        for _ in 0..3 {
            let frame = chan.next_frame().await.unwrap().unwrap();
            let reply: ChannelReply = decode_message(&frame, MAX_FRAME_SIZE).unwrap();
            assert!(matches!(reply.response, WireResponse::Ok(_)));
            seen.insert(reply.request_id);
        }
        assert_eq!(seen.len(), 3, "each request id answered exactly once");
    }

    #[tokio::test]
    async fn channel_bind_with_wrong_token_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let (_state, path, _shutdown) = start_server(&tmp).await;

        let mut setup = connect(&path).await;
        let established = establish_over(&mut setup).await;

        let mut chan = connect(&path).await;
        let bind = WireRequest::ChannelBind(ChannelBindRequest {
            dock_id: established.dock_id,
            handshake_token: "wrong".to_string(),
            channel_id: established.secure_channel_id,
        });
        let WireResponse::Error(err) = call(&mut chan, &bind).await else {
            panic!("expected error response");
        };
        assert_eq!(err.code, ErrorCode::Unauthorized);
    }

    #[tokio::test]
    async fn undecodable_channel_frame_with_id_gets_error_reply() {
        let tmp = TempDir::new().unwrap();
        let (_state, path, _shutdown) = start_server(&tmp).await;

        let mut setup = connect(&path).await;
        let established = establish_over(&mut setup).await;

        let mut chan = connect(&path).await;
        let bind = WireRequest::ChannelBind(ChannelBindRequest {
            dock_id: established.dock_id.clone(),
            handshake_token: established.handshake_token.expose().to_string(),
            channel_id: established.secure_channel_id.clone(),
        });
        call(&mut chan, &bind).await;

        let raw = Bytes::from_static(br#"{"request_id":"r9","operation":{"nope":true}}"#);
        chan.send_frame(raw).await.unwrap();

        let frame = chan.next_frame().await.unwrap().unwrap();
        let reply: ChannelReply = decode_message(&frame, MAX_FRAME_SIZE).unwrap();
        assert_eq!(reply.request_id, "r9");
        assert!(matches!(reply.response, WireResponse::Error(_)));
    }
}
