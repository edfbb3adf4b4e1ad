//! Synchronous request/response transport.
//!
//! One connection per call: connect, send a single framed request,
//! read the single framed response. Every call is bounded by a
//! timeout.

use std::path::Path;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::UnixStream;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use berth_core::messages::{
    decode_message, encode_message, OperationResponse, WireRequest, WireResponse, MAX_FRAME_SIZE,
};

use crate::error::ClientError;

/// Wrap a stream in the length-prefixed framing the daemon speaks.
pub(crate) fn framed(stream: UnixStream) -> Framed<UnixStream, LengthDelimitedCodec> {
    let codec = LengthDelimitedCodec::builder()
        .length_field_length(4)
        .max_frame_length(MAX_FRAME_SIZE)
        .new_codec();
    Framed::new(stream, codec)
}

/// Issue one request and await its response, bounded by `timeout`.
///
/// # Errors
///
/// [`ClientError::DaemonNotRunning`] if the socket is absent,
/// [`ClientError::Timeout`] if the bound elapses, or transport/decode
/// failures.
pub async fn call(
    socket_path: &Path,
    request: &WireRequest,
    timeout: Duration,
) -> Result<WireResponse, ClientError> {
    let fut = async {
        let stream = UnixStream::connect(socket_path).await?;
        let mut framed = framed(stream);

        framed
            .send(encode_message(request)?)
            .await
            .map_err(ClientError::from)?;

        let frame = framed
            .next()
            .await
            .ok_or(ClientError::ChannelClosed)?
            .map_err(ClientError::from)?;
        Ok(decode_message::<WireResponse>(&frame, MAX_FRAME_SIZE)?)
    };

    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_elapsed) => Err(ClientError::Timeout {
            duration_ms: timeout.as_millis() as u64,
        }),
    }
}

/// Unwrap an operation response, converting error envelopes.
///
/// # Errors
///
/// [`ClientError::Daemon`] for error envelopes,
/// [`ClientError::UnexpectedResponse`] for shape mismatches.
pub fn expect_ok(response: WireResponse) -> Result<OperationResponse, ClientError> {
    match response {
        WireResponse::Ok(operation) => Ok(operation),
        WireResponse::Error(err) => Err(ClientError::Daemon {
            code: err.code,
            message: err.error,
        }),
        other => Err(ClientError::UnexpectedResponse {
            reason: format!("expected operation response, got {other:?}"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use berth_core::messages::{ErrorCode, ErrorResponse};

    use super::*;

    #[tokio::test]
    async fn missing_socket_is_daemon_not_running() {
        let request = WireRequest::Operation(berth_core::messages::OperationRequest {
            dock_id: "d".to_string(),
            handshake_token: "t".to_string(),
            operation: berth_core::messages::Operation::Status,
        });
        let err = call(
            Path::new("/nonexistent/berth/dock.sock"),
            &request,
            Duration::from_secs(1),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ClientError::DaemonNotRunning));
    }

    #[test]
    fn expect_ok_unwraps_and_converts() {
        let ok = WireResponse::Ok(OperationResponse::Deposit {
            accepted: true,
            deposits: 1,
        });
        assert!(expect_ok(ok).is_ok());

        let err = WireResponse::Error(ErrorResponse::new(ErrorCode::Unauthorized, "nope"));
        let converted = expect_ok(err).unwrap_err();
        assert!(converted.is_session_invalid());

        let unexpected = WireResponse::ChannelBound {
            channel_id: "c".to_string(),
        };
        assert!(matches!(
            expect_ok(unexpected),
            Err(ClientError::UnexpectedResponse { .. })
        ));
    }
}
