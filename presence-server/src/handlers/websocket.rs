//! WebSocket transport for the presence service.
//!
//! One socket serves one authenticated session: the JWT travels in the URL
//! query, requests arrive as JSON envelopes, and stream messages are
//! forwarded until either the stream or the socket closes. Closing the
//! socket destroys the per-connection service, which scrubs the session's
//! presence.

use serde::Serialize;
use shared::{
    ErrorData, PresenceError, PresenceResponse, PresenceResult, RequestEnvelope, ResponseEnvelope,
};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio_tungstenite::{
    accept_hdr_async,
    tungstenite::{handshake::server::Request, Message},
};
use futures_util::{SinkExt, StreamExt};
use tracing::{debug, error, info, warn};

use crate::auth::{JwtAuth, PresenceAuth};
use crate::service::{PresenceService, RequestOutcome};
use crate::stream::PresenceStreamMessage;
use crate::AppState;

/// Frame carrying one batched stream message to the client.
#[derive(Serialize)]
struct StreamFrame<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    id: u64,
    data: &'a PresenceStreamMessage,
}

/// Frame telling the client a stream is finished.
#[derive(Serialize)]
struct StreamClosedFrame {
    #[serde(rename = "type")]
    kind: &'static str,
    id: u64,
}

/// Handle one incoming WebSocket connection end to end.
pub async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    state: AppState,
) -> PresenceResult<()> {
    info!("New connection from: {}", addr);

    let auth_slot: Arc<Mutex<Option<Arc<JwtAuth>>>> = Arc::new(Mutex::new(None));
    let jwt_secret = state.config.jwt.secret.clone();
    let handshake_slot = Arc::clone(&auth_slot);

    // Authenticate during the handshake so an invalid token is rejected
    // with a 401 instead of an open-then-close.
    let ws_stream = accept_hdr_async(stream, move |req: &Request, response| {
        let query = req.uri().query().unwrap_or("");
        let token = query
            .split('&')
            .find_map(|param| param.strip_prefix("token="));

        let Some(token) = token else {
            warn!("WebSocket connection without token");
            return Err(http::Response::builder()
                .status(401)
                .body(Some("Token required".to_string()))
                .unwrap());
        };

        match JwtAuth::from_token(token, &jwt_secret) {
            Ok(auth) => {
                *handshake_slot.lock().unwrap() = Some(auth);
                Ok(response)
            }
            Err(e) => {
                warn!("WebSocket authentication failed: {}", e);
                Err(http::Response::builder()
                    .status(401)
                    .body(Some("Unauthorized".to_string()))
                    .unwrap())
            }
        }
    })
    .await
    .map_err(|e| PresenceError::websocket(&e.to_string()))?;

    let auth = auth_slot
        .lock()
        .unwrap()
        .take()
        .ok_or_else(|| PresenceError::websocket("handshake produced no session"))?;

    let session_id = auth.session_id().unwrap_or_default();
    info!(session_id = %session_id, "WebSocket connection established");

    let service = Arc::new(PresenceService::new(
        Arc::clone(&auth) as Arc<dyn PresenceAuth>,
        Arc::clone(&state.store),
        Arc::clone(&state.manager),
        Arc::clone(&state.subscriber),
        &state.config.presence,
    ));

    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let (tx, mut rx) = mpsc::unbounded_channel();

    // Outgoing messages are funneled through one task.
    let outgoing_task = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if let Err(e) = ws_sender.send(message).await {
                debug!("Failed to send WebSocket message: {}", e);
                break;
            }
        }
    });

    while let Some(msg) = ws_receiver.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                if let Err(e) = handle_client_message(&text, &service, &tx).await {
                    error!("Error handling client message: {}", e);
                }
            }
            Ok(Message::Close(_)) => {
                info!(session_id = %session_id, "WebSocket connection closed by client");
                break;
            }
            Ok(Message::Ping(data)) => {
                let _ = tx.send(Message::Pong(data));
            }
            Err(e) => {
                warn!(session_id = %session_id, "WebSocket error: {}", e);
                break;
            }
            _ => {}
        }
    }

    // The transport is the service's owner: tearing the socket down destroys
    // the service, which scrubs presence and closes every owned stream.
    auth.destroy();
    service.destroy();
    drop(tx);
    let _ = outgoing_task.await;

    info!(session_id = %session_id, "WebSocket connection finished");
    Ok(())
}

/// Parse and dispatch one request envelope.
async fn handle_client_message(
    text: &str,
    service: &Arc<PresenceService>,
    tx: &UnboundedSender<Message>,
) -> PresenceResult<()> {
    let envelope: RequestEnvelope = match serde_json::from_str(text) {
        Ok(envelope) => envelope,
        Err(e) => {
            debug!("Failed to parse request: {}", e);
            send_response(
                tx,
                0,
                PresenceResponse::Error(ErrorData {
                    code: "INVALID_REQUEST".to_string(),
                    message: "Invalid request format".to_string(),
                }),
            )?;
            return Ok(());
        }
    };

    let response = match service.handle_request(envelope.request).await {
        Ok(RequestOutcome::Ack) => PresenceResponse::Ack,
        Ok(RequestOutcome::Presence(presence)) => PresenceResponse::Presence(presence),
        Ok(RequestOutcome::PresenceList(list)) => PresenceResponse::PresenceList(list),
        Ok(RequestOutcome::Stream(mut handle)) => {
            let stream_id = handle.id;
            let forward_tx = tx.clone();
            // Forward stream messages until the stream or the socket closes.
            tokio::spawn(async move {
                while let Some(message) = handle.messages.recv().await {
                    let frame = StreamFrame {
                        kind: "streamData",
                        id: stream_id,
                        data: &message,
                    };
                    let encoded = match serde_json::to_string(&frame) {
                        Ok(encoded) => encoded,
                        Err(e) => {
                            error!("Failed to encode stream frame: {}", e);
                            continue;
                        }
                    };
                    if forward_tx.send(Message::Text(encoded)).is_err() {
                        return;
                    }
                }
                let closed = StreamClosedFrame {
                    kind: "streamClosed",
                    id: stream_id,
                };
                if let Ok(encoded) = serde_json::to_string(&closed) {
                    let _ = forward_tx.send(Message::Text(encoded));
                }
            });
            PresenceResponse::StreamOpened { stream_id }
        }
        Err(e) => {
            if e.is_client_error() {
                debug!("Request rejected: {}", e);
            } else {
                error!("Request failed: {}", e);
            }
            PresenceResponse::Error(ErrorData {
                code: e.error_code().to_string(),
                message: e.to_string(),
            })
        }
    };

    send_response(tx, envelope.id, response)
}

fn send_response(
    tx: &UnboundedSender<Message>,
    id: u64,
    response: PresenceResponse,
) -> PresenceResult<()> {
    let envelope = ResponseEnvelope { id, response };
    let encoded = serde_json::to_string(&envelope)?;
    tx.send(Message::Text(encoded))
        .map_err(|_| PresenceError::websocket("connection is gone"))?;
    Ok(())
}
