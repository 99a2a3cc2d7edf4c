use super::protocol as ws_protocol;
use super::session::{
    GatewayState, SocketSessions, HEARTBEAT_INTERVAL_MS, HEARTBEAT_TIMEOUT_MS, MAX_FRAME_BYTES,
};
use crate::error::{current_request_id, request_id_from_headers_or_generate, with_request_id_scope};
use crate::metrics;
use crate::rooms::SocketHandle;
use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::HeaderMap,
    response::IntoResponse,
    routing::get,
    Router,
};
use concord_common::protocol::ws::ServerEvent;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, warn};

pub fn router(state: GatewayState) -> Router {
    Router::new().route("/socket", get(ws_upgrade)).with_state(state)
}

pub async fn ws_upgrade(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let request_id = request_id_from_headers_or_generate(&headers);
    ws.max_frame_size(MAX_FRAME_BYTES).max_message_size(MAX_FRAME_BYTES).on_upgrade(
        move |socket| async move {
            with_request_id_scope(request_id, handle_socket(state, socket)).await;
        },
    )
}

fn frame_size_exceeded_reason() -> String {
    format!("websocket frame exceeds maximum size of {MAX_FRAME_BYTES} bytes")
}

async fn close_with(socket: &mut WebSocket, code: u16, reason: String) {
    let _ = socket.send(Message::Close(Some(CloseFrame { code, reason: reason.into() }))).await;
}

async fn handle_socket(state: GatewayState, mut socket: WebSocket) {
    let request_id = current_request_id().unwrap_or_else(|| "unknown".to_string());

    let (outbound_sender, mut outbound_receiver) = mpsc::unbounded_channel::<ServerEvent>();
    let (mut sessions, mut failures) =
        SocketSessions::new(state, SocketHandle::new(outbound_sender));
    let socket_id = sessions.socket().id;

    // Heartbeat: server pings every HEARTBEAT_INTERVAL_MS, disconnects if no
    // pong arrives within HEARTBEAT_TIMEOUT_MS.
    let mut heartbeat_interval =
        tokio::time::interval(std::time::Duration::from_millis(HEARTBEAT_INTERVAL_MS));
    heartbeat_interval.reset();
    let mut last_pong = Instant::now();
    let heartbeat_timeout = std::time::Duration::from_millis(HEARTBEAT_TIMEOUT_MS);

    loop {
        tokio::select! {
            _ = heartbeat_interval.tick() => {
                if last_pong.elapsed() > heartbeat_timeout {
                    warn!(
                        socket_id = %socket_id,
                        request_id = %request_id,
                        "heartbeat timeout, disconnecting"
                    );
                    break;
                }
                if socket.send(Message::Ping(vec![].into())).await.is_err() {
                    break;
                }
            }
            maybe_outbound = outbound_receiver.recv() => {
                match maybe_outbound {
                    Some(event) => {
                        if ws_protocol::send_ws_message(&mut socket, &event).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            Some(failure) = failures.recv() => {
                error!(
                    socket_id = %socket_id,
                    request_id = %request_id,
                    tenant_id = %failure.tenant_id,
                    document_id = %failure.document_id,
                    client_id = %failure.client_id,
                    "disconnecting socket on orderer connection error"
                );
                close_with(&mut socket, close_code::ERROR, "orderer connection failed".to_string())
                    .await;
                break;
            }
            maybe_message = socket.recv() => {
                let Some(message) = maybe_message else {
                    break;
                };

                match message {
                    Ok(Message::Text(raw_message)) => {
                        if raw_message.len() > MAX_FRAME_BYTES {
                            close_with(&mut socket, close_code::SIZE, frame_size_exceeded_reason())
                                .await;
                            break;
                        }

                        let started_at = Instant::now();
                        match ws_protocol::decode_message(&raw_message) {
                            Ok(event) => {
                                let (endpoint, is_error) = sessions.handle(event).await;
                                metrics::record_ws_request(
                                    endpoint,
                                    is_error,
                                    started_at.elapsed().as_millis() as u64,
                                );
                            }
                            Err(decode_error) => {
                                metrics::record_ws_request(
                                    "invalid",
                                    true,
                                    started_at.elapsed().as_millis() as u64,
                                );
                                warn!(
                                    socket_id = %socket_id,
                                    error = %decode_error,
                                    "ignoring undecodable websocket frame"
                                );
                            }
                        }
                    }
                    Ok(Message::Ping(payload)) => {
                        if socket.send(Message::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Ok(Message::Pong(_)) => {
                        last_pong = Instant::now();
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(Message::Binary(_)) => {
                        debug!(socket_id = %socket_id, "ignoring binary websocket frame");
                    }
                    Err(receive_error) => {
                        debug!(socket_id = %socket_id, error = %receive_error, "websocket receive failed");
                        break;
                    }
                }
            }
        }
    }

    sessions.disconnect().await;
}
