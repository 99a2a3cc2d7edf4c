use axum::extract::ws::{Message, WebSocket};
use concord_common::protocol::ws::{ClientEvent, ServerEvent};

pub fn decode_message(raw: &str) -> Result<ClientEvent, serde_json::Error> {
    serde_json::from_str::<ClientEvent>(raw)
}

pub fn encode_message(event: &ServerEvent) -> Result<String, serde_json::Error> {
    serde_json::to_string(event)
}

pub async fn send_ws_message(socket: &mut WebSocket, event: &ServerEvent) -> Result<(), ()> {
    let encoded = encode_message(event).map_err(|_| ())?;
    socket.send(Message::Text(encoded.into())).await.map_err(|_| ())
}
