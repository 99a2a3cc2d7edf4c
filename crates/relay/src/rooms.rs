// Room registry: broadcast scopes shared by sockets.
//
// A document room is named `tenantId/documentId`, with `%` and `/` escaped
// inside each id so distinct pairs never share a room; every client also has a
// private room `client#<clientId>`. Rooms hold outbound senders only and
// disappear once their last member leaves.

use std::collections::HashMap;

use concord_common::protocol::ws::ServerEvent;
use tokio::sync::{mpsc, RwLock};
use tracing::debug;
use uuid::Uuid;

pub type Outbound = mpsc::UnboundedSender<ServerEvent>;

/// The server side of one websocket: an id plus its outbound queue.
#[derive(Debug, Clone)]
pub struct SocketHandle {
    pub id: Uuid,
    outbound: Outbound,
}

impl SocketHandle {
    pub fn new(outbound: Outbound) -> Self {
        Self { id: Uuid::new_v4(), outbound }
    }

    /// Queues an event for this socket. Returns false once the socket is gone.
    pub fn send(&self, event: ServerEvent) -> bool {
        self.outbound.send(event).is_ok()
    }
}

pub fn document_room(tenant_id: &str, document_id: &str) -> String {
    format!("{}/{}", escape_room_part(tenant_id), escape_room_part(document_id))
}

fn escape_room_part(part: &str) -> String {
    part.replace('%', "%25").replace('/', "%2F")
}

pub fn client_room(client_id: &str) -> String {
    format!("client#{client_id}")
}

#[derive(Debug, Default)]
pub struct RoomHub {
    rooms: RwLock<HashMap<String, HashMap<Uuid, Outbound>>>,
}

impl RoomHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn join(&self, room: &str, socket: &SocketHandle) {
        self.rooms
            .write()
            .await
            .entry(room.to_string())
            .or_default()
            .insert(socket.id, socket.outbound.clone());
    }

    pub async fn leave(&self, room: &str, socket_id: Uuid) {
        let mut rooms = self.rooms.write().await;
        if let Some(members) = rooms.get_mut(room) {
            members.remove(&socket_id);
            if members.is_empty() {
                rooms.remove(room);
            }
        }
    }

    /// Sends to every socket in the room. Returns the number reached.
    pub async fn emit(&self, room: &str, event: ServerEvent) -> usize {
        self.emit_filtered(room, None, event).await
    }

    /// Sends to every socket in the room except `sender`.
    pub async fn broadcast(&self, room: &str, sender: Uuid, event: ServerEvent) -> usize {
        self.emit_filtered(room, Some(sender), event).await
    }

    pub async fn member_count(&self, room: &str) -> usize {
        self.rooms.read().await.get(room).map_or(0, HashMap::len)
    }

    async fn emit_filtered(&self, room: &str, skip: Option<Uuid>, event: ServerEvent) -> usize {
        let rooms = self.rooms.read().await;
        let Some(members) = rooms.get(room) else {
            return 0;
        };

        let mut delivered = 0;
        for (socket_id, outbound) in members {
            if Some(*socket_id) == skip {
                continue;
            }
            if outbound.send(event.clone()).is_ok() {
                delivered += 1;
            } else {
                debug!(room, socket_id = %socket_id, "dropping event for closed socket");
            }
        }
        delivered
    }
}
