// Ordering connections to an external ordering service over WebSocket.
//
// Each client connection opens its own socket to
// `{base}/v1/orderer/{tenantId}/{documentId}`. Frames are JSON tagged by
// `event`, mirroring the gateway's socket protocol. The service sends every
// sequenced `op` to all sockets of the document, in sequence order; the
// pumps of one document share a cursor so the room sees each op once.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use anyhow::{bail, Context};
use concord_common::protocol::{
    messages::{Client, DocumentMessage, Nack, SequencedDocumentMessage, ServiceConfiguration},
    ws::ServerEvent,
};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, info_span, warn, Instrument};
use url::Url;

use super::{
    local::DocumentKey, ConnectionState, Lifecycle, OrdererConnection, OrdererConnectionFactory, OrdererError,
    OrdererFuture,
};
use crate::{
    metrics,
    rooms::{document_room, RoomHub, SocketHandle},
    store::DocumentDetails,
};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
enum OrdererFrame {
    Join { client_id: String, client: Client },
    Submit { client_id: String, messages: Vec<DocumentMessage> },
    Leave { client_id: String },
    Op { document_id: String, messages: Vec<SequencedDocumentMessage> },
    Nack { document_id: String, nacks: Vec<Nack> },
}

/// Highest sequence number relayed to each document room, shared by the
/// pumps of that document. Entries go away with the last pump.
#[derive(Default)]
struct RelayCursors {
    documents: Mutex<HashMap<DocumentKey, RelayCursor>>,
}

struct RelayCursor {
    pumps: usize,
    relayed: Arc<AsyncMutex<i64>>,
}

impl RelayCursors {
    fn acquire(&self, key: &DocumentKey) -> Arc<AsyncMutex<i64>> {
        let mut documents = self.documents.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let cursor = documents
            .entry(key.clone())
            .or_insert_with(|| RelayCursor { pumps: 0, relayed: Arc::new(AsyncMutex::new(0)) });
        cursor.pumps += 1;
        Arc::clone(&cursor.relayed)
    }

    fn release(&self, key: &DocumentKey) {
        let mut documents = self.documents.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(cursor) = documents.get_mut(key) {
            cursor.pumps = cursor.pumps.saturating_sub(1);
            if cursor.pumps == 0 {
                documents.remove(key);
            }
        }
    }

    fn len(&self) -> usize {
        self.documents.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).len()
    }
}

pub struct RemoteOrdererConnectionFactory {
    base_url: Url,
    rooms: Arc<RoomHub>,
    cursors: Arc<RelayCursors>,
    service_configuration: ServiceConfiguration,
}

impl RemoteOrdererConnectionFactory {
    pub fn new(
        base_url: &str,
        rooms: Arc<RoomHub>,
        service_configuration: ServiceConfiguration,
    ) -> anyhow::Result<Self> {
        let mut url = Url::parse(base_url).context("invalid remote orderer url")?;
        let scheme = match url.scheme() {
            "ws" | "http" => "ws",
            "wss" | "https" => "wss",
            other => bail!("remote orderer url must use ws, wss, http or https; got {other}"),
        };
        if url.set_scheme(scheme).is_err() {
            bail!("remote orderer url scheme cannot be rewritten to {scheme}");
        }

        Ok(Self { base_url: url, rooms, cursors: Arc::default(), service_configuration })
    }

    fn endpoint(&self, tenant_id: &str, document_id: &str) -> Result<Url, OrdererError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| OrdererError::NotConfigured("remote orderer url cannot be a base"))?
            .pop_if_empty()
            .extend(["v1", "orderer", tenant_id, document_id]);
        Ok(url)
    }
}

impl OrdererConnectionFactory for RemoteOrdererConnectionFactory {
    fn connect<'a>(
        &'a self,
        socket: &'a SocketHandle,
        client_id: &'a str,
        client: &'a Client,
        details: &'a DocumentDetails,
    ) -> OrdererFuture<'a, Arc<dyn OrdererConnection>> {
        Box::pin(async move {
            let tenant_id = details.value.tenant_id.clone();
            let document_id = details.value.document_id.clone();
            let endpoint = self.endpoint(&tenant_id, &document_id)?;

            let connection: Arc<dyn OrdererConnection> = Arc::new(RemoteOrdererConnection {
                endpoint,
                tenant_id,
                document_id,
                client_id: client_id.to_string(),
                client: client.clone(),
                socket: socket.clone(),
                rooms: Arc::clone(&self.rooms),
                cursors: Arc::clone(&self.cursors),
                lifecycle: Arc::new(Lifecycle::new()),
                frames: Mutex::new(None),
                service_configuration: self.service_configuration.clone(),
            });
            Ok(connection)
        })
    }
}

struct RemoteOrdererConnection {
    endpoint: Url,
    tenant_id: String,
    document_id: String,
    client_id: String,
    client: Client,
    socket: SocketHandle,
    rooms: Arc<RoomHub>,
    cursors: Arc<RelayCursors>,
    lifecycle: Arc<Lifecycle>,
    frames: Mutex<Option<mpsc::UnboundedSender<OrdererFrame>>>,
    service_configuration: ServiceConfiguration,
}

impl RemoteOrdererConnection {
    fn send_frame(&self, frame: OrdererFrame) -> bool {
        let frames = self.frames.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        frames.as_ref().is_some_and(|frames| frames.send(frame).is_ok())
    }

    fn fail(&self, reason: &str) {
        warn!(
            client_id = %self.client_id,
            document_id = %self.document_id,
            reason,
            "remote orderer connection failed"
        );
        if self.lifecycle.fail() {
            metrics::increment_sequencer_failures();
        }
    }
}

impl OrdererConnection for RemoteOrdererConnection {
    fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    fn document_id(&self) -> &str {
        &self.document_id
    }

    fn client_id(&self) -> &str {
        &self.client_id
    }

    fn parent_branch(&self) -> Option<&str> {
        None
    }

    fn max_message_size(&self) -> u64 {
        self.service_configuration.max_message_size
    }

    fn service_configuration(&self) -> &ServiceConfiguration {
        &self.service_configuration
    }

    fn connect(&self) -> OrdererFuture<'_, ()> {
        Box::pin(async move {
            let (stream, _) = match connect_async(self.endpoint.as_str()).await {
                Ok(connected) => connected,
                Err(error) => {
                    self.fail("connect failed");
                    return Err(OrdererError::Remote(error.to_string()));
                }
            };

            let (sender, receiver) = mpsc::unbounded_channel();
            sender
                .send(OrdererFrame::Join {
                    client_id: self.client_id.clone(),
                    client: self.client.clone(),
                })
                .map_err(|_| OrdererError::Remote("frame queue closed".to_string()))?;
            *self.frames.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(sender);

            let key = (self.tenant_id.clone(), self.document_id.clone());
            let pump = FramePump {
                room: document_room(&self.tenant_id, &self.document_id),
                socket: self.socket.clone(),
                rooms: Arc::clone(&self.rooms),
                relayed: self.cursors.acquire(&key),
                cursors: Arc::clone(&self.cursors),
                key,
                lifecycle: Arc::clone(&self.lifecycle),
            };
            let span = info_span!(
                "relay.remote_orderer",
                tenant_id = %self.tenant_id,
                document_id = %self.document_id,
                client_id = %self.client_id
            );
            tokio::spawn(pump.run(stream, receiver).instrument(span));

            info!(endpoint = %self.endpoint, client_id = %self.client_id, "remote orderer connected");
            self.lifecycle.transition(ConnectionState::Connected)
        })
    }

    fn order(&self, messages: Vec<DocumentMessage>) {
        if self.lifecycle.current() != ConnectionState::Connected {
            self.fail("order called outside of an open connection");
            return;
        }

        let frame = OrdererFrame::Submit { client_id: self.client_id.clone(), messages };
        if !self.send_frame(frame) {
            self.fail("frame queue closed");
        }
    }

    fn disconnect(&self) -> OrdererFuture<'_, ()> {
        Box::pin(async move {
            let _ = self.lifecycle.transition(ConnectionState::Closed);
            self.send_frame(OrdererFrame::Leave { client_id: self.client_id.clone() });
            // Dropping the queue ends the pump once the leave frame is written.
            self.frames.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).take();
            Ok(())
        })
    }

    fn state(&self) -> watch::Receiver<ConnectionState> {
        self.lifecycle.subscribe()
    }
}

struct FramePump {
    room: String,
    socket: SocketHandle,
    rooms: Arc<RoomHub>,
    key: DocumentKey,
    cursors: Arc<RelayCursors>,
    relayed: Arc<AsyncMutex<i64>>,
    lifecycle: Arc<Lifecycle>,
}

impl FramePump {
    async fn run<S>(self, stream: S, mut outgoing: mpsc::UnboundedReceiver<OrdererFrame>)
    where
        S: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>>
            + futures_util::Sink<Message, Error = tokio_tungstenite::tungstenite::Error>
            + Unpin,
    {
        let (mut sink, mut incoming) = stream.split();

        loop {
            tokio::select! {
                frame = outgoing.recv() => {
                    let Some(frame) = frame else {
                        let _ = sink.send(Message::Close(None)).await;
                        break;
                    };
                    let encoded = match serde_json::to_string(&frame) {
                        Ok(encoded) => encoded,
                        Err(error) => {
                            warn!(error = %error, "failed to encode orderer frame");
                            continue;
                        }
                    };
                    if sink.send(Message::Text(encoded.into())).await.is_err() {
                        self.fail("send failed");
                        break;
                    }
                }
                received = incoming.next() => {
                    match received {
                        Some(Ok(Message::Text(text))) => self.relay(text.as_str()).await,
                        Some(Ok(Message::Ping(payload))) => {
                            if sink.send(Message::Pong(payload)).await.is_err() {
                                self.fail("pong failed");
                                break;
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            self.fail("remote orderer closed the socket");
                            break;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(error)) => {
                            warn!(error = %error, "remote orderer socket error");
                            self.fail("socket error");
                            break;
                        }
                    }
                }
            }
        }

        self.cursors.release(&self.key);
        debug!(room = %self.room, "remote orderer pump stopped");
    }

    async fn relay(&self, text: &str) {
        match serde_json::from_str::<OrdererFrame>(text) {
            Ok(OrdererFrame::Op { document_id, messages }) => {
                let mut relayed = self.relayed.lock().await;
                let fresh: Vec<_> =
                    messages.into_iter().filter(|message| message.sequence_number > *relayed).collect();
                let Some(last) = fresh.iter().map(|message| message.sequence_number).max() else {
                    return;
                };
                *relayed = last;
                self.rooms.emit(&self.room, ServerEvent::Op { document_id, messages: fresh }).await;
            }
            Ok(OrdererFrame::Nack { document_id, nacks }) => {
                self.socket.send(ServerEvent::Nack { document_id, nacks });
                self.fail("remote orderer rejected the client");
            }
            Ok(other) => debug!(frame = ?other, "ignoring unexpected orderer frame"),
            Err(error) => warn!(error = %error, "undecodable orderer frame"),
        }
    }

    /// A close after `disconnect` is expected and leaves the state alone.
    fn fail(&self, reason: &str) {
        if self.lifecycle.current().is_terminal() {
            return;
        }
        warn!(room = %self.room, reason, "remote orderer connection failed");
        if self.lifecycle.fail() {
            metrics::increment_sequencer_failures();
        }
    }
}
