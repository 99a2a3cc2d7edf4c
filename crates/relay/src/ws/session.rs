// Per-socket session state.
//
// A socket task owns one `SocketSessions`. Every session it establishes via
// `connect_document` lives in that map and nowhere else; shared state is
// only touched through the room hub, the storage collaborators and the
// orderer manager.

use std::{collections::HashMap, sync::Arc};

use concord_common::protocol::{
    messages::{
        can_summarize, can_write, message_type, sanitize_message, Client, ConnectRequest,
        Connected, ConnectionMode, ContentMessage, Nack, NackErrorType, ServiceConfiguration,
        SignalMessage, TokenClaims, Trace,
    },
    ws::{flatten_batches, Batch, ClientEvent, ServerEvent},
};
use futures_util::future::join_all;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    auth::jwt::{decode_claims_unverified, TenantManager},
    error::ConnectError,
    metrics::{self, LatencyMetricSink},
    orderer::{ConnectionState, OrdererConnection, OrdererError, OrdererManager},
    protocol,
    rooms::{client_room, document_room, RoomHub, SocketHandle},
    store::{Collaborators, ContentRecord, DocumentDetails, StoreError},
};

pub(crate) const HEARTBEAT_INTERVAL_MS: u64 = 15_000;
pub(crate) const HEARTBEAT_TIMEOUT_MS: u64 = 45_000;
pub(crate) const MAX_FRAME_BYTES: usize = 1024 * 1024;
/// Message size ceiling advertised to read-only sessions.
pub(crate) const READ_ONLY_MAX_MESSAGE_SIZE: u64 = 1024;
const LATENCY_METRIC: &str = "latency";

/// Shared dependencies of every socket task.
#[derive(Clone)]
pub struct GatewayState {
    pub tenants: Arc<dyn TenantManager>,
    pub collaborators: Collaborators,
    pub orderers: Arc<OrdererManager>,
    pub rooms: Arc<RoomHub>,
    pub latency_sink: Arc<dyn LatencyMetricSink>,
    pub max_clients_per_document: usize,
}

/// One client connection to one document.
pub struct Session {
    pub client_id: String,
    pub tenant_id: String,
    pub document_id: String,
    pub room: String,
    pub client: Client,
    pub scopes: Vec<String>,
    pub version: &'static str,
    /// Client offered `^0.3.0` and receives room join/leave signals.
    pub room_signals: bool,
    pub connection: Option<Arc<dyn OrdererConnection>>,
}

/// Reported by the failure watcher when a bound connection fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrdererFailure {
    pub client_id: String,
    pub tenant_id: String,
    pub document_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ContentSubmission {
    client_sequence_number: i64,
    #[serde(default)]
    contents: Value,
}

fn has_write_access(scopes: &[String]) -> bool {
    can_write(scopes) || can_summarize(scopes)
}

/// A new document always needs a writer; otherwise an absent mode counts
/// as a write request.
fn is_writer(scopes: &[String], existing: bool, mode: Option<ConnectionMode>) -> bool {
    if !has_write_access(scopes) {
        return false;
    }

    !existing || mode != Some(ConnectionMode::Read)
}

pub struct SocketSessions {
    state: GatewayState,
    socket: SocketHandle,
    sessions: HashMap<String, Session>,
    failures: mpsc::UnboundedSender<OrdererFailure>,
}

impl SocketSessions {
    pub fn new(
        state: GatewayState,
        socket: SocketHandle,
    ) -> (Self, mpsc::UnboundedReceiver<OrdererFailure>) {
        let (failures, failure_receiver) = mpsc::unbounded_channel();
        (Self { state, socket, sessions: HashMap::new(), failures }, failure_receiver)
    }

    pub fn socket(&self) -> &SocketHandle {
        &self.socket
    }

    pub fn session(&self, client_id: &str) -> Option<&Session> {
        self.sessions.get(client_id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Routes one client event. Returns the metric endpoint name and
    /// whether the request failed.
    pub async fn handle(&mut self, event: ClientEvent) -> (&'static str, bool) {
        match event {
            ClientEvent::ConnectDocument { request } => {
                ("connect_document", self.handle_connect(request).await)
            }
            ClientEvent::SubmitOp { client_id, batches, ack_id } => {
                ("submit_op", self.submit_op(&client_id, batches, ack_id))
            }
            ClientEvent::SubmitContent { client_id, message, ack_id } => {
                ("submit_content", self.submit_content(&client_id, message, ack_id).await)
            }
            ClientEvent::SubmitSignal { client_id, batches, ack_id } => {
                ("submit_signal", self.submit_signal(&client_id, batches, ack_id).await)
            }
        }
    }

    async fn handle_connect(&mut self, request: ConnectRequest) -> bool {
        let tenant_id = request.tenant_id.clone();
        let document_id = request.id.clone();

        match self.connect_document(request).await {
            Ok(connection) => {
                let client_id = connection.client_id.clone();
                info!(
                    tenant_id = %tenant_id,
                    document_id = %document_id,
                    client_id = %client_id,
                    mode = ?connection.mode,
                    version = %connection.version,
                    "client connected to document"
                );
                self.socket.send(ServerEvent::ConnectDocumentSuccess { connection });

                if let Some(session) = self.sessions.get(&client_id) {
                    if session.room_signals {
                        let join = SignalMessage::room_join(&client_id, &session.client);
                        self.state.rooms.emit(&session.room, ServerEvent::Signal { message: join }).await;
                    }
                }
                false
            }
            Err(connect_error) => {
                warn!(
                    tenant_id = %tenant_id,
                    document_id = %document_id,
                    error = %connect_error,
                    "connect document failed"
                );
                self.socket.send(ServerEvent::ConnectDocumentError { error: connect_error.to_failure() });
                true
            }
        }
    }

    /// Authenticates, negotiates and admits a client for one document.
    pub async fn connect_document(
        &mut self,
        request: ConnectRequest,
    ) -> Result<Connected, ConnectError> {
        let token = request
            .token
            .as_deref()
            .filter(|token| !token.is_empty())
            .ok_or(ConnectError::MissingToken)?;
        let unverified = decode_claims_unverified(token)?;
        if unverified.document_id != request.id || unverified.tenant_id != request.tenant_id {
            return Err(ConnectError::ClaimsMismatch {
                tenant_id: unverified.tenant_id,
                document_id: unverified.document_id,
            });
        }
        let claims = self.state.tenants.verify_token(&request.tenant_id, token).await?;

        let client_id = Uuid::new_v4().to_string();
        let room = document_room(&claims.tenant_id, &claims.document_id);
        self.state.rooms.join(&room, &self.socket).await;
        self.state.rooms.join(&client_room(&client_id), &self.socket).await;

        match self.admit(&request, claims, &client_id, &room).await {
            Ok(connected) => Ok(connected),
            Err(connect_error) => {
                self.release_rooms(&room, &client_id).await;
                Err(connect_error)
            }
        }
    }

    async fn admit(
        &mut self,
        request: &ConnectRequest,
        claims: TokenClaims,
        client_id: &str,
        room: &str,
    ) -> Result<Connected, ConnectError> {
        let mut client = request.client.clone().unwrap_or_default();
        client.user = claims.user.clone();
        client.scopes = claims.scopes.clone();

        let offered = protocol::offered_or_default(request.versions.as_deref());
        let version = protocol::select_protocol_version(&offered)?;

        let tenant_id = claims.tenant_id.as_str();
        let document_id = claims.document_id.as_str();
        let collaborators = &self.state.collaborators;
        let (details, clients) = tokio::try_join!(
            collaborators.documents.get_or_create_document(tenant_id, document_id),
            collaborators.clients.get_clients(tenant_id, document_id),
        )?;

        if clients.len() > self.state.max_clients_per_document {
            return Err(ConnectError::TooManyClients {
                connected: clients.len(),
                limit: self.state.max_clients_per_document,
            });
        }

        collaborators.clients.add_client(tenant_id, document_id, client_id, &client).await?;

        let connection = if is_writer(&client.scopes, details.existing, request.mode) {
            match self.bind_orderer(client_id, &client, &details).await {
                Ok(connection) => Some(connection),
                Err(orderer_error) => {
                    if let Err(cleanup_error) =
                        collaborators.clients.remove_client(tenant_id, document_id, client_id).await
                    {
                        warn!(
                            client_id,
                            error = %cleanup_error,
                            "failed to unregister client after orderer failure"
                        );
                    }
                    return Err(orderer_error.into());
                }
            }
        } else {
            None
        };

        let (mode, max_message_size, parent_branch, service_configuration) = match &connection {
            Some(connection) => (
                ConnectionMode::Write,
                connection.max_message_size(),
                connection.parent_branch().map(str::to_string),
                connection.service_configuration().clone(),
            ),
            None => (
                ConnectionMode::Read,
                READ_ONLY_MAX_MESSAGE_SIZE,
                None,
                ServiceConfiguration::default(),
            ),
        };

        let connected = Connected {
            claims: claims.clone(),
            client_id: client_id.to_string(),
            existing: details.existing,
            max_message_size,
            mode,
            parent_branch,
            service_configuration,
            initial_clients: clients,
            initial_contents: Vec::new(),
            initial_messages: Vec::new(),
            initial_signals: Vec::new(),
            supported_versions: protocol::supported_versions_owned(),
            version: version.to_string(),
        };

        self.sessions.insert(
            client_id.to_string(),
            Session {
                client_id: client_id.to_string(),
                tenant_id: claims.tenant_id,
                document_id: claims.document_id,
                room: room.to_string(),
                scopes: client.scopes.clone(),
                client,
                version,
                room_signals: protocol::supports_room_signals(&offered),
                connection,
            },
        );
        metrics::add_connected_clients(1);

        Ok(connected)
    }

    async fn bind_orderer(
        &self,
        client_id: &str,
        client: &Client,
        details: &DocumentDetails,
    ) -> Result<Arc<dyn OrdererConnection>, OrdererError> {
        let orderer = self
            .state
            .orderers
            .get_orderer(&details.value.tenant_id, &details.value.document_id)
            .await?;
        let connection = orderer.connect(&self.socket, client_id, client, details).await?;
        connection.connect().await?;
        self.watch_failures(&connection);
        Ok(connection)
    }

    fn watch_failures(&self, connection: &Arc<dyn OrdererConnection>) {
        let mut state = connection.state();
        let failures = self.failures.clone();
        let failure = OrdererFailure {
            client_id: connection.client_id().to_string(),
            tenant_id: connection.tenant_id().to_string(),
            document_id: connection.document_id().to_string(),
        };

        tokio::spawn(async move {
            let ended = state.wait_for(|state| state.is_terminal()).await.map(|state| *state);
            if let Ok(ConnectionState::Failed) = ended {
                let _ = failures.send(failure);
            }
        });
    }

    /// Leaves the client's private room, and the document room unless
    /// another session on this socket still uses it.
    async fn release_rooms(&self, room: &str, client_id: &str) {
        let rooms = &self.state.rooms;
        rooms.leave(&client_room(client_id), self.socket.id).await;
        if !self.sessions.values().any(|session| session.room == room) {
            rooms.leave(room, self.socket.id).await;
        }
    }

    fn bound_connection(&self, client_id: &str) -> Option<&Arc<dyn OrdererConnection>> {
        self.sessions.get(client_id).and_then(|session| session.connection.as_ref())
    }

    fn unbound_nack(&self, client_id: &str) -> Nack {
        match self.sessions.get(client_id) {
            Some(session) if has_write_access(&session.scopes) => {
                Nack::new(400, NackErrorType::BadRequestError, "Readonly client")
            }
            Some(_) => Nack::new(403, NackErrorType::InvalidScopeError, "Invalid scope"),
            None => Nack::new(400, NackErrorType::BadRequestError, "Nonexistent client"),
        }
    }

    fn nack(&self, nack: Nack) {
        metrics::increment_nacks_total(nack.content.error_type);
        self.socket.send(ServerEvent::Nack { document_id: String::new(), nacks: vec![nack] });
    }

    fn ack(&self, ack_id: Option<u64>, error: Option<&str>) {
        if let Some(ack_id) = ack_id {
            self.socket.send(ServerEvent::Ack { ack_id, error: error.map(str::to_string) });
        }
    }

    /// Forwards each batch to the bound orderer. The ack fires before the
    /// operations are sequenced.
    pub fn submit_op(&self, client_id: &str, batches: Vec<Batch<Value>>, ack_id: Option<u64>) -> bool {
        let Some(connection) = self.bound_connection(client_id) else {
            self.nack(self.unbound_nack(client_id));
            return true;
        };

        for batch in batches {
            let messages = match batch {
                Batch::Many(messages) => messages,
                Batch::One(message) => vec![message],
            };

            let mut sanitized = Vec::with_capacity(messages.len());
            for raw in messages {
                if raw.get("type").and_then(Value::as_str) == Some(message_type::ROUND_TRIP) {
                    self.record_round_trip(&raw);
                    continue;
                }

                match sanitize_message(&raw) {
                    Ok(message) => sanitized.push(message),
                    Err(decode_error) => {
                        debug!(client_id, error = %decode_error, "dropping malformed operation");
                        self.nack(Nack::new(400, NackErrorType::BadRequestError, "Invalid message"));
                    }
                }
            }

            if !sanitized.is_empty() {
                connection.order(sanitized);
            }
        }

        self.ack(ack_id, None);
        false
    }

    fn record_round_trip(&self, raw: &Value) {
        let traces = match raw.get("traces").cloned() {
            Some(traces) => serde_json::from_value::<Vec<Trace>>(traces).unwrap_or_else(|decode_error| {
                warn!(error = %decode_error, "round trip message carries invalid traces");
                Vec::new()
            }),
            None => Vec::new(),
        };

        if let Err(metric_error) = self.state.latency_sink.write_latency_metric(LATENCY_METRIC, &traces) {
            error!(error = %metric_error, "failed to write latency metric");
        }
    }

    /// Persists out-of-band content and relays it to the rest of the room.
    pub async fn submit_content(&self, client_id: &str, message: Value, ack_id: Option<u64>) -> bool {
        let Some((session, connection)) = self
            .sessions
            .get(client_id)
            .and_then(|session| session.connection.as_ref().map(|connection| (session, connection)))
        else {
            self.nack(self.unbound_nack(client_id));
            return true;
        };

        let submission = match serde_json::from_value::<ContentSubmission>(message) {
            Ok(submission) => submission,
            Err(decode_error) => {
                debug!(client_id, error = %decode_error, "dropping malformed content");
                self.nack(Nack::new(400, NackErrorType::BadRequestError, "Invalid message"));
                return true;
            }
        };

        let op = ContentMessage {
            client_id: client_id.to_string(),
            client_sequence_number: submission.client_sequence_number,
            contents: submission.contents,
        };
        let record = ContentRecord {
            client_id: client_id.to_string(),
            document_id: connection.document_id().to_string(),
            tenant_id: connection.tenant_id().to_string(),
            op: op.clone(),
        };

        match self.state.collaborators.contents.insert_one(&record).await {
            Ok(()) | Err(StoreError::DuplicateKey) => {
                self.state
                    .rooms
                    .broadcast(&session.room, self.socket.id, ServerEvent::OpContent { message: op })
                    .await;
                self.ack(ack_id, None);
                false
            }
            Err(store_error) => {
                error!(
                    client_id,
                    document_id = %record.document_id,
                    error = %store_error,
                    "failed to persist content"
                );
                self.ack(ack_id, Some("Could not write to DB"));
                true
            }
        }
    }

    /// Relays each signal to the room. Requires room membership only.
    pub async fn submit_signal(
        &self,
        client_id: &str,
        batches: Vec<Batch<Value>>,
        ack_id: Option<u64>,
    ) -> bool {
        let Some(session) = self.sessions.get(client_id) else {
            self.ack(ack_id, Some("Invalid client ID"));
            return true;
        };

        for content in flatten_batches(batches) {
            let message = SignalMessage { client_id: Some(client_id.to_string()), content };
            self.state.rooms.emit(&session.room, ServerEvent::Signal { message }).await;
        }

        self.ack(ack_id, None);
        false
    }

    /// Tears down every session of the socket. Failures are logged.
    pub async fn disconnect(&mut self) {
        let sessions: Vec<Session> = self.sessions.drain().map(|(_, session)| session).collect();

        for session in &sessions {
            if let Some(connection) = &session.connection {
                info!(
                    tenant_id = %session.tenant_id,
                    document_id = %session.document_id,
                    client_id = %session.client_id,
                    "disconnecting orderer connection"
                );
                if let Err(disconnect_error) = connection.disconnect().await {
                    warn!(
                        client_id = %session.client_id,
                        error = %disconnect_error,
                        "orderer disconnect failed"
                    );
                }
            }
        }

        let clients = &self.state.collaborators.clients;
        join_all(sessions.iter().map(|session| async move {
            info!(
                tenant_id = %session.tenant_id,
                document_id = %session.document_id,
                client_id = %session.client_id,
                "removing client from room"
            );
            if let Err(remove_error) =
                clients.remove_client(&session.tenant_id, &session.document_id, &session.client_id).await
            {
                error!(
                    client_id = %session.client_id,
                    error = %remove_error,
                    "failed to remove client"
                );
            }
        }))
        .await;

        for session in &sessions {
            self.release_rooms(&session.room, &session.client_id).await;
            if session.room_signals {
                let leave = SignalMessage::room_leave(&session.client_id);
                self.state.rooms.emit(&session.room, ServerEvent::Signal { message: leave }).await;
            }
        }

        if !sessions.is_empty() {
            metrics::add_connected_clients(-(sessions.len() as i64));
        }
    }
}

#[cfg(test)]
mod tests {
    use concord_common::protocol::messages::{scopes, ConnectionMode};

    use super::is_writer;

    fn granted(values: &[&str]) -> Vec<String> {
        values.iter().map(|value| value.to_string()).collect()
    }

    #[test]
    fn writers_need_a_write_capable_scope() {
        let read_only = granted(&[scopes::DOC_READ]);
        let writer = granted(&[scopes::DOC_READ, scopes::DOC_WRITE]);
        let summarizer = granted(&[scopes::SUMMARY_WRITE]);

        assert!(!is_writer(&read_only, false, None));
        assert!(is_writer(&writer, true, None));
        assert!(is_writer(&summarizer, true, Some(ConnectionMode::Write)));
    }

    #[test]
    fn read_mode_is_honoured_only_for_existing_documents() {
        let writer = granted(&[scopes::DOC_WRITE]);

        assert!(is_writer(&writer, false, Some(ConnectionMode::Read)));
        assert!(!is_writer(&writer, true, Some(ConnectionMode::Read)));
    }
}
