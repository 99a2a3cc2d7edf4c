// In-process sequencer.
//
// One task per document owns the ordering state and consumes commands from
// an unbounded channel, so every join, operation and leave of a document is
// sequenced in arrival order by a single writer.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use concord_common::{
    protocol::{
        messages::{
            message_type, Client, DocumentMessage, Nack, NackErrorType, SequencedDocumentMessage,
            ServiceConfiguration,
        },
        ws::ServerEvent,
    },
    quorum::{Quorum, SequencedClient},
    tree::{DocumentAttributes, ProtocolState},
};
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, info_span, warn, Instrument};

use super::{
    ConnectionState, Lifecycle, Orderer, OrdererConnection, OrdererError, OrdererFuture,
};
use crate::{
    metrics,
    rooms::{document_room, RoomHub, SocketHandle},
    store::DocumentDetails,
};

enum SequencerCommand {
    Join {
        client_id: String,
        client: Client,
        lifecycle: Arc<Lifecycle>,
        socket: SocketHandle,
        done: oneshot::Sender<()>,
    },
    Order {
        client_id: String,
        lifecycle: Arc<Lifecycle>,
        socket: SocketHandle,
        messages: Vec<DocumentMessage>,
    },
    Leave {
        client_id: String,
        done: oneshot::Sender<()>,
    },
    Summarize {
        reply: oneshot::Sender<ProtocolState>,
    },
    /// Stops the sequencer if no client is joined, replying with its final
    /// state; replies `None` and keeps running otherwise.
    Retire {
        reply: oneshot::Sender<Option<ProtocolState>>,
    },
    Stop,
}

/// Identifies a document's sequencer as `(tenant_id, document_id)`.
pub type DocumentKey = (String, String);

/// Orderer backed by an in-process sequencer task.
pub struct LocalOrderer {
    tenant_id: String,
    document_id: String,
    commands: mpsc::UnboundedSender<SequencerCommand>,
    service_configuration: ServiceConfiguration,
}

impl LocalOrderer {
    /// Starts the sequencer task for one document.
    pub fn spawn(
        tenant_id: &str,
        document_id: &str,
        rooms: Arc<RoomHub>,
        service_configuration: ServiceConfiguration,
    ) -> Self {
        Self::start(DocumentSequencer::new(tenant_id, document_id, rooms), service_configuration)
    }

    /// Starts a sequencer that continues numbering from `checkpoint` and
    /// reports its key on `idle` whenever the last client leaves.
    pub fn resume(
        tenant_id: &str,
        document_id: &str,
        rooms: Arc<RoomHub>,
        service_configuration: ServiceConfiguration,
        checkpoint: Option<ProtocolState>,
        idle: mpsc::UnboundedSender<DocumentKey>,
    ) -> Self {
        let mut sequencer = DocumentSequencer::new(tenant_id, document_id, rooms);
        if let Some(checkpoint) = checkpoint {
            sequencer.restore(checkpoint);
        }
        sequencer.idle = Some(idle);
        Self::start(sequencer, service_configuration)
    }

    fn start(sequencer: DocumentSequencer, service_configuration: ServiceConfiguration) -> Self {
        let tenant_id = sequencer.tenant_id.clone();
        let document_id = sequencer.document_id.clone();
        let (commands, receiver) = mpsc::unbounded_channel();
        let span = info_span!(
            "relay.sequencer",
            tenant_id = %tenant_id,
            document_id = %document_id
        );
        tokio::spawn(sequencer.run(receiver).instrument(span));

        Self { tenant_id, document_id, commands, service_configuration }
    }

    pub fn is_running(&self) -> bool {
        !self.commands.is_closed()
    }

    /// Current ordering cursor and quorum of the document.
    pub async fn summarize(&self) -> Result<ProtocolState, OrdererError> {
        let (reply, response) = oneshot::channel();
        self.commands.send(SequencerCommand::Summarize { reply }).map_err(|_| self.stopped())?;
        response.await.map_err(|_| self.stopped())
    }

    /// Stops the sequencer when no client is joined. Returns its final
    /// state, or `None` when a client is still joined.
    pub async fn retire(&self) -> Result<Option<ProtocolState>, OrdererError> {
        let (reply, response) = oneshot::channel();
        self.commands.send(SequencerCommand::Retire { reply }).map_err(|_| self.stopped())?;
        response.await.map_err(|_| self.stopped())
    }

    fn stopped(&self) -> OrdererError {
        OrdererError::SequencerStopped(document_room(&self.tenant_id, &self.document_id))
    }
}

impl Orderer for LocalOrderer {
    fn connect<'a>(
        &'a self,
        socket: &'a SocketHandle,
        client_id: &'a str,
        client: &'a Client,
        details: &'a DocumentDetails,
    ) -> OrdererFuture<'a, Arc<dyn OrdererConnection>> {
        Box::pin(async move {
            if self.commands.is_closed() {
                return Err(self.stopped());
            }

            debug!(
                tenant_id = %self.tenant_id,
                document_id = %self.document_id,
                client_id,
                existing = details.existing,
                "binding local orderer connection"
            );

            let connection: Arc<dyn OrdererConnection> = Arc::new(LocalOrdererConnection {
                tenant_id: self.tenant_id.clone(),
                document_id: self.document_id.clone(),
                client_id: client_id.to_string(),
                client: client.clone(),
                socket: socket.clone(),
                commands: self.commands.clone(),
                lifecycle: Arc::new(Lifecycle::new()),
                service_configuration: self.service_configuration.clone(),
            });
            Ok(connection)
        })
    }

    fn close(&self) -> OrdererFuture<'_, ()> {
        Box::pin(async move {
            // Already stopped is fine.
            let _ = self.commands.send(SequencerCommand::Stop);
            Ok(())
        })
    }
}

struct LocalOrdererConnection {
    tenant_id: String,
    document_id: String,
    client_id: String,
    client: Client,
    socket: SocketHandle,
    commands: mpsc::UnboundedSender<SequencerCommand>,
    lifecycle: Arc<Lifecycle>,
    service_configuration: ServiceConfiguration,
}

impl LocalOrdererConnection {
    fn stopped(&self) -> OrdererError {
        self.lifecycle.fail();
        OrdererError::SequencerStopped(document_room(&self.tenant_id, &self.document_id))
    }
}

impl OrdererConnection for LocalOrdererConnection {
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
            let (done, joined) = oneshot::channel();
            self.commands
                .send(SequencerCommand::Join {
                    client_id: self.client_id.clone(),
                    client: self.client.clone(),
                    lifecycle: Arc::clone(&self.lifecycle),
                    socket: self.socket.clone(),
                    done,
                })
                .map_err(|_| self.stopped())?;
            joined.await.map_err(|_| self.stopped())?;

            self.lifecycle.transition(ConnectionState::Connected)
        })
    }

    fn order(&self, messages: Vec<DocumentMessage>) {
        if self.lifecycle.current() != ConnectionState::Connected {
            warn!(
                client_id = %self.client_id,
                document_id = %self.document_id,
                state = ?self.lifecycle.current(),
                "order called outside of an open connection"
            );
            self.lifecycle.fail();
            return;
        }

        let command = SequencerCommand::Order {
            client_id: self.client_id.clone(),
            lifecycle: Arc::clone(&self.lifecycle),
            socket: self.socket.clone(),
            messages,
        };
        if self.commands.send(command).is_err() {
            self.stopped();
        }
    }

    fn disconnect(&self) -> OrdererFuture<'_, ()> {
        Box::pin(async move {
            if self.lifecycle.current() != ConnectionState::Connecting {
                let (done, left) = oneshot::channel();
                let leave =
                    SequencerCommand::Leave { client_id: self.client_id.clone(), done };
                if self.commands.send(leave).is_ok() {
                    let _ = left.await;
                }
            }

            // A failed connection stays failed.
            let _ = self.lifecycle.transition(ConnectionState::Closed);
            Ok(())
        })
    }

    fn state(&self) -> watch::Receiver<ConnectionState> {
        self.lifecycle.subscribe()
    }
}

struct ClientCursor {
    reference_sequence_number: i64,
    last_client_sequence_number: i64,
}

struct DocumentSequencer {
    tenant_id: String,
    document_id: String,
    room: String,
    rooms: Arc<RoomHub>,
    sequence_number: i64,
    minimum_sequence_number: i64,
    clients: HashMap<String, ClientCursor>,
    quorum: Quorum,
    idle: Option<mpsc::UnboundedSender<DocumentKey>>,
}

impl DocumentSequencer {
    fn new(tenant_id: &str, document_id: &str, rooms: Arc<RoomHub>) -> Self {
        Self {
            tenant_id: tenant_id.to_string(),
            document_id: document_id.to_string(),
            room: document_room(tenant_id, document_id),
            rooms,
            sequence_number: 0,
            minimum_sequence_number: 0,
            clients: HashMap::new(),
            quorum: Quorum::new(),
            idle: None,
        }
    }

    fn restore(&mut self, checkpoint: ProtocolState) {
        let mut snapshot = checkpoint.quorum;
        snapshot.members.clear();
        self.sequence_number = checkpoint.attributes.sequence_number;
        self.minimum_sequence_number = checkpoint.attributes.minimum_sequence_number;
        self.quorum = Quorum::from_snapshot(snapshot, self.minimum_sequence_number);
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<SequencerCommand>) {
        while let Some(command) = commands.recv().await {
            match command {
                SequencerCommand::Join { client_id, client, lifecycle, socket, done } => {
                    self.join(client_id, client, &lifecycle, &socket).await;
                    let _ = done.send(());
                }
                SequencerCommand::Order { client_id, lifecycle, socket, messages } => {
                    self.order(&client_id, &lifecycle, &socket, messages).await;
                }
                SequencerCommand::Leave { client_id, done } => {
                    self.leave(&client_id).await;
                    let _ = done.send(());
                    if self.clients.is_empty() {
                        self.report_idle();
                    }
                }
                SequencerCommand::Summarize { reply } => {
                    let _ = reply.send(self.protocol_state());
                }
                SequencerCommand::Retire { reply } => {
                    if self.clients.is_empty() {
                        let _ = reply.send(Some(self.protocol_state()));
                        break;
                    }
                    let _ = reply.send(None);
                }
                SequencerCommand::Stop => break,
            }
        }

        info!(room = %self.room, sequence_number = self.sequence_number, "sequencer stopped");
    }

    async fn join(
        &mut self,
        client_id: String,
        client: Client,
        lifecycle: &Lifecycle,
        socket: &SocketHandle,
    ) {
        if self.clients.contains_key(&client_id) {
            warn!(client_id = %client_id, "client joined twice");
            self.reject(
                lifecycle,
                socket,
                None,
                "Duplicate client".to_string(),
            );
            return;
        }

        let data = json!({ "clientId": client_id, "detail": client }).to_string();
        let sequence_number = self.next_sequence_number();
        self.clients.insert(
            client_id.clone(),
            ClientCursor {
                reference_sequence_number: sequence_number,
                last_client_sequence_number: 0,
            },
        );
        self.quorum.add_member(client_id.clone(), SequencedClient { client, sequence_number });
        self.update_minimum_sequence_number();

        info!(client_id = %client_id, sequence_number, "client joined");
        self.broadcast(self.system_message(message_type::CLIENT_JOIN, data)).await;
    }

    async fn leave(&mut self, client_id: &str) {
        if self.clients.remove(client_id).is_none() {
            debug!(client_id, "leave for unknown client");
            return;
        }
        self.quorum.remove_member(client_id);

        let data = Value::String(client_id.to_string()).to_string();
        self.next_sequence_number();
        self.update_minimum_sequence_number();

        info!(client_id, sequence_number = self.sequence_number, "client left");
        self.broadcast(self.system_message(message_type::CLIENT_LEAVE, data)).await;
    }

    async fn order(
        &mut self,
        client_id: &str,
        lifecycle: &Lifecycle,
        socket: &SocketHandle,
        messages: Vec<DocumentMessage>,
    ) {
        for message in messages {
            let Some(cursor) = self.clients.get(client_id) else {
                self.reject(lifecycle, socket, Some(message), "Nonexistent client".to_string());
                return;
            };

            if message.reference_sequence_number > self.sequence_number {
                let reason = format!(
                    "Reference sequence number {} is ahead of sequence number {}",
                    message.reference_sequence_number, self.sequence_number
                );
                self.reject(lifecycle, socket, Some(message), reason);
                return;
            }

            if message.client_sequence_number <= cursor.last_client_sequence_number {
                debug!(
                    client_id,
                    client_sequence_number = message.client_sequence_number,
                    "dropping duplicate operation"
                );
                continue;
            }

            let sequenced = self.sequence(client_id, message);
            self.broadcast(sequenced).await;
        }
    }

    fn sequence(&mut self, client_id: &str, message: DocumentMessage) -> SequencedDocumentMessage {
        let sequence_number = self.next_sequence_number();
        if let Some(cursor) = self.clients.get_mut(client_id) {
            cursor.reference_sequence_number = message.reference_sequence_number;
            cursor.last_client_sequence_number = message.client_sequence_number;
        }

        if message.message_type == message_type::PROPOSE {
            match proposal_parts(&message.contents) {
                Some((key, value)) => self.quorum.add_proposal(key, value, sequence_number),
                None => warn!(client_id, sequence_number, "ignoring malformed proposal"),
            }
        }
        self.update_minimum_sequence_number();

        SequencedDocumentMessage {
            client_id: Some(client_id.to_string()),
            sequence_number,
            minimum_sequence_number: self.minimum_sequence_number,
            client_sequence_number: message.client_sequence_number,
            reference_sequence_number: message.reference_sequence_number,
            message_type: message.message_type,
            contents: message.contents,
            metadata: message.metadata,
            traces: message.traces,
            data: message.data,
            timestamp: Utc::now().timestamp_millis(),
        }
    }

    fn reject(
        &self,
        lifecycle: &Lifecycle,
        socket: &SocketHandle,
        operation: Option<DocumentMessage>,
        reason: String,
    ) {
        warn!(room = %self.room, reason = %reason, "rejecting client operation");
        let mut nack = Nack::new(400, NackErrorType::BadRequestError, reason);
        nack.operation = operation;
        socket.send(ServerEvent::Nack { document_id: self.document_id.clone(), nacks: vec![nack] });
        metrics::increment_nacks_total(NackErrorType::BadRequestError);

        if lifecycle.fail() {
            metrics::increment_sequencer_failures();
        }
    }

    fn report_idle(&self) {
        if let Some(idle) = &self.idle {
            let _ = idle.send((self.tenant_id.clone(), self.document_id.clone()));
        }
    }

    fn next_sequence_number(&mut self) -> i64 {
        self.sequence_number += 1;
        self.sequence_number
    }

    /// MSN is the lowest reference sequence number of any connected
    /// client, or the head when nobody is connected. It never regresses.
    fn update_minimum_sequence_number(&mut self) {
        let lowest = self
            .clients
            .values()
            .map(|cursor| cursor.reference_sequence_number)
            .min()
            .unwrap_or(self.sequence_number);
        self.minimum_sequence_number = self.minimum_sequence_number.max(lowest);

        let accepted = self.quorum.update_minimum_sequence_number(self.minimum_sequence_number);
        if !accepted.is_empty() {
            info!(keys = ?accepted, msn = self.minimum_sequence_number, "quorum values accepted");
        }
    }

    fn system_message(&self, kind: &str, data: String) -> SequencedDocumentMessage {
        SequencedDocumentMessage {
            client_id: None,
            sequence_number: self.sequence_number,
            minimum_sequence_number: self.minimum_sequence_number,
            client_sequence_number: -1,
            reference_sequence_number: -1,
            message_type: kind.to_string(),
            contents: Value::Null,
            metadata: None,
            traces: None,
            data: Some(data),
            timestamp: Utc::now().timestamp_millis(),
        }
    }

    async fn broadcast(&self, message: SequencedDocumentMessage) {
        self.rooms
            .emit(
                &self.room,
                ServerEvent::Op { document_id: self.document_id.clone(), messages: vec![message] },
            )
            .await;
    }

    fn protocol_state(&self) -> ProtocolState {
        ProtocolState {
            attributes: DocumentAttributes {
                branch: self.document_id.clone(),
                minimum_sequence_number: self.minimum_sequence_number,
                sequence_number: self.sequence_number,
            },
            quorum: self.quorum.snapshot(),
        }
    }
}

fn proposal_parts(contents: &Value) -> Option<(String, Value)> {
    let key = contents.get("key")?.as_str()?.to_string();
    let value = contents.get("value").cloned().unwrap_or(Value::Null);
    Some((key, value))
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use chrono::Utc;
    use concord_common::protocol::{
        messages::{message_type, Client, DocumentMessage, ServiceConfiguration},
        ws::ServerEvent,
    };
    use serde_json::{json, Value};
    use tokio::{sync::mpsc, time::timeout};

    use super::LocalOrderer;
    use crate::{
        orderer::{ConnectionState, Orderer, OrdererConnection},
        rooms::{document_room, RoomHub, SocketHandle},
        store::{DocumentDetails, DocumentRecord},
    };

    struct Harness {
        orderer: LocalOrderer,
        rooms: Arc<RoomHub>,
        socket: SocketHandle,
        events: mpsc::UnboundedReceiver<ServerEvent>,
        details: DocumentDetails,
    }

    async fn harness() -> Harness {
        let rooms = Arc::new(RoomHub::new());
        let (sender, events) = mpsc::unbounded_channel();
        let socket = SocketHandle::new(sender);
        rooms.join(&document_room("t", "doc"), &socket).await;

        Harness {
            orderer: LocalOrderer::spawn("t", "doc", Arc::clone(&rooms), ServiceConfiguration::default()),
            rooms,
            socket,
            events,
            details: DocumentDetails {
                existing: false,
                value: DocumentRecord {
                    tenant_id: "t".to_string(),
                    document_id: "doc".to_string(),
                    created_at: Utc::now(),
                },
            },
        }
    }

    impl Harness {
        async fn connect(&self, client_id: &str) -> Arc<dyn OrdererConnection> {
            let connection = self
                .orderer
                .connect(&self.socket, client_id, &Client::default(), &self.details)
                .await
                .expect("orderer should bind a connection");
            connection.connect().await.expect("connection should join");
            connection
        }

        async fn next_op(&mut self) -> ServerEvent {
            self.events.recv().await.expect("event should arrive")
        }

        async fn next_sequenced(&mut self) -> (i64, i64, String, Option<String>) {
            match self.next_op().await {
                ServerEvent::Op { document_id, mut messages } => {
                    assert_eq!(document_id, "doc");
                    assert_eq!(messages.len(), 1);
                    let message = messages.remove(0);
                    (
                        message.sequence_number,
                        message.minimum_sequence_number,
                        message.message_type,
                        message.client_id,
                    )
                }
                other => panic!("expected op event, got {other:?}"),
            }
        }
    }

    fn op(client_sequence_number: i64, reference_sequence_number: i64) -> DocumentMessage {
        DocumentMessage {
            client_sequence_number,
            contents: json!({ "n": client_sequence_number }),
            metadata: None,
            reference_sequence_number,
            traces: None,
            message_type: message_type::OPERATION.to_string(),
            data: None,
        }
    }

    fn propose(
        client_sequence_number: i64,
        reference_sequence_number: i64,
        key: &str,
        value: Value,
    ) -> DocumentMessage {
        DocumentMessage {
            contents: json!({ "key": key, "value": value }),
            message_type: message_type::PROPOSE.to_string(),
            ..op(client_sequence_number, reference_sequence_number)
        }
    }

    #[tokio::test]
    async fn assigns_strictly_increasing_sequence_numbers() {
        let mut harness = harness().await;
        let connection = harness.connect("a").await;
        assert_eq!(*connection.state().borrow(), ConnectionState::Connected);

        let (join_seq, _, join_type, join_client) = harness.next_sequenced().await;
        assert_eq!((join_seq, join_type.as_str(), join_client), (1, "join", None));

        connection.order(vec![op(1, 1), op(2, 1)]);
        connection.order(vec![op(3, 2)]);

        let mut sequence_numbers = Vec::new();
        for _ in 0..3 {
            let (seq, _, kind, client_id) = harness.next_sequenced().await;
            assert_eq!(kind, "op");
            assert_eq!(client_id.as_deref(), Some("a"));
            sequence_numbers.push(seq);
        }
        assert_eq!(sequence_numbers, vec![2, 3, 4]);
    }

    #[tokio::test]
    async fn minimum_sequence_number_tracks_the_slowest_client() {
        let mut harness = harness().await;
        let a = harness.connect("a").await;
        let b = harness.connect("b").await;
        harness.next_sequenced().await;
        let (_, msn_after_b_join, _, _) = harness.next_sequenced().await;
        assert_eq!(msn_after_b_join, 1);

        a.order(vec![op(1, 2)]);
        let (seq, msn, _, _) = harness.next_sequenced().await;
        assert_eq!((seq, msn), (3, 2));

        b.order(vec![op(1, 3)]);
        let (seq, msn, _, _) = harness.next_sequenced().await;
        assert_eq!((seq, msn), (4, 2));

        a.order(vec![op(2, 4)]);
        let (seq, msn, _, _) = harness.next_sequenced().await;
        assert_eq!((seq, msn), (5, 3));
    }

    #[tokio::test]
    async fn proposals_are_accepted_once_the_msn_reaches_them() {
        let mut harness = harness().await;
        let a = harness.connect("a").await;
        harness.next_sequenced().await;

        a.order(vec![propose(1, 1, "code", json!("pkg@1"))]);
        let (proposal_seq, msn, kind, _) = harness.next_sequenced().await;
        assert_eq!((proposal_seq, msn, kind.as_str()), (2, 1, "propose"));

        let pending = harness.orderer.summarize().await.expect("summary should succeed");
        assert!(pending.quorum.values.is_empty());
        assert_eq!(pending.quorum.proposals.len(), 1);

        a.order(vec![op(2, proposal_seq)]);
        harness.next_sequenced().await;

        let accepted = harness.orderer.summarize().await.expect("summary should succeed");
        assert!(accepted.quorum.proposals.is_empty());
        assert_eq!(accepted.quorum.values.len(), 1);
        assert_eq!(accepted.quorum.values[0].1.value, json!("pkg@1"));
        assert_eq!(accepted.attributes.sequence_number, 3);
        assert_eq!(accepted.attributes.minimum_sequence_number, 2);
    }

    #[tokio::test]
    async fn reference_ahead_of_head_fails_the_connection() {
        let mut harness = harness().await;
        let a = harness.connect("a").await;
        let mut state = a.state();
        harness.next_sequenced().await;

        a.order(vec![op(1, 99)]);

        match harness.next_op().await {
            ServerEvent::Nack { nacks, .. } => {
                assert_eq!(nacks[0].content.code, 400);
                assert_eq!(nacks[0].operation.as_ref().map(|op| op.reference_sequence_number), Some(99));
            }
            other => panic!("expected nack, got {other:?}"),
        }
        state.wait_for(|state| *state == ConnectionState::Failed).await.expect("should fail");

        a.order(vec![op(2, 1)]);
        let summary = harness.orderer.summarize().await.expect("summary should succeed");
        assert_eq!(summary.attributes.sequence_number, 1);
    }

    #[tokio::test]
    async fn resent_client_sequence_numbers_are_dropped() {
        let mut harness = harness().await;
        let a = harness.connect("a").await;
        harness.next_sequenced().await;

        a.order(vec![op(1, 1), op(1, 1), op(2, 1)]);
        let (first, _, _, _) = harness.next_sequenced().await;
        let (second, _, _, _) = harness.next_sequenced().await;

        assert_eq!((first, second), (2, 3));
        let summary = harness.orderer.summarize().await.expect("summary should succeed");
        assert_eq!(summary.attributes.sequence_number, 3);
    }

    #[tokio::test]
    async fn leave_removes_the_quorum_member_and_closes() {
        let mut harness = harness().await;
        let a = harness.connect("a").await;
        let b = harness.connect("b").await;
        harness.next_sequenced().await;
        harness.next_sequenced().await;

        b.disconnect().await.expect("disconnect should succeed");
        let (seq, msn, kind, _) = harness.next_sequenced().await;

        assert_eq!((seq, kind.as_str()), (3, "leave"));
        assert_eq!(msn, 1);
        assert_eq!(*b.state().borrow(), ConnectionState::Closed);

        let summary = harness.orderer.summarize().await.expect("summary should succeed");
        let members: Vec<_> = summary.quorum.members.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(members, vec!["a"]);

        a.disconnect().await.expect("disconnect should succeed");
        let (_, msn, _, _) = harness.next_sequenced().await;
        assert_eq!(msn, 4);
    }

    #[tokio::test]
    async fn last_leave_reports_idle_and_retire_waits_for_it() {
        let mut harness = harness().await;
        let (idle, mut idle_reports) = mpsc::unbounded_channel();
        harness.orderer = LocalOrderer::resume(
            "t",
            "doc",
            Arc::clone(&harness.rooms),
            ServiceConfiguration::default(),
            None,
            idle,
        );
        let a = harness.connect("a").await;
        harness.next_sequenced().await;

        let busy = harness.orderer.retire().await.expect("sequencer should answer");
        assert!(busy.is_none());
        assert!(harness.orderer.is_running());

        a.disconnect().await.expect("disconnect should succeed");
        let reported = timeout(Duration::from_secs(2), idle_reports.recv())
            .await
            .expect("idle report should arrive");
        assert_eq!(reported, Some(("t".to_string(), "doc".to_string())));

        let checkpoint = harness
            .orderer
            .retire()
            .await
            .expect("sequencer should answer")
            .expect("idle sequencer should retire");
        assert_eq!(checkpoint.attributes.sequence_number, 2);
        assert!(checkpoint.quorum.members.is_empty());
        assert!(harness.orderer.summarize().await.is_err());
    }

    #[tokio::test]
    async fn resumed_sequencer_continues_from_the_checkpoint() {
        let mut harness = harness().await;
        let a = harness.connect("a").await;
        harness.next_sequenced().await;
        a.order(vec![propose(1, 1, "code", json!("pkg@1"))]);
        harness.next_sequenced().await;
        a.disconnect().await.expect("disconnect should succeed");
        harness.next_sequenced().await;
        let checkpoint = harness
            .orderer
            .retire()
            .await
            .expect("sequencer should answer")
            .expect("idle sequencer should retire");

        let (idle, _idle_reports) = mpsc::unbounded_channel();
        harness.orderer = LocalOrderer::resume(
            "t",
            "doc",
            Arc::clone(&harness.rooms),
            ServiceConfiguration::default(),
            Some(checkpoint),
            idle,
        );
        harness.connect("b").await;
        let (seq, msn, kind, _) = harness.next_sequenced().await;

        assert_eq!((seq, kind.as_str()), (4, "join"));
        assert_eq!(msn, 4);
        let summary = harness.orderer.summarize().await.expect("summary should succeed");
        assert_eq!(summary.quorum.values.len(), 1);
        assert_eq!(summary.quorum.values[0].0, "code");
    }

    #[tokio::test]
    async fn order_before_connect_fails_the_connection() {
        let harness = harness().await;
        let connection = harness
            .orderer
            .connect(&harness.socket, "a", &Client::default(), &harness.details)
            .await
            .expect("orderer should bind a connection");

        connection.order(vec![op(1, 0)]);

        assert_eq!(*connection.state().borrow(), ConnectionState::Failed);
    }

    #[tokio::test]
    async fn closed_orderer_refuses_new_connections() {
        let harness = harness().await;
        harness.orderer.close().await.expect("close should succeed");

        assert!(harness.orderer.summarize().await.is_err());
        let result = harness
            .orderer
            .connect(&harness.socket, "a", &Client::default(), &harness.details)
            .await;
        assert!(result.is_err());
    }
}
