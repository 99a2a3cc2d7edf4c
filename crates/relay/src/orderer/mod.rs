// Orderers assign the total order of a document's operations.
//
// The gateway only sees the `Orderer` / `OrdererConnection` traits. The
// manager picks the implementation: an in-process sequencer per document
// (`local`) or a pass-through to a remote ordering service (`proxy`).

pub mod local;
pub mod manager;
pub mod proxy;
pub mod remote;

use std::{future::Future, pin::Pin, sync::Arc};

use concord_common::protocol::messages::{Client, DocumentMessage, ServiceConfiguration};
use tokio::sync::watch;

use crate::{rooms::SocketHandle, store::DocumentDetails};

pub use local::LocalOrderer;
pub use manager::OrdererManager;
pub use proxy::{OrdererConnectionFactory, ProxyOrderer};

pub type OrdererFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, OrdererError>> + Send + 'a>>;

#[derive(Debug, thiserror::Error)]
pub enum OrdererError {
    #[error("sequencer for {0} has stopped")]
    SequencerStopped(String),
    #[error("invalid connection state transition from {from:?} to {to:?}")]
    InvalidTransition { from: ConnectionState, to: ConnectionState },
    #[error("remote orderer unavailable: {0}")]
    Remote(String),
    #[error("orderer is not configured: {0}")]
    NotConfigured(&'static str),
}

/// Lifecycle of an orderer connection. `Closed` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Closed,
    Failed,
}

impl ConnectionState {
    pub const fn can_transition_to(self, next: ConnectionState) -> bool {
        matches!(
            (self, next),
            (Self::Connecting, Self::Connected | Self::Closed | Self::Failed)
                | (Self::Connected, Self::Closed | Self::Failed)
        )
    }

    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Failed)
    }
}

/// Owner side of a connection's state; observers subscribe to changes.
#[derive(Debug)]
pub struct Lifecycle {
    state: watch::Sender<ConnectionState>,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    pub fn new() -> Self {
        let (state, _) = watch::channel(ConnectionState::Connecting);
        Self { state }
    }

    pub fn current(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Applies a directed transition. Illegal transitions leave the state
    /// untouched.
    pub fn transition(&self, next: ConnectionState) -> Result<(), OrdererError> {
        let mut rejected_from = None;
        self.state.send_if_modified(|state| {
            if state.can_transition_to(next) {
                *state = next;
                true
            } else {
                rejected_from = Some(*state);
                false
            }
        });

        match rejected_from {
            Some(from) => Err(OrdererError::InvalidTransition { from, to: next }),
            None => Ok(()),
        }
    }

    /// Moves to `Failed` unless the connection already ended.
    pub fn fail(&self) -> bool {
        self.transition(ConnectionState::Failed).is_ok()
    }
}

/// A client's ordering channel for one document.
pub trait OrdererConnection: Send + Sync {
    fn tenant_id(&self) -> &str;
    fn document_id(&self) -> &str;
    fn client_id(&self) -> &str;
    fn parent_branch(&self) -> Option<&str>;
    fn max_message_size(&self) -> u64;
    fn service_configuration(&self) -> &ServiceConfiguration;

    /// Announces the client to the sequencer.
    fn connect(&self) -> OrdererFuture<'_, ()>;

    /// Enqueues messages in submission order. Only valid while connected;
    /// otherwise the connection fails.
    fn order(&self, messages: Vec<DocumentMessage>);

    /// Sequences the client's leave and closes the connection.
    fn disconnect(&self) -> OrdererFuture<'_, ()>;

    fn state(&self) -> watch::Receiver<ConnectionState>;
}

pub trait Orderer: Send + Sync {
    fn connect<'a>(
        &'a self,
        socket: &'a SocketHandle,
        client_id: &'a str,
        client: &'a Client,
        details: &'a DocumentDetails,
    ) -> OrdererFuture<'a, Arc<dyn OrdererConnection>>;

    fn close(&self) -> OrdererFuture<'_, ()>;
}
