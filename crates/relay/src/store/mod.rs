// Storage collaborators used by the session gateway.
//
// Each trait method is one atomic per-key operation so that many socket
// tasks can call into the same store concurrently.

pub mod memory;
pub mod postgres;

use std::{future::Future, pin::Pin, sync::Arc};

use chrono::{DateTime, Utc};
use concord_common::protocol::messages::{Client, ClientEntry, ContentMessage};
use serde::{Deserialize, Serialize};

pub use memory::{MemoryClientManager, MemoryContentCollection, MemoryDocumentStorage};
pub use postgres::PostgresStore;

pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StoreError>> + Send + 'a>>;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("duplicate key")]
    DuplicateKey,
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("failed to encode stored value: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    pub(crate) fn from_sqlx(error: sqlx::Error) -> Self {
        if let sqlx::Error::Database(database_error) = &error {
            if database_error.code().as_deref() == Some("23505") {
                return Self::DuplicateKey;
            }
        }

        Self::Database(error)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentRecord {
    pub tenant_id: String,
    pub document_id: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentDetails {
    /// False when this call created the document.
    pub existing: bool,
    pub value: DocumentRecord,
}

/// Out-of-band content persisted by `submit_content`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentRecord {
    pub client_id: String,
    pub document_id: String,
    pub tenant_id: String,
    pub op: ContentMessage,
}

pub trait DocumentStorage: Send + Sync {
    fn get_or_create_document<'a>(
        &'a self,
        tenant_id: &'a str,
        document_id: &'a str,
    ) -> StoreFuture<'a, DocumentDetails>;
}

/// Registry of clients connected to each document.
pub trait ClientManager: Send + Sync {
    fn get_clients<'a>(
        &'a self,
        tenant_id: &'a str,
        document_id: &'a str,
    ) -> StoreFuture<'a, Vec<ClientEntry>>;

    fn add_client<'a>(
        &'a self,
        tenant_id: &'a str,
        document_id: &'a str,
        client_id: &'a str,
        client: &'a Client,
    ) -> StoreFuture<'a, ()>;

    fn remove_client<'a>(
        &'a self,
        tenant_id: &'a str,
        document_id: &'a str,
        client_id: &'a str,
    ) -> StoreFuture<'a, ()>;
}

pub trait ContentCollection: Send + Sync {
    /// Fails with [`StoreError::DuplicateKey`] when the same client already
    /// stored content at this client sequence number.
    fn insert_one<'a>(&'a self, record: &'a ContentRecord) -> StoreFuture<'a, ()>;
}

/// The storage collaborators the gateway depends on.
#[derive(Clone)]
pub struct Collaborators {
    pub documents: Arc<dyn DocumentStorage>,
    pub clients: Arc<dyn ClientManager>,
    pub contents: Arc<dyn ContentCollection>,
}

impl Collaborators {
    pub fn memory() -> Self {
        Self {
            documents: Arc::new(MemoryDocumentStorage::default()),
            clients: Arc::new(MemoryClientManager::default()),
            contents: Arc::new(MemoryContentCollection::default()),
        }
    }

    pub fn postgres(pool: sqlx::PgPool) -> Self {
        let store = Arc::new(PostgresStore::new(pool));
        Self { documents: store.clone(), clients: store.clone(), contents: store }
    }
}
