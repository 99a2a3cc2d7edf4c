use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::Utc;
use concord_common::protocol::messages::{Client, ClientEntry};
use tokio::sync::RwLock;

use super::{
    ClientManager, ContentCollection, ContentRecord, DocumentDetails, DocumentRecord,
    DocumentStorage, StoreError, StoreFuture,
};

type DocumentKey = (String, String);

fn key(tenant_id: &str, document_id: &str) -> DocumentKey {
    (tenant_id.to_string(), document_id.to_string())
}

#[derive(Debug, Default)]
pub struct MemoryDocumentStorage {
    documents: RwLock<HashMap<DocumentKey, DocumentRecord>>,
}

impl DocumentStorage for MemoryDocumentStorage {
    fn get_or_create_document<'a>(
        &'a self,
        tenant_id: &'a str,
        document_id: &'a str,
    ) -> StoreFuture<'a, DocumentDetails> {
        Box::pin(async move {
            let mut documents = self.documents.write().await;
            if let Some(record) = documents.get(&key(tenant_id, document_id)) {
                return Ok(DocumentDetails { existing: true, value: record.clone() });
            }

            let record = DocumentRecord {
                tenant_id: tenant_id.to_string(),
                document_id: document_id.to_string(),
                created_at: Utc::now(),
            };
            documents.insert(key(tenant_id, document_id), record.clone());
            Ok(DocumentDetails { existing: false, value: record })
        })
    }
}

/// Clients per document, kept in registration order.
#[derive(Debug, Default)]
pub struct MemoryClientManager {
    clients: RwLock<HashMap<DocumentKey, BTreeMap<u64, ClientEntry>>>,
    next_slot: RwLock<u64>,
}

impl ClientManager for MemoryClientManager {
    fn get_clients<'a>(
        &'a self,
        tenant_id: &'a str,
        document_id: &'a str,
    ) -> StoreFuture<'a, Vec<ClientEntry>> {
        Box::pin(async move {
            let clients = self.clients.read().await;
            Ok(clients
                .get(&key(tenant_id, document_id))
                .map(|entries| entries.values().cloned().collect())
                .unwrap_or_default())
        })
    }

    fn add_client<'a>(
        &'a self,
        tenant_id: &'a str,
        document_id: &'a str,
        client_id: &'a str,
        client: &'a Client,
    ) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let slot = {
                let mut next_slot = self.next_slot.write().await;
                *next_slot += 1;
                *next_slot
            };

            let mut clients = self.clients.write().await;
            let entries = clients.entry(key(tenant_id, document_id)).or_default();
            entries.retain(|_, entry| entry.client_id != client_id);
            entries.insert(
                slot,
                ClientEntry { client_id: client_id.to_string(), client: client.clone() },
            );
            Ok(())
        })
    }

    fn remove_client<'a>(
        &'a self,
        tenant_id: &'a str,
        document_id: &'a str,
        client_id: &'a str,
    ) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let mut clients = self.clients.write().await;
            let document_key = key(tenant_id, document_id);
            if let Some(entries) = clients.get_mut(&document_key) {
                entries.retain(|_, entry| entry.client_id != client_id);
                if entries.is_empty() {
                    clients.remove(&document_key);
                }
            }
            Ok(())
        })
    }
}

#[derive(Debug, Default)]
pub struct MemoryContentCollection {
    records: RwLock<Vec<ContentRecord>>,
    keys: RwLock<HashSet<(String, String, String, i64)>>,
}

impl MemoryContentCollection {
    pub async fn records(&self) -> Vec<ContentRecord> {
        self.records.read().await.clone()
    }
}

impl ContentCollection for MemoryContentCollection {
    fn insert_one<'a>(&'a self, record: &'a ContentRecord) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let unique_key = (
                record.tenant_id.clone(),
                record.document_id.clone(),
                record.client_id.clone(),
                record.op.client_sequence_number,
            );

            if !self.keys.write().await.insert(unique_key) {
                return Err(StoreError::DuplicateKey);
            }
            self.records.write().await.push(record.clone());
            Ok(())
        })
    }
}
