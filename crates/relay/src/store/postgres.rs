use chrono::{DateTime, Utc};
use concord_common::protocol::messages::{Client, ClientEntry};
use sqlx::{types::Json, PgPool};

use super::{
    ClientManager, ContentCollection, ContentRecord, DocumentDetails, DocumentRecord,
    DocumentStorage, StoreError, StoreFuture,
};

/// PostgreSQL-backed implementation of every storage collaborator.
#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl DocumentStorage for PostgresStore {
    fn get_or_create_document<'a>(
        &'a self,
        tenant_id: &'a str,
        document_id: &'a str,
    ) -> StoreFuture<'a, DocumentDetails> {
        Box::pin(async move {
            let created = sqlx::query_scalar::<_, DateTime<Utc>>(
                r#"
                INSERT INTO documents (tenant_id, document_id)
                VALUES ($1, $2)
                ON CONFLICT (tenant_id, document_id) DO NOTHING
                RETURNING created_at
                "#,
            )
            .bind(tenant_id)
            .bind(document_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(StoreError::from_sqlx)?;

            let (existing, created_at) = match created {
                Some(created_at) => (false, created_at),
                None => {
                    let created_at = sqlx::query_scalar::<_, DateTime<Utc>>(
                        r#"
                        SELECT created_at
                        FROM documents
                        WHERE tenant_id = $1 AND document_id = $2
                        "#,
                    )
                    .bind(tenant_id)
                    .bind(document_id)
                    .fetch_one(&self.pool)
                    .await
                    .map_err(StoreError::from_sqlx)?;
                    (true, created_at)
                }
            };

            Ok(DocumentDetails {
                existing,
                value: DocumentRecord {
                    tenant_id: tenant_id.to_string(),
                    document_id: document_id.to_string(),
                    created_at,
                },
            })
        })
    }
}

impl ClientManager for PostgresStore {
    fn get_clients<'a>(
        &'a self,
        tenant_id: &'a str,
        document_id: &'a str,
    ) -> StoreFuture<'a, Vec<ClientEntry>> {
        Box::pin(async move {
            let rows = sqlx::query_as::<_, (String, Json<Client>)>(
                r#"
                SELECT client_id, client
                FROM connected_clients
                WHERE tenant_id = $1 AND document_id = $2
                ORDER BY connected_at, client_id
                "#,
            )
            .bind(tenant_id)
            .bind(document_id)
            .fetch_all(&self.pool)
            .await
            .map_err(StoreError::from_sqlx)?;

            Ok(rows
                .into_iter()
                .map(|(client_id, Json(client))| ClientEntry { client_id, client })
                .collect())
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
            sqlx::query(
                r#"
                INSERT INTO connected_clients (tenant_id, document_id, client_id, client)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (tenant_id, document_id, client_id)
                DO UPDATE SET client = EXCLUDED.client
                "#,
            )
            .bind(tenant_id)
            .bind(document_id)
            .bind(client_id)
            .bind(Json(client))
            .execute(&self.pool)
            .await
            .map_err(StoreError::from_sqlx)?;

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
            sqlx::query(
                r#"
                DELETE FROM connected_clients
                WHERE tenant_id = $1 AND document_id = $2 AND client_id = $3
                "#,
            )
            .bind(tenant_id)
            .bind(document_id)
            .bind(client_id)
            .execute(&self.pool)
            .await
            .map_err(StoreError::from_sqlx)?;

            Ok(())
        })
    }
}

impl ContentCollection for PostgresStore {
    fn insert_one<'a>(&'a self, record: &'a ContentRecord) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            sqlx::query(
                r#"
                INSERT INTO content_messages
                    (tenant_id, document_id, client_id, client_sequence_number, contents)
                VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(&record.tenant_id)
            .bind(&record.document_id)
            .bind(&record.client_id)
            .bind(record.op.client_sequence_number)
            .bind(Json(&record.op.contents))
            .execute(&self.pool)
            .await
            .map_err(StoreError::from_sqlx)?;

            Ok(())
        })
    }
}
