// HTTP routes served next to the websocket gateway.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{header::CONTENT_TYPE, StatusCode},
    middleware,
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use concord_common::tree::{
    merge_app_and_protocol_tree, quorum_tree_entries, DocumentAttributes, StoredTreeEntry, Tree,
    TreeEntry, TreeError,
};
use serde::Serialize;
use tracing::{error, warn};

use crate::{
    auth::{jwt::TenantManager, middleware::require_document_token},
    error::{ErrorCode, RelayError},
    metrics::RelayMetrics,
    orderer::OrdererManager,
};

#[derive(Clone)]
pub struct ApiState {
    pub orderers: Arc<OrdererManager>,
    pub metrics: Arc<RelayMetrics>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ProtocolTreeResponse {
    attributes: DocumentAttributes,
    entries: Vec<TreeEntry>,
    protocol_tree: Tree,
    /// Summary tree entries with the `.protocol` reference appended.
    tree: Vec<StoredTreeEntry>,
}

pub fn router(state: ApiState, tenants: Arc<dyn TenantManager>) -> Router {
    let documents = Router::new()
        .route(
            "/v1/tenants/{tenant_id}/documents/{document_id}/protocol-tree",
            get(get_protocol_tree),
        )
        .route_layer(middleware::from_fn_with_state(tenants, require_document_token));

    Router::new().route("/metrics", get(get_metrics)).merge(documents).with_state(state)
}

async fn get_metrics(State(state): State<ApiState>) -> Response {
    (
        StatusCode::OK,
        [(CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render_prometheus(),
    )
        .into_response()
}

async fn get_protocol_tree(
    State(state): State<ApiState>,
    Path((tenant_id, document_id)): Path<(String, String)>,
) -> Result<Json<ProtocolTreeResponse>, RelayError> {
    let orderer = state.orderers.local_orderer(&tenant_id, &document_id).await.ok_or_else(|| {
        RelayError::new(ErrorCode::NotFound, "document is not ordered by this relay")
    })?;

    let protocol = orderer.summarize().await.map_err(|orderer_error| {
        warn!(
            tenant_id = %tenant_id,
            document_id = %document_id,
            error = %orderer_error,
            "failed to summarize protocol state"
        );
        RelayError::from_code(ErrorCode::OrdererUnavailable)
    })?;

    let attributes = protocol.attributes;
    let entries = quorum_tree_entries(
        &document_id,
        attributes.minimum_sequence_number,
        attributes.sequence_number,
        &protocol.quorum,
    )
    .map_err(tree_error)?;
    let protocol_tree = Tree::from_entries(&entries).map_err(tree_error)?;
    let app_tree = Tree::from_entries(&[]).map_err(tree_error)?;
    let tree = merge_app_and_protocol_tree(&app_tree, &protocol_tree);

    Ok(Json(ProtocolTreeResponse { attributes, entries, protocol_tree, tree }))
}

fn tree_error(tree_error: TreeError) -> RelayError {
    error!(error = %tree_error, "failed to build protocol tree");
    RelayError::from_code(ErrorCode::InternalError)
}
