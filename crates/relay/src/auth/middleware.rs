use crate::{
    auth::jwt::TenantManager,
    error::{ErrorCode, RelayError},
};
use axum::{
    extract::{Path, Request, State},
    http::header::AUTHORIZATION,
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::sync::Arc;

/// Verifies a bearer token against the tenant and document in the route
/// path (`.../{tenant_id}/.../{document_id}`). The verified
/// `TokenClaims` are inserted as a request extension.
pub async fn require_document_token(
    State(tenants): State<Arc<dyn TenantManager>>,
    Path((tenant_id, document_id)): Path<(String, String)>,
    mut request: Request,
    next: Next,
) -> Response {
    let token = match request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(extract_bearer_token)
    {
        Some(token) => token,
        None => return unauthorized_response("missing bearer token"),
    };

    let claims = match tenants.verify_token(&tenant_id, token).await {
        Ok(claims) => claims,
        Err(_) => return unauthorized_response("invalid bearer token"),
    };

    if claims.document_id != document_id {
        return RelayError::new(ErrorCode::AuthForbidden, "token is not valid for this document")
            .into_response();
    }

    request.extensions_mut().insert(claims);

    next.run(request).await
}

fn extract_bearer_token(value: &str) -> Option<&str> {
    let (scheme, token) = value.split_once(' ')?;

    if !scheme.eq_ignore_ascii_case("Bearer") {
        return None;
    }

    let token = token.trim();
    if token.is_empty() {
        return None;
    }

    Some(token)
}

fn unauthorized_response(message: &'static str) -> Response {
    RelayError::new(ErrorCode::AuthInvalidToken, message).into_response()
}
