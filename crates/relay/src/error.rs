use std::future::Future;

use axum::{
    http::{header::HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use concord_common::protocol::messages::ConnectFailure;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::{
    auth::jwt::TokenError, orderer::OrdererError, protocol::UnsupportedProtocol,
    store::StoreError,
};

pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Seconds a client rejected by admission control should wait.
pub const ADMISSION_RETRY_AFTER_SECONDS: u64 = 5 * 60;

tokio::task_local! {
    static REQUEST_ID: String;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    AuthInvalidToken,
    AuthForbidden,
    NotFound,
    UpgradeRequired,
    TooManyClients,
    StorageUnavailable,
    OrdererUnavailable,
    InternalError,
}

impl ErrorCode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::AuthInvalidToken => "AUTH_INVALID_TOKEN",
            Self::AuthForbidden => "AUTH_FORBIDDEN",
            Self::NotFound => "NOT_FOUND",
            Self::UpgradeRequired => "UPGRADE_REQUIRED",
            Self::TooManyClients => "TOO_MANY_CLIENTS",
            Self::StorageUnavailable => "STORAGE_UNAVAILABLE",
            Self::OrdererUnavailable => "ORDERER_UNAVAILABLE",
            Self::InternalError => "INTERNAL_ERROR",
        }
    }

    pub const fn status(self) -> StatusCode {
        match self {
            Self::AuthInvalidToken => StatusCode::UNAUTHORIZED,
            Self::AuthForbidden => StatusCode::FORBIDDEN,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::UpgradeRequired => StatusCode::UPGRADE_REQUIRED,
            Self::TooManyClients => StatusCode::TOO_MANY_REQUESTS,
            Self::StorageUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            Self::OrdererUnavailable => StatusCode::BAD_GATEWAY,
            Self::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub const fn retryable(self) -> bool {
        matches!(
            self,
            Self::TooManyClients
                | Self::StorageUnavailable
                | Self::OrdererUnavailable
                | Self::InternalError
        )
    }

    pub const fn default_message(self) -> &'static str {
        match self {
            Self::AuthInvalidToken => "invalid authentication token",
            Self::AuthForbidden => "caller lacks required permission",
            Self::NotFound => "requested resource not found",
            Self::UpgradeRequired => "client protocol version is not supported",
            Self::TooManyClients => "Too many clients are already connected to this document.",
            Self::StorageUnavailable => "document storage is unavailable",
            Self::OrdererUnavailable => "document orderer is unavailable",
            Self::InternalError => "internal server error",
        }
    }
}

#[derive(Debug, Clone)]
pub struct RelayError {
    code: ErrorCode,
    message: String,
    details: Value,
    request_id: Option<String>,
}

impl RelayError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self { code, message: message.into(), details: json!({}), request_id: None }
    }

    pub fn from_code(code: ErrorCode) -> Self {
        Self::new(code, code.default_message())
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let request_id = self.request_id.or_else(current_request_id);

        let mut response = (
            self.code.status(),
            Json(json!({
                "error": {
                    "code": self.code.as_str(),
                    "message": self.message,
                    "retryable": self.code.retryable(),
                    "request_id": request_id.clone(),
                    "details": self.details,
                }
            })),
        )
            .into_response();

        if let Some(request_id) = request_id {
            attach_request_id_header(&mut response, &request_id);
        }

        response
    }
}

/// Reasons a `connect_document` request is refused.
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("Must provide an authorization token")]
    MissingToken,
    #[error("Invalid claims: token is for {tenant_id}/{document_id}")]
    ClaimsMismatch { tenant_id: String, document_id: String },
    #[error(transparent)]
    Token(#[from] TokenError),
    #[error(transparent)]
    Protocol(#[from] UnsupportedProtocol),
    #[error("{}", ErrorCode::TooManyClients.default_message())]
    TooManyClients { connected: usize, limit: usize },
    #[error("document storage failed: {0}")]
    Storage(#[from] StoreError),
    #[error("document orderer failed: {0}")]
    Orderer(#[from] OrdererError),
}

impl ConnectError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::MissingToken | Self::ClaimsMismatch { .. } | Self::Token(_) => {
                ErrorCode::AuthInvalidToken
            }
            Self::Protocol(_) => ErrorCode::UpgradeRequired,
            Self::TooManyClients { .. } => ErrorCode::TooManyClients,
            Self::Storage(_) => ErrorCode::StorageUnavailable,
            Self::Orderer(_) => ErrorCode::OrdererUnavailable,
        }
    }

    /// Wire payload for `connect_document_error`.
    pub fn to_failure(&self) -> ConnectFailure {
        let code = self.code();
        let (retry_after, details) = match self {
            Self::TooManyClients { connected, limit } => (
                Some(ADMISSION_RETRY_AFTER_SECONDS),
                json!({ "connected": connected, "limit": limit }),
            ),
            Self::Protocol(error) => (
                None,
                json!({
                    "server": crate::protocol::supported_versions(),
                    "client": error.offered,
                }),
            ),
            _ => (None, json!({})),
        };

        ConnectFailure {
            code: code.as_str().to_string(),
            message: self.to_string(),
            retryable: code.retryable(),
            retry_after,
            details,
        }
    }
}

pub async fn with_request_id_scope<F>(request_id: String, future: F) -> F::Output
where
    F: Future,
{
    REQUEST_ID.scope(request_id, future).await
}

pub fn current_request_id() -> Option<String> {
    REQUEST_ID.try_with(Clone::clone).ok()
}

pub fn request_id_from_headers_or_generate(headers: &HeaderMap) -> String {
    headers
        .get(REQUEST_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.trim().is_empty())
        .map(ToOwned::to_owned)
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

pub fn attach_request_id_header(response: &mut Response, request_id: &str) {
    if let Ok(header) = HeaderValue::from_str(request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, header);
    }
}
