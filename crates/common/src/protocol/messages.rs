// Document-level message types exchanged between clients, the gateway and
// the sequencer.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Message `type` values understood by the gateway and sequencer.
pub mod message_type {
    pub const NO_OP: &str = "noop";
    pub const CLIENT_JOIN: &str = "join";
    pub const CLIENT_LEAVE: &str = "leave";
    pub const PROPOSE: &str = "propose";
    pub const REJECT: &str = "reject";
    pub const OPERATION: &str = "op";
    pub const SUMMARIZE: &str = "summarize";
    /// End of latency tracking; never sequenced.
    pub const ROUND_TRIP: &str = "tripComplete";
    pub const REMOTE_HELP: &str = "remoteHelp";
    pub const INTEGRATE: &str = "integrate";
    pub const FORK: &str = "fork";
}

/// System messages carry a server-readable `data` payload.
pub fn is_system_type(kind: &str) -> bool {
    matches!(
        kind,
        message_type::REMOTE_HELP
            | message_type::INTEGRATE
            | message_type::CLIENT_JOIN
            | message_type::CLIENT_LEAVE
            | message_type::FORK
    )
}

/// Permission scopes carried in token claims.
pub mod scopes {
    pub const DOC_READ: &str = "doc:read";
    pub const DOC_WRITE: &str = "doc:write";
    pub const SUMMARY_WRITE: &str = "summary:write";
}

pub fn can_write(granted: &[String]) -> bool {
    granted.iter().any(|scope| scope == scopes::DOC_WRITE)
}

pub fn can_summarize(granted: &[String]) -> bool {
    granted.iter().any(|scope| scope == scopes::SUMMARY_WRITE)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Trace {
    pub service: String,
    pub action: String,
    pub timestamp: f64,
}

/// Fields a client is allowed to submit for sequencing.
const SANITIZED_FIELDS: [&str; 6] = [
    "clientSequenceNumber",
    "contents",
    "metadata",
    "referenceSequenceNumber",
    "traces",
    "type",
];

/// An operation as submitted by a client, after sanitization.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DocumentMessage {
    pub client_sequence_number: i64,
    #[serde(default)]
    pub contents: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    pub reference_sequence_number: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub traces: Option<Vec<Trace>>,
    #[serde(rename = "type")]
    pub message_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

/// Copies only the fields a client may submit from a raw message. `data` is
/// kept for system-typed messages and dropped otherwise.
pub fn sanitize_message(raw: &Value) -> Result<DocumentMessage, serde_json::Error> {
    let mut sanitized = Map::new();
    if let Some(object) = raw.as_object() {
        for field in SANITIZED_FIELDS {
            if let Some(value) = object.get(field) {
                sanitized.insert(field.to_string(), value.clone());
            }
        }

        let system = object.get("type").and_then(Value::as_str).is_some_and(is_system_type);
        if system {
            if let Some(data) = object.get("data") {
                sanitized.insert("data".to_string(), data.clone());
            }
        }
    }

    serde_json::from_value(Value::Object(sanitized))
}

/// An operation after the sequencer assigned it a place in the total order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SequencedDocumentMessage {
    pub client_id: Option<String>,
    pub sequence_number: i64,
    pub minimum_sequence_number: i64,
    pub client_sequence_number: i64,
    pub reference_sequence_number: i64,
    #[serde(rename = "type")]
    pub message_type: String,
    #[serde(default)]
    pub contents: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub traces: Option<Vec<Trace>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionMode {
    Write,
    Read,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct User {
    #[serde(default)]
    pub id: String,
    #[serde(flatten)]
    pub properties: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Capabilities {
    pub interactive: bool,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self { interactive: true }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClientDetails {
    #[serde(default)]
    pub capabilities: Capabilities,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub client_type: Option<String>,
}

/// Identity and capabilities of a connected client. `user` and `scopes`
/// are always overwritten from verified token claims.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Client {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<ConnectionMode>,
    #[serde(default)]
    pub details: ClientDetails,
    #[serde(default)]
    pub permission: Vec<String>,
    #[serde(default)]
    pub user: User,
    #[serde(default)]
    pub scopes: Vec<String>,
}

/// A client registered against a document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClientEntry {
    pub client_id: String,
    pub client: Client,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TokenClaims {
    pub document_id: String,
    pub tenant_id: String,
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default)]
    pub user: User,
    #[serde(default)]
    pub iat: i64,
    #[serde(default)]
    pub exp: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SummaryConfiguration {
    pub idle_time: u64,
    pub max_ops: u64,
    pub max_time: u64,
    pub max_ack_wait_time: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ServiceConfiguration {
    pub block_size: u64,
    pub max_message_size: u64,
    pub summary: SummaryConfiguration,
}

pub const DEFAULT_BLOCK_SIZE: u64 = 64_436;
pub const DEFAULT_MAX_MESSAGE_SIZE: u64 = 16 * 1024;

impl Default for ServiceConfiguration {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            summary: SummaryConfiguration {
                idle_time: 5_000,
                max_ops: 1_000,
                max_time: 5_000 * 12,
                max_ack_wait_time: 600_000,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum NackErrorType {
    ThrottlingError,
    InvalidScopeError,
    BadRequestError,
    LimitExceededError,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NackContent {
    pub code: u16,
    #[serde(rename = "type")]
    pub error_type: NackErrorType,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
}

/// Negative acknowledgement. The socket stays open after a nack.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Nack {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<DocumentMessage>,
    pub sequence_number: i64,
    pub content: NackContent,
}

impl Nack {
    pub fn new(code: u16, error_type: NackErrorType, message: impl Into<String>) -> Self {
        Self {
            operation: None,
            sequence_number: -1,
            content: NackContent { code, error_type, message: message.into(), retry_after: None },
        }
    }
}

/// Payload persisted and broadcast for `submitContent`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ContentMessage {
    pub client_id: String,
    pub client_sequence_number: i64,
    #[serde(default)]
    pub contents: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SignalMessage {
    pub client_id: Option<String>,
    pub content: Value,
}

impl SignalMessage {
    pub fn room_join(client_id: &str, client: &Client) -> Self {
        Self {
            client_id: None,
            content: serde_json::json!({
                "type": message_type::CLIENT_JOIN,
                "content": { "clientId": client_id, "client": client },
            }),
        }
    }

    pub fn room_leave(client_id: &str) -> Self {
        Self {
            client_id: None,
            content: serde_json::json!({
                "type": message_type::CLIENT_LEAVE,
                "content": client_id,
            }),
        }
    }
}

/// `connect_document` request body.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConnectRequest {
    pub tenant_id: String,
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client: Option<Client>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub versions: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<ConnectionMode>,
}

/// `connect_document_success` payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Connected {
    pub claims: TokenClaims,
    pub client_id: String,
    pub existing: bool,
    pub max_message_size: u64,
    pub mode: ConnectionMode,
    pub parent_branch: Option<String>,
    pub service_configuration: ServiceConfiguration,
    pub initial_clients: Vec<ClientEntry>,
    pub initial_contents: Vec<Value>,
    pub initial_messages: Vec<Value>,
    pub initial_signals: Vec<Value>,
    pub supported_versions: Vec<String>,
    pub version: String,
}

/// `connect_document_error` payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConnectFailure {
    pub code: String,
    pub message: String,
    pub retryable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
    #[serde(default)]
    pub details: Value,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sanitize_keeps_only_submittable_fields() {
        let raw = json!({
            "clientSequenceNumber": 4,
            "contents": { "insert": "abc" },
            "metadata": { "batch": true },
            "referenceSequenceNumber": 2,
            "traces": [{ "service": "client", "action": "start", "timestamp": 1.0 }],
            "type": "op",
            "data": "should be dropped",
            "sequenceNumber": 99,
            "clientId": "spoofed",
        });

        let sanitized = sanitize_message(&raw).expect("message should sanitize");
        let encoded = serde_json::to_value(&sanitized).expect("message should encode");
        let mut keys = encoded.as_object().expect("object").keys().cloned().collect::<Vec<_>>();
        keys.sort();

        assert_eq!(
            keys,
            vec![
                "clientSequenceNumber",
                "contents",
                "metadata",
                "referenceSequenceNumber",
                "traces",
                "type"
            ]
        );
        assert!(sanitized.data.is_none());
    }

    #[test]
    fn sanitize_keeps_data_for_system_messages() {
        let raw = json!({
            "clientSequenceNumber": 1,
            "contents": null,
            "referenceSequenceNumber": 0,
            "type": "remoteHelp",
            "data": "{\"tasks\":[]}",
            "extra": true,
        });

        let sanitized = sanitize_message(&raw).expect("message should sanitize");

        assert_eq!(sanitized.data.as_deref(), Some("{\"tasks\":[]}"));
        let encoded = serde_json::to_value(&sanitized).expect("message should encode");
        assert!(encoded.get("extra").is_none());
    }

    #[test]
    fn sanitize_rejects_messages_without_sequence_numbers() {
        assert!(sanitize_message(&json!({ "type": "op", "contents": 1 })).is_err());
        assert!(sanitize_message(&json!("not an object")).is_err());
    }

    #[test]
    fn write_access_comes_from_write_or_summary_scope() {
        let writer = vec![scopes::DOC_READ.to_string(), scopes::DOC_WRITE.to_string()];
        let summarizer = vec![scopes::SUMMARY_WRITE.to_string()];
        let reader = vec![scopes::DOC_READ.to_string()];

        assert!(can_write(&writer));
        assert!(!can_summarize(&writer));
        assert!(can_summarize(&summarizer));
        assert!(!can_write(&reader) && !can_summarize(&reader));
    }

    #[test]
    fn default_service_configuration_matches_published_limits() {
        let config = ServiceConfiguration::default();
        assert_eq!(config.block_size, 64_436);
        assert_eq!(config.max_message_size, 16_384);
        assert_eq!(config.summary.idle_time, 5_000);
        assert_eq!(config.summary.max_ops, 1_000);
        assert_eq!(config.summary.max_time, 60_000);
        assert_eq!(config.summary.max_ack_wait_time, 600_000);
    }

    #[test]
    fn nack_serializes_with_error_type_name() {
        let nack = Nack::new(403, NackErrorType::InvalidScopeError, "Invalid scope");
        let encoded = serde_json::to_value(&nack).expect("nack should encode");

        assert_eq!(encoded["sequenceNumber"], -1);
        assert_eq!(encoded["content"]["code"], 403);
        assert_eq!(encoded["content"]["type"], "InvalidScopeError");
        assert_eq!(encoded["content"]["message"], "Invalid scope");
        assert!(encoded.get("operation").is_none());
    }
}
