use concord_common::protocol::messages::{
    ConnectFailure, ContentMessage, Nack, NackErrorType, ServiceConfiguration, SignalMessage,
};
use concord_common::protocol::ws::{Batch, ClientEvent, ServerEvent};
use serde_json::{json, Value};

const RELAY_WS_SESSION_SOURCE: &str = include_str!("../src/ws/session.rs");
const RELAY_PROTOCOL_SOURCE: &str = include_str!("../src/protocol.rs");
const RELAY_ERROR_SOURCE: &str = include_str!("../src/error.rs");

#[test]
fn websocket_contract_heartbeat_and_limits() {
    let heartbeat_interval_ms = parse_u64_const(RELAY_WS_SESSION_SOURCE, "HEARTBEAT_INTERVAL_MS");
    let heartbeat_timeout_ms = parse_u64_const(RELAY_WS_SESSION_SOURCE, "HEARTBEAT_TIMEOUT_MS");
    let read_only_max = parse_u64_const(RELAY_WS_SESSION_SOURCE, "READ_ONLY_MAX_MESSAGE_SIZE");

    assert_eq!(heartbeat_interval_ms, 15_000);
    assert_eq!(heartbeat_timeout_ms, 45_000);
    assert_eq!(read_only_max, 1024);
    assert!(
        heartbeat_timeout_ms > heartbeat_interval_ms,
        "pong timeout must span at least one heartbeat interval",
    );
    assert!(RELAY_WS_SESSION_SOURCE.contains("const MAX_FRAME_BYTES: usize = 1024 * 1024;"));
}

#[test]
fn websocket_contract_supported_protocol_ranges() {
    assert!(RELAY_PROTOCOL_SOURCE
        .contains("const SUPPORTED_VERSIONS: &[&str] = &[\"^0.4.0\", \"^0.3.0\", \"^0.2.0\", \"^0.1.0\"];"));
    assert!(RELAY_PROTOCOL_SOURCE.contains("const DEFAULT_CLIENT_VERSIONS: &[&str] = &[\"^0.1.0\"];"));
    assert!(RELAY_PROTOCOL_SOURCE.contains("const ROOM_SIGNAL_VERSION: &str = \"^0.3.0\";"));
}

#[test]
fn websocket_contract_admission_retry_is_five_minutes() {
    assert!(RELAY_ERROR_SOURCE.contains("pub const ADMISSION_RETRY_AFTER_SECONDS: u64 = 5 * 60;"));
}

#[test]
fn websocket_contract_default_service_configuration() {
    let value = serde_json::to_value(ServiceConfiguration::default())
        .expect("service configuration should serialize");

    assert_eq!(
        value,
        json!({
            "blockSize": 64436,
            "maxMessageSize": 16384,
            "summary": {
                "idleTime": 5000,
                "maxOps": 1000,
                "maxTime": 60000,
                "maxAckWaitTime": 600000
            }
        })
    );
}

#[test]
fn websocket_contract_client_events_decode() {
    let connect: ClientEvent = serde_json::from_value(json!({
        "event": "connect_document",
        "request": {
            "tenantId": "tenant-a",
            "id": "doc-1",
            "token": "jwt",
            "versions": ["^0.3.0"],
            "mode": "read"
        }
    }))
    .expect("connect_document should decode");
    assert!(matches!(connect, ClientEvent::ConnectDocument { .. }));

    let content: ClientEvent = serde_json::from_value(json!({
        "event": "submitContent",
        "client_id": "c1",
        "message": { "clientSequenceNumber": 1, "contents": "x" }
    }))
    .expect("submitContent should decode");
    assert!(matches!(content, ClientEvent::SubmitContent { ack_id: None, .. }));

    let signal: ClientEvent = serde_json::from_value(json!({
        "event": "submitSignal",
        "client_id": "c1",
        "batches": ["hello", ["a", "b"]],
        "ack_id": 4
    }))
    .expect("submitSignal should decode");
    match signal {
        ClientEvent::SubmitSignal { batches, ack_id, .. } => {
            assert_eq!(ack_id, Some(4));
            assert_eq!(
                batches,
                vec![Batch::One(json!("hello")), Batch::Many(vec![json!("a"), json!("b")])]
            );
        }
        other => panic!("expected submitSignal, got {other:?}"),
    }
}

#[test]
fn websocket_contract_server_event_shapes() {
    let samples = [
        (
            ServerEvent::ConnectDocumentError {
                error: ConnectFailure {
                    code: "TOO_MANY_CLIENTS".to_string(),
                    message: "Too many clients are already connected to this document.".to_string(),
                    retryable: true,
                    retry_after: Some(300),
                    details: json!({}),
                },
            },
            "connect_document_error",
            &["event", "error"][..],
        ),
        (
            ServerEvent::OpContent {
                message: ContentMessage {
                    client_id: "c1".to_string(),
                    client_sequence_number: 1,
                    contents: json!({ "chunk": 1 }),
                },
            },
            "op-content",
            &["event", "message"][..],
        ),
        (
            ServerEvent::Signal {
                message: SignalMessage { client_id: Some("c1".to_string()), content: json!("hi") },
            },
            "signal",
            &["event", "message"][..],
        ),
        (
            ServerEvent::Nack {
                document_id: String::new(),
                nacks: vec![Nack::new(403, NackErrorType::InvalidScopeError, "Invalid scope")],
            },
            "nack",
            &["event", "document_id", "nacks"][..],
        ),
        (ServerEvent::Ack { ack_id: 1, error: None }, "ack", &["event", "ack_id"][..]),
    ];

    for (event, expected_event, expected_keys) in samples {
        let value = serde_json::to_value(event).expect("server event should serialize");
        assert_eq!(value["event"], expected_event);
        assert_eq!(object_keys(&value), sorted(expected_keys));
    }
}

#[test]
fn websocket_contract_nack_and_failure_payloads() {
    let nack = serde_json::to_value(Nack::new(400, NackErrorType::BadRequestError, "Readonly client"))
        .expect("nack should serialize");
    assert_eq!(nack["content"]["code"], 400);
    assert_eq!(nack["content"]["type"], "BadRequestError");
    assert_eq!(nack["content"]["message"], "Readonly client");

    let failure = serde_json::to_value(ConnectFailure {
        code: "AUTH_INVALID_TOKEN".to_string(),
        message: "Must provide an authorization token".to_string(),
        retryable: false,
        retry_after: None,
        details: json!({}),
    })
    .expect("failure should serialize");
    assert!(!object_keys(&failure).contains(&"retryAfter".to_string()));
    assert_eq!(failure["retryable"], false);
}

fn sorted(keys: &[&str]) -> Vec<String> {
    let mut keys = keys.iter().map(|key| key.to_string()).collect::<Vec<_>>();
    keys.sort();
    keys
}

fn object_keys(value: &Value) -> Vec<String> {
    let mut keys =
        value.as_object().expect("value should be an object").keys().cloned().collect::<Vec<_>>();
    keys.sort();
    keys
}

fn parse_u64_const(source: &str, name: &str) -> u64 {
    let needle = format!("const {name}:");
    let index = source.find(&needle).expect("constant must be declared");
    let line = source[index..].lines().next().expect("constant declaration line must exist");
    let raw_value = line
        .split('=')
        .nth(1)
        .expect("constant must have assignment")
        .trim()
        .trim_end_matches(';')
        .replace('_', "");
    raw_value
        .parse::<u64>()
        .unwrap_or_else(|error| panic!("failed to parse `{name}` from `{line}`: {error}"))
}
