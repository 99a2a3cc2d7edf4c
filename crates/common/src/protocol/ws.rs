// Socket events for the document session protocol.
//
// Every frame is a JSON text message tagged by `event`. Connect events and
// the plain broadcasts are snake_case; submissions are `submitOp`,
// `submitContent` and `submitSignal`, and content broadcasts `op-content`.
// Payload bodies use the camelCase document-protocol shapes from `messages`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::messages::{
    ConnectFailure, ConnectRequest, Connected, ContentMessage, Nack, SequencedDocumentMessage,
    SignalMessage,
};

/// A submission is either a single message or an array of messages.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum Batch<T> {
    Many(Vec<T>),
    One(T),
}

/// Flattens submitted batches into a single ordered list.
pub fn flatten_batches<T>(batches: Vec<Batch<T>>) -> Vec<T> {
    let mut flattened = Vec::new();
    for batch in batches {
        match batch {
            Batch::Many(messages) => flattened.extend(messages),
            Batch::One(message) => flattened.push(message),
        }
    }
    flattened
}

/// Client -> Server events.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ClientEvent {
    ConnectDocument {
        request: ConnectRequest,
    },

    #[serde(rename = "submitOp")]
    SubmitOp {
        client_id: String,
        batches: Vec<Batch<Value>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ack_id: Option<u64>,
    },

    #[serde(rename = "submitContent")]
    SubmitContent {
        client_id: String,
        message: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ack_id: Option<u64>,
    },

    #[serde(rename = "submitSignal")]
    SubmitSignal {
        client_id: String,
        batches: Vec<Batch<Value>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ack_id: Option<u64>,
    },
}

/// Server -> Client events.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ServerEvent {
    ConnectDocumentSuccess {
        connection: Connected,
    },

    ConnectDocumentError {
        error: ConnectFailure,
    },

    /// Room broadcast of sequenced operations.
    Op {
        document_id: String,
        messages: Vec<SequencedDocumentMessage>,
    },

    /// Room broadcast of persisted out-of-band content.
    #[serde(rename = "op-content")]
    OpContent {
        message: ContentMessage,
    },

    /// Room broadcast of a transient signal.
    Signal {
        message: SignalMessage,
    },

    /// Direct-to-socket negative acknowledgement.
    Nack {
        document_id: String,
        nacks: Vec<Nack>,
    },

    /// Transport acknowledgement for a submission that carried an `ack_id`.
    Ack {
        ack_id: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn batches_flatten_in_submission_order() {
        let batches: Vec<Batch<Value>> =
            serde_json::from_value(json!([[{ "n": 1 }, { "n": 2 }], { "n": 3 }, []]))
                .expect("batches should decode");

        let flattened = flatten_batches(batches);

        assert_eq!(flattened, vec![json!({ "n": 1 }), json!({ "n": 2 }), json!({ "n": 3 })]);
    }

    #[test]
    fn submissions_use_camel_case_event_tags() {
        let event: ClientEvent = serde_json::from_value(json!({
            "event": "submitSignal",
            "client_id": "abc",
            "batches": [{ "cursor": 3 }],
        }))
        .expect("event should decode");

        assert_eq!(
            event,
            ClientEvent::SubmitSignal {
                client_id: "abc".to_string(),
                batches: vec![Batch::One(json!({ "cursor": 3 }))],
                ack_id: None,
            }
        );
    }

    #[test]
    fn event_tags_match_the_wire_names() {
        let submit_op = serde_json::to_value(ClientEvent::SubmitOp {
            client_id: "abc".to_string(),
            batches: Vec::new(),
            ack_id: None,
        })
        .expect("submit op should encode");
        assert_eq!(submit_op["event"], "submitOp");

        let submit_content = serde_json::to_value(ClientEvent::SubmitContent {
            client_id: "abc".to_string(),
            message: json!({}),
            ack_id: None,
        })
        .expect("submit content should encode");
        assert_eq!(submit_content["event"], "submitContent");

        let legacy: Result<ClientEvent, _> =
            serde_json::from_value(json!({ "event": "submit_op", "client_id": "abc", "batches": [] }));
        assert!(legacy.is_err());

        let content = serde_json::to_value(ServerEvent::OpContent {
            message: ContentMessage {
                client_id: "abc".to_string(),
                client_sequence_number: 1,
                contents: json!("x"),
            },
        })
        .expect("op content should encode");
        assert_eq!(content["event"], "op-content");
    }

    #[test]
    fn ack_without_error_omits_the_field() {
        let encoded = serde_json::to_value(ServerEvent::Ack { ack_id: 7, error: None })
            .expect("ack should encode");

        assert_eq!(encoded, json!({ "event": "ack", "ack_id": 7 }));
    }
}
