// Quorum: the consensus record of a document.
//
// The sequencer is the single writer. Members join and leave at the
// sequence number of their join/leave message; proposals wait until the
// minimum sequence number (MSN) reaches the sequence number they were
// proposed at, then become accepted values.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::protocol::messages::Client;

/// A quorum member and the sequence number of its join message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SequencedClient {
    pub client: Client,
    pub sequence_number: i64,
}

/// A pending value keyed by name.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Proposal {
    pub sequence_number: i64,
    pub key: String,
    pub value: Value,
}

/// A proposal that stabilized.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AcceptedValue {
    pub key: String,
    pub value: Value,
    /// Sequence number the value was proposed at.
    pub sequence_number: i64,
    /// MSN that made the proposal stable.
    pub approval_sequence_number: i64,
}

/// Serializable quorum state. Maps are encoded as arrays of `[key, value]`
/// pairs in key order.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct QuorumSnapshot {
    pub members: Vec<(String, SequencedClient)>,
    pub proposals: Vec<(i64, Proposal)>,
    pub values: Vec<(String, AcceptedValue)>,
}

#[derive(Debug, Clone, Default)]
pub struct Quorum {
    members: BTreeMap<String, SequencedClient>,
    proposals: BTreeMap<i64, Proposal>,
    values: BTreeMap<String, AcceptedValue>,
    minimum_sequence_number: i64,
}

impl Quorum {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_snapshot(snapshot: QuorumSnapshot, minimum_sequence_number: i64) -> Self {
        Self {
            members: snapshot.members.into_iter().collect(),
            proposals: snapshot.proposals.into_iter().collect(),
            values: snapshot.values.into_iter().collect(),
            minimum_sequence_number,
        }
    }

    pub fn add_member(&mut self, client_id: impl Into<String>, member: SequencedClient) {
        self.members.insert(client_id.into(), member);
    }

    pub fn remove_member(&mut self, client_id: &str) -> Option<SequencedClient> {
        self.members.remove(client_id)
    }

    pub fn member(&self, client_id: &str) -> Option<&SequencedClient> {
        self.members.get(client_id)
    }

    pub fn members(&self) -> impl Iterator<Item = (&String, &SequencedClient)> {
        self.members.iter()
    }

    /// Records a proposal made by the message sequenced at `sequence_number`.
    /// A proposal at or below the current MSN is accepted immediately.
    pub fn add_proposal(&mut self, key: impl Into<String>, value: Value, sequence_number: i64) {
        let proposal = Proposal { sequence_number, key: key.into(), value };
        if sequence_number <= self.minimum_sequence_number {
            self.accept(proposal, self.minimum_sequence_number);
        } else {
            self.proposals.insert(sequence_number, proposal);
        }
    }

    /// Advances the MSN and accepts every proposal it covers. Returns the
    /// accepted keys in proposal order. A lower MSN is ignored.
    pub fn update_minimum_sequence_number(&mut self, minimum_sequence_number: i64) -> Vec<String> {
        if minimum_sequence_number <= self.minimum_sequence_number {
            return Vec::new();
        }
        self.minimum_sequence_number = minimum_sequence_number;

        let pending = self.proposals.split_off(&(minimum_sequence_number + 1));
        let stable = std::mem::replace(&mut self.proposals, pending);

        let mut accepted = Vec::with_capacity(stable.len());
        for (_, proposal) in stable {
            accepted.push(proposal.key.clone());
            self.accept(proposal, minimum_sequence_number);
        }
        accepted
    }

    pub fn minimum_sequence_number(&self) -> i64 {
        self.minimum_sequence_number
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key).map(|accepted| &accepted.value)
    }

    pub fn has(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn pending(&self) -> impl Iterator<Item = &Proposal> {
        self.proposals.values()
    }

    pub fn snapshot(&self) -> QuorumSnapshot {
        QuorumSnapshot {
            members: self
                .members
                .iter()
                .map(|(client_id, member)| (client_id.clone(), member.clone()))
                .collect(),
            proposals: self
                .proposals
                .iter()
                .map(|(sequence_number, proposal)| (*sequence_number, proposal.clone()))
                .collect(),
            values: self.values.iter().map(|(key, value)| (key.clone(), value.clone())).collect(),
        }
    }

    fn accept(&mut self, proposal: Proposal, approval_sequence_number: i64) {
        self.values.insert(
            proposal.key.clone(),
            AcceptedValue {
                key: proposal.key,
                value: proposal.value,
                sequence_number: proposal.sequence_number,
                approval_sequence_number,
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn member(sequence_number: i64) -> SequencedClient {
        SequencedClient { client: Client::default(), sequence_number }
    }

    #[test]
    fn proposals_wait_for_minimum_sequence_number() {
        let mut quorum = Quorum::new();
        quorum.add_proposal("code", json!("v1"), 5);

        assert!(quorum.update_minimum_sequence_number(4).is_empty());
        assert!(!quorum.has("code"));
        assert_eq!(quorum.pending().count(), 1);

        assert_eq!(quorum.update_minimum_sequence_number(5), vec!["code".to_string()]);
        assert_eq!(quorum.get("code"), Some(&json!("v1")));
        assert_eq!(quorum.pending().count(), 0);
    }

    #[test]
    fn later_proposal_for_same_key_wins_when_both_stabilize() {
        let mut quorum = Quorum::new();
        quorum.add_proposal("code", json!("v1"), 3);
        quorum.add_proposal("code", json!("v2"), 7);
        quorum.add_proposal("other", json!(1), 9);

        let accepted = quorum.update_minimum_sequence_number(8);

        assert_eq!(accepted, vec!["code".to_string(), "code".to_string()]);
        assert_eq!(quorum.get("code"), Some(&json!("v2")));
        assert!(!quorum.has("other"));
    }

    #[test]
    fn minimum_sequence_number_never_regresses() {
        let mut quorum = Quorum::new();
        quorum.update_minimum_sequence_number(10);
        quorum.update_minimum_sequence_number(4);

        assert_eq!(quorum.minimum_sequence_number(), 10);

        quorum.add_proposal("late", json!(true), 6);
        assert_eq!(quorum.get("late"), Some(&json!(true)));
    }

    #[test]
    fn snapshot_round_trips_through_from_snapshot() {
        let mut quorum = Quorum::new();
        quorum.add_member("b", member(2));
        quorum.add_member("a", member(1));
        quorum.add_proposal("k", json!({ "x": 1 }), 3);
        quorum.add_proposal("stable", json!([1, 2]), 2);
        quorum.update_minimum_sequence_number(2);
        assert!(quorum.remove_member("b").is_some());

        let snapshot = quorum.snapshot();
        let restored = Quorum::from_snapshot(snapshot.clone(), quorum.minimum_sequence_number());

        assert_eq!(snapshot.members.len(), 1);
        assert_eq!(snapshot.proposals.len(), 1);
        assert_eq!(snapshot.values.len(), 1);
        assert_eq!(restored.snapshot(), snapshot);
        assert_eq!(restored.member("a"), Some(&member(1)));
    }
}
