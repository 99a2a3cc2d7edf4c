// Snapshot tree builder.
//
// A summary is a git-style tree. Protocol state (quorum + document
// attributes) lives in a `.protocol` subtree next to the application tree.
// Application entries are carried by hash, never re-serialized.

use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::quorum::QuorumSnapshot;

pub const PROTOCOL_TREE_PATH: &str = ".protocol";
pub const QUORUM_MEMBERS_PATH: &str = "quorumMembers";
pub const QUORUM_PROPOSALS_PATH: &str = "quorumProposals";
pub const QUORUM_VALUES_PATH: &str = "quorumValues";
pub const ATTRIBUTES_PATH: &str = "attributes";

#[derive(Debug, Error)]
pub enum TreeError {
    #[error("protocol tree is missing the `{0}` blob")]
    MissingEntry(&'static str),
    #[error("tree entry `{0}` is not a blob")]
    NotABlob(String),
    #[error("invalid base64 blob contents: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("blob contents are not valid utf-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
    #[error("invalid protocol blob json: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum FileMode {
    #[serde(rename = "100644")]
    File,
    #[serde(rename = "100755")]
    Executable,
    #[serde(rename = "040000")]
    Directory,
    #[serde(rename = "120000")]
    Symlink,
}

impl FileMode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::File => "100644",
            Self::Executable => "100755",
            Self::Directory => "040000",
            Self::Symlink => "120000",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EntryType {
    Blob,
    Tree,
    Commit,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum BlobEncoding {
    #[serde(rename = "utf-8")]
    Utf8,
    #[serde(rename = "base64")]
    Base64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Blob {
    pub contents: String,
    pub encoding: BlobEncoding,
}

impl Blob {
    pub fn utf8(contents: impl Into<String>) -> Self {
        Self { contents: contents.into(), encoding: BlobEncoding::Utf8 }
    }

    pub fn bytes(&self) -> Result<Vec<u8>, TreeError> {
        match self.encoding {
            BlobEncoding::Utf8 => Ok(self.contents.as_bytes().to_vec()),
            BlobEncoding::Base64 => Ok(STANDARD.decode(&self.contents)?),
        }
    }

    pub fn text(&self) -> Result<String, TreeError> {
        match self.encoding {
            BlobEncoding::Utf8 => Ok(self.contents.clone()),
            BlobEncoding::Base64 => Ok(String::from_utf8(self.bytes()?)?),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum TreeValue {
    Blob(Blob),
    Tree(Vec<TreeEntry>),
}

/// An in-memory snapshot entry, before it is written to storage.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TreeEntry {
    pub mode: FileMode,
    pub path: String,
    #[serde(rename = "type")]
    pub entry_type: EntryType,
    pub value: TreeValue,
}

impl TreeEntry {
    pub fn blob(path: impl Into<String>, blob: Blob) -> Self {
        Self {
            mode: FileMode::File,
            path: path.into(),
            entry_type: EntryType::Blob,
            value: TreeValue::Blob(blob),
        }
    }

    pub fn tree(path: impl Into<String>, entries: Vec<TreeEntry>) -> Self {
        Self {
            mode: FileMode::Directory,
            path: path.into(),
            entry_type: EntryType::Tree,
            value: TreeValue::Tree(entries),
        }
    }
}

/// A stored tree entry, referencing its content by hash.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoredTreeEntry {
    pub mode: FileMode,
    pub path: String,
    pub sha: String,
    #[serde(rename = "type")]
    pub entry_type: EntryType,
}

/// A stored tree: its hash plus its top-level entries.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Tree {
    pub sha: String,
    pub tree: Vec<StoredTreeEntry>,
}

impl Tree {
    /// Hashes in-memory entries into a stored tree. Blob hashes cover the
    /// decoded bytes; tree hashes cover the sorted `mode path sha` lines.
    pub fn from_entries(entries: &[TreeEntry]) -> Result<Self, TreeError> {
        let mut tree = Vec::with_capacity(entries.len());
        for entry in entries {
            let sha = match &entry.value {
                TreeValue::Blob(blob) => hash_object("blob", &blob.bytes()?),
                TreeValue::Tree(children) => Self::from_entries(children)?.sha,
            };
            tree.push(StoredTreeEntry {
                mode: entry.mode,
                path: entry.path.clone(),
                sha,
                entry_type: entry.entry_type,
            });
        }
        tree.sort_by(|left, right| left.path.cmp(&right.path));

        let mut body = Vec::new();
        for entry in &tree {
            body.extend_from_slice(entry.mode.as_str().as_bytes());
            body.push(b' ');
            body.extend_from_slice(entry.path.as_bytes());
            body.push(0);
            body.extend_from_slice(entry.sha.as_bytes());
            body.push(b'\n');
        }

        Ok(Self { sha: hash_object("tree", &body), tree })
    }
}

fn hash_object(kind: &str, body: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("{kind} {}\0", body.len()).as_bytes());
    hasher.update(body);
    hasher.finalize().iter().map(|byte| format!("{byte:02x}")).collect()
}

/// The authoritative ordering cursor of a document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DocumentAttributes {
    pub branch: String,
    pub minimum_sequence_number: i64,
    pub sequence_number: i64,
}

/// Protocol state recovered from a `.protocol` subtree.
#[derive(Debug, Clone, PartialEq)]
pub struct ProtocolState {
    pub attributes: DocumentAttributes,
    pub quorum: QuorumSnapshot,
}

/// Serializes quorum state and document attributes into the four protocol
/// blobs.
pub fn quorum_tree_entries(
    document_id: &str,
    minimum_sequence_number: i64,
    sequence_number: i64,
    snapshot: &QuorumSnapshot,
) -> Result<Vec<TreeEntry>, TreeError> {
    let attributes = DocumentAttributes {
        branch: document_id.to_string(),
        minimum_sequence_number,
        sequence_number,
    };

    Ok(vec![
        TreeEntry::blob(QUORUM_MEMBERS_PATH, Blob::utf8(serde_json::to_string(&snapshot.members)?)),
        TreeEntry::blob(
            QUORUM_PROPOSALS_PATH,
            Blob::utf8(serde_json::to_string(&snapshot.proposals)?),
        ),
        TreeEntry::blob(QUORUM_VALUES_PATH, Blob::utf8(serde_json::to_string(&snapshot.values)?)),
        TreeEntry::blob(ATTRIBUTES_PATH, Blob::utf8(serde_json::to_string(&attributes)?)),
    ])
}

/// Parses the protocol blobs written by [`quorum_tree_entries`].
pub fn quorum_snapshot_from_entries(entries: &[TreeEntry]) -> Result<ProtocolState, TreeError> {
    let members = serde_json::from_str(&blob_text(entries, QUORUM_MEMBERS_PATH)?)?;
    let proposals = serde_json::from_str(&blob_text(entries, QUORUM_PROPOSALS_PATH)?)?;
    let values = serde_json::from_str(&blob_text(entries, QUORUM_VALUES_PATH)?)?;
    let attributes = serde_json::from_str(&blob_text(entries, ATTRIBUTES_PATH)?)?;

    Ok(ProtocolState { attributes, quorum: QuorumSnapshot { members, proposals, values } })
}

fn blob_text(entries: &[TreeEntry], path: &'static str) -> Result<String, TreeError> {
    let entry =
        entries.iter().find(|entry| entry.path == path).ok_or(TreeError::MissingEntry(path))?;
    match &entry.value {
        TreeValue::Blob(blob) => blob.text(),
        TreeValue::Tree(_) => Err(TreeError::NotABlob(entry.path.clone())),
    }
}

/// Builds the entries of a summary tree: every application entry by
/// reference plus a `.protocol` directory entry pointing at the protocol
/// subtree.
pub fn merge_app_and_protocol_tree(app_tree: &Tree, protocol_tree: &Tree) -> Vec<StoredTreeEntry> {
    let mut entries = Vec::with_capacity(app_tree.tree.len() + 1);
    entries.extend(app_tree.tree.iter().map(|entry| StoredTreeEntry {
        mode: entry.mode,
        path: entry.path.clone(),
        sha: entry.sha.clone(),
        entry_type: entry.entry_type,
    }));
    entries.push(StoredTreeEntry {
        mode: FileMode::Directory,
        path: PROTOCOL_TREE_PATH.to_string(),
        sha: protocol_tree.sha.clone(),
        entry_type: EntryType::Tree,
    });
    entries
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        protocol::messages::Client,
        quorum::{Quorum, SequencedClient},
    };
    use serde_json::json;

    fn sample_quorum() -> Quorum {
        let mut quorum = Quorum::new();
        quorum.add_member("client-a", SequencedClient { client: Client::default(), sequence_number: 1 });
        quorum.add_member("client-b", SequencedClient { client: Client::default(), sequence_number: 2 });
        quorum.add_proposal("code", json!({ "package": "@scope/app" }), 3);
        quorum.add_proposal("pending", json!(42), 9);
        quorum.update_minimum_sequence_number(4);
        quorum
    }

    #[test]
    fn quorum_entries_use_reserved_blob_names() {
        let snapshot = sample_quorum().snapshot();
        let entries = quorum_tree_entries("doc-1", 4, 9, &snapshot).expect("entries should build");

        let paths = entries.iter().map(|entry| entry.path.as_str()).collect::<Vec<_>>();
        assert_eq!(paths, vec!["quorumMembers", "quorumProposals", "quorumValues", "attributes"]);
        assert!(entries.iter().all(|entry| entry.mode == FileMode::File
            && entry.entry_type == EntryType::Blob
            && matches!(&entry.value, TreeValue::Blob(blob) if blob.encoding == BlobEncoding::Utf8)));
    }

    #[test]
    fn quorum_entries_parse_back_to_identical_snapshot() {
        let snapshot = sample_quorum().snapshot();
        let entries = quorum_tree_entries("doc-1", 4, 9, &snapshot).expect("entries should build");

        let parsed = quorum_snapshot_from_entries(&entries).expect("entries should parse");

        assert_eq!(parsed.quorum, snapshot);
        assert_eq!(
            parsed.attributes,
            DocumentAttributes {
                branch: "doc-1".to_string(),
                minimum_sequence_number: 4,
                sequence_number: 9,
            }
        );
    }

    #[test]
    fn base64_protocol_blobs_are_accepted() {
        let snapshot = sample_quorum().snapshot();
        let entries = quorum_tree_entries("doc-1", 4, 9, &snapshot)
            .expect("entries should build")
            .into_iter()
            .map(|mut entry| {
                if let TreeValue::Blob(blob) = &mut entry.value {
                    *blob = Blob {
                        contents: STANDARD.encode(blob.contents.as_bytes()),
                        encoding: BlobEncoding::Base64,
                    };
                }
                entry
            })
            .collect::<Vec<_>>();

        let parsed = quorum_snapshot_from_entries(&entries).expect("base64 entries should parse");
        assert_eq!(parsed.quorum, snapshot);
    }

    #[test]
    fn missing_protocol_blob_is_reported() {
        let entries = vec![TreeEntry::blob(QUORUM_MEMBERS_PATH, Blob::utf8("[]"))];
        let error = quorum_snapshot_from_entries(&entries).expect_err("parse should fail");
        assert!(matches!(error, TreeError::MissingEntry(QUORUM_PROPOSALS_PATH)));
    }

    #[test]
    fn merge_references_app_entries_and_appends_protocol_tree() {
        let app_tree = Tree::from_entries(&[
            TreeEntry::blob("header", Blob::utf8("x".repeat(1 << 16))),
            TreeEntry::tree("content", vec![TreeEntry::blob("body", Blob::utf8("hello"))]),
        ])
        .expect("app tree should hash");
        let snapshot = sample_quorum().snapshot();
        let protocol_tree =
            Tree::from_entries(&quorum_tree_entries("doc-1", 4, 9, &snapshot).expect("entries"))
                .expect("protocol tree should hash");

        let merged = merge_app_and_protocol_tree(&app_tree, &protocol_tree);

        assert_eq!(merged.len(), app_tree.tree.len() + 1);
        assert_eq!(&merged[..app_tree.tree.len()], app_tree.tree.as_slice());
        let protocol = merged.last().expect("protocol entry");
        assert_eq!(protocol.path, ".protocol");
        assert_eq!(protocol.entry_type, EntryType::Tree);
        assert_eq!(protocol.mode, FileMode::Directory);
        assert_eq!(protocol.sha, protocol_tree.sha);
    }

    #[test]
    fn tree_hash_depends_on_content_not_entry_order() {
        let forward = Tree::from_entries(&[
            TreeEntry::blob("a", Blob::utf8("1")),
            TreeEntry::blob("b", Blob::utf8("2")),
        ])
        .expect("tree should hash");
        let reversed = Tree::from_entries(&[
            TreeEntry::blob("b", Blob::utf8("2")),
            TreeEntry::blob("a", Blob::utf8("1")),
        ])
        .expect("tree should hash");
        let changed = Tree::from_entries(&[
            TreeEntry::blob("a", Blob::utf8("1")),
            TreeEntry::blob("b", Blob::utf8("3")),
        ])
        .expect("tree should hash");

        assert_eq!(forward.sha, reversed.sha);
        assert_ne!(forward.sha, changed.sha);
        assert_eq!(forward.sha.len(), 64);
    }
}
