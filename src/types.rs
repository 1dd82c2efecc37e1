use serde::{Deserialize, Serialize};
use std::fmt;

/// Key of a store entry. Keys are compared as strings for tie-breaking.
pub type EntryKey = String;

/// Stable identifier of one horizontal split (bucket) of a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PartitionId(pub u32);

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "p{}", self.0)
    }
}

/// Identifies an index: its name plus the store it covers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IndexKey {
    pub index: String,
    pub store: String,
}

impl IndexKey {
    pub fn new(index: impl Into<String>, store: impl Into<String>) -> Self {
        IndexKey {
            index: index.into(),
            store: store.into(),
        }
    }
}

impl fmt::Display for IndexKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.index, self.store)
    }
}

/// What a store mutation did to one entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", content = "value", rename_all = "snake_case")]
pub enum EventOp {
    /// The entry was created or replaced; carries the new value.
    Put(serde_json::Value),
    Remove,
}

/// One pending index mutation for a partition.
///
/// `seq` is assigned by the partition's event log and is strictly
/// increasing without gaps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedEvent {
    pub partition: PartitionId,
    pub seq: u64,
    pub key: EntryKey,
    pub op: EventOp,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRow {
    pub key: EntryKey,
    pub value: serde_json::Value,
    pub score: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultPage {
    /// Zero-based page number.
    pub number: usize,
    pub rows: Vec<ResultRow>,
}

/// Rows one partition contributed to a federated query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartitionHits {
    pub partition: PartitionId,
    /// Matches in the partition's index before the per-partition limit.
    pub total: usize,
    pub rows: Vec<ResultRow>,
}

/// A sub-query that produced no rows for the merged result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartitionFailure {
    pub partitions: Vec<PartitionId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node: Option<String>,
    pub error: String,
}

/// How the federator reacts to a failing sub-query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FederationMode {
    /// Any failure fails the whole query.
    #[default]
    FailFast,
    /// Failures are reported alongside the rows that did arrive.
    Partial,
}

/// Queue depth snapshot for one partition of an index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartitionStats {
    pub partition: PartitionId,
    pub enqueued_seq: u64,
    pub applied_seq: u64,
    pub pending: u64,
    pub indexed_entries: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stale: Option<String>,
}

/// A string query shipped to another node, which parses it against its own
/// copy of the index definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteSearch {
    pub index: String,
    pub store: String,
    pub query: String,
    pub default_field: String,
    pub partitions: Vec<PartitionId>,
    pub limit: usize,
    /// Time left before the caller's query deadline; zero means none.
    #[serde(default)]
    pub timeout_ms: u64,
}
