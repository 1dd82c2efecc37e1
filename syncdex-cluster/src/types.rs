use serde::{Deserialize, Serialize};
use syncdex::{IndexKey, PartitionHits, PartitionId, SyncdexError};

/// Query parameters of `GET /internal/partitions`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionsQuery {
    pub index: String,
    pub store: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionsResponse {
    pub node_id: String,
    pub store: String,
    pub partitions: Vec<PartitionId>,
}

/// Response of `POST /internal/search`; the request body is a
/// [`syncdex::RemoteSearch`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResponse {
    pub node_id: String,
    pub hits: Vec<PartitionHits>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlushRequest {
    pub index: String,
    pub store: String,
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlushResponse {
    pub node_id: String,
    pub flushed: bool,
}

/// JSON body of every non-2xx internal response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub kind: String,
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partition: Option<PartitionId>,
}

impl From<&SyncdexError> for ErrorBody {
    fn from(e: &SyncdexError) -> Self {
        let partition = match e {
            SyncdexError::IndexingFailure { partition, .. }
            | SyncdexError::PartitionNotHosted { partition, .. }
            | SyncdexError::QueueClosed(partition) => Some(*partition),
            _ => None,
        };
        ErrorBody {
            kind: e.kind().to_string(),
            error: e.to_string(),
            partition,
        }
    }
}

impl ErrorBody {
    /// Rebuild the typed error a peer reported for `key`.
    ///
    /// Kinds without a faithful local counterpart become `PeerUnreachable`
    /// naming the peer, so fail-fast and partial federation treat them as a
    /// lost sub-query.
    pub fn into_error(self, node: &str, key: &IndexKey) -> SyncdexError {
        match (self.kind.as_str(), self.partition) {
            ("index_not_found", _) => SyncdexError::IndexNotFound {
                index: key.index.clone(),
                store: key.store.clone(),
            },
            ("query_parse_error", _) => SyncdexError::QueryParse(self.error),
            ("unsupported", _) => SyncdexError::Unsupported(self.error),
            ("indexing_failure", Some(partition)) => SyncdexError::IndexingFailure {
                partition,
                detail: format!("{} on {}", self.error, node),
            },
            ("partition_not_hosted", Some(partition)) => SyncdexError::PartitionNotHosted {
                store: key.store.clone(),
                partition,
            },
            _ => SyncdexError::PeerUnreachable(format!(
                "{} answered {}: {}",
                node, self.kind, self.error
            )),
        }
    }
}
