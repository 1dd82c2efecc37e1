use crate::types::PartitionId;
use http::StatusCode;
use thiserror::Error;

/// Message carried by [`SyncdexError::QueryWithinTransaction`].
///
/// Callers match on this text, so it never changes between releases.
pub const QUERY_WITHIN_TRANSACTION_MESSAGE: &str =
    "Text search queries cannot be executed within a transaction";

#[derive(Error, Debug, Clone)]
pub enum SyncdexError {
    #[error("{}", QUERY_WITHIN_TRANSACTION_MESSAGE)]
    QueryWithinTransaction,

    #[error("Index not found: {index} on store {store}")]
    IndexNotFound { index: String, store: String },

    #[error("Index already exists: {index} on store {store}")]
    IndexAlreadyExists { index: String, store: String },

    #[error("Invalid index definition: {0}")]
    InvalidDefinition(String),

    #[error("Query parse error: {0}")]
    QueryParse(String),

    #[error("Partial result: {} partition(s) missing ({detail})", missing.len())]
    PartialResult {
        missing: Vec<PartitionId>,
        detail: String,
    },

    #[error("Indexing failure on partition {partition}: {detail}")]
    IndexingFailure {
        partition: PartitionId,
        detail: String,
    },

    #[error("Event queue closed for partition {0}")]
    QueueClosed(PartitionId),

    #[error("Store not found: {0}")]
    StoreNotFound(String),

    #[error("Partition {partition} of store {store} is not hosted on this node")]
    PartitionNotHosted { store: String, partition: PartitionId },

    #[error("Peer unreachable: {0}")]
    PeerUnreachable(String),

    #[error("Unsupported: {0}")]
    Unsupported(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Tantivy error: {0}")]
    Tantivy(String),

    #[error("JSON error: {0}")]
    Json(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, SyncdexError>;

impl From<std::io::Error> for SyncdexError {
    fn from(e: std::io::Error) -> Self {
        SyncdexError::Io(e.to_string())
    }
}

impl From<tantivy::TantivyError> for SyncdexError {
    fn from(e: tantivy::TantivyError) -> Self {
        SyncdexError::Tantivy(e.to_string())
    }
}

impl From<tantivy::query::QueryParserError> for SyncdexError {
    fn from(e: tantivy::query::QueryParserError) -> Self {
        SyncdexError::QueryParse(e.to_string())
    }
}

impl From<serde_json::Error> for SyncdexError {
    fn from(e: serde_json::Error) -> Self {
        SyncdexError::Json(e.to_string())
    }
}

impl SyncdexError {
    /// Stable machine-readable name of the error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            SyncdexError::QueryWithinTransaction => "query_within_transaction",
            SyncdexError::IndexNotFound { .. } => "index_not_found",
            SyncdexError::IndexAlreadyExists { .. } => "index_already_exists",
            SyncdexError::InvalidDefinition(_) => "invalid_definition",
            SyncdexError::QueryParse(_) => "query_parse_error",
            SyncdexError::PartialResult { .. } => "partial_result",
            SyncdexError::IndexingFailure { .. } => "indexing_failure",
            SyncdexError::QueueClosed(_) => "queue_closed",
            SyncdexError::StoreNotFound(_) => "store_not_found",
            SyncdexError::PartitionNotHosted { .. } => "partition_not_hosted",
            SyncdexError::PeerUnreachable(_) => "peer_unreachable",
            SyncdexError::Unsupported(_) => "unsupported",
            SyncdexError::Io(_) => "io_error",
            SyncdexError::Tantivy(_) => "internal_error",
            SyncdexError::Json(_) => "json_error",
            SyncdexError::Config(_) => "config_error",
        }
    }

    /// Whether retrying the same call later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncdexError::PartialResult { .. }
                | SyncdexError::PeerUnreachable(_)
                | SyncdexError::PartitionNotHosted { .. }
                | SyncdexError::Io(_)
        )
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            SyncdexError::QueryWithinTransaction => StatusCode::CONFLICT,
            SyncdexError::IndexNotFound { .. } => StatusCode::NOT_FOUND,
            SyncdexError::IndexAlreadyExists { .. } => StatusCode::CONFLICT,
            SyncdexError::InvalidDefinition(_) => StatusCode::BAD_REQUEST,
            SyncdexError::QueryParse(_) => StatusCode::BAD_REQUEST,
            SyncdexError::PartialResult { .. } => StatusCode::SERVICE_UNAVAILABLE,
            SyncdexError::IndexingFailure { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            SyncdexError::QueueClosed(_) => StatusCode::SERVICE_UNAVAILABLE,
            SyncdexError::StoreNotFound(_) => StatusCode::NOT_FOUND,
            SyncdexError::PartitionNotHosted { .. } => StatusCode::MISDIRECTED_REQUEST,
            SyncdexError::PeerUnreachable(_) => StatusCode::BAD_GATEWAY,
            SyncdexError::Unsupported(_) => StatusCode::NOT_IMPLEMENTED,
            SyncdexError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
            SyncdexError::Tantivy(_) => StatusCode::INTERNAL_SERVER_ERROR,
            SyncdexError::Json(_) => StatusCode::BAD_REQUEST,
            SyncdexError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transaction_error_uses_fixed_message() {
        let err = SyncdexError::QueryWithinTransaction;
        assert_eq!(err.to_string(), QUERY_WITHIN_TRANSACTION_MESSAGE);
        assert!(!err.is_retryable());
        assert_eq!(err.kind(), "query_within_transaction");
    }

    #[test]
    fn partial_result_is_retryable() {
        let err = SyncdexError::PartialResult {
            missing: vec![PartitionId(3), PartitionId(7)],
            detail: "timed out".to_string(),
        };
        assert!(err.is_retryable());
        assert_eq!(
            err.to_string(),
            "Partial result: 2 partition(s) missing (timed out)"
        );
        assert_eq!(err.status_code(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn parser_errors_map_to_query_parse() {
        let err: SyncdexError = tantivy::query::QueryParserError::SyntaxError("at 4".into()).into();
        assert_eq!(err.kind(), "query_parse_error");
        assert!(err.to_string().contains("at 4"));
    }
}
