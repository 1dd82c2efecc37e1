use super::types::{
    ErrorBody, FlushRequest, FlushResponse, PartitionsQuery, PartitionsResponse, SearchResponse,
};
use axum::{
    extract::{Query, State},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use std::sync::Arc;
use std::time::Duration;
use syncdex::{RemoteSearch, SyncService, SyncdexError};

pub struct InternalState {
    pub service: Arc<SyncService>,
    pub node_id: String,
}

/// A [`SyncdexError`] rendered as an [`ErrorBody`] with its HTTP status.
pub struct ApiError(pub SyncdexError);

impl From<SyncdexError> for ApiError {
    fn from(e: SyncdexError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.0.status_code(), Json(ErrorBody::from(&self.0))).into_response()
    }
}

/// Endpoints peers use to reach this node's local partitions. Carries no
/// authentication; bind it to a private interface.
pub fn internal_router(service: Arc<SyncService>, node_id: impl Into<String>) -> Router {
    let state = Arc::new(InternalState {
        service,
        node_id: node_id.into(),
    });
    Router::new()
        .route("/internal/partitions", get(partitions))
        .route("/internal/search", post(search))
        .route("/internal/flush", post(flush))
        .with_state(state)
}

/// GET /internal/partitions?index=X&store=Y
pub async fn partitions(
    State(state): State<Arc<InternalState>>,
    Query(query): Query<PartitionsQuery>,
) -> Result<Json<PartitionsResponse>, ApiError> {
    state.service.describe_index(&query.index, &query.store)?;
    let partitions = state.service.local_partitions(&query.store);
    Ok(Json(PartitionsResponse {
        node_id: state.node_id.clone(),
        store: query.store,
        partitions,
    }))
}

/// POST /internal/search
pub async fn search(
    State(state): State<Arc<InternalState>>,
    Json(request): Json<RemoteSearch>,
) -> Result<Json<SearchResponse>, ApiError> {
    let hits = state.service.search_local(&request).await.map_err(|e| {
        tracing::warn!(
            "[CLUSTER {}] search for {}@{} failed: {}",
            state.node_id,
            request.index,
            request.store,
            e
        );
        e
    })?;
    Ok(Json(SearchResponse {
        node_id: state.node_id.clone(),
        hits,
    }))
}

/// POST /internal/flush
pub async fn flush(
    State(state): State<Arc<InternalState>>,
    Json(request): Json<FlushRequest>,
) -> Result<Json<FlushResponse>, ApiError> {
    let flushed = state
        .service
        .wait_until_flushed_locally(
            &request.index,
            &request.store,
            Duration::from_millis(request.timeout_ms),
        )
        .await?;
    Ok(Json(FlushResponse {
        node_id: state.node_id.clone(),
        flushed,
    }))
}
