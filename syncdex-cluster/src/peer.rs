use super::types::{
    ErrorBody, FlushRequest, FlushResponse, PartitionsQuery, PartitionsResponse, SearchResponse,
};
use serde::de::DeserializeOwned;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use syncdex::{IndexKey, PartitionHits, PartitionId, RemoteSearch, Result, SyncdexError};

const CLIENT_TIMEOUT: Duration = Duration::from_secs(5);

/// HTTP client for the internal endpoints of one peer node.
pub struct PeerClient {
    peer_id: String,
    base_url: String,
    http_client: reqwest::Client,
    last_success: AtomicU64, // unix seconds
}

impl PeerClient {
    pub fn new(peer_id: String, base_url: String) -> Self {
        let http_client = reqwest::Client::builder()
            .timeout(CLIENT_TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            peer_id,
            base_url: base_url.trim_end_matches('/').to_string(),
            http_client,
            last_success: AtomicU64::new(0),
        }
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn last_success_timestamp(&self) -> u64 {
        self.last_success.load(Ordering::Relaxed)
    }

    /// Partitions of `key.store` the peer hosts.
    pub async fn partitions(&self, key: &IndexKey) -> Result<Vec<PartitionId>> {
        let request = self
            .http_client
            .get(format!("{}/internal/partitions", self.base_url))
            .query(&PartitionsQuery {
                index: key.index.clone(),
                store: key.store.clone(),
            });
        let resp: PartitionsResponse = self.send(request, key).await?;
        Ok(resp.partitions)
    }

    /// Run a query on the peer's partitions. The request may take as long
    /// as `search.timeout_ms` allows, past the client-wide default.
    pub async fn search(&self, search: &RemoteSearch) -> Result<Vec<PartitionHits>> {
        let key = IndexKey::new(&search.index, &search.store);
        let mut request = self
            .http_client
            .post(format!("{}/internal/search", self.base_url))
            .json(search);
        if search.timeout_ms > 0 {
            request = request.timeout(Duration::from_millis(search.timeout_ms));
        }
        let resp: SearchResponse = self.send(request, &key).await?;
        Ok(resp.hits)
    }

    /// Ask the peer to wait for its own partitions of the index to drain.
    pub async fn wait_until_flushed(&self, key: &IndexKey, timeout: Duration) -> Result<bool> {
        let request = self
            .http_client
            .post(format!("{}/internal/flush", self.base_url))
            .timeout(timeout + CLIENT_TIMEOUT)
            .json(&FlushRequest {
                index: key.index.clone(),
                store: key.store.clone(),
                timeout_ms: timeout.as_millis() as u64,
            });
        let resp: FlushResponse = self.send(request, key).await?;
        Ok(resp.flushed)
    }

    async fn send<T: DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
        key: &IndexKey,
    ) -> Result<T> {
        let response = request.send().await.map_err(|e| {
            SyncdexError::PeerUnreachable(format!("{}: {}", self.peer_id, e))
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.json::<ErrorBody>().await.map_err(|_| {
                SyncdexError::PeerUnreachable(format!("{} returned {}", self.peer_id, status))
            })?;
            return Err(body.into_error(&self.peer_id, key));
        }

        let parsed = response.json::<T>().await.map_err(|e| {
            SyncdexError::PeerUnreachable(format!(
                "unreadable response from {}: {}",
                self.peer_id, e
            ))
        })?;

        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        self.last_success.store(now, Ordering::Relaxed);
        Ok(parsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn key() -> IndexKey {
        IndexKey::new("people_text", "people")
    }

    #[tokio::test]
    async fn partitions_are_read_from_the_peer() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/internal/partitions"))
            .and(query_param("index", "people_text"))
            .and(query_param("store", "people"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "node_id": "node-b",
                "store": "people",
                "partitions": [2, 3]
            })))
            .mount(&server)
            .await;

        let peer = PeerClient::new("node-b".to_string(), server.uri());
        assert_eq!(peer.last_success_timestamp(), 0);
        let partitions = peer.partitions(&key()).await.unwrap();
        assert_eq!(partitions, vec![PartitionId(2), PartitionId(3)]);
        assert!(peer.last_success_timestamp() > 0);
    }

    #[tokio::test]
    async fn error_bodies_become_typed_errors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/internal/search"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "kind": "query_parse_error",
                "error": "Query parse error: syntax error"
            })))
            .mount(&server)
            .await;

        let peer = PeerClient::new("node-b".to_string(), server.uri());
        let err = peer
            .search(&RemoteSearch {
                index: "people_text".to_string(),
                store: "people".to_string(),
                query: "(text:world".to_string(),
                default_field: "text".to_string(),
                partitions: vec![PartitionId(2)],
                limit: 10,
                timeout_ms: 0,
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "query_parse_error");
    }

    fn slow_search(timeout_ms: u64) -> RemoteSearch {
        RemoteSearch {
            index: "people_text".to_string(),
            store: "people".to_string(),
            query: "world".to_string(),
            default_field: "text".to_string(),
            partitions: vec![PartitionId(2)],
            limit: 10,
            timeout_ms,
        }
    }

    async fn slow_search_server(delay: Duration) -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/internal/search"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_delay(delay)
                    .set_body_json(json!({"node_id": "node-b", "hits": []})),
            )
            .mount(&server)
            .await;
        server
    }

    #[tokio::test]
    async fn search_may_outlast_the_client_default_within_its_deadline() {
        let server = slow_search_server(CLIENT_TIMEOUT + Duration::from_millis(500)).await;
        let peer = PeerClient::new("node-b".to_string(), server.uri());
        let hits = peer.search(&slow_search(10_000)).await.unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn search_stops_at_the_query_deadline() {
        let server = slow_search_server(Duration::from_secs(3)).await;
        let peer = PeerClient::new("node-b".to_string(), server.uri());
        let started = std::time::Instant::now();
        let err = peer.search(&slow_search(200)).await.unwrap_err();
        assert_eq!(err.kind(), "peer_unreachable");
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn flush_wait_reports_peer_answer() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/internal/flush"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"node_id": "node-b", "flushed": false})),
            )
            .mount(&server)
            .await;

        let peer = PeerClient::new("node-b".to_string(), format!("{}/", server.uri()));
        let flushed = peer
            .wait_until_flushed(&key(), Duration::from_millis(200))
            .await
            .unwrap();
        assert!(!flushed);
    }

    #[tokio::test]
    async fn non_json_failure_is_peer_unreachable() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/internal/partitions"))
            .respond_with(ResponseTemplate::new(502).set_body_string("bad gateway"))
            .mount(&server)
            .await;

        let peer = PeerClient::new("node-b".to_string(), server.uri());
        let err = peer.partitions(&key()).await.unwrap_err();
        assert_eq!(err.kind(), "peer_unreachable");
        assert!(err.to_string().contains("502"));
    }
}
