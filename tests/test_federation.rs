mod common;

use async_trait::async_trait;
use common::{fixture_keys, Fixture, INDEX, STORE};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use syncdex::{
    FederationMode, IndexKey, PartitionHits, PartitionId, RemoteNodes, RemoteSearch, Result,
    ResultRow,
};

/// One peer hosting p9, answering with a fixed row or never.
struct FakePeer {
    answer: bool,
    flushed: bool,
    searches: AtomicUsize,
}

impl FakePeer {
    fn new(answer: bool, flushed: bool) -> Arc<Self> {
        Arc::new(FakePeer {
            answer,
            flushed,
            searches: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl RemoteNodes for FakePeer {
    async fn partitions(&self, _key: &IndexKey) -> Vec<(String, Result<Vec<PartitionId>>)> {
        vec![("node-x".to_string(), Ok(vec![PartitionId(9)]))]
    }

    async fn search(&self, node: &str, request: &RemoteSearch) -> Result<Vec<PartitionHits>> {
        assert_eq!(node, "node-x");
        assert_eq!(request.partitions, vec![PartitionId(9)]);
        self.searches.fetch_add(1, Ordering::SeqCst);
        if !self.answer {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        Ok(vec![PartitionHits {
            partition: PartitionId(9),
            total: 1,
            rows: vec![ResultRow {
                key: "900".to_string(),
                value: json!({"text": "remote world"}),
                score: 100.0,
            }],
        }])
    }

    async fn wait_until_flushed(&self, _key: &IndexKey, _timeout: Duration) -> Result<bool> {
        Ok(self.flushed)
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn remote_rows_merge_into_the_ranking() {
    let f = Fixture::loaded().await;
    let peer = FakePeer::new(true, true);
    f.service.attach_remote(peer.clone());

    let cursor = f
        .service
        .query(INDEX, STORE)
        .string("world", "text")
        .build()
        .unwrap()
        .find_pages()
        .await
        .unwrap();
    assert_eq!(cursor.size(), 4);
    assert_eq!(cursor.rows()[0].key, "900");
    assert!(cursor.contributors().contains(&PartitionId(9)));
    assert_eq!(peer.searches.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn slow_peer_fails_fast_on_timeout() {
    let f = Fixture::loaded().await;
    f.service.attach_remote(FakePeer::new(false, true));

    let err = f
        .service
        .query(INDEX, STORE)
        .string("world", "text")
        .timeout(Duration::from_millis(200))
        .build()
        .unwrap()
        .find_pages()
        .await
        .unwrap_err();
    match err {
        syncdex::SyncdexError::PartialResult { missing, .. } => {
            assert_eq!(missing, vec![PartitionId(9)]);
        }
        other => panic!("unexpected error {:?}", other),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn slow_peer_yields_partial_result_when_allowed() {
    let f = Fixture::loaded().await;
    f.service.attach_remote(FakePeer::new(false, true));

    let cursor = f
        .service
        .query(INDEX, STORE)
        .string("world", "text")
        .timeout(Duration::from_millis(200))
        .federation_mode(FederationMode::Partial)
        .build()
        .unwrap()
        .find_pages()
        .await
        .unwrap();
    assert!(cursor.is_partial());
    assert_eq!(common::sorted(cursor.keys()), fixture_keys());
    assert_eq!(cursor.failures().len(), 1);
    assert_eq!(cursor.failures()[0].partitions, vec![PartitionId(9)]);
    assert!(!cursor.contributors().contains(&PartitionId(9)));
}

#[tokio::test(flavor = "multi_thread")]
async fn flush_wait_includes_remote_nodes() {
    let f = Fixture::loaded().await;
    f.service.attach_remote(FakePeer::new(true, false));
    assert!(!f.flush(Duration::from_millis(100)).await);

    f.service.attach_remote(FakePeer::new(true, true));
    assert!(f.flush(Duration::from_millis(100)).await);
}
