use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use syncdex::{IndexDefinition, MemoryStore, PartitionId, SyncConfig, SyncService};
use syncdex_cluster::internal_router;
use tokio::net::TcpListener;

pub const STORE: &str = "people";
pub const INDEX: &str = "people_text";
pub const BUCKETS: u32 = 4;

pub const FIXTURE: [(&str, &str); 3] = [
    ("1", "hello world"),
    ("113", "hi world"),
    ("2", "goodbye world"),
];

pub struct Node {
    pub store: Arc<MemoryStore>,
    pub service: Arc<SyncService>,
}

/// A node hosting only `hosted` partitions of the store, with the index
/// created.
pub async fn node(hosted: &[u32]) -> Node {
    let store = MemoryStore::new();
    store.create_store(STORE, BUCKETS).unwrap();
    for p in 0..BUCKETS {
        if !hosted.contains(&p) {
            store.drop_partition(STORE, PartitionId(p)).await.unwrap();
        }
    }
    let service = SyncService::attach(SyncConfig::default(), &store).unwrap();
    service
        .create_index(IndexDefinition::builder(INDEX, STORE).field("text").build())
        .await
        .unwrap();
    Node { store, service }
}

/// Write the fixture, each entry to whichever node hosts its partition.
/// Entries no node hosts are skipped.
pub async fn load_fixture(nodes: &[&Node]) {
    for (key, text) in FIXTURE {
        let partition = nodes[0].store.partition_for(STORE, key).unwrap();
        let Some(owner) = nodes
            .iter()
            .find(|n| n.service.local_partitions(STORE).contains(&partition))
        else {
            continue;
        };
        owner
            .store
            .put(STORE, key, json!({ "text": text }))
            .await
            .unwrap();
    }
    for n in nodes {
        assert!(n
            .service
            .wait_until_flushed_locally(INDEX, STORE, Duration::from_secs(10))
            .await
            .unwrap());
    }
}

#[allow(dead_code)]
/// Serve the internal endpoints of `service` on an ephemeral port.
pub async fn spawn_internal(service: Arc<SyncService>, node_id: &str) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = internal_router(service, node_id);
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

#[allow(dead_code)]
pub fn sorted(mut keys: Vec<String>) -> Vec<String> {
    keys.sort();
    keys
}
