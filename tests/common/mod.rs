#![allow(dead_code)]

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use syncdex::{IndexDefinition, MemoryStore, SyncConfig, SyncService};

pub const STORE: &str = "people";
pub const INDEX: &str = "people_text";
pub const BUCKETS: u32 = 4;

pub const FIXTURE: [(&str, &str); 3] = [
    ("1", "hello world"),
    ("113", "hi world"),
    ("2", "goodbye world"),
];

pub struct Fixture {
    pub store: Arc<MemoryStore>,
    pub service: Arc<SyncService>,
}

impl Fixture {
    /// Store and service with the text index created but no data.
    pub async fn empty(config: SyncConfig) -> Self {
        let store = MemoryStore::new();
        store.create_store(STORE, BUCKETS).unwrap();
        let service = SyncService::attach(config, &store).unwrap();
        service.create_index(text_index()).await.unwrap();
        Fixture { store, service }
    }

    /// Store and service with the three fixture entries indexed.
    pub async fn loaded() -> Self {
        let fixture = Self::empty(SyncConfig::default()).await;
        fixture.put_all().await;
        assert!(fixture.flush(Duration::from_secs(10)).await);
        fixture
    }

    pub async fn put_all(&self) {
        for (key, text) in FIXTURE {
            self.put(key, text).await;
        }
    }

    pub async fn put(&self, key: &str, text: &str) {
        self.store
            .put(STORE, key, json!({ "text": text }))
            .await
            .unwrap();
    }

    pub async fn flush(&self, timeout: Duration) -> bool {
        self.service
            .wait_until_flushed(INDEX, STORE, timeout)
            .await
            .unwrap()
    }

    pub async fn keys(&self, query: &str, default_field: &str) -> Vec<String> {
        let keys = self
            .service
            .query(INDEX, STORE)
            .string(query, default_field)
            .build()
            .unwrap()
            .find_keys()
            .await
            .unwrap();
        sorted(keys)
    }
}

pub fn text_index() -> IndexDefinition {
    IndexDefinition::builder(INDEX, STORE).field("text").build()
}

pub fn sorted(mut keys: Vec<String>) -> Vec<String> {
    keys.sort();
    keys
}

pub fn fixture_keys() -> Vec<String> {
    sorted(FIXTURE.iter().map(|(k, _)| k.to_string()).collect())
}
