//! # Syncdex
//!
//! Full-text indexes over a partitioned key-value store, kept in sync
//! asynchronously and queried across every partition at once. Built on
//! [Tantivy](https://github.com/quickwit-oss/tantivy).
//!
//! Every partition of an indexed store gets its own repository, fed by a
//! bounded event log that the store's write path appends to. A background
//! worker per partition drains the log in order. Queries fan out to every
//! partition (local, or on peers through `syncdex-cluster`) and come back as
//! one ranked, paged result.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use syncdex::{IndexDefinition, MemoryStore, SyncConfig, SyncService};
//! use serde_json::json;
//! use std::time::Duration;
//!
//! # async fn run() -> syncdex::Result<()> {
//! let store = MemoryStore::new();
//! store.create_store("people", 4)?;
//! let service = SyncService::attach(SyncConfig::default(), &store)?;
//!
//! service
//!     .create_index(IndexDefinition::builder("people_text", "people").field("text").build())
//!     .await?;
//! store.put("people", "1", json!({"text": "hello world"})).await?;
//!
//! // writes reach the index asynchronously
//! service
//!     .wait_until_flushed("people_text", "people", Duration::from_secs(5))
//!     .await?;
//!
//! let keys = service
//!     .query("people_text", "people")
//!     .string("world", "text")
//!     .build()?
//!     .find_keys()
//!     .await?;
//! assert_eq!(keys, vec!["1"]);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod index;
pub mod query;
pub mod service;
pub mod store;
pub mod types;

pub use config::SyncConfig;
pub use error::{Result, SyncdexError, QUERY_WITHIN_TRANSACTION_MESSAGE};
pub use index::{FieldSpec, IndexDefinition};
pub use query::{
    PageCursor, QueryBuilder, QueryContext, QueryHandle, QueryProvider, RemoteNodes,
};
pub use service::SyncService;
pub use store::{MemoryStore, MutationListener, PartitionedStore, Transaction};
pub use types::*;

/// The text engine, for [`QueryProvider`] implementations.
pub use tantivy;

/// Install a `fmt` subscriber filtered by `RUST_LOG` (default `info`).
///
/// Does nothing if a global subscriber is already set.
pub fn init_tracing() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    let _ = tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}
