//! The boundary to the partitioned key-value store.
//!
//! The store itself (routing, replication, membership) lives outside this
//! crate. Indexing only needs to enumerate and read the partitions hosted
//! locally, learn about committed mutations, and ask whether the caller is
//! inside a transaction.

pub mod memory;

use crate::error::Result;
use crate::types::{EntryKey, PartitionId};
use async_trait::async_trait;
use serde_json::Value;

pub use memory::{MemoryStore, Transaction};

#[async_trait]
pub trait PartitionedStore: Send + Sync {
    /// Partitions of `store` currently hosted on this node.
    fn local_partitions(&self, store: &str) -> Vec<PartitionId>;

    /// Every entry of a locally hosted partition, for bulk loading.
    async fn scan_partition(
        &self,
        store: &str,
        partition: PartitionId,
    ) -> Result<Vec<(EntryKey, Value)>>;

    /// Current value of an entry, or `None` if it no longer exists.
    async fn get(&self, store: &str, partition: PartitionId, key: &str) -> Result<Option<Value>>;

    /// Whether the calling task has an open transaction on `store`.
    /// Transactions held by other tasks must not count.
    fn transaction_active(&self, store: &str) -> bool;

    fn supports_transactions(&self, _store: &str) -> bool {
        true
    }
}

/// Receives committed store mutations and partition movements.
///
/// Implemented by [`crate::SyncService`]. The store invokes
/// `on_mutation` after every committed put/remove and before the write call
/// returns to its caller.
#[async_trait]
pub trait MutationListener: Send + Sync {
    async fn on_mutation(
        &self,
        store: &str,
        partition: PartitionId,
        key: &str,
        value: Option<&Value>,
    ) -> Result<()>;

    async fn on_partition_gained(&self, _store: &str, _partition: PartitionId) -> Result<()> {
        Ok(())
    }

    async fn on_partition_lost(&self, _store: &str, _partition: PartitionId) {}
}
