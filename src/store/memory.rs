use super::{MutationListener, PartitionedStore};
use crate::error::{Result, SyncdexError};
use crate::types::{EntryKey, PartitionId};
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, Weak};

struct Region {
    buckets: u32,
    partitions: DashMap<PartitionId, BTreeMap<EntryKey, Value>>,
    /// Held from commit until the listener has seen the mutation, so
    /// listeners observe each partition's writes in commit order.
    write_gates: Vec<tokio::sync::Mutex<()>>,
}

tokio::task_local! {
    /// Transactions bound to the current task by [`Transaction::scope`].
    static BOUND_TRANSACTIONS: Vec<Arc<TxState>>;
}

/// In-process partitioned store.
///
/// Each named store is split into a fixed number of buckets; keys are routed
/// with a stable FNV-1a hash. All buckets start out hosted locally and can be
/// moved away with [`MemoryStore::drop_partition`] and back with
/// [`MemoryStore::adopt_partition`].
///
/// Transactions belong to the task that runs inside
/// [`Transaction::scope`]; writes are applied immediately regardless.
pub struct MemoryStore {
    regions: DashMap<String, Arc<Region>>,
    listener: RwLock<Option<Weak<dyn MutationListener>>>,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(MemoryStore {
            regions: DashMap::new(),
            listener: RwLock::new(None),
        })
    }

    /// Create an empty store split into `buckets` partitions.
    pub fn create_store(&self, name: &str, buckets: u32) -> Result<()> {
        if buckets == 0 {
            return Err(SyncdexError::Config(format!(
                "store '{}' needs at least one bucket",
                name
            )));
        }
        let partitions = DashMap::new();
        for b in 0..buckets {
            partitions.insert(PartitionId(b), BTreeMap::new());
        }
        self.regions
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(Region {
                    buckets,
                    partitions,
                    write_gates: (0..buckets).map(|_| tokio::sync::Mutex::new(())).collect(),
                })
            });
        Ok(())
    }

    /// Route committed mutations to `listener`. Held weakly so the listener
    /// may own this store.
    pub fn attach_listener<L: MutationListener + 'static>(&self, listener: &Arc<L>) {
        let dyn_listener: Arc<dyn MutationListener> = listener.clone();
        let weak = Arc::downgrade(&dyn_listener);
        *self.listener.write().unwrap_or_else(|e| e.into_inner()) = Some(weak);
    }

    fn listener(&self) -> Option<Arc<dyn MutationListener>> {
        self.listener
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .and_then(Weak::upgrade)
    }

    fn region(&self, store: &str) -> Result<Arc<Region>> {
        self.regions
            .get(store)
            .map(|r| Arc::clone(&r))
            .ok_or_else(|| SyncdexError::StoreNotFound(store.to_string()))
    }

    pub fn partition_for(&self, store: &str, key: &str) -> Result<PartitionId> {
        let region = self.region(store)?;
        Ok(PartitionId(fnv1a(key.as_bytes()) % region.buckets))
    }

    /// Store `value` under `key`, then notify the listener.
    ///
    /// A listener failure is returned to the caller even though the write
    /// itself has been committed.
    pub async fn put(&self, store: &str, key: impl Into<EntryKey>, value: Value) -> Result<PartitionId> {
        let key = key.into();
        let region = self.region(store)?;
        let partition = PartitionId(fnv1a(key.as_bytes()) % region.buckets);
        let _gate = region.write_gates[partition.0 as usize].lock().await;
        {
            let mut bucket = region.partitions.get_mut(&partition).ok_or_else(|| {
                SyncdexError::PartitionNotHosted {
                    store: store.to_string(),
                    partition,
                }
            })?;
            bucket.insert(key.clone(), value.clone());
        }
        if let Some(listener) = self.listener() {
            if let Err(e) = listener
                .on_mutation(store, partition, &key, Some(&value))
                .await
            {
                tracing::error!(
                    "[STORE {}] put {} committed but not indexed: {}",
                    store,
                    key,
                    e
                );
                return Err(e);
            }
        }
        Ok(partition)
    }

    pub async fn remove(&self, store: &str, key: &str) -> Result<Option<Value>> {
        let region = self.region(store)?;
        let partition = PartitionId(fnv1a(key.as_bytes()) % region.buckets);
        let _gate = region.write_gates[partition.0 as usize].lock().await;
        let previous = {
            let mut bucket = region.partitions.get_mut(&partition).ok_or_else(|| {
                SyncdexError::PartitionNotHosted {
                    store: store.to_string(),
                    partition,
                }
            })?;
            bucket.remove(key)
        };
        if previous.is_some() {
            if let Some(listener) = self.listener() {
                if let Err(e) = listener.on_mutation(store, partition, key, None).await {
                    tracing::error!(
                        "[STORE {}] remove {} committed but not indexed: {}",
                        store,
                        key,
                        e
                    );
                    return Err(e);
                }
            }
        }
        Ok(previous)
    }

    pub fn get_local(&self, store: &str, key: &str) -> Option<Value> {
        let region = self.regions.get(store)?;
        let partition = PartitionId(fnv1a(key.as_bytes()) % region.buckets);
        let bucket = region.partitions.get(&partition)?;
        bucket.get(key).cloned()
    }

    /// Number of entries in the locally hosted partitions of `store`.
    pub fn len(&self, store: &str) -> usize {
        self.regions
            .get(store)
            .map(|r| r.partitions.iter().map(|b| b.len()).sum())
            .unwrap_or(0)
    }

    pub fn is_empty(&self, store: &str) -> bool {
        self.len(store) == 0
    }

    /// Open a transaction on `store`. It is visible to
    /// [`PartitionedStore::transaction_active`] only from inside
    /// [`Transaction::scope`].
    pub fn begin_transaction(&self, store: &str) -> Result<Transaction> {
        let region = self.region(store)?;
        Ok(Transaction {
            state: Arc::new(TxState {
                region,
                open: AtomicBool::new(true),
            }),
        })
    }

    /// Move a partition off this node. Returns its entries, or `None` if it
    /// was not hosted here.
    pub async fn drop_partition(
        &self,
        store: &str,
        partition: PartitionId,
    ) -> Option<BTreeMap<EntryKey, Value>> {
        let region = self.regions.get(store).map(|r| Arc::clone(&r))?;
        let (_, entries) = region.partitions.remove(&partition)?;
        if let Some(listener) = self.listener() {
            listener.on_partition_lost(store, partition).await;
        }
        Some(entries)
    }

    /// Host a partition on this node with the given entries.
    pub async fn adopt_partition(
        &self,
        store: &str,
        partition: PartitionId,
        entries: BTreeMap<EntryKey, Value>,
    ) -> Result<()> {
        let region = self.region(store)?;
        if partition.0 >= region.buckets {
            return Err(SyncdexError::Config(format!(
                "store '{}' has no partition {}",
                store, partition
            )));
        }
        region.partitions.insert(partition, entries);
        if let Some(listener) = self.listener() {
            listener.on_partition_gained(store, partition).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl PartitionedStore for MemoryStore {
    fn local_partitions(&self, store: &str) -> Vec<PartitionId> {
        let mut partitions: Vec<PartitionId> = match self.regions.get(store) {
            Some(region) => region.partitions.iter().map(|e| *e.key()).collect(),
            None => Vec::new(),
        };
        partitions.sort();
        partitions
    }

    async fn scan_partition(
        &self,
        store: &str,
        partition: PartitionId,
    ) -> Result<Vec<(EntryKey, Value)>> {
        let region = self.region(store)?;
        let bucket =
            region
                .partitions
                .get(&partition)
                .ok_or_else(|| SyncdexError::PartitionNotHosted {
                    store: store.to_string(),
                    partition,
                })?;
        Ok(bucket
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    async fn get(&self, store: &str, partition: PartitionId, key: &str) -> Result<Option<Value>> {
        let region = self.region(store)?;
        let bucket =
            region
                .partitions
                .get(&partition)
                .ok_or_else(|| SyncdexError::PartitionNotHosted {
                    store: store.to_string(),
                    partition,
                })?;
        Ok(bucket.get(key).cloned())
    }

    fn transaction_active(&self, store: &str) -> bool {
        let region = match self.regions.get(store) {
            Some(r) => Arc::clone(&r),
            None => return false,
        };
        BOUND_TRANSACTIONS
            .try_with(|bound| {
                bound
                    .iter()
                    .any(|tx| tx.is_open() && Arc::ptr_eq(&tx.region, &region))
            })
            .unwrap_or(false)
    }
}

struct TxState {
    region: Arc<Region>,
    open: AtomicBool,
}

impl TxState {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

/// An open transaction on one [`MemoryStore`] store. Rolled back on drop.
pub struct Transaction {
    state: Arc<TxState>,
}

impl Transaction {
    /// Run `fut` as part of this transaction.
    ///
    /// The binding is task-local: tasks spawned from `fut`, and every other
    /// caller of the store, do not see the transaction.
    pub async fn scope<F: Future>(&self, fut: F) -> F::Output {
        let mut bound = BOUND_TRANSACTIONS
            .try_with(|b| b.clone())
            .unwrap_or_default();
        bound.push(Arc::clone(&self.state));
        BOUND_TRANSACTIONS.scope(bound, fut).await
    }

    pub fn is_open(&self) -> bool {
        self.state.is_open()
    }

    pub fn commit(self) {
        self.close();
    }

    pub fn rollback(self) {
        self.close();
    }

    fn close(&self) {
        self.state.open.store(false, Ordering::SeqCst);
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        self.close();
    }
}

fn fnv1a(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for b in bytes {
        hash ^= *b as u32;
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}
