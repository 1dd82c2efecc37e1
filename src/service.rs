use crate::config::SyncConfig;
use crate::error::{Result, SyncdexError};
use crate::index::analyzers;
use crate::index::{FlushCoordinator, IndexDefinition, IndexEntry, IndexRegistry, PartitionSlot};
use crate::query::federator::{search_slot, QueryFederator};
use crate::query::{parse_text, QueryBuilder, RemoteNodes, TransactionGuard};
use crate::store::{MemoryStore, MutationListener, PartitionedStore};
use crate::types::{EventOp, IndexKey, PartitionHits, PartitionId, PartitionStats, RemoteSearch};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tantivy::query::Query;
use tantivy::tokenizer::TokenizerManager;
use tokio::task::JoinSet;
use tokio::time::Instant;

/// Keeps text indexes in step with a partitioned store and answers queries
/// against them.
///
/// One service per node. It owns the index registry, so indexes live exactly
/// as long as the service; call [`SyncService::shutdown`] to stop every
/// drain worker.
pub struct SyncService {
    config: SyncConfig,
    store: Arc<dyn PartitionedStore>,
    registry: IndexRegistry,
    tokenizers: TokenizerManager,
    guard: TransactionGuard,
    flush: FlushCoordinator,
    remote: RwLock<Option<Arc<dyn RemoteNodes>>>,
}

impl SyncService {
    pub fn start(config: SyncConfig, store: Arc<dyn PartitionedStore>) -> Result<Arc<Self>> {
        config.validate()?;
        tracing::info!(
            "[SYNC] starting: queue_capacity={} batch_size={} federation={:?} data_dir={}",
            config.queue_capacity,
            config.batch_size,
            config.federation_mode,
            config
                .data_dir
                .as_ref()
                .map(|d| d.display().to_string())
                .unwrap_or_else(|| "<memory>".to_string())
        );
        Ok(Arc::new(SyncService {
            flush: FlushCoordinator::new(config.flush_poll_interval()),
            guard: TransactionGuard::new(store.clone()),
            tokenizers: analyzers::tokenizer_manager(),
            registry: IndexRegistry::new(),
            remote: RwLock::new(None),
            store,
            config,
        }))
    }

    /// Start a service over `store` and subscribe it to the store's mutations.
    pub fn attach(config: SyncConfig, store: &Arc<MemoryStore>) -> Result<Arc<Self>> {
        let service = Self::start(config, store.clone())?;
        store.attach_listener(&service);
        Ok(service)
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn registry(&self) -> &IndexRegistry {
        &self.registry
    }

    pub fn tokenizers(&self) -> &TokenizerManager {
        &self.tokenizers
    }

    pub fn guard(&self) -> &TransactionGuard {
        &self.guard
    }

    /// Route queries and flush-waits to other nodes as well.
    pub fn attach_remote(&self, remote: Arc<dyn RemoteNodes>) {
        *self.remote.write().unwrap_or_else(|e| e.into_inner()) = Some(remote);
    }

    pub fn remote(&self) -> Option<Arc<dyn RemoteNodes>> {
        self.remote
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub(crate) fn federator(&self) -> QueryFederator {
        QueryFederator::new(self.store.clone(), self.remote())
    }

    // ── index lifecycle ──

    /// Register `definition` and start indexing every local partition of
    /// its store. Existing entries are bulk loaded in the background; use
    /// [`SyncService::wait_until_flushed`] to wait for them.
    pub async fn create_index(&self, definition: IndexDefinition) -> Result<()> {
        definition.validate(&self.tokenizers)?;
        let entry = self.registry.register(definition)?;
        let key = entry.key();
        for partition in self.store.local_partitions(&key.store) {
            if let Err(e) = self.ensure_slot(&entry, partition).await {
                tracing::error!("[SYNC] create {} failed on {}: {}", key, partition, e);
                if let Ok((_, slots)) = self.registry.deregister(&key) {
                    for slot in slots {
                        slot.shutdown(true).await;
                    }
                }
                return Err(e);
            }
        }
        tracing::info!(
            "[SYNC] index {} created over {} local partition(s)",
            key,
            self.registry.slots(entry.id).len()
        );
        Ok(())
    }

    /// Stop indexing and drop every repository of the index. Queries already
    /// running finish; new ones fail with IndexNotFound.
    pub async fn remove_index(&self, index: &str, store: &str) -> Result<()> {
        let key = IndexKey::new(index, store);
        let (entry, slots) = self.registry.deregister(&key)?;
        let count = slots.len();
        for slot in slots {
            slot.shutdown(true).await;
        }
        entry.progress.notify_waiters();
        tracing::info!("[SYNC] index {} removed, {} partition(s) dropped", key, count);
        Ok(())
    }

    pub fn list_indexes(&self) -> Vec<IndexDefinition> {
        self.registry
            .list()
            .into_iter()
            .map(|e| e.definition.clone())
            .collect()
    }

    pub fn describe_index(&self, index: &str, store: &str) -> Result<IndexDefinition> {
        Ok(self
            .registry
            .get(&IndexKey::new(index, store))?
            .definition
            .clone())
    }

    // ── store hooks ──

    /// Queue one committed store mutation for every index of `store`.
    /// `None` means the key was removed.
    pub async fn on_mutation(
        &self,
        store: &str,
        partition: PartitionId,
        key: &str,
        value: Option<&Value>,
    ) -> Result<()> {
        let mut first_error = None;
        for entry in self.registry.indexes_for_store(store) {
            let slot = match self.ensure_slot(&entry, partition).await {
                Ok(slot) => slot,
                Err(SyncdexError::IndexNotFound { .. }) => continue,
                Err(e) => {
                    tracing::error!(
                        "[SYNC] {} change to {} on {} not indexed: {}",
                        entry.key(),
                        key,
                        partition,
                        e
                    );
                    first_error.get_or_insert(e);
                    continue;
                }
            };
            let op = match value {
                Some(v) => EventOp::Put(v.clone()),
                None => EventOp::Remove,
            };
            if let Err(e) = slot.log.enqueue(key, op).await {
                if entry.is_removed() {
                    continue;
                }
                tracing::error!(
                    "[SYNC] {} change to {} on {} not queued: {}",
                    entry.key(),
                    key,
                    partition,
                    e
                );
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// The partition now lives elsewhere: drop its repositories here.
    pub async fn on_partition_lost(&self, store: &str, partition: PartitionId) {
        for entry in self.registry.indexes_for_store(store) {
            if let Some(slot) = self.registry.remove_slot(entry.id, partition) {
                slot.shutdown(true).await;
                entry.progress.notify_waiters();
                tracing::info!("[SYNC] {} released {}", entry.key(), partition);
            }
        }
    }

    /// The partition moved here: build its repositories from current data.
    pub async fn on_partition_gained(&self, store: &str, partition: PartitionId) -> Result<()> {
        for entry in self.registry.indexes_for_store(store) {
            match self.ensure_slot(&entry, partition).await {
                Ok(_) | Err(SyncdexError::IndexNotFound { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    async fn ensure_slot(
        &self,
        entry: &Arc<IndexEntry>,
        partition: PartitionId,
    ) -> Result<Arc<PartitionSlot>> {
        let (slot, created) = self.registry.get_or_open_slot(entry.id, partition, || {
            PartitionSlot::open(
                entry,
                partition,
                &self.config,
                &self.tokenizers,
                self.store.clone(),
            )
        })?;
        if created {
            tracing::debug!("[SYNC] opened {}/{}", entry.definition.name, partition);
        }
        if entry.is_removed() {
            if let Some(orphan) = self.registry.remove_slot(entry.id, partition) {
                orphan.shutdown(true).await;
            }
            let key = entry.key();
            return Err(SyncdexError::IndexNotFound {
                index: key.index,
                store: key.store,
            });
        }
        Ok(slot)
    }

    /// Slots of every partition of the index hosted on this node, opening
    /// any that are missing.
    pub async fn local_slots(&self, entry: &Arc<IndexEntry>) -> Result<Vec<Arc<PartitionSlot>>> {
        let partitions = self.store.local_partitions(&entry.definition.store);
        let mut slots = Vec::with_capacity(partitions.len());
        for partition in partitions {
            slots.push(self.ensure_slot(entry, partition).await?);
        }
        Ok(slots)
    }

    pub fn local_partitions(&self, store: &str) -> Vec<PartitionId> {
        self.store.local_partitions(store)
    }

    // ── flush ──

    /// Wait until every event enqueued so far for the index, on this node and
    /// on attached remote nodes, has been applied. `Ok(false)` on timeout.
    pub async fn wait_until_flushed(
        &self,
        index: &str,
        store: &str,
        timeout: Duration,
    ) -> Result<bool> {
        let key = IndexKey::new(index, store);
        let entry = self.registry.get(&key)?;
        let deadline = Instant::now() + timeout;
        match self.remote() {
            Some(remote) => {
                let (local, remote) = tokio::join!(
                    self.wait_local(&entry, deadline),
                    remote.wait_until_flushed(&key, timeout)
                );
                Ok(local? && remote?)
            }
            None => self.wait_local(&entry, deadline).await,
        }
    }

    /// Like [`SyncService::wait_until_flushed`] but only for partitions
    /// hosted on this node.
    pub async fn wait_until_flushed_locally(
        &self,
        index: &str,
        store: &str,
        timeout: Duration,
    ) -> Result<bool> {
        let entry = self.registry.get(&IndexKey::new(index, store))?;
        self.wait_local(&entry, Instant::now() + timeout).await
    }

    async fn wait_local(&self, entry: &Arc<IndexEntry>, deadline: Instant) -> Result<bool> {
        self.local_slots(entry).await?;
        let key = entry.key();
        self.flush
            .wait_until_flushed(&key.index, &entry.progress, deadline, || {
                let current = self.registry.get(&key)?;
                if current.id != entry.id {
                    return Err(SyncdexError::IndexNotFound {
                        index: key.index.clone(),
                        store: key.store.clone(),
                    });
                }
                let hosted = self.store.local_partitions(&key.store);
                Ok(self
                    .registry
                    .slots(entry.id)
                    .into_iter()
                    .filter(|s| hosted.contains(&s.partition))
                    .map(|s| (s.partition, s.state.clone()))
                    .collect())
            })
            .await
    }

    // ── drain control ──

    /// Hold every drain worker of the index. Events keep queueing until the
    /// per-partition buffer is full, then producers wait.
    pub fn pause_indexing(&self, index: &str, store: &str) -> Result<()> {
        let entry = self.registry.get(&IndexKey::new(index, store))?;
        entry.set_paused(true);
        tracing::info!("[SYNC] indexing paused for {}", entry.key());
        Ok(())
    }

    pub fn resume_indexing(&self, index: &str, store: &str) -> Result<()> {
        let entry = self.registry.get(&IndexKey::new(index, store))?;
        entry.set_paused(false);
        tracing::info!("[SYNC] indexing resumed for {}", entry.key());
        Ok(())
    }

    pub fn index_stats(&self, index: &str, store: &str) -> Result<Vec<PartitionStats>> {
        let entry = self.registry.get(&IndexKey::new(index, store))?;
        Ok(self
            .registry
            .slots(entry.id)
            .iter()
            .map(|s| s.stats())
            .collect())
    }

    // ── queries ──

    pub fn query(self: &Arc<Self>, index: &str, store: &str) -> QueryBuilder {
        QueryBuilder::new(self.clone(), IndexKey::new(index, store))
    }

    /// Answer a string query shipped from another node, over the listed
    /// local partitions only.
    pub async fn search_local(&self, request: &RemoteSearch) -> Result<Vec<PartitionHits>> {
        let key = IndexKey::new(&request.index, &request.store);
        let entry = self.registry.get(&key)?;
        let query: Arc<dyn Query> = Arc::from(parse_text(
            &entry.schema,
            &self.tokenizers,
            &request.query,
            &request.default_field,
        )?);
        let hosted = self.store.local_partitions(&request.store);

        let mut tasks = JoinSet::new();
        for partition in &request.partitions {
            if !hosted.contains(partition) {
                return Err(SyncdexError::PartitionNotHosted {
                    store: request.store.clone(),
                    partition: *partition,
                });
            }
            let slot = self.ensure_slot(&entry, *partition).await?;
            let store = self.store.clone();
            let store_name = request.store.clone();
            let query = query.clone();
            let limit = request.limit;
            tasks.spawn(async move { search_slot(store, &store_name, slot, query, limit).await });
        }

        let mut hits = Vec::with_capacity(request.partitions.len());
        while let Some(joined) = tasks.join_next().await {
            let result =
                joined.map_err(|e| SyncdexError::Io(format!("search task failed: {}", e)))?;
            hits.push(result?);
        }
        hits.sort_by_key(|h| h.partition);
        Ok(hits)
    }

    /// Stop every drain worker. On-disk repositories and journals are kept.
    pub async fn shutdown(&self) {
        for entry in self.registry.list() {
            if let Ok((_, slots)) = self.registry.deregister(&entry.key()) {
                for slot in slots {
                    slot.shutdown(false).await;
                }
            }
            entry.progress.notify_waiters();
        }
        tracing::info!("[SYNC] stopped");
    }
}

#[async_trait]
impl MutationListener for SyncService {
    async fn on_mutation(
        &self,
        store: &str,
        partition: PartitionId,
        key: &str,
        value: Option<&Value>,
    ) -> Result<()> {
        SyncService::on_mutation(self, store, partition, key, value).await
    }

    async fn on_partition_gained(&self, store: &str, partition: PartitionId) -> Result<()> {
        SyncService::on_partition_gained(self, store, partition).await
    }

    async fn on_partition_lost(&self, store: &str, partition: PartitionId) {
        SyncService::on_partition_lost(self, store, partition).await
    }
}
