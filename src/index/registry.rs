use super::definition::{IndexDefinition, IndexSchema};
use super::drain::{DrainSettings, DrainWorker, Recovery};
use super::event_log::{event_channel, EventLog};
use super::flush::FlushState;
use super::journal::EventJournal;
use super::repository::IndexRepository;
use crate::config::SyncConfig;
use crate::error::{Result, SyncdexError};
use crate::store::PartitionedStore;
use crate::types::{IndexKey, PartitionId, PartitionStats};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tantivy::tokenizer::TokenizerManager;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;

pub type IndexId = u64;

/// A registered index definition and its index-wide controls.
pub struct IndexEntry {
    pub id: IndexId,
    pub definition: IndexDefinition,
    pub schema: IndexSchema,
    pause: watch::Sender<bool>,
    /// Woken whenever any partition of this index makes progress.
    pub progress: Arc<Notify>,
    removed: AtomicBool,
}

impl std::fmt::Debug for IndexEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexEntry")
            .field("id", &self.id)
            .field("definition", &self.definition)
            .finish_non_exhaustive()
    }
}

impl IndexEntry {
    pub fn key(&self) -> IndexKey {
        self.definition.key()
    }

    pub fn set_paused(&self, paused: bool) {
        self.pause.send_replace(paused);
    }

    pub fn is_paused(&self) -> bool {
        *self.pause.borrow()
    }

    pub fn is_removed(&self) -> bool {
        self.removed.load(Ordering::SeqCst)
    }

    fn pause_receiver(&self) -> watch::Receiver<bool> {
        self.pause.subscribe()
    }
}

/// Everything one partition of one index needs: the repository, its event
/// log, its counters, and the worker draining the log into the repository.
pub struct PartitionSlot {
    pub partition: PartitionId,
    pub repository: Arc<IndexRepository>,
    pub log: EventLog,
    pub state: Arc<FlushState>,
    path: Option<PathBuf>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for PartitionSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartitionSlot")
            .field("partition", &self.partition)
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl PartitionSlot {
    /// Create the repository for `partition` and start its drain worker.
    pub fn open(
        entry: &IndexEntry,
        partition: PartitionId,
        config: &SyncConfig,
        tokenizers: &TokenizerManager,
        store: Arc<dyn PartitionedStore>,
    ) -> Result<Arc<Self>> {
        let def = &entry.definition;
        let label = format!("{}/{}", def.name, partition);
        let path = config.data_dir.as_ref().map(|dir| {
            dir.join(&def.store)
                .join(&def.name)
                .join(partition.0.to_string())
        });

        let (repository, journal, recovery, last_seq) = match &path {
            Some(path) => {
                let (repository, existed) = IndexRepository::open_or_create(
                    &path.join("index"),
                    entry.schema.clone(),
                    tokenizers,
                )?;
                let journal = Arc::new(EventJournal::open(&path.join("journal"))?);
                let checkpoint = journal.checkpoint()?;
                let recovery = if existed {
                    Recovery::Replay { checkpoint }
                } else {
                    Recovery::BulkLoad
                };
                let last_seq = journal.last_seq().max(checkpoint);
                (repository, Some(journal), recovery, last_seq)
            }
            None => (
                IndexRepository::create_in_ram(entry.schema.clone(), tokenizers)?,
                None,
                Recovery::BulkLoad,
                0,
            ),
        };

        let applied_start = match recovery {
            Recovery::Replay { checkpoint } => checkpoint,
            Recovery::BulkLoad => last_seq,
        };
        let state = Arc::new(FlushState::loading(applied_start, entry.progress.clone()));
        state.note_enqueued(last_seq);

        let repository = Arc::new(repository);
        let (log, rx) = event_channel(
            partition,
            label.clone(),
            config.queue_capacity,
            last_seq,
            journal.clone(),
            state.clone(),
        );
        let worker = DrainWorker {
            label,
            store_name: def.store.clone(),
            partition,
            repository: repository.clone(),
            state: state.clone(),
            journal,
            store,
            pause: entry.pause_receiver(),
            settings: DrainSettings::from(config),
            recovery,
        }
        .spawn(rx);

        Ok(Arc::new(PartitionSlot {
            partition,
            repository,
            log,
            state,
            path,
            worker: Mutex::new(Some(worker)),
        }))
    }

    pub fn stats(&self) -> PartitionStats {
        PartitionStats {
            partition: self.partition,
            enqueued_seq: self.state.enqueued_seq(),
            applied_seq: self.state.applied_seq(),
            pending: self.state.pending(),
            indexed_entries: self.repository.num_docs(),
            stale: self.state.stale(),
        }
    }

    /// Stop the worker and refuse further events. With `purge`, also delete
    /// the on-disk repository and journal.
    pub async fn shutdown(&self, purge: bool) {
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = worker {
            handle.abort();
            // the writer lock is released only once the task is dropped
            let _ = handle.await;
        }
        self.log.close().await;
        if purge {
            if let Some(path) = &self.path {
                if let Err(e) = std::fs::remove_dir_all(path) {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        tracing::warn!("[REGISTRY] could not remove {}: {}", path.display(), e);
                    }
                }
            }
        }
    }
}

/// Owns every registered index and the arena of partition slots.
///
/// Lookups are lock-free reads of concurrent maps. Only registration and
/// removal take the registration lock, so two callers cannot both register
/// the same name or observe a half-removed index.
pub struct IndexRegistry {
    entries: DashMap<IndexKey, Arc<IndexEntry>>,
    arena: DashMap<(IndexId, PartitionId), Arc<PartitionSlot>>,
    next_id: AtomicU64,
    registration: Mutex<()>,
}

impl Default for IndexRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl IndexRegistry {
    pub fn new() -> Self {
        IndexRegistry {
            entries: DashMap::new(),
            arena: DashMap::new(),
            next_id: AtomicU64::new(1),
            registration: Mutex::new(()),
        }
    }

    pub fn register(&self, definition: IndexDefinition) -> Result<Arc<IndexEntry>> {
        let _guard = self.registration.lock().unwrap_or_else(|e| e.into_inner());
        let key = definition.key();
        if self.entries.contains_key(&key) {
            return Err(SyncdexError::IndexAlreadyExists {
                index: key.index,
                store: key.store,
            });
        }
        let schema = definition.schema();
        let (pause, _) = watch::channel(false);
        let entry = Arc::new(IndexEntry {
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            definition,
            schema,
            pause,
            progress: Arc::new(Notify::new()),
            removed: AtomicBool::new(false),
        });
        self.entries.insert(key.clone(), entry.clone());
        tracing::info!("[REGISTRY] registered {} as #{}", key, entry.id);
        Ok(entry)
    }

    /// Unregister an index and detach its slots. The caller shuts the
    /// returned slots down.
    pub fn deregister(&self, key: &IndexKey) -> Result<(Arc<IndexEntry>, Vec<Arc<PartitionSlot>>)> {
        let _guard = self.registration.lock().unwrap_or_else(|e| e.into_inner());
        let (_, entry) = self
            .entries
            .remove(key)
            .ok_or_else(|| SyncdexError::IndexNotFound {
                index: key.index.clone(),
                store: key.store.clone(),
            })?;
        entry.removed.store(true, Ordering::SeqCst);
        let ids: Vec<(IndexId, PartitionId)> = self
            .arena
            .iter()
            .filter(|s| s.key().0 == entry.id)
            .map(|s| *s.key())
            .collect();
        let slots = ids
            .into_iter()
            .filter_map(|id| self.arena.remove(&id).map(|(_, slot)| slot))
            .collect();
        tracing::info!("[REGISTRY] removed {} (#{})", key, entry.id);
        Ok((entry, slots))
    }

    pub fn get(&self, key: &IndexKey) -> Result<Arc<IndexEntry>> {
        self.entries
            .get(key)
            .map(|e| Arc::clone(&e))
            .ok_or_else(|| SyncdexError::IndexNotFound {
                index: key.index.clone(),
                store: key.store.clone(),
            })
    }

    pub fn list(&self) -> Vec<Arc<IndexEntry>> {
        let mut entries: Vec<_> = self.entries.iter().map(|e| Arc::clone(&e)).collect();
        entries.sort_by(|a, b| a.key().cmp(&b.key()));
        entries
    }

    pub fn indexes_for_store(&self, store: &str) -> Vec<Arc<IndexEntry>> {
        self.entries
            .iter()
            .filter(|e| e.key().store == store)
            .map(|e| Arc::clone(&e))
            .collect()
    }

    pub fn slot(&self, id: IndexId, partition: PartitionId) -> Option<Arc<PartitionSlot>> {
        self.arena.get(&(id, partition)).map(|s| Arc::clone(&s))
    }

    /// Slots of one index, ordered by partition.
    pub fn slots(&self, id: IndexId) -> Vec<Arc<PartitionSlot>> {
        let mut slots: Vec<_> = self
            .arena
            .iter()
            .filter(|s| s.key().0 == id)
            .map(|s| Arc::clone(s.value()))
            .collect();
        slots.sort_by_key(|s| s.partition);
        slots
    }

    /// Existing slot, or one built by `open` and stored atomically.
    pub fn get_or_open_slot<F>(
        &self,
        id: IndexId,
        partition: PartitionId,
        open: F,
    ) -> Result<(Arc<PartitionSlot>, bool)>
    where
        F: FnOnce() -> Result<Arc<PartitionSlot>>,
    {
        match self.arena.entry((id, partition)) {
            Entry::Occupied(o) => Ok((Arc::clone(o.get()), false)),
            Entry::Vacant(v) => {
                let slot = open()?;
                v.insert(slot.clone());
                Ok((slot, true))
            }
        }
    }

    pub fn remove_slot(&self, id: IndexId, partition: PartitionId) -> Option<Arc<PartitionSlot>> {
        self.arena.remove(&(id, partition)).map(|(_, slot)| slot)
    }
}
