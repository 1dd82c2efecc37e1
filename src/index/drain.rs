//! Per-partition drain workers.
//!
//! Each worker owns the only writer of its repository and the only receiver
//! of its event log. It first brings the repository up to date (bulk load
//! from the store, or journal replay for an on-disk index), then applies
//! queued events in batches until the log is closed.

use super::event_log::EventReceiver;
use super::flush::FlushState;
use super::journal::EventJournal;
use super::repository::IndexRepository;
use crate::error::{Result, SyncdexError};
use crate::store::PartitionedStore;
use crate::types::{PartitionId, QueuedEvent};
use std::sync::Arc;
use std::time::Duration;
use tantivy::IndexWriter;
use tokio::sync::watch;
use tokio::task::JoinHandle;

#[derive(Debug, Clone)]
pub struct DrainSettings {
    pub batch_size: usize,
    pub max_retries: u32,
    pub retry_backoff: Duration,
    pub writer_heap_bytes: usize,
}

/// How a new worker reconciles its repository before draining.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    /// Empty repository: scan the partition and index every entry.
    BulkLoad,
    /// On-disk repository: re-apply journal events after `checkpoint`.
    Replay { checkpoint: u64 },
}

pub struct DrainWorker {
    pub label: String,
    pub store_name: String,
    pub partition: PartitionId,
    pub repository: Arc<IndexRepository>,
    pub state: Arc<FlushState>,
    pub journal: Option<Arc<EventJournal>>,
    pub store: Arc<dyn PartitionedStore>,
    pub pause: watch::Receiver<bool>,
    pub settings: DrainSettings,
    pub recovery: Recovery,
}

impl DrainWorker {
    pub fn spawn(self, rx: EventReceiver) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(rx).await })
    }

    async fn run(mut self, mut rx: EventReceiver) {
        let mut writer = match self.repository.writer(self.settings.writer_heap_bytes) {
            Ok(w) => w,
            Err(e) => {
                self.fail(format!("could not open index writer: {}", e));
                self.discard(rx).await;
                return;
            }
        };

        if !wait_while_paused(&mut self.pause).await {
            return;
        }
        if let Err(e) = self.recover(&mut writer).await {
            self.fail(format!("recovery failed: {}", e));
            self.discard(rx).await;
            return;
        }
        self.state.mark_ready();
        tracing::info!(
            "[DRAIN {}] ready at seq {}, {} entries indexed",
            self.label,
            self.state.applied_seq(),
            self.repository.num_docs()
        );

        loop {
            if !wait_while_paused(&mut self.pause).await {
                break;
            }
            let batch = match rx.next_batch(self.settings.batch_size).await {
                Some(batch) => batch,
                None => break,
            };
            // a pause requested while we were parked on recv holds this batch
            if !wait_while_paused(&mut self.pause).await {
                break;
            }

            let accepted = match self.sequence_check(batch) {
                Ok(events) => events,
                Err(detail) => {
                    self.fail(detail);
                    break;
                }
            };
            if accepted.is_empty() {
                continue;
            }
            if let Err(e) = self.apply_with_retry(&mut writer, &accepted).await {
                self.fail(format!(
                    "giving up on seq {}..={}: {}",
                    accepted[0].seq,
                    accepted[accepted.len() - 1].seq,
                    e
                ));
                break;
            }
        }

        if self.state.stale().is_some() {
            self.discard(rx).await;
        }
        tracing::info!("[DRAIN {}] worker stopped", self.label);
    }

    async fn recover(&self, writer: &mut IndexWriter) -> Result<()> {
        match self.recovery {
            Recovery::BulkLoad => {
                let start_seq = self.state.enqueued_seq();
                let entries = self
                    .store
                    .scan_partition(&self.store_name, self.partition)
                    .await?;
                self.repository.load_all(writer, &entries)?;
                self.state.note_applied(start_seq);
                self.checkpoint(start_seq).await;
                tracing::info!(
                    "[DRAIN {}] bulk loaded {} entries at seq {}",
                    self.label,
                    entries.len(),
                    start_seq
                );
            }
            Recovery::Replay { checkpoint } => {
                let events = match &self.journal {
                    Some(journal) => {
                        let journal = Arc::clone(journal);
                        tokio::task::spawn_blocking(move || journal.read_since(checkpoint))
                            .await
                            .map_err(|e| {
                                SyncdexError::Io(format!("journal replay task failed: {}", e))
                            })??
                    }
                    None => Vec::new(),
                };
                if let Some(last) = events.last().map(|e| e.seq) {
                    self.repository.apply_batch(writer, &events)?;
                    self.state.note_applied(last);
                    self.checkpoint(last).await;
                    tracing::info!(
                        "[DRAIN {}] replayed {} journal events up to seq {}",
                        self.label,
                        events.len(),
                        last
                    );
                }
            }
        }
        Ok(())
    }

    /// Drop events already applied and reject gaps.
    fn sequence_check(
        &self,
        batch: Vec<QueuedEvent>,
    ) -> std::result::Result<Vec<QueuedEvent>, String> {
        let mut cursor = self.state.applied_seq();
        let mut accepted = Vec::with_capacity(batch.len());
        for event in batch {
            if event.seq <= cursor {
                tracing::debug!(
                    "[DRAIN {}] skipping seq {} (applied {})",
                    self.label,
                    event.seq,
                    cursor
                );
                continue;
            }
            if event.seq != cursor + 1 {
                return Err(format!(
                    "sequence gap: expected {}, got {}",
                    cursor + 1,
                    event.seq
                ));
            }
            cursor = event.seq;
            accepted.push(event);
        }
        Ok(accepted)
    }

    async fn apply_with_retry(
        &self,
        writer: &mut IndexWriter,
        events: &[QueuedEvent],
    ) -> Result<()> {
        let last = events[events.len() - 1].seq;
        let mut attempt = 0u32;
        loop {
            match self.repository.apply_batch(writer, events) {
                Ok(()) => break,
                Err(e) => {
                    if let Err(rollback) = writer.rollback() {
                        tracing::warn!("[DRAIN {}] rollback failed: {}", self.label, rollback);
                    }
                    if attempt >= self.settings.max_retries {
                        return Err(e);
                    }
                    let delay = self.settings.retry_backoff * 2u32.saturating_pow(attempt);
                    attempt += 1;
                    tracing::warn!(
                        "[DRAIN {}] apply of {} event(s) failed (attempt {}/{}), retrying in {:?}: {}",
                        self.label,
                        events.len(),
                        attempt,
                        self.settings.max_retries,
                        delay,
                        e
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
        self.state.note_applied(last);
        self.checkpoint(last).await;
        tracing::debug!(
            "[DRAIN {}] committed {} event(s) through seq {}, pending {}",
            self.label,
            events.len(),
            last,
            self.state.pending()
        );
        Ok(())
    }

    async fn checkpoint(&self, applied: u64) {
        let journal = match &self.journal {
            Some(journal) => Arc::clone(journal),
            None => return,
        };
        match tokio::task::spawn_blocking(move || journal.checkpoint_and_truncate(applied)).await {
            Ok(Ok(0)) => {}
            Ok(Ok(removed)) => tracing::debug!(
                "[DRAIN {}] dropped {} journal segment(s) below seq {}",
                self.label,
                removed,
                applied + 1
            ),
            Ok(Err(e)) => tracing::warn!("[DRAIN {}] journal checkpoint failed: {}", self.label, e),
            Err(e) => tracing::warn!("[DRAIN {}] journal checkpoint task failed: {}", self.label, e),
        }
    }

    fn fail(&self, detail: String) {
        tracing::error!("[DRAIN {}] partition index is stale: {}", self.label, detail);
        self.state.mark_stale(detail);
    }

    /// Keep the log moving after a fatal error so producers never block on a
    /// dead partition. Flush-waits report the stale mark instead.
    async fn discard(&self, mut rx: EventReceiver) {
        let mut dropped = 0u64;
        while let Some(batch) = rx.next_batch(self.settings.batch_size).await {
            dropped += batch.len() as u64;
        }
        if dropped > 0 {
            tracing::warn!(
                "[DRAIN {}] discarded {} event(s) for stale partition",
                self.label,
                dropped
            );
        }
    }
}

/// Returns false once the pause switch is gone (index removed).
async fn wait_while_paused(pause: &mut watch::Receiver<bool>) -> bool {
    loop {
        if !*pause.borrow_and_update() {
            return true;
        }
        if pause.changed().await.is_err() {
            return false;
        }
    }
}

impl From<&crate::config::SyncConfig> for DrainSettings {
    fn from(config: &crate::config::SyncConfig) -> Self {
        DrainSettings {
            batch_size: config.batch_size,
            max_retries: config.max_apply_retries,
            retry_backoff: config.retry_backoff(),
            writer_heap_bytes: config.writer_heap_bytes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::analyzers::tokenizer_manager;
    use crate::index::event_log::{event_channel, EventLog};
    use crate::index::{FlushCoordinator, IndexDefinition};
    use crate::store::MemoryStore;
    use crate::types::EventOp;
    use serde_json::json;
    use tokio::sync::Notify;
    use tokio::time::Instant;

    struct Harness {
        log: EventLog,
        repository: Arc<IndexRepository>,
        state: Arc<FlushState>,
        progress: Arc<Notify>,
        _pause: watch::Sender<bool>,
    }

    impl Harness {
        fn start(max_retries: u32, failing_batches: u32) -> Self {
            let def = IndexDefinition::builder("idx", "people").field("text").build();
            let repository = Arc::new(
                IndexRepository::create_in_ram(def.schema(), &tokenizer_manager()).unwrap(),
            );
            repository.fail_next_batches(failing_batches);
            let progress = Arc::new(Notify::new());
            let state = Arc::new(FlushState::loading(0, progress.clone()));
            let (log, rx) = event_channel(
                PartitionId(0),
                "idx/p0".to_string(),
                16,
                0,
                None,
                state.clone(),
            );
            let store = MemoryStore::new();
            store.create_store("people", 1).unwrap();
            let (pause, pause_rx) = watch::channel(false);
            DrainWorker {
                label: "idx/p0".to_string(),
                store_name: "people".to_string(),
                partition: PartitionId(0),
                repository: repository.clone(),
                state: state.clone(),
                journal: None,
                store,
                pause: pause_rx,
                settings: DrainSettings {
                    batch_size: 8,
                    max_retries,
                    retry_backoff: Duration::from_millis(5),
                    writer_heap_bytes: 15_000_000,
                },
                recovery: Recovery::BulkLoad,
            }
            .spawn(rx);
            Harness {
                log,
                repository,
                state,
                progress,
                _pause: pause,
            }
        }

        async fn put(&self, key: &str) {
            self.log
                .enqueue(key, EventOp::Put(json!({ "text": "hello world" })))
                .await
                .unwrap();
        }

        async fn flush(&self, timeout: Duration) -> Result<bool> {
            let state = self.state.clone();
            FlushCoordinator::new(Duration::from_millis(10))
                .wait_until_flushed(
                    "idx",
                    &self.progress,
                    Instant::now() + timeout,
                    move || Ok(vec![(PartitionId(0), state.clone())]),
                )
                .await
        }
    }

    #[tokio::test]
    async fn transient_write_failures_are_retried() {
        let h = Harness::start(3, 2);
        for key in ["a", "b", "c"] {
            h.put(key).await;
        }

        assert!(h.flush(Duration::from_secs(10)).await.unwrap());
        assert_eq!(h.state.pending(), 0);
        assert!(h.state.stale().is_none());
        assert_eq!(h.repository.num_docs(), 3);
    }

    #[tokio::test]
    async fn exhausted_retries_mark_the_partition_stale() {
        let h = Harness::start(2, u32::MAX);
        h.put("a").await;

        let err = h.flush(Duration::from_secs(10)).await.unwrap_err();
        assert_eq!(err.kind(), "indexing_failure");
        assert!(err.to_string().contains("injected write failure"));
        assert!(h.state.stale().is_some());
        assert_eq!(h.repository.num_docs(), 0);

        // the dead partition keeps accepting events beyond its buffer size
        let more = async {
            for i in 0..40 {
                h.put(&format!("k{}", i)).await;
            }
        };
        tokio::time::timeout(Duration::from_secs(10), more)
            .await
            .expect("producer blocked on a stale partition");
    }
}
