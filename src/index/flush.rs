use crate::error::{Result, SyncdexError};
use crate::types::PartitionId;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

/// Enqueued/applied counter pair of one partition repository.
///
/// Both counters only move forward. The partition is flushed up to `n` once
/// `applied_seq() >= n`.
pub struct FlushState {
    enqueued: AtomicU64,
    applied: AtomicU64,
    ready: AtomicBool,
    stale: Mutex<Option<String>>,
    progress: Arc<Notify>,
}

impl FlushState {
    /// `start_seq` is the last sequence number already reflected in the index.
    pub fn new(start_seq: u64, progress: Arc<Notify>) -> Self {
        FlushState {
            enqueued: AtomicU64::new(start_seq),
            applied: AtomicU64::new(start_seq),
            ready: AtomicBool::new(true),
            stale: Mutex::new(None),
            progress,
        }
    }

    /// A state that counts as behind until [`FlushState::mark_ready`], for
    /// repositories that still need a bulk load or journal replay.
    pub fn loading(start_seq: u64, progress: Arc<Notify>) -> Self {
        let state = FlushState::new(start_seq, progress);
        state.ready.store(false, Ordering::SeqCst);
        state
    }

    pub fn mark_ready(&self) {
        self.ready.store(true, Ordering::SeqCst);
        self.progress.notify_waiters();
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    pub fn note_enqueued(&self, seq: u64) {
        self.enqueued.fetch_max(seq, Ordering::SeqCst);
    }

    pub fn note_applied(&self, seq: u64) {
        self.applied.fetch_max(seq, Ordering::SeqCst);
        self.progress.notify_waiters();
    }

    /// Mark the repository as no longer tracking its partition. Wakes every
    /// waiter so it can report the failure.
    pub fn mark_stale(&self, detail: impl Into<String>) {
        let mut stale = self.stale.lock().unwrap_or_else(|e| e.into_inner());
        if stale.is_none() {
            *stale = Some(detail.into());
        }
        drop(stale);
        self.progress.notify_waiters();
    }

    pub fn stale(&self) -> Option<String> {
        self.stale.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn enqueued_seq(&self) -> u64 {
        self.enqueued.load(Ordering::SeqCst)
    }

    pub fn applied_seq(&self) -> u64 {
        self.applied.load(Ordering::SeqCst)
    }

    pub fn pending(&self) -> u64 {
        self.enqueued_seq().saturating_sub(self.applied_seq())
    }

    pub fn is_flushed(&self) -> bool {
        self.is_ready() && self.applied_seq() >= self.enqueued_seq()
    }
}

/// Blocks callers until the partitions of an index catch up.
#[derive(Debug, Clone)]
pub struct FlushCoordinator {
    poll_interval: Duration,
}

struct Target {
    state: Arc<FlushState>,
    seq: u64,
}

impl FlushCoordinator {
    pub fn new(poll_interval: Duration) -> Self {
        FlushCoordinator { poll_interval }
    }

    /// Wait until every partition returned by `members` has applied the
    /// events enqueued before it was first observed.
    ///
    /// `members` is re-evaluated on every wake-up: partitions that appear
    /// mid-wait are targeted from the moment they are seen, partitions that
    /// leave are dropped, and a partition whose repository was rebuilt is
    /// re-targeted against the new one. Returns `Ok(false)` on deadline and
    /// `Err(IndexingFailure)` if a targeted partition went stale.
    pub async fn wait_until_flushed<F>(
        &self,
        label: &str,
        progress: &Notify,
        deadline: Instant,
        mut members: F,
    ) -> Result<bool>
    where
        F: FnMut() -> Result<Vec<(PartitionId, Arc<FlushState>)>>,
    {
        let mut targets: HashMap<PartitionId, Target> = HashMap::new();
        let mut wakeups = 0u64;
        loop {
            let notified = progress.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let current = members()?;
            targets.retain(|p, _| current.iter().any(|(q, _)| q == p));
            for (partition, state) in current {
                let retarget = match targets.get(&partition) {
                    Some(t) => !Arc::ptr_eq(&t.state, &state),
                    None => true,
                };
                if retarget {
                    let seq = state.enqueued_seq();
                    targets.insert(partition, Target { state, seq });
                }
            }

            let mut behind = 0usize;
            for (partition, target) in &targets {
                if let Some(detail) = target.state.stale() {
                    tracing::error!("[FLUSH {}] {} is stale: {}", label, partition, detail);
                    return Err(SyncdexError::IndexingFailure {
                        partition: *partition,
                        detail,
                    });
                }
                if !target.state.is_ready() || target.state.applied_seq() < target.seq {
                    behind += 1;
                }
            }
            if behind == 0 {
                tracing::debug!(
                    "[FLUSH {}] drained {} partition(s) after {} wake-up(s)",
                    label,
                    targets.len(),
                    wakeups
                );
                return Ok(true);
            }

            let now = Instant::now();
            if now >= deadline {
                tracing::debug!(
                    "[FLUSH {}] timed out with {} partition(s) behind",
                    label,
                    behind
                );
                return Ok(false);
            }
            let nap = self.poll_interval.min(deadline - now);
            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep(nap) => {}
            }
            wakeups += 1;
        }
    }
}
