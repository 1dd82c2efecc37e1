use super::flush::FlushState;
use super::journal::EventJournal;
use crate::error::{Result, SyncdexError};
use crate::types::{EventOp, PartitionId, QueuedEvent};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

struct Sequencer {
    next_seq: u64,
    sender: Option<mpsc::Sender<QueuedEvent>>,
}

/// Producer side of one partition's queued event log.
///
/// Sequence numbers are assigned under a lock that is held until the event
/// is in the channel, so channel order is sequence order. The channel is
/// bounded: when the drain worker falls behind, `enqueue` waits for room
/// instead of dropping or buffering without limit.
pub struct EventLog {
    partition: PartitionId,
    label: String,
    sequencer: Mutex<Sequencer>,
    journal: Option<Arc<EventJournal>>,
    state: Arc<FlushState>,
}

/// Consumer side. Not cloneable, so one partition has exactly one drainer.
pub struct EventReceiver {
    rx: mpsc::Receiver<QueuedEvent>,
}

pub fn event_channel(
    partition: PartitionId,
    label: String,
    capacity: usize,
    last_seq: u64,
    journal: Option<Arc<EventJournal>>,
    state: Arc<FlushState>,
) -> (EventLog, EventReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let log = EventLog {
        partition,
        label,
        sequencer: Mutex::new(Sequencer {
            next_seq: last_seq + 1,
            sender: Some(tx),
        }),
        journal,
        state,
    };
    (log, EventReceiver { rx })
}

impl EventLog {
    pub fn partition(&self) -> PartitionId {
        self.partition
    }

    /// Append an event and return its sequence number.
    ///
    /// Any failure here means a committed store mutation will never reach the
    /// index, so the partition is marked stale as well as reported.
    pub async fn enqueue(&self, key: &str, op: EventOp) -> Result<u64> {
        let mut sequencer = self.sequencer.lock().await;
        let sender = match &sequencer.sender {
            Some(s) => s.clone(),
            None => return Err(SyncdexError::QueueClosed(self.partition)),
        };
        let seq = sequencer.next_seq;
        let event = QueuedEvent {
            partition: self.partition,
            seq,
            key: key.to_string(),
            op,
        };

        if let Some(journal) = &self.journal {
            let journal = Arc::clone(journal);
            let record = event.clone();
            let appended = tokio::task::spawn_blocking(move || journal.append(&record))
                .await
                .unwrap_or_else(|e| Err(SyncdexError::Io(format!("append task failed: {}", e))));
            if let Err(e) = appended {
                let detail = format!("journal append failed for seq {}: {}", seq, e);
                tracing::error!("[QUEUE {}] {}", self.label, detail);
                self.state.mark_stale(detail.clone());
                return Err(SyncdexError::IndexingFailure {
                    partition: self.partition,
                    detail,
                });
            }
        }

        self.state.note_enqueued(seq);
        if sender.send(event).await.is_err() {
            tracing::error!(
                "[QUEUE {}] drain worker gone, seq {} for key {} lost",
                self.label,
                seq,
                key
            );
            self.state.mark_stale(format!("event queue closed at seq {}", seq));
            return Err(SyncdexError::QueueClosed(self.partition));
        }
        sequencer.next_seq = seq + 1;
        Ok(seq)
    }

    /// Stop accepting events. The worker exits after draining what is queued.
    pub async fn close(&self) {
        self.sequencer.lock().await.sender = None;
    }
}

impl EventReceiver {
    /// Wait for at least one event, then take whatever else is already
    /// queued, up to `max`. `None` once the log is closed and empty.
    pub async fn next_batch(&mut self, max: usize) -> Option<Vec<QueuedEvent>> {
        let first = self.rx.recv().await?;
        let mut batch = Vec::with_capacity(max.min(64));
        batch.push(first);
        while batch.len() < max {
            match self.rx.try_recv() {
                Ok(event) => batch.push(event),
                Err(_) => break,
            }
        }
        Some(batch)
    }
}
