use crate::error::Result;
use crate::types::QueuedEvent;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

const SEGMENT_MAX_BYTES: u64 = 10 * 1024 * 1024;
const CHECKPOINT_FILE: &str = "applied_seq";

struct ActiveSegment {
    writer: BufWriter<File>,
    path: PathBuf,
    size: u64,
    id: u32,
    max_seq: u64,
}

struct Segments {
    active: ActiveSegment,
    /// Rotated-out segments and the highest sequence number each holds.
    closed: Vec<(PathBuf, u64)>,
}

/// Append-only JSONL record of one partition's queued events.
///
/// Events are written before they reach the drain worker; the worker writes
/// an `applied_seq` checkpoint after each commit. On restart everything
/// after the checkpoint is replayed into the on-disk index.
///
/// All methods do blocking file I/O; async callers run them on the blocking
/// pool.
pub struct EventJournal {
    dir: PathBuf,
    last_seq: u64,
    segments: Mutex<Segments>,
}

fn segment_name(id: u32) -> String {
    format!("segment_{:04}.jsonl", id)
}

fn segment_id(name: &str) -> Option<u32> {
    name.strip_prefix("segment_")
        .and_then(|s| s.strip_suffix(".jsonl"))
        .and_then(|s| s.parse().ok())
}

impl EventJournal {
    pub fn open(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let mut segments = list_segments(dir)?;
        let id = segments.last().map(|(id, _)| *id).unwrap_or(1);

        let mut active_max = 0;
        if let Some((_, path)) = segments.pop() {
            active_max = max_seq(&path)?;
        }
        let mut closed = Vec::with_capacity(segments.len());
        for (_, path) in segments {
            let max = max_seq(&path)?;
            closed.push((path, max));
        }
        // an empty tail segment after rotation: the checkpoint still bounds it
        let last_seq = active_max.max(read_checkpoint(dir)?);

        let path = dir.join(segment_name(id));
        let torn_tail = fs::read(&path)
            .map(|bytes| bytes.last().is_some_and(|b| *b != b'\n'))
            .unwrap_or(false);
        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        if torn_tail {
            file.write_all(b"\n")?;
        }
        let size = path.metadata().map(|m| m.len()).unwrap_or(0);
        Ok(EventJournal {
            dir: dir.to_path_buf(),
            last_seq,
            segments: Mutex::new(Segments {
                active: ActiveSegment {
                    writer: BufWriter::new(file),
                    path,
                    size,
                    id,
                    max_seq: active_max,
                },
                closed,
            }),
        })
    }

    /// Highest sequence number found when the journal was opened.
    pub fn last_seq(&self) -> u64 {
        self.last_seq
    }

    fn lock(&self) -> MutexGuard<'_, Segments> {
        self.segments.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn append(&self, event: &QueuedEvent) -> Result<()> {
        let line = serde_json::to_string(event)?;
        let mut segs = self.lock();
        let seg = &mut segs.active;
        seg.writer.write_all(line.as_bytes())?;
        seg.writer.write_all(b"\n")?;
        seg.writer.flush()?;
        seg.size += line.len() as u64 + 1;
        seg.max_seq = seg.max_seq.max(event.seq);
        if seg.size >= SEGMENT_MAX_BYTES {
            self.rotate_locked(&mut segs)?;
        }
        Ok(())
    }

    fn rotate_locked(&self, segs: &mut Segments) -> Result<()> {
        let seg = &mut segs.active;
        seg.writer.flush()?;
        let path = self.dir.join(segment_name(seg.id + 1));
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let old_path = std::mem::replace(&mut seg.path, path);
        segs.closed.push((old_path, seg.max_seq));
        seg.writer = BufWriter::new(file);
        seg.id += 1;
        seg.size = 0;
        seg.max_seq = 0;
        Ok(())
    }

    /// Events with `seq > since`, in sequence order.
    pub fn read_since(&self, since: u64) -> Result<Vec<QueuedEvent>> {
        self.lock().active.writer.flush()?;
        let mut events = Vec::new();
        for (_, path) in list_segments(&self.dir)? {
            events.extend(read_segment(&path)?.into_iter().filter(|e| e.seq > since));
        }
        events.sort_by_key(|e| e.seq);
        Ok(events)
    }

    pub fn write_checkpoint(&self, applied_seq: u64) -> Result<()> {
        let tmp = self.dir.join(format!("{}.tmp", CHECKPOINT_FILE));
        fs::write(&tmp, applied_seq.to_string())?;
        fs::rename(&tmp, self.dir.join(CHECKPOINT_FILE))?;
        Ok(())
    }

    pub fn checkpoint(&self) -> Result<u64> {
        read_checkpoint(&self.dir)
    }

    /// Remove closed segments whose events are all below `before`.
    ///
    /// Uses the bounds recorded at open and rotation, so nothing is read and
    /// the common case (no closed segment below `before`) touches no file.
    pub fn truncate_before(&self, before: u64) -> Result<u64> {
        let mut segs = self.lock();
        let mut removed = 0;
        let mut failure = None;
        segs.closed.retain(|(path, max_seq)| {
            if *max_seq >= before {
                return true;
            }
            match fs::remove_file(path) {
                Ok(()) => {
                    removed += 1;
                    false
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
                Err(e) => {
                    failure.get_or_insert(e);
                    true
                }
            }
        });
        match failure {
            Some(e) => Err(e.into()),
            None => Ok(removed),
        }
    }

    /// Record `applied_seq` and drop the segments it makes obsolete.
    pub fn checkpoint_and_truncate(&self, applied_seq: u64) -> Result<u64> {
        self.write_checkpoint(applied_seq)?;
        self.truncate_before(applied_seq + 1)
    }
}

fn list_segments(dir: &Path) -> Result<Vec<(u32, PathBuf)>> {
    let mut segments: Vec<(u32, PathBuf)> = fs::read_dir(dir)?
        .filter_map(|e| e.ok())
        .filter_map(|e| {
            let id = e.file_name().to_str().and_then(segment_id)?;
            Some((id, e.path()))
        })
        .collect();
    segments.sort_by_key(|(id, _)| *id);
    Ok(segments)
}

fn read_segment(path: &Path) -> Result<Vec<QueuedEvent>> {
    let reader = BufReader::new(File::open(path)?);
    let mut events = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<QueuedEvent>(&line) {
            Ok(event) => events.push(event),
            // torn final line from a crash mid-write
            Err(e) => tracing::warn!("[JOURNAL] skipping bad line in {}: {}", path.display(), e),
        }
    }
    Ok(events)
}

fn max_seq(path: &Path) -> Result<u64> {
    Ok(read_segment(path)?.iter().map(|e| e.seq).max().unwrap_or(0))
}

fn read_checkpoint(dir: &Path) -> Result<u64> {
    match fs::read_to_string(dir.join(CHECKPOINT_FILE)) {
        Ok(s) => Ok(s.trim().parse().unwrap_or(0)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EventOp, PartitionId};
    use serde_json::json;
    use tempfile::TempDir;

    fn event(seq: u64) -> QueuedEvent {
        QueuedEvent {
            partition: PartitionId(1),
            seq,
            key: format!("k{}", seq),
            op: EventOp::Put(json!({ "n": seq })),
        }
    }

    #[test]
    fn append_and_read_since() {
        let tmp = TempDir::new().unwrap();
        let journal = EventJournal::open(tmp.path()).unwrap();
        assert_eq!(journal.last_seq(), 0);
        for seq in 1..=3 {
            journal.append(&event(seq)).unwrap();
        }
        let all = journal.read_since(0).unwrap();
        assert_eq!(all.iter().map(|e| e.seq).collect::<Vec<_>>(), vec![1, 2, 3]);
        let tail = journal.read_since(2).unwrap();
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].key, "k3");
    }

    #[test]
    fn reopen_recovers_last_seq_and_checkpoint() {
        let tmp = TempDir::new().unwrap();
        {
            let journal = EventJournal::open(tmp.path()).unwrap();
            journal.append(&event(1)).unwrap();
            journal.append(&event(2)).unwrap();
            journal.write_checkpoint(1).unwrap();
        }
        let journal = EventJournal::open(tmp.path()).unwrap();
        assert_eq!(journal.last_seq(), 2);
        assert_eq!(journal.checkpoint().unwrap(), 1);
        assert_eq!(journal.read_since(1).unwrap().len(), 1);
    }

    #[test]
    fn truncate_drops_closed_segments_below_checkpoint() {
        let tmp = TempDir::new().unwrap();
        let journal = EventJournal::open(tmp.path()).unwrap();
        for seq in 1..=5 {
            journal.append(&event(seq)).unwrap();
        }
        journal.rotate_locked(&mut journal.lock()).unwrap();
        for seq in 6..=10 {
            journal.append(&event(seq)).unwrap();
        }

        assert_eq!(journal.truncate_before(5).unwrap(), 0);
        assert_eq!(journal.truncate_before(6).unwrap(), 1);
        let remaining = journal.read_since(0).unwrap();
        assert_eq!(remaining.len(), 5);
        assert_eq!(remaining[0].seq, 6);
    }

    #[test]
    fn truncate_uses_bounds_recorded_at_rotation() {
        let tmp = TempDir::new().unwrap();
        let journal = EventJournal::open(tmp.path()).unwrap();
        for seq in 1..=3 {
            journal.append(&event(seq)).unwrap();
        }
        journal.rotate_locked(&mut journal.lock()).unwrap();
        journal.append(&event(4)).unwrap();

        // the closed segment is not re-read: a rewrite on disk changes nothing
        let closed = tmp.path().join(segment_name(1));
        let line = serde_json::to_string(&event(99)).unwrap();
        fs::write(&closed, format!("{}\n", line)).unwrap();

        assert_eq!(journal.checkpoint_and_truncate(2).unwrap(), 0);
        assert!(closed.exists());
        assert_eq!(journal.checkpoint_and_truncate(3).unwrap(), 1);
        assert!(!closed.exists());
        assert_eq!(journal.checkpoint().unwrap(), 3);
        // already gone
        assert_eq!(journal.truncate_before(10).unwrap(), 0);
    }

    #[test]
    fn reopen_restores_closed_segment_bounds() {
        let tmp = TempDir::new().unwrap();
        {
            let journal = EventJournal::open(tmp.path()).unwrap();
            journal.append(&event(1)).unwrap();
            journal.rotate_locked(&mut journal.lock()).unwrap();
            journal.append(&event(2)).unwrap();
        }
        let journal = EventJournal::open(tmp.path()).unwrap();
        assert_eq!(journal.last_seq(), 2);
        assert_eq!(journal.truncate_before(2).unwrap(), 1);
        assert_eq!(journal.read_since(0).unwrap().len(), 1);
    }

    #[test]
    fn torn_line_is_skipped() {
        let tmp = TempDir::new().unwrap();
        {
            let journal = EventJournal::open(tmp.path()).unwrap();
            journal.append(&event(1)).unwrap();
        }
        let path = tmp.path().join(segment_name(1));
        let mut content = fs::read_to_string(&path).unwrap();
        content.push_str("{\"partition\":1,\"se");
        fs::write(&path, content).unwrap();

        let journal = EventJournal::open(tmp.path()).unwrap();
        assert_eq!(journal.last_seq(), 1);
        assert_eq!(journal.read_since(0).unwrap().len(), 1);
    }
}
