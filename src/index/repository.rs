use super::definition::IndexSchema;
use crate::error::{Result, SyncdexError};
use crate::types::{EntryKey, EventOp, QueuedEvent};
use std::path::Path;
use tantivy::collector::{Count, TopDocs};
use tantivy::directory::MmapDirectory;
use tantivy::query::{Query, TermQuery};
use tantivy::schema::{IndexRecordOption, OwnedValue, Value as _};
use tantivy::tokenizer::TokenizerManager;
use tantivy::{Index, IndexReader, IndexWriter, ReloadPolicy, TantivyDocument};

/// Scored keys from one partition's index.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LocalHits {
    pub total: usize,
    pub hits: Vec<(EntryKey, f32)>,
}

/// The text index of one partition of one index definition.
///
/// Writes go through a single [`IndexWriter`] owned by the partition's drain
/// worker. Readers are reloaded only after a commit, so a search sees either
/// all events of a batch or none of them.
pub struct IndexRepository {
    index: Index,
    reader: IndexReader,
    schema: IndexSchema,
    #[cfg(test)]
    failing_batches: std::sync::atomic::AtomicU32,
}

impl IndexRepository {
    pub fn create_in_ram(schema: IndexSchema, tokenizers: &TokenizerManager) -> Result<Self> {
        let index = Index::create_in_ram(schema.schema.clone());
        Self::wrap(index, schema, tokenizers)
    }

    /// Open the index under `path`, creating it when the directory holds none.
    /// Returns whether an existing index was found.
    pub fn open_or_create(
        path: &Path,
        schema: IndexSchema,
        tokenizers: &TokenizerManager,
    ) -> Result<(Self, bool)> {
        std::fs::create_dir_all(path)?;
        let directory = MmapDirectory::open(path)
            .map_err(|e| SyncdexError::Io(format!("open {}: {}", path.display(), e)))?;
        let existed = Index::exists(&directory)
            .map_err(|e| SyncdexError::Io(format!("probe {}: {}", path.display(), e)))?;
        let index = if existed {
            let index = Index::open_in_dir(path)?;
            if index.schema() != schema.schema {
                return Err(SyncdexError::InvalidDefinition(format!(
                    "index at {} was built for a different definition",
                    path.display()
                )));
            }
            index
        } else {
            Index::create_in_dir(path, schema.schema.clone())?
        };
        Ok((Self::wrap(index, schema, tokenizers)?, existed))
    }

    fn wrap(mut index: Index, schema: IndexSchema, tokenizers: &TokenizerManager) -> Result<Self> {
        index.set_tokenizers(tokenizers.clone());
        let reader = index
            .reader_builder()
            .reload_policy(ReloadPolicy::Manual)
            .try_into()?;
        Ok(IndexRepository {
            index,
            reader,
            schema,
            #[cfg(test)]
            failing_batches: std::sync::atomic::AtomicU32::new(0),
        })
    }

    pub fn schema(&self) -> &IndexSchema {
        &self.schema
    }

    pub fn writer(&self, heap_bytes: usize) -> Result<IndexWriter> {
        Ok(self.index.writer_with_num_threads(1, heap_bytes)?)
    }

    /// Stage one event. Put replaces any prior document for the key.
    pub fn apply(&self, writer: &mut IndexWriter, event: &QueuedEvent) -> Result<()> {
        writer.delete_term(self.schema.key_term(&event.key));
        if let EventOp::Put(value) = &event.op {
            writer.add_document(self.schema.to_document(&event.key, value))?;
        }
        Ok(())
    }

    pub fn apply_batch(&self, writer: &mut IndexWriter, events: &[QueuedEvent]) -> Result<()> {
        #[cfg(test)]
        self.injected_failure()?;
        for event in events {
            self.apply(writer, event)?;
        }
        self.commit(writer)
    }

    /// Make staged changes visible to searches.
    pub fn commit(&self, writer: &mut IndexWriter) -> Result<()> {
        writer.commit()?;
        self.reader.reload()?;
        Ok(())
    }

    /// Replace the whole index content with `entries` in one commit.
    pub fn load_all(
        &self,
        writer: &mut IndexWriter,
        entries: &[(EntryKey, serde_json::Value)],
    ) -> Result<()> {
        writer.delete_all_documents()?;
        for (key, value) in entries {
            writer.add_document(self.schema.to_document(key, value))?;
        }
        self.commit(writer)
    }

    pub fn search(&self, query: &dyn Query, limit: usize, offset: usize) -> Result<LocalHits> {
        let searcher = self.reader.searcher();
        if limit == 0 {
            let total = searcher.search(query, &Count)?;
            return Ok(LocalHits {
                total,
                hits: Vec::new(),
            });
        }
        let collector = (TopDocs::with_limit(limit).and_offset(offset), Count);
        let (top, total) = searcher.search(query, &collector)?;
        let mut hits = Vec::with_capacity(top.len());
        for (score, address) in top {
            let doc: TantivyDocument = searcher.doc(address)?;
            let key = match doc.get_first(self.schema.key_field) {
                Some(v) => {
                    let owned: OwnedValue = v.into();
                    match owned {
                        OwnedValue::Str(s) => s,
                        _ => continue,
                    }
                }
                None => continue,
            };
            hits.push((key, score));
        }
        Ok(LocalHits { total, hits })
    }

    /// Make the next `n` calls to [`IndexRepository::apply_batch`] fail.
    #[cfg(test)]
    pub(crate) fn fail_next_batches(&self, n: u32) {
        self.failing_batches
            .store(n, std::sync::atomic::Ordering::SeqCst);
    }

    #[cfg(test)]
    fn injected_failure(&self) -> Result<()> {
        use std::sync::atomic::Ordering;
        let hit = self
            .failing_batches
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if hit {
            return Err(SyncdexError::Io("injected write failure".to_string()));
        }
        Ok(())
    }

    pub fn num_docs(&self) -> u64 {
        self.reader.searcher().num_docs()
    }

    pub fn contains(&self, key: &str) -> Result<bool> {
        let query = TermQuery::new(self.schema.key_term(key), IndexRecordOption::Basic);
        let searcher = self.reader.searcher();
        Ok(searcher.search(&query, &Count)? > 0)
    }

    /// Keys currently indexed, for diagnostics and tests.
    pub fn keys(&self) -> Result<Vec<EntryKey>> {
        let searcher = self.reader.searcher();
        let mut keys = Vec::new();
        for segment in searcher.segment_readers() {
            let store = segment.get_store_reader(1)?;
            for doc_id in segment.doc_ids_alive() {
                let doc: TantivyDocument = store.get(doc_id)?;
                if let Some(s) = doc
                    .get_first(self.schema.key_field)
                    .and_then(|v| v.as_str())
                {
                    keys.push(s.to_string());
                }
            }
        }
        keys.sort();
        Ok(keys)
    }
}
