use super::federator::FederationRequest;
use super::pager::{self, PageCursor};
use super::{QueryContext, QueryProvider, QuerySpec};
use crate::error::{Result, SyncdexError};
use crate::index::IndexEntry;
use crate::service::SyncService;
use crate::types::{EntryKey, FederationMode, IndexKey, ResultRow};
use std::sync::Arc;
use std::time::Duration;
use tantivy::query::Query;
use uuid::Uuid;

/// Collects the parts of a query before it is checked and compiled.
///
/// Obtained from [`SyncService::query`]. Unset options fall back to the
/// service's [`crate::SyncConfig`].
pub struct QueryBuilder {
    service: Arc<SyncService>,
    key: IndexKey,
    spec: Option<QuerySpec>,
    limit: Option<usize>,
    page_size: Option<usize>,
    timeout: Option<Duration>,
    mode: Option<FederationMode>,
}

impl QueryBuilder {
    pub(crate) fn new(service: Arc<SyncService>, key: IndexKey) -> Self {
        QueryBuilder {
            service,
            key,
            spec: None,
            limit: None,
            page_size: None,
            timeout: None,
            mode: None,
        }
    }

    /// Query string in tantivy syntax; unqualified terms go to `default_field`.
    pub fn string(mut self, query: impl Into<String>, default_field: impl Into<String>) -> Self {
        self.spec = Some(QuerySpec::Text {
            query: query.into(),
            default_field: default_field.into(),
        });
        self
    }

    /// Custom query construction. Only runs against local partitions.
    pub fn builder<P: QueryProvider + 'static>(mut self, provider: P) -> Self {
        self.spec = Some(QuerySpec::Provider(Arc::new(provider)));
        self
    }

    /// Closure form of [`QueryBuilder::builder`].
    pub fn provider<F>(self, f: F) -> Self
    where
        F: Fn(&QueryContext<'_>) -> Result<Box<dyn Query>> + Send + Sync + 'static,
    {
        self.builder(f)
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Rows per page; 0 puts every row on one page.
    pub fn page_size(mut self, page_size: usize) -> Self {
        self.page_size = Some(page_size);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn federation_mode(mut self, mode: FederationMode) -> Self {
        self.mode = Some(mode);
        self
    }

    /// Check the transaction guard, resolve the index and compile the query.
    pub fn build(self) -> Result<QueryHandle> {
        self.service.guard().check(&self.key.store)?;
        let entry = self.service.registry().get(&self.key)?;
        let spec = self
            .spec
            .ok_or_else(|| SyncdexError::QueryParse("no query string or builder given".to_string()))?;
        let config = self.service.config();
        let limit = self.limit.unwrap_or(config.default_limit);
        if limit == 0 {
            return Err(SyncdexError::QueryParse(
                "limit must be at least 1".to_string(),
            ));
        }
        let query = spec.compile(&entry.definition, &entry.schema, self.service.tokenizers())?;
        Ok(QueryHandle {
            id: Uuid::new_v4(),
            service: self.service.clone(),
            entry,
            spec,
            query,
            limit,
            page_size: self.page_size.unwrap_or(config.default_page_size),
            timeout: self.timeout.unwrap_or_else(|| config.query_timeout()),
            mode: self.mode.unwrap_or(config.federation_mode),
        })
    }
}

/// A checked, compiled query. Each `find_*` call runs it anew.
pub struct QueryHandle {
    id: Uuid,
    service: Arc<SyncService>,
    entry: Arc<IndexEntry>,
    spec: QuerySpec,
    query: Arc<dyn Query>,
    limit: usize,
    page_size: usize,
    timeout: Duration,
    mode: FederationMode,
}

impl QueryHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn key(&self) -> IndexKey {
        self.entry.key()
    }

    /// Run the query and materialize the ranked result.
    pub async fn find_pages(&self) -> Result<PageCursor> {
        let key = self.entry.key();
        self.service.guard().check(&key.store)?;
        let current = self.service.registry().get(&key)?;
        if current.id != self.entry.id {
            // removed and re-created since build()
            return Err(SyncdexError::IndexNotFound {
                index: key.index,
                store: key.store,
            });
        }

        let slots = self.service.local_slots(&self.entry).await?;
        let request = FederationRequest {
            query_id: self.id.to_string(),
            key,
            spec: self.spec.clone(),
            query: self.query.clone(),
            limit: self.limit,
            timeout: self.timeout,
            mode: self.mode,
        };
        let outcome = self.service.federator().execute(request, slots).await?;
        let (rows, total) = pager::merge(outcome.hits, self.limit);
        tracing::debug!(
            "[FED {}] {} row(s) of {} match(es) from {} partition(s)",
            self.entry.definition.name,
            rows.len(),
            total,
            outcome.contributors.len()
        );
        Ok(PageCursor::new(
            rows,
            self.page_size,
            total,
            outcome.contributors,
            outcome.failures,
        ))
    }

    pub async fn find_results(&self) -> Result<Vec<ResultRow>> {
        Ok(self.find_pages().await?.rows().to_vec())
    }

    pub async fn find_keys(&self) -> Result<Vec<EntryKey>> {
        Ok(self.find_pages().await?.keys())
    }

    /// Number of rows the query currently returns.
    pub async fn size(&self) -> Result<usize> {
        Ok(self.find_pages().await?.size())
    }
}
