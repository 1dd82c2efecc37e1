//! Fans a compiled query out to every partition of an index and collects the
//! answers.
//!
//! A query moves through Building (find the partitions and who hosts them),
//! Dispatching (one task per local partition, one request per remote node),
//! Collecting (wait for every task or the deadline) and ends Done or Failed.

use super::QuerySpec;
use crate::error::{Result, SyncdexError};
use crate::index::PartitionSlot;
use crate::store::PartitionedStore;
use crate::types::{
    FederationMode, IndexKey, PartitionFailure, PartitionHits, PartitionId, RemoteSearch,
    ResultRow,
};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tantivy::query::Query;
use tokio::task::JoinSet;
use tokio::time::{timeout_at, Instant};

/// The other nodes of the cluster, as seen by the federator.
#[async_trait]
pub trait RemoteNodes: Send + Sync {
    /// Partitions of `key.store` each peer hosts, per peer. A peer that
    /// cannot be reached yields an error in its slot.
    async fn partitions(&self, key: &IndexKey) -> Vec<(String, Result<Vec<PartitionId>>)>;

    /// Run a string query on `node` against the listed partitions.
    async fn search(&self, node: &str, request: &RemoteSearch) -> Result<Vec<PartitionHits>>;

    /// Whether every peer drained its partitions of the index in time.
    async fn wait_until_flushed(&self, key: &IndexKey, timeout: Duration) -> Result<bool>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Building,
    Dispatching,
    Collecting,
    Done,
    Failed,
}

enum Target {
    Local(Arc<PartitionSlot>),
    Remote {
        node: String,
        partitions: Vec<PartitionId>,
    },
}

impl Target {
    fn partitions(&self) -> Vec<PartitionId> {
        match self {
            Target::Local(slot) => vec![slot.partition],
            Target::Remote { partitions, .. } => partitions.clone(),
        }
    }

    fn node(&self) -> Option<String> {
        match self {
            Target::Local(_) => None,
            Target::Remote { node, .. } => Some(node.clone()),
        }
    }
}

pub struct FederationRequest {
    pub query_id: String,
    pub key: IndexKey,
    pub spec: QuerySpec,
    pub query: Arc<dyn Query>,
    pub limit: usize,
    pub timeout: Duration,
    pub mode: FederationMode,
}

#[derive(Debug, Default)]
pub struct FederationOutcome {
    pub hits: Vec<PartitionHits>,
    pub contributors: Vec<PartitionId>,
    pub failures: Vec<PartitionFailure>,
}

pub struct QueryFederator {
    store: Arc<dyn PartitionedStore>,
    remote: Option<Arc<dyn RemoteNodes>>,
}

impl QueryFederator {
    pub fn new(store: Arc<dyn PartitionedStore>, remote: Option<Arc<dyn RemoteNodes>>) -> Self {
        QueryFederator { store, remote }
    }

    /// Run `request` over the local `slots` and every remote partition.
    pub async fn execute(
        &self,
        request: FederationRequest,
        slots: Vec<Arc<PartitionSlot>>,
    ) -> Result<FederationOutcome> {
        let label = format!("{} {}", request.key.index, short_id(&request.query_id));
        let deadline = Instant::now() + request.timeout;
        let mut outcome = FederationOutcome::default();

        trace_phase(&label, Phase::Building);
        let mut targets: Vec<Target> = Vec::with_capacity(slots.len());
        let mut covered: HashSet<PartitionId> = slots.iter().map(|s| s.partition).collect();
        targets.extend(slots.into_iter().map(Target::Local));

        if let Some(remote) = &self.remote {
            let discovered = match timeout_at(deadline, remote.partitions(&request.key)).await {
                Ok(d) => d,
                Err(_) => {
                    self.fail_or_record(
                        &label,
                        &request,
                        &mut outcome,
                        Vec::new(),
                        None,
                        SyncdexError::PeerUnreachable("partition discovery timed out".to_string()),
                    )?;
                    Vec::new()
                }
            };
            for (node, result) in discovered {
                match result {
                    Ok(partitions) => {
                        let mut mine: Vec<PartitionId> = partitions
                            .into_iter()
                            .filter(|p| covered.insert(*p))
                            .collect();
                        if mine.is_empty() {
                            continue;
                        }
                        mine.sort();
                        targets.push(Target::Remote {
                            node,
                            partitions: mine,
                        });
                    }
                    Err(e) => {
                        self.fail_or_record(
                            &label,
                            &request,
                            &mut outcome,
                            Vec::new(),
                            Some(node),
                            e,
                        )?;
                    }
                }
            }
        }

        trace_phase(&label, Phase::Dispatching);
        tracing::debug!(
            "[FED {}] dispatching to {} target(s), limit {}, mode {:?}",
            label,
            targets.len(),
            request.limit,
            request.mode
        );
        let mut tasks: JoinSet<(usize, Result<Vec<PartitionHits>>)> = JoinSet::new();
        for (i, target) in targets.iter().enumerate() {
            match target {
                Target::Local(slot) => {
                    let store = self.store.clone();
                    let store_name = request.key.store.clone();
                    let slot = slot.clone();
                    let query = request.query.clone();
                    let limit = request.limit;
                    tasks.spawn(async move {
                        let result = search_slot(store, &store_name, slot, query, limit)
                            .await
                            .map(|h| vec![h]);
                        (i, result)
                    });
                }
                Target::Remote { node, partitions } => {
                    let remote = self.remote.clone();
                    let node = node.clone();
                    let search = match &request.spec {
                        QuerySpec::Text {
                            query,
                            default_field,
                        } => Ok(RemoteSearch {
                            index: request.key.index.clone(),
                            store: request.key.store.clone(),
                            query: query.clone(),
                            default_field: default_field.clone(),
                            partitions: partitions.clone(),
                            limit: request.limit,
                            timeout_ms: (deadline.saturating_duration_since(Instant::now())
                                .as_millis() as u64)
                                .max(1),
                        }),
                        QuerySpec::Provider(_) => Err(SyncdexError::Unsupported(
                            "query builders cannot be sent to remote partitions".to_string(),
                        )),
                    };
                    tasks.spawn(async move {
                        let result = match (search, remote) {
                            (Ok(search), Some(remote)) => remote.search(&node, &search).await,
                            (Err(e), _) => Err(e),
                            (Ok(_), None) => Err(SyncdexError::PeerUnreachable(node)),
                        };
                        (i, result)
                    });
                }
            }
        }

        trace_phase(&label, Phase::Collecting);
        let mut answered = vec![false; targets.len()];
        loop {
            match timeout_at(deadline, tasks.join_next()).await {
                Ok(Some(Ok((i, Ok(hits))))) => {
                    answered[i] = true;
                    outcome.contributors.extend(hits.iter().map(|h| h.partition));
                    outcome.hits.extend(hits);
                }
                Ok(Some(Ok((i, Err(e))))) => {
                    answered[i] = true;
                    let target = &targets[i];
                    if request.mode == FederationMode::FailFast {
                        tasks.abort_all();
                    }
                    self.fail_or_record(
                        &label,
                        &request,
                        &mut outcome,
                        target.partitions(),
                        target.node(),
                        e,
                    )?;
                }
                Ok(Some(Err(join_error))) => {
                    // the target index is lost with the task; reported below
                    tracing::error!("[FED {}] sub-query task failed: {}", label, join_error);
                    if request.mode == FederationMode::FailFast {
                        tasks.abort_all();
                        trace_phase(&label, Phase::Failed);
                        return Err(SyncdexError::PartialResult {
                            missing: unanswered(&targets, &answered),
                            detail: format!("sub-query task failed: {}", join_error),
                        });
                    }
                }
                Ok(None) => break,
                Err(_) => {
                    tasks.abort_all();
                    let missing = unanswered(&targets, &answered);
                    tracing::warn!(
                        "[FED {}] timed out after {:?} waiting for {} partition(s)",
                        label,
                        request.timeout,
                        missing.len()
                    );
                    if request.mode == FederationMode::FailFast {
                        trace_phase(&label, Phase::Failed);
                        return Err(SyncdexError::PartialResult {
                            missing,
                            detail: format!("timed out after {:?}", request.timeout),
                        });
                    }
                    break;
                }
            }
        }

        for (i, target) in targets.iter().enumerate() {
            if !answered[i] {
                outcome.failures.push(PartitionFailure {
                    partitions: target.partitions(),
                    node: target.node(),
                    error: "no answer before the query deadline".to_string(),
                });
            }
        }
        if !outcome.failures.is_empty() {
            tracing::warn!(
                "[FED {}] returning partial result, {} failure(s)",
                label,
                outcome.failures.len()
            );
        }
        trace_phase(&label, Phase::Done);
        Ok(outcome)
    }

    /// Fail-fast turns a sub-query error into the query's error; partial
    /// mode records it and carries on.
    fn fail_or_record(
        &self,
        label: &str,
        request: &FederationRequest,
        outcome: &mut FederationOutcome,
        partitions: Vec<PartitionId>,
        node: Option<String>,
        error: SyncdexError,
    ) -> Result<()> {
        tracing::warn!(
            "[FED {}] sub-query on {:?} ({}) failed: {}",
            label,
            partitions,
            node.as_deref().unwrap_or("local"),
            error
        );
        if request.mode == FederationMode::FailFast {
            trace_phase(label, Phase::Failed);
            return Err(error);
        }
        outcome.failures.push(PartitionFailure {
            partitions,
            node,
            error: error.to_string(),
        });
        Ok(())
    }
}

/// Search one local partition and resolve hits to live store values.
/// Entries removed from the store since they were indexed are dropped.
pub async fn search_slot(
    store: Arc<dyn PartitionedStore>,
    store_name: &str,
    slot: Arc<PartitionSlot>,
    query: Arc<dyn Query>,
    limit: usize,
) -> Result<PartitionHits> {
    let repository = slot.repository.clone();
    let local = tokio::task::spawn_blocking(move || repository.search(query.as_ref(), limit, 0))
        .await
        .map_err(|e| SyncdexError::Io(format!("search task failed: {}", e)))??;

    let mut rows = Vec::with_capacity(local.hits.len());
    let mut vanished = 0usize;
    for (key, score) in local.hits {
        match store.get(store_name, slot.partition, &key).await? {
            Some(value) => rows.push(ResultRow { key, value, score }),
            None => vanished += 1,
        }
    }
    if vanished > 0 {
        tracing::debug!(
            "[FED] {} indexed key(s) on {} no longer in store {}",
            vanished,
            slot.partition,
            store_name
        );
    }
    Ok(PartitionHits {
        partition: slot.partition,
        total: local.total.saturating_sub(vanished),
        rows,
    })
}

fn unanswered(targets: &[Target], answered: &[bool]) -> Vec<PartitionId> {
    targets
        .iter()
        .zip(answered)
        .filter(|(_, done)| !**done)
        .flat_map(|(t, _)| t.partitions())
        .collect()
}

fn trace_phase(label: &str, phase: Phase) {
    tracing::trace!("[FED {}] {:?}", label, phase);
}

fn short_id(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}
