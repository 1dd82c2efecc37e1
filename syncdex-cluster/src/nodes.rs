use super::config::NodeConfig;
use super::peer::PeerClient;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use syncdex::{
    IndexKey, PartitionHits, PartitionId, RemoteNodes, RemoteSearch, Result, SyncdexError,
};
use tokio::task::JoinSet;

/// Every peer of this node, reached over HTTP.
pub struct ClusterNodes {
    node_config: NodeConfig,
    peers: Vec<Arc<PeerClient>>,
}

impl ClusterNodes {
    pub fn new(node_config: NodeConfig) -> Arc<Self> {
        let peers = node_config
            .peers
            .iter()
            .map(|peer| Arc::new(PeerClient::new(peer.node_id.clone(), peer.addr.clone())))
            .collect();
        Arc::new(Self { node_config, peers })
    }

    pub fn node_id(&self) -> &str {
        &self.node_config.node_id
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    fn peer(&self, node: &str) -> Option<&Arc<PeerClient>> {
        self.peers.iter().find(|p| p.peer_id() == node)
    }
}

#[async_trait]
impl RemoteNodes for ClusterNodes {
    async fn partitions(&self, key: &IndexKey) -> Vec<(String, Result<Vec<PartitionId>>)> {
        let mut tasks = JoinSet::new();
        for peer in &self.peers {
            let peer = Arc::clone(peer);
            let key = key.clone();
            tasks.spawn(async move {
                let result = peer.partitions(&key).await;
                (peer.peer_id().to_string(), result)
            });
        }

        let mut answers = Vec::with_capacity(self.peers.len());
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(answer) => answers.push(answer),
                Err(e) => tracing::error!("[CLUSTER {}] discovery task failed: {}", key, e),
            }
        }
        answers.sort_by(|a, b| a.0.cmp(&b.0));
        answers
    }

    async fn search(&self, node: &str, request: &RemoteSearch) -> Result<Vec<PartitionHits>> {
        let peer = self
            .peer(node)
            .ok_or_else(|| SyncdexError::PeerUnreachable(format!("unknown peer {}", node)))?;
        peer.search(request).await
    }

    async fn wait_until_flushed(&self, key: &IndexKey, timeout: Duration) -> Result<bool> {
        let mut tasks = JoinSet::new();
        for peer in &self.peers {
            let peer = Arc::clone(peer);
            let key = key.clone();
            tasks.spawn(async move {
                let result = peer.wait_until_flushed(&key, timeout).await;
                (peer.peer_id().to_string(), result)
            });
        }

        let mut flushed = true;
        while let Some(joined) = tasks.join_next().await {
            let (peer_id, result) = joined
                .map_err(|e| SyncdexError::PeerUnreachable(format!("flush task failed: {}", e)))?;
            match result {
                Ok(true) => {}
                Ok(false) => {
                    tracing::debug!("[CLUSTER {}] {} not drained in time", key, peer_id);
                    flushed = false;
                }
                Err(e) => {
                    tracing::warn!("[CLUSTER {}] flush-wait on {} failed: {}", key, peer_id, e);
                    tasks.abort_all();
                    return Err(e);
                }
            }
        }
        Ok(flushed)
    }
}
