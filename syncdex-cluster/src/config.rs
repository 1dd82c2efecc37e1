use serde::{Deserialize, Serialize};
use std::path::Path;

/// Identity of this node and the peers it federates queries to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub node_id: String,
    pub bind_addr: String,
    #[serde(default)]
    pub peers: Vec<PeerConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerConfig {
    pub node_id: String,
    /// Base URL, e.g. "http://10.0.1.2:7710"
    pub addr: String,
}

impl NodeConfig {
    /// Load `{data_dir}/node.json`, or a standalone config (no peers) when
    /// the file is missing or unreadable.
    pub fn load_or_default(data_dir: &Path) -> Self {
        let node_json = data_dir.join("node.json");

        if node_json.exists() {
            match std::fs::read_to_string(&node_json) {
                Ok(content) => match serde_json::from_str::<NodeConfig>(&content) {
                    Ok(config) => {
                        tracing::info!(
                            "[CLUSTER] loaded node config: node_id={}, peers={}",
                            config.node_id,
                            config.peers.len()
                        );
                        return config;
                    }
                    Err(e) => {
                        tracing::error!("[CLUSTER] bad node.json, using defaults: {}", e);
                    }
                },
                Err(e) => {
                    tracing::error!("[CLUSTER] cannot read node.json, using defaults: {}", e);
                }
            }
        }

        let node_id = std::env::var("SYNCDEX_NODE_ID").unwrap_or_else(|_| {
            hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .unwrap_or_else(|| "unknown".to_string())
        });
        let bind_addr =
            std::env::var("SYNCDEX_BIND_ADDR").unwrap_or_else(|_| "127.0.0.1:7710".to_string());

        tracing::info!("[CLUSTER] standalone node {}", node_id);
        NodeConfig {
            node_id,
            bind_addr,
            peers: vec![],
        }
    }

    pub fn is_standalone(&self) -> bool {
        self.peers.is_empty()
    }
}
