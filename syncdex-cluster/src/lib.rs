//! Multi-node federation for syncdex.
//!
//! Each node serves [`internal_router`] so peers can list, search and
//! flush-wait its local partitions, and plugs a [`ClusterNodes`] into its
//! [`syncdex::SyncService`] so its own queries reach the peers.

pub mod config;
pub mod nodes;
pub mod peer;
pub mod routes;
pub mod types;

pub use config::{NodeConfig, PeerConfig};
pub use nodes::ClusterNodes;
pub use peer::PeerClient;
pub use routes::internal_router;

use std::sync::Arc;
use syncdex::SyncService;

/// Attach the configured peers to `service` and serve the internal
/// endpoints on `config.bind_addr` until the listener fails.
pub async fn serve(service: Arc<SyncService>, config: NodeConfig) -> std::io::Result<()> {
    if !config.is_standalone() {
        service.attach_remote(ClusterNodes::new(config.clone()));
    }
    let app = internal_router(service, config.node_id.clone());
    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    tracing::info!(
        "[CLUSTER] node {} serving internal endpoints on {} ({} peer(s))",
        config.node_id,
        listener.local_addr()?,
        config.peers.len()
    );
    axum::serve(listener, app).await
}
