//! Shared helpers for scenario tests.

use std::sync::Arc;
use std::time::Duration;

use strand_core::{ClientId, ServerId};
use strand_flow::Interruptor;
use strand_routing::ReadinessLevel;
use strand_runtime::RuntimeConfig;

use crate::cluster::{ClientNode, SimCluster};

/// The server the client node runs on.
pub const LOCAL: ServerId = ServerId::new(100);

pub fn config() -> RuntimeConfig {
    RuntimeConfig::fast_for_testing(LOCAL)
}

pub fn node(cluster: &Arc<SimCluster>) -> Arc<ClientNode> {
    Arc::new(ClientNode::start(cluster, &config(), ClientId::new(1)))
}

pub fn node_with(cluster: &Arc<SimCluster>, config: &RuntimeConfig) -> Arc<ClientNode> {
    Arc::new(ClientNode::start(cluster, config, ClientId::new(1)))
}

/// Waits until `level` is reached, failing the test after a while.
pub async fn ready(node: &ClientNode, level: ReadinessLevel) {
    tokio::time::timeout(
        Duration::from_secs(10),
        node.dispatcher().check_readiness(level, &Interruptor::never()),
    )
    .await
    .expect("node never became ready")
    .unwrap();
}

/// Lets spawned tasks run to quiescence.
pub async fn settle() {
    for _ in 0..20 {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
}
