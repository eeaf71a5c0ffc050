//! Lost servers are retried on the configured schedule.

use std::time::Duration;

use strand_flow::Interruptor;
use strand_routing::{ReadinessLevel, WriteQuery};
use strand_runtime::ReconnectConfig;

use crate::cluster::SimCluster;
use crate::scenarios::{even_partition, sharded_primaries};
use crate::support::{config, node_with, ready, settle};

#[tokio::test(start_paused = true)]
async fn test_reconnect_backoff_bounds() {
    let cluster = SimCluster::new();
    let replicas = sharded_primaries(&cluster, &even_partition(2, 10), 1, None).unwrap();
    let backoff = ReconnectConfig::default();
    let node = node_with(&cluster, &config().with_reconnect(backoff.clone()));
    ready(&node, ReadinessLevel::Writes).await;

    let server = replicas[0].0;
    cluster.set_reachable(server, false);
    cluster.disconnect(server);
    tokio::time::sleep(Duration::from_secs(60)).await;

    let attempts = node.connector().attempts_to(server);
    assert!(attempts.len() > 10, "only {} attempts", attempts.len());

    // The k-th wait is min(50ms * 1.5^(k-1), 15s), give or take one timer tick.
    let mut expected = backoff.initial_backoff;
    for pair in attempts.windows(2) {
        let gap = pair[1].at - pair[0].at;
        assert!(gap >= expected, "waited {gap:?}, expected {expected:?}");
        assert!(gap <= expected + Duration::from_millis(1), "waited {gap:?}, expected {expected:?}");
        expected = backoff.next_backoff(expected);
    }
    assert_eq!(expected, backoff.max_backoff);

    cluster.set_reachable(server, true);
    tokio::time::sleep(backoff.max_backoff).await;
    ready(&node, ReadinessLevel::Writes).await;
    node.dispatcher()
        .write(WriteQuery::set("a", "1"), &Interruptor::never())
        .await
        .unwrap();
    node.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_declared_dead_stops_attempts() {
    let cluster = SimCluster::new();
    let replicas = sharded_primaries(&cluster, &even_partition(2, 10), 1, None).unwrap();
    let node = node_with(&cluster, &config().with_reconnect(ReconnectConfig::default()));
    ready(&node, ReadinessLevel::Writes).await;

    let server = replicas[1].0;
    cluster.set_reachable(server, false);
    cluster.disconnect(server);
    tokio::time::sleep(Duration::from_millis(200)).await;
    let before = node.connector().attempts_to(server).len();
    assert!(before >= 3);

    cluster.declare_dead(server);
    settle().await;
    assert!(!node.reconnector().is_retrying(server));
    assert!(node.reconnector().known_address(server).is_none());

    // Reachable again, but nobody tries.
    cluster.set_reachable(server, true);
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(node.connector().attempts_to(server).len(), before);
    assert!(cluster.peer(server).is_none());
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_follows_moved_server() {
    let cluster = SimCluster::new();
    let replicas = sharded_primaries(&cluster, &even_partition(2, 10), 1, None).unwrap();
    let node = node_with(&cluster, &config());
    ready(&node, ReadinessLevel::Writes).await;

    let server = replicas[0].0;
    // The server restarts elsewhere and reaches us on its own.
    cluster.disconnect(server);
    cluster.move_server(server, "moved:29015");
    cluster.connect(server).unwrap();
    settle().await;
    assert_eq!(
        node.reconnector().known_address(server).as_deref(),
        Some("moved:29015")
    );

    // Later losses are retried at the new address.
    cluster.disconnect(server);
    ready(&node, ReadinessLevel::Writes).await;
    let attempts = node.connector().attempts_to(server);
    assert!(attempts.iter().any(|attempt| attempt.addr == "moved:29015"));
    node.shutdown().await;
}
