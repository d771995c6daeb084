mod common;

use std::time::Duration;

use common::Wire;
use magnetar::instance::{Node, NodeConfig, NodeReplica, ReplicaConfig};
use tempfile::tempdir;
use tokio::time::sleep;

async fn open_replica(dir: &std::path::Path) -> NodeReplica {
    let mut config = ReplicaConfig::default();
    config.server_config.address = "localhost:0".to_string();
    common::write_config(dir, ".nodereplica", &config);
    NodeReplica::open(dir, common::SHARED_KEY)
        .await
        .expect("open replica")
}

async fn open_node(dir: &std::path::Path, config: NodeConfig) -> Node {
    common::write_config(dir, ".node", &config);
    Node::open(dir, common::SHARED_KEY).await.expect("open node")
}

fn node_config() -> NodeConfig {
    let mut config = NodeConfig::default();
    config.health_check_interval = 1;
    config.server_config.address = "localhost:0".to_string();
    config
}

#[tokio::test]
async fn test_node_serves_replica_surface() {
    let dir = tempdir().unwrap();
    let node = open_node(dir.path(), node_config()).await;

    let mut wire = Wire::connect(node.local_addr()).await;
    assert_eq!(wire.send("PUT hello world").await, "ERR not authenticated");
    wire.nauth().await;

    assert_eq!(wire.send("PUT hello world").await, "OK");
    assert_eq!(wire.send("GET hello").await, "OK world");
    assert_eq!(wire.send("PING").await, "OK PONG");
    assert_eq!(wire.send("DEL hello").await, "OK");

    node.close().await;
}

#[tokio::test]
async fn test_node_replicates_mutations() {
    let replica_dir = tempdir().unwrap();
    let replica = open_replica(replica_dir.path()).await;

    let node_dir = tempdir().unwrap();
    let mut config = node_config();
    config.read_replicas = vec![common::test_client_config(replica.local_addr())];
    let node = open_node(node_dir.path(), config).await;

    // Let the first health tick connect and authenticate the link.
    sleep(Duration::from_millis(500)).await;

    let mut wire = Wire::connect(node.local_addr()).await;
    wire.nauth().await;
    for i in 0..10 {
        assert_eq!(wire.send(&format!("PUT hello{} world", i)).await, "OK");
    }
    assert_eq!(wire.send("PUT n 0").await, "OK");
    assert_eq!(wire.send("INCR n 5").await, "OK 5");
    assert_eq!(wire.send("DEL hello9").await, "OK");

    // Replication is fire-and-forget over one ordered queue per replica.
    sleep(Duration::from_millis(500)).await;

    let mut replica_wire = Wire::connect(replica.local_addr()).await;
    replica_wire.nauth().await;
    for i in 0..9 {
        assert_eq!(
            replica_wire.send(&format!("GET hello{}", i)).await,
            "OK world"
        );
    }
    assert_eq!(replica_wire.send("GET hello9").await, "ERR key not found");
    assert_eq!(replica_wire.send("GET n").await, "OK 5");

    node.close().await;
    replica.close().await;
}

#[tokio::test]
async fn test_node_memory_pressure_refuses_writes() {
    let dir = tempdir().unwrap();
    let mut config = node_config();
    // Any RSS at all exceeds a zero threshold.
    config.max_memory_threshold = 0.0;
    let node = open_node(dir.path(), config).await;

    let mut wire = Wire::connect(node.local_addr()).await;
    wire.nauth().await;
    assert_eq!(wire.send("PUT early value").await, "OK");

    // The guard trips on the next health tick.
    sleep(Duration::from_millis(1500)).await;
    assert_eq!(wire.send("PUT hello world").await, "ERR memory pressure");
    assert_eq!(wire.send("INCR early 1").await, "ERR memory pressure");

    // Reads stay available.
    assert_eq!(wire.send("GET early").await, "OK value");
    assert_eq!(wire.send("PING").await, "OK PONG");

    node.close().await;
}

#[tokio::test]
async fn test_node_recovers_from_journal() {
    let dir = tempdir().unwrap();

    let node = open_node(dir.path(), node_config()).await;
    let mut wire = Wire::connect(node.local_addr()).await;
    wire.nauth().await;
    assert_eq!(wire.send("PUT persisted yes").await, "OK");
    node.close().await;

    let node = Node::open(dir.path(), common::SHARED_KEY)
        .await
        .expect("reopen node");
    let mut wire = Wire::connect(node.local_addr()).await;
    wire.nauth().await;
    assert_eq!(wire.send("GET persisted").await, "OK yes");
    node.close().await;
}

#[tokio::test]
async fn test_node_survives_replica_outage() {
    let replica_dir = tempdir().unwrap();
    let replica = open_replica(replica_dir.path()).await;
    let replica_addr = replica.local_addr();

    let node_dir = tempdir().unwrap();
    let mut config = node_config();
    config.read_replicas = vec![common::test_client_config(replica_addr)];
    let node = open_node(node_dir.path(), config).await;
    sleep(Duration::from_millis(500)).await;

    // Kill the replica: the primary keeps acknowledging writes.
    replica.close().await;
    sleep(Duration::from_millis(1500)).await;

    let mut wire = Wire::connect(node.local_addr()).await;
    wire.nauth().await;
    assert_eq!(wire.send("PUT hello world").await, "OK");
    assert_eq!(wire.send("GET hello").await, "OK world");

    node.close().await;
}
