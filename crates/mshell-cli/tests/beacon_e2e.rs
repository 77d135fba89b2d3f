//! Beacon discovery over the in-memory broker hub.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use mshell_core::beacon::{node_id_from_event_topic, BeaconDiscovery};
use mshell_core::constants::{BEACON_REQUEST_TOPIC, BEACON_RESPONSE_WILDCARD};
use mshell_core::session::SessionTopics;
use mshell_server::{ServerConfig, ServerShell};
use mshell_test_utils::MockHub;

#[tokio::test]
async fn scanner_discovers_a_live_server() {
    let hub = MockHub::new();
    let dir = tempfile::tempdir().unwrap();
    let _server = ServerShell::start(
        hub.broker(),
        SessionTopics::server("N1"),
        ServerConfig {
            default_dir: Some(dir.path().to_path_buf()),
            ..Default::default()
        },
    )
    .await
    .unwrap();

    let discovery = BeaconDiscovery::new(
        hub.broker(),
        BEACON_REQUEST_TOPIC,
        BEACON_RESPONSE_WILDCARD,
        Duration::from_millis(500),
        Arc::new(node_id_from_event_topic),
    );
    let (tx, mut rx) = mpsc::channel(16);
    discovery.run(tx).await.unwrap();

    let mut ids = Vec::new();
    while let Ok(node) = rx.try_recv() {
        assert!(node.uptime.contains("days"));
        ids.push(node.id);
    }
    assert!(ids.contains(&"N1".to_string()), "discovered: {ids:?}");
}

#[tokio::test]
async fn scan_timeout_is_a_normal_end() {
    let hub = MockHub::new();
    let discovery = BeaconDiscovery::new(
        hub.broker(),
        BEACON_REQUEST_TOPIC,
        BEACON_RESPONSE_WILDCARD,
        Duration::from_millis(100),
        Arc::new(node_id_from_event_topic),
    );
    let (tx, mut rx) = mpsc::channel(16);
    assert!(discovery.run(tx).await.is_ok());
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn broker_loss_terminates_the_scan_with_an_error() {
    let hub = MockHub::new();
    let scanner = hub.broker();
    let discovery = BeaconDiscovery::new(
        scanner.clone(),
        BEACON_REQUEST_TOPIC,
        BEACON_RESPONSE_WILDCARD,
        Duration::from_secs(30),
        Arc::new(node_id_from_event_topic),
    );

    let dropper = scanner.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        dropper.drop_connection();
    });

    let (tx, _rx) = mpsc::channel(16);
    let started = std::time::Instant::now();
    assert!(discovery.run(tx).await.is_err());
    assert!(started.elapsed() < Duration::from_secs(5));
}
