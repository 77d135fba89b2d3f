//! Beacon scan presentation: discover servers and print one line each.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use mshell_core::beacon::{node_id_from_event_topic, BeaconDiscovery, Node};
use mshell_core::broker::Broker;
use mshell_core::constants::{BEACON_REQUEST_TOPIC, BEACON_RESPONSE_WILDCARD};
use mshell_core::Result;

/// Run a scan for the given window, printing replies as they arrive.
/// Returns every node seen.
pub async fn run_scan(broker: Arc<dyn Broker>, timeout: Duration) -> Result<Vec<Node>> {
    let discovery = BeaconDiscovery::new(
        broker,
        BEACON_REQUEST_TOPIC,
        BEACON_RESPONSE_WILDCARD,
        timeout,
        Arc::new(node_id_from_event_topic),
    );

    let (tx, mut rx) = mpsc::channel::<Node>(64);
    let printer = tokio::spawn(async move {
        let mut nodes = Vec::new();
        while let Some(node) = rx.recv().await {
            println!(
                "Ip: {:>15} - Id: {:>20} - Version: {:>10} - Time: {} - Uptime: {}",
                node.ip, node.id, node.version, node.time, node.uptime
            );
            nodes.push(node);
        }
        nodes
    });

    let outcome = discovery.run(tx).await;
    let nodes = printer.await.unwrap_or_default();
    outcome.map(|_| nodes)
}
