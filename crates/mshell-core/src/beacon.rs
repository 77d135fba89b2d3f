//! Beacon discovery: scan the broker for live servers.
//!
//! Servers advertise themselves on their beacon topic (see
//! [`crate::session::SessionCore::send_beacon`]); the scanner broadcasts a
//! request, collects replies for a bounded window and surfaces each node
//! through a channel sink.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::broker::{Broker, ConnectionStatus};
use crate::error::{Error, Result};
use crate::protocol::Envelope;

/// One discovered server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub id: String,
    pub ip: String,
    pub version: String,
    pub time: String,
    pub uptime: String,
}

/// Derives a node id from the topic a beacon arrived on.
pub type NodeIdExtractor = Arc<dyn Fn(&str) -> String + Send + Sync>;

/// Extractor for the standard `/mqtt-shell/<id>/event` topic layout.
pub fn node_id_from_event_topic(topic: &str) -> String {
    topic
        .split('/')
        .nth(2)
        .unwrap_or_default()
        .to_string()
}

/// Render an uptime in seconds as `D days HH:MM`.
pub fn format_uptime(secs: u64) -> String {
    let days = secs / 86_400;
    let hours = (secs % 86_400) / 3_600;
    let minutes = (secs % 3_600) / 60;
    format!("{days} days {hours:02}:{minutes:02}")
}

/// A bounded server scan over the broker.
pub struct BeaconDiscovery {
    broker: Arc<dyn Broker>,
    request_topic: String,
    response_topic: String,
    timeout: Duration,
    extractor: NodeIdExtractor,
}

impl BeaconDiscovery {
    pub fn new(
        broker: Arc<dyn Broker>,
        request_topic: impl Into<String>,
        response_topic: impl Into<String>,
        timeout: Duration,
        extractor: NodeIdExtractor,
    ) -> Self {
        BeaconDiscovery {
            broker,
            request_topic: request_topic.into(),
            response_topic: response_topic.into(),
            timeout,
            extractor,
        }
    }

    /// Run the scan, pushing every discovered node into `sink`.
    ///
    /// Returns `Ok(())` when the window elapses (the normal terminal event)
    /// or an error when the broker drops mid-scan. The broker session is
    /// torn down either way.
    pub async fn run(&self, sink: mpsc::Sender<Node>) -> Result<()> {
        let (stop_tx, mut stop_rx) = mpsc::channel::<()>(1);
        self.broker.add_connection_listener(Arc::new(move |status| {
            if status == ConnectionStatus::Disconnected {
                let _ = stop_tx.try_send(());
            }
        }));

        self.broker.start().await?;

        let extractor = self.extractor.clone();
        let handler = {
            let sink = sink.clone();
            Arc::new(move |topic: &str, payload: &[u8]| {
                match serde_json::from_slice::<Envelope>(payload) {
                    Ok(beacon) => {
                        let uptime_secs: u64 = beacon.data.parse().unwrap_or(0);
                        let node = Node {
                            id: extractor(topic),
                            ip: beacon.ip,
                            version: beacon.version,
                            time: beacon.datetime,
                            uptime: format_uptime(uptime_secs),
                        };
                        if sink.try_send(node).is_err() {
                            debug!("beacon sink full, dropping reply");
                        }
                    }
                    Err(e) => debug!(error = %e, "dropping undecodable beacon"),
                }
            })
        };
        self.broker.subscribe(&self.response_topic, handler).await?;
        self.broker.publish(&self.request_topic, Bytes::new()).await?;

        let outcome = tokio::select! {
            _ = tokio::time::sleep(self.timeout) => {
                info!("beacon scan window elapsed");
                Ok(())
            }
            _ = stop_rx.recv() => Err(Error::broker("broker disconnected during scan")),
        };

        let _ = self.broker.unsubscribe(&self.response_topic).await;
        let _ = self.broker.stop().await;
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_id_extraction() {
        assert_eq!(node_id_from_event_topic("/mqtt-shell/pi4/event"), "pi4");
        assert_eq!(node_id_from_event_topic("no-slashes"), "");
    }

    #[test]
    fn uptime_rendering() {
        assert_eq!(format_uptime(0), "0 days 00:00");
        assert_eq!(format_uptime(3 * 86_400 + 2 * 3_600 + 15 * 60), "3 days 02:15");
        assert_eq!(format_uptime(59), "0 days 00:00");
    }
}
