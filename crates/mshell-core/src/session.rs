//! Shared session core for client and server.
//!
//! Owns the tx/rx topic pair, fills in the ambient envelope fields on
//! transmit and wires the subscribe lifecycle to broker connection events.
//! Client and server each compose a `SessionCore` and add their own
//! dispatcher on top.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::broker::{Broker, ConnectionStatus};
use crate::constants::{beacon_topic, control_reply_topic, control_topic, BEACON_REQUEST_TOPIC};
use crate::error::Result;
use crate::ids;
use crate::net::local_ipv4;
use crate::protocol::{kind, Envelope};

/// Callback invoked with every decoded inbound envelope.
///
/// Runs on the broker dispatcher task; implementations doing nontrivial
/// work must hand off to another task to avoid blocking delivery.
pub type EnvelopeHandler = Arc<dyn Fn(Envelope) + Send + Sync>;

/// Topic set of one session endpoint.
#[derive(Debug, Clone)]
pub struct SessionTopics {
    /// Topic this endpoint receives envelopes on.
    pub rx: String,
    /// Topic this endpoint transmits envelopes to.
    pub tx: String,
    /// Beacon advertisement topic (server side).
    pub beacon: Option<String>,
    /// Beacon request topic to answer (server side).
    pub beacon_request: Option<String>,
}

impl SessionTopics {
    /// Topics for a client session against node `node_id`.
    pub fn client(node_id: &str) -> Self {
        SessionTopics {
            rx: control_reply_topic(node_id),
            tx: control_topic(node_id),
            beacon: None,
            beacon_request: None,
        }
    }

    /// Topics for the server session of node `node_id`.
    pub fn server(node_id: &str) -> Self {
        SessionTopics {
            rx: control_topic(node_id),
            tx: control_reply_topic(node_id),
            beacon: Some(beacon_topic(node_id)),
            beacon_request: Some(BEACON_REQUEST_TOPIC.to_string()),
        }
    }
}

/// Envelope construction, topic management and subscribe lifecycle.
pub struct SessionCore {
    broker: Arc<dyn Broker>,
    topics: SessionTopics,
    version: String,
    started_at: Instant,
    net_interface: Option<String>,
}

impl SessionCore {
    pub fn new(broker: Arc<dyn Broker>, topics: SessionTopics, version: impl Into<String>) -> Arc<Self> {
        Arc::new(SessionCore {
            broker,
            topics,
            version: version.into(),
            started_at: Instant::now(),
            net_interface: None,
        })
    }

    pub fn with_interface(
        broker: Arc<dyn Broker>,
        topics: SessionTopics,
        version: impl Into<String>,
        net_interface: Option<String>,
    ) -> Arc<Self> {
        Arc::new(SessionCore {
            broker,
            topics,
            version: version.into(),
            started_at: Instant::now(),
            net_interface,
        })
    }

    pub fn broker(&self) -> Arc<dyn Broker> {
        self.broker.clone()
    }

    pub fn topics(&self) -> &SessionTopics {
        &self.topics
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn local_ip(&self) -> String {
        local_ipv4(self.net_interface.as_deref())
    }

    /// Wire up subscriptions and start the broker.
    ///
    /// On every connect: subscribe `rx`, subscribe the beacon request topic
    /// when configured, and emit a beacon.
    pub async fn start(self: &Arc<Self>, on_data: EnvelopeHandler) -> Result<()> {
        let core = self.clone();
        let handler = on_data.clone();
        self.broker
            .add_connection_listener(Arc::new(move |status| {
                if status == ConnectionStatus::Connected {
                    let core = core.clone();
                    let handler = handler.clone();
                    tokio::spawn(async move {
                        core.on_connected(handler).await;
                    });
                }
            }));

        self.broker.start().await?;

        if self.broker.is_connected() {
            self.on_connected(on_data).await;
        }
        Ok(())
    }

    pub async fn stop(&self) -> Result<()> {
        self.broker.unsubscribe(&self.topics.rx).await?;
        if let Some(req) = &self.topics.beacon_request {
            self.broker.unsubscribe(req).await?;
        }
        self.broker.stop().await
    }

    async fn on_connected(self: &Arc<Self>, on_data: EnvelopeHandler) {
        let rx_handler = {
            let on_data = on_data.clone();
            Arc::new(move |_topic: &str, payload: &[u8]| match Envelope::decode(payload) {
                Ok(envelope) => on_data(envelope),
                Err(e) => debug!(error = %e, "dropping undecodable envelope"),
            })
        };
        if let Err(e) = self.broker.subscribe(&self.topics.rx, rx_handler).await {
            debug!(error = %e, topic = %self.topics.rx, "rx subscribe failed");
        }

        if let Some(request_topic) = self.topics.beacon_request.clone() {
            let core = self.clone();
            let beacon_handler = Arc::new(move |_topic: &str, _payload: &[u8]| {
                let core = core.clone();
                tokio::spawn(async move {
                    let _ = core.send_beacon().await;
                });
            });
            if let Err(e) = self.broker.subscribe(&request_topic, beacon_handler).await {
                debug!(error = %e, "beacon request subscribe failed");
            }
            let _ = self.send_beacon().await;
        }
    }

    /// Fill in the ambient fields and publish on the tx topic.
    pub async fn transmit(&self, mut envelope: Envelope) -> Result<()> {
        envelope.ip = self.local_ip();
        envelope.version = self.version.clone();
        envelope.datetime = timestamp_now();
        if envelope.cmd_uuid.is_empty() {
            envelope.cmd_uuid = ids::new_id();
        }
        let wire = envelope.encode()?;
        self.broker.publish(&self.topics.tx, wire.into()).await
    }

    /// Publish a presence beacon with the current uptime.
    ///
    /// Beacons are plain JSON: they are consumed by scanners that never
    /// speak the base64 session encoding.
    pub async fn send_beacon(&self) -> Result<()> {
        let Some(topic) = &self.topics.beacon else {
            return Ok(());
        };
        let beacon = Envelope {
            ip: self.local_ip(),
            version: self.version.clone(),
            cmd: kind::BEACON.to_string(),
            data: self.uptime().as_secs().to_string(),
            datetime: timestamp_now(),
            ..Default::default()
        };
        let json = serde_json::to_vec(&beacon)
            .map_err(|e| crate::Error::codec(format!("beacon serialization failed: {e}")))?;
        self.broker.publish(topic, json.into()).await
    }
}

/// Wall-clock stamp in the wire format `YYYY-MM-DD HH:MM:SS`.
pub fn timestamp_now() -> String {
    chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_and_server_topics_mirror() {
        let client = SessionTopics::client("n1");
        let server = SessionTopics::server("n1");
        assert_eq!(client.tx, server.rx);
        assert_eq!(client.rx, server.tx);
        assert!(client.beacon.is_none());
        assert_eq!(server.beacon.as_deref(), Some("/mqtt-shell/n1/event"));
        assert_eq!(server.beacon_request.as_deref(), Some("/mqtt-shell/whoami"));
    }

    #[test]
    fn timestamp_has_wire_shape() {
        let stamp = timestamp_now();
        assert_eq!(stamp.len(), 19);
        assert_eq!(&stamp[4..5], "-");
        assert_eq!(&stamp[10..11], " ");
        assert_eq!(&stamp[13..14], ":");
    }
}
