//! MFT: the mqtt file transfer subsystem.
//!
//! A transfer is negotiated over a control topic pair with the handshake
//! messages in [`message`], then bulk bytes move as binary frames
//! ([`crate::protocol::mft`]) on a per-transfer data topic. The send and
//! receive loops shared by both directions live in [`engine`].

pub mod engine;
pub mod message;

pub use engine::{
    destination_path_check, file_info, receive_and_verify, receive_into, send_file,
    subscribe_frames,
};
pub use message::{direction, step, CpMessage, CpRequest};

use std::sync::Arc;

use tracing::debug;

use crate::broker::{Broker, ConnectionStatus};
use crate::error::Result;

/// Callback invoked with every decoded inbound handshake message.
pub type CpHandler = Arc<dyn Fn(CpMessage) + Send + Sync>;

/// Control-topic plumbing shared by the copy client and the copy server.
pub struct CpSession {
    broker: Arc<dyn Broker>,
    rx_topic: String,
    tx_topic: String,
}

impl CpSession {
    pub fn new(broker: Arc<dyn Broker>, rx_topic: impl Into<String>, tx_topic: impl Into<String>) -> Arc<Self> {
        Arc::new(CpSession {
            broker,
            rx_topic: rx_topic.into(),
            tx_topic: tx_topic.into(),
        })
    }

    pub fn broker(&self) -> Arc<dyn Broker> {
        self.broker.clone()
    }

    /// Subscribe the control rx topic (now and after every reconnect) and
    /// start the broker.
    pub async fn start(self: &Arc<Self>, on_data: CpHandler) -> Result<()> {
        let session = self.clone();
        let handler = on_data.clone();
        self.broker
            .add_connection_listener(Arc::new(move |status| {
                if status == ConnectionStatus::Connected {
                    let session = session.clone();
                    let handler = handler.clone();
                    tokio::spawn(async move {
                        session.subscribe_rx(handler).await;
                    });
                }
            }));

        self.broker.start().await?;
        if self.broker.is_connected() {
            self.subscribe_rx(on_data).await;
        }
        Ok(())
    }

    pub async fn stop(&self) -> Result<()> {
        self.broker.unsubscribe(&self.rx_topic).await?;
        self.broker.stop().await
    }

    async fn subscribe_rx(&self, on_data: CpHandler) {
        let handler = Arc::new(move |_topic: &str, payload: &[u8]| {
            match CpMessage::decode(payload) {
                Ok(msg) => on_data(msg),
                Err(e) => debug!(error = %e, "dropping undecodable transfer message"),
            }
        });
        if let Err(e) = self.broker.subscribe(&self.rx_topic, handler).await {
            debug!(error = %e, topic = %self.rx_topic, "transfer rx subscribe failed");
        }
    }

    /// Stamp and publish a handshake message on the tx topic.
    pub async fn transmit(&self, mut msg: CpMessage) -> Result<()> {
        msg.ts = message::unix_millis();
        let wire = msg.encode()?;
        self.broker.publish(&self.tx_topic, wire.into()).await
    }
}
