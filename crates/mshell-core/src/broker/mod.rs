//! Broker adapter: the only seam that knows about the MQTT client library.
//!
//! Everything above this module talks to [`Broker`], an object-safe trait.
//! Production code uses [`MqttWorker`]; tests swap in an in-memory hub.

mod topic;
mod worker;

pub use topic::topic_matches;
pub use worker::{MqttWorker, MqttWorkerConfig};

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::Result;

/// Broker connection state, fanned out to registered listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connected,
    Disconnected,
}

/// Callback invoked with every message on a subscribed topic.
///
/// Handlers run on the adapter's dispatcher task and are delivered
/// sequentially per subscription; hand off nontrivial work.
pub type MessageHandler = Arc<dyn Fn(&str, &[u8]) + Send + Sync>;

/// Callback invoked on every connection status change, in registration order.
pub type ConnectionListener = Arc<dyn Fn(ConnectionStatus) + Send + Sync>;

/// The broker adapter interface.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Start the connection machinery. Idempotent.
    async fn start(&self) -> Result<()>;

    /// Stop the connection and the re-dial loop.
    async fn stop(&self) -> Result<()>;

    /// Register `handler` for `topic` (MQTT wildcards allowed) and subscribe.
    ///
    /// The registration survives reconnects: the adapter re-subscribes every
    /// registered topic after each successful connect.
    async fn subscribe(&self, topic: &str, handler: MessageHandler) -> Result<()>;

    /// Drop the registration and unsubscribe.
    async fn unsubscribe(&self, topic: &str) -> Result<()>;

    /// Publish a payload. Raw bytes for MFT frames, base64 text otherwise.
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<()>;

    /// Register a connection listener.
    fn add_connection_listener(&self, listener: ConnectionListener);

    /// Whether the broker session is currently up.
    fn is_connected(&self) -> bool;
}
