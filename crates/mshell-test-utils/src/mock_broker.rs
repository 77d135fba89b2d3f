//! In-memory broker hub for testing without real network.
//!
//! A [`MockHub`] routes published payloads to every attached
//! [`MockBroker`]'s matching subscriptions, with the same wildcard
//! semantics as the real adapter. Connection events can be simulated.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use async_trait::async_trait;
use bytes::Bytes;

use mshell_core::broker::{
    topic_matches, Broker, ConnectionListener, ConnectionStatus, MessageHandler,
};
use mshell_core::Result;

/// Shared in-memory message bus.
#[derive(Default)]
pub struct MockHub {
    brokers: Mutex<Vec<Weak<MockBroker>>>,
}

impl MockHub {
    pub fn new() -> Arc<Self> {
        Arc::new(MockHub::default())
    }

    /// Create a broker endpoint attached to this hub.
    pub fn broker(self: &Arc<Self>) -> Arc<MockBroker> {
        let broker = Arc::new(MockBroker {
            hub: self.clone(),
            subscriptions: RwLock::new(Vec::new()),
            listeners: RwLock::new(Vec::new()),
            connected: AtomicBool::new(false),
        });
        self.brokers.lock().unwrap().push(Arc::downgrade(&broker));
        broker
    }

    fn route(&self, topic: &str, payload: &[u8]) {
        let brokers: Vec<Arc<MockBroker>> = self
            .brokers
            .lock()
            .unwrap()
            .iter()
            .filter_map(Weak::upgrade)
            .collect();
        for broker in brokers {
            if broker.is_connected() {
                broker.deliver(topic, payload);
            }
        }
    }
}

/// One endpoint on the hub, implementing the broker adapter trait.
pub struct MockBroker {
    hub: Arc<MockHub>,
    subscriptions: RwLock<Vec<(String, MessageHandler)>>,
    listeners: RwLock<Vec<ConnectionListener>>,
    connected: AtomicBool,
}

impl MockBroker {
    fn deliver(&self, topic: &str, payload: &[u8]) {
        let handlers: Vec<MessageHandler> = self
            .subscriptions
            .read()
            .unwrap()
            .iter()
            .filter(|(filter, _)| topic_matches(filter, topic))
            .map(|(_, handler)| handler.clone())
            .collect();
        for handler in handlers {
            handler(topic, payload);
        }
    }

    fn notify(&self, status: ConnectionStatus) {
        let listeners = self.listeners.read().unwrap().clone();
        for listener in listeners {
            listener(status);
        }
    }

    /// Simulate a lost broker connection.
    pub fn drop_connection(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            self.notify(ConnectionStatus::Disconnected);
        }
    }

    /// Simulate the connection coming back.
    pub fn restore_connection(&self) {
        if !self.connected.swap(true, Ordering::SeqCst) {
            self.notify(ConnectionStatus::Connected);
        }
    }
}

#[async_trait]
impl Broker for MockBroker {
    async fn start(&self) -> Result<()> {
        if !self.connected.swap(true, Ordering::SeqCst) {
            self.notify(ConnectionStatus::Connected);
        }
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.drop_connection();
        Ok(())
    }

    async fn subscribe(&self, topic: &str, handler: MessageHandler) -> Result<()> {
        let mut subs = self.subscriptions.write().unwrap();
        subs.retain(|(t, _)| t != topic);
        subs.push((topic.to_string(), handler));
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<()> {
        self.subscriptions
            .write()
            .unwrap()
            .retain(|(t, _)| t != topic);
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Bytes) -> Result<()> {
        self.hub.route(topic, &payload);
        Ok(())
    }

    fn add_connection_listener(&self, listener: ConnectionListener) {
        self.listeners.write().unwrap().push(listener);
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn publish_reaches_matching_subscribers() {
        let hub = MockHub::new();
        let a = hub.broker();
        let b = hub.broker();
        a.start().await.unwrap();
        b.start().await.unwrap();

        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        b.subscribe(
            "/mqtt-shell/+/cmd",
            Arc::new(move |_t, _p| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .await
        .unwrap();

        a.publish("/mqtt-shell/n1/cmd", Bytes::from_static(b"x"))
            .await
            .unwrap();
        a.publish("/mqtt-shell/n1/cmd/res", Bytes::from_static(b"x"))
            .await
            .unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn disconnected_endpoint_gets_nothing() {
        let hub = MockHub::new();
        let a = hub.broker();
        let b = hub.broker();
        a.start().await.unwrap();
        b.start().await.unwrap();

        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        b.subscribe(
            "/t",
            Arc::new(move |_t, _p| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .await
        .unwrap();

        b.drop_connection();
        a.publish("/t", Bytes::from_static(b"x")).await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn listeners_fire_in_registration_order() {
        let hub = MockHub::new();
        let a = hub.broker();
        let order = Arc::new(Mutex::new(Vec::new()));
        for tag in ["first", "second"] {
            let order = order.clone();
            a.add_connection_listener(Arc::new(move |status| {
                if status == ConnectionStatus::Connected {
                    order.lock().unwrap().push(tag);
                }
            }));
        }
        a.start().await.unwrap();
        assert_eq!(*order.lock().unwrap(), vec!["first", "second"]);
    }
}
