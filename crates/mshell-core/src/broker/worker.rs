//! rumqttc-backed implementation of the broker adapter.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use rand::Rng;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::broker::{topic_matches, Broker, ConnectionListener, ConnectionStatus, MessageHandler};
use crate::constants::{
    CLIENT_ID_PREFIX, CLIENT_ID_SUFFIX_LEN, MAX_RECONNECT_DELAY, REDIAL_INTERVAL,
};
use crate::error::{Error, Result};

/// Connection settings for [`MqttWorker`].
#[derive(Debug, Clone)]
pub struct MqttWorkerConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Explicit client id; a random `mqtt-shell-` id is generated when unset.
    pub client_id: Option<String>,
}

impl MqttWorkerConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        MqttWorkerConfig {
            host: host.into(),
            port,
            username: None,
            password: None,
            client_id: None,
        }
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }
}

fn random_client_id() -> String {
    const CHARS: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
    let mut rng = rand::thread_rng();
    let suffix: String = (0..CLIENT_ID_SUFFIX_LEN)
        .map(|_| CHARS[rng.gen_range(0..CHARS.len())] as char)
        .collect();
    format!("{CLIENT_ID_PREFIX}{suffix}")
}

struct WorkerInner {
    config: MqttWorkerConfig,
    client: Mutex<Option<AsyncClient>>,
    subscriptions: RwLock<Vec<(String, MessageHandler)>>,
    listeners: RwLock<Vec<ConnectionListener>>,
    connected: AtomicBool,
    started: AtomicBool,
    shutdown: Mutex<Option<CancellationToken>>,
}

impl WorkerInner {
    fn client(&self) -> Option<AsyncClient> {
        self.client.lock().unwrap().clone()
    }

    fn notify(&self, status: ConnectionStatus) {
        let listeners = self.listeners.read().unwrap().clone();
        for listener in listeners {
            listener(status);
        }
    }

    fn dispatch(&self, topic: &str, payload: &[u8]) {
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
}

/// Broker adapter over the rumqttc async client.
#[derive(Clone)]
pub struct MqttWorker {
    inner: Arc<WorkerInner>,
}

impl MqttWorker {
    pub fn new(config: MqttWorkerConfig) -> Self {
        MqttWorker {
            inner: Arc::new(WorkerInner {
                config,
                client: Mutex::new(None),
                subscriptions: RwLock::new(Vec::new()),
                listeners: RwLock::new(Vec::new()),
                connected: AtomicBool::new(false),
                started: AtomicBool::new(false),
                shutdown: Mutex::new(None),
            }),
        }
    }
}

#[async_trait]
impl Broker for MqttWorker {
    async fn start(&self) -> Result<()> {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let config = &self.inner.config;
        let client_id = config
            .client_id
            .clone()
            .unwrap_or_else(random_client_id);
        debug!(%client_id, "broker client id");

        let mut options = MqttOptions::new(client_id, config.host.clone(), config.port);
        options.set_keep_alive(Duration::from_secs(30));
        if let (Some(user), Some(pass)) = (&config.username, &config.password) {
            options.set_credentials(user.clone(), pass.clone());
        }

        let (client, event_loop) = AsyncClient::new(options, 64);
        *self.inner.client.lock().unwrap() = Some(client);

        let token = CancellationToken::new();
        *self.inner.shutdown.lock().unwrap() = Some(token.clone());
        tokio::spawn(run_event_loop(self.inner.clone(), event_loop, token));
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        if let Some(token) = self.inner.shutdown.lock().unwrap().take() {
            token.cancel();
        }
        let client = self.inner.client.lock().unwrap().take();
        if let Some(client) = client {
            let _ = client.disconnect().await;
        }
        self.inner.connected.store(false, Ordering::SeqCst);
        self.inner.started.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn subscribe(&self, topic: &str, handler: MessageHandler) -> Result<()> {
        {
            let mut subs = self.inner.subscriptions.write().unwrap();
            subs.retain(|(t, _)| t != topic);
            subs.push((topic.to_string(), handler));
        }
        if self.is_connected() {
            if let Some(client) = self.inner.client() {
                info!(topic, "subscribe");
                client
                    .subscribe(topic, QoS::AtLeastOnce)
                    .await
                    .map_err(|e| Error::broker(e.to_string()))?;
            }
        }
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<()> {
        self.inner
            .subscriptions
            .write()
            .unwrap()
            .retain(|(t, _)| t != topic);
        if let Some(client) = self.inner.client() {
            info!(topic, "unsubscribe");
            client
                .unsubscribe(topic)
                .await
                .map_err(|e| Error::broker(e.to_string()))?;
        }
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Bytes) -> Result<()> {
        let client = self
            .inner
            .client()
            .ok_or_else(|| Error::broker("publish with no broker client"))?;
        client
            .publish(topic, QoS::AtLeastOnce, false, payload)
            .await
            .map_err(|e| Error::broker(e.to_string()))
    }

    fn add_connection_listener(&self, listener: ConnectionListener) {
        self.inner.listeners.write().unwrap().push(listener);
    }

    fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }
}

/// Dispatcher fiber: polls the event loop, routes publishes to handlers,
/// fans out connection events and paces reconnect attempts.
async fn run_event_loop(inner: Arc<WorkerInner>, mut event_loop: EventLoop, token: CancellationToken) {
    let mut ever_connected = false;
    let mut delay = Duration::from_secs(1);

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            event = event_loop.poll() => match event {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    debug!("broker connected");
                    ever_connected = true;
                    delay = Duration::from_secs(1);
                    inner.connected.store(true, Ordering::SeqCst);

                    let topics: Vec<String> = inner
                        .subscriptions
                        .read()
                        .unwrap()
                        .iter()
                        .map(|(t, _)| t.clone())
                        .collect();
                    if let Some(client) = inner.client() {
                        for topic in &topics {
                            if let Err(e) = client.subscribe(topic, QoS::AtLeastOnce).await {
                                warn!(%topic, error = %e, "re-subscribe failed");
                            }
                        }
                    }
                    inner.notify(ConnectionStatus::Connected);
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    inner.dispatch(&publish.topic, &publish.payload);
                }
                Ok(_) => {}
                Err(e) => {
                    if inner.connected.swap(false, Ordering::SeqCst) {
                        inner.notify(ConnectionStatus::Disconnected);
                    }
                    debug!(error = %e, "broker connection error");
                    // First connect retries on a fixed cadence; later drops
                    // back off up to the reconnect cap.
                    let wait = if ever_connected { delay } else { REDIAL_INTERVAL };
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = tokio::time::sleep(wait) => {}
                    }
                    delay = (delay * 2).min(MAX_RECONNECT_DELAY);
                }
            }
        }
    }
}
