//! Server session manager.
//!
//! One state per client UUID, created lazily on first traffic and collected
//! after inactivity. A single dispatcher task processes envelopes in
//! broker-delivery order; plugins and bridges reply asynchronously through
//! the bounded output channel.

use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use mshell_core::broker::Broker;
use mshell_core::constants::{
    DEFAULT_CMD_TIMEOUT, INACTIVITY_SWEEP, INACTIVITY_TIMEOUT, OUTPUT_CHANNEL_SIZE,
};
use mshell_core::protocol::{kind, Envelope};
use mshell_core::session::{SessionCore, SessionTopics};
use mshell_core::Result;

use crate::autocomplete;
use crate::exec::run_shell;
use crate::plugin::{parse_plugin_config, plugin_prompt, ShellPlugin, PLUGIN_HELP};

/// Server tuning knobs.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub version: String,
    /// Starting working directory for new client states; process cwd if unset.
    pub default_dir: Option<PathBuf>,
    pub inactivity_timeout: Duration,
    pub sweep_interval: Duration,
    pub cmd_timeout: Duration,
    pub net_interface: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            version: env!("CARGO_PKG_VERSION").to_string(),
            default_dir: None,
            inactivity_timeout: INACTIVITY_TIMEOUT,
            sweep_interval: INACTIVITY_SWEEP,
            cmd_timeout: DEFAULT_CMD_TIMEOUT,
            net_interface: None,
        }
    }
}

/// Per-client state, keyed by client UUID.
#[derive(Debug)]
struct ClientState {
    client_uuid: String,
    current_dir: PathBuf,
    active_plugin: String,
    last_active: Instant,
}

/// Read-only view of a client state, for operator consoles.
#[derive(Debug, Clone)]
pub struct ClientSnapshot {
    pub client_uuid: String,
    pub current_dir: PathBuf,
    pub active_plugin: String,
    pub idle: Duration,
}

/// An asynchronous reply queued for a client.
#[derive(Debug, Clone)]
pub struct OutMessage {
    pub data: String,
    pub client_uuid: String,
    pub cmd_uuid: String,
    pub prompt: String,
}

impl OutMessage {
    pub fn new(data: impl Into<String>, client_uuid: impl Into<String>, cmd_uuid: impl Into<String>) -> Self {
        OutMessage {
            data: data.into(),
            client_uuid: client_uuid.into(),
            cmd_uuid: cmd_uuid.into(),
            prompt: String::new(),
        }
    }

    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = prompt.into();
        self
    }
}

/// The server session manager.
pub struct ServerShell {
    core: Arc<SessionCore>,
    clients: DashMap<String, Arc<Mutex<ClientState>>>,
    plugins: RwLock<Vec<Arc<dyn ShellPlugin>>>,
    output_tx: mpsc::Sender<OutMessage>,
    default_dir: PathBuf,
    inactivity_timeout: Duration,
    sweep_interval: Duration,
    cmd_timeout: Duration,
    shutdown: CancellationToken,
}

impl ServerShell {
    /// Wire the session manager onto `broker` and start its fibers.
    pub async fn start(
        broker: Arc<dyn Broker>,
        topics: SessionTopics,
        config: ServerConfig,
    ) -> Result<Arc<Self>> {
        let default_dir = match config.default_dir {
            Some(dir) => dir,
            None => std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
        };

        let (output_tx, output_rx) = mpsc::channel(OUTPUT_CHANNEL_SIZE);
        let (dispatch_tx, dispatch_rx) = mpsc::channel::<Envelope>(OUTPUT_CHANNEL_SIZE);

        let core = SessionCore::with_interface(
            broker,
            topics,
            config.version,
            config.net_interface,
        );

        let server = Arc::new(ServerShell {
            core: core.clone(),
            clients: DashMap::new(),
            plugins: RwLock::new(Vec::new()),
            output_tx,
            default_dir,
            inactivity_timeout: config.inactivity_timeout,
            sweep_interval: config.sweep_interval,
            cmd_timeout: config.cmd_timeout,
            shutdown: CancellationToken::new(),
        });

        // Intake stays cheap on the broker dispatcher; real work happens on
        // the dispatch task, preserving per-client delivery order.
        core.start(Arc::new(move |envelope| {
            if dispatch_tx.try_send(envelope).is_err() {
                warn!("dispatch queue full, dropping envelope");
            }
        }))
        .await?;

        tokio::spawn(dispatch_loop(server.clone(), dispatch_rx));
        tokio::spawn(transmit_loop(server.clone(), output_rx));
        tokio::spawn(inactivity_loop(server.clone()));

        Ok(server)
    }

    /// Register a plugin. Plugins are selected per client with
    /// `plugin <id> on`.
    pub fn add_plugin(&self, plugin: Arc<dyn ShellPlugin>) {
        self.plugins.write().unwrap().push(plugin);
    }

    /// Sender half of the output channel, for plugins posting replies.
    pub fn output(&self) -> mpsc::Sender<OutMessage> {
        self.output_tx.clone()
    }

    pub fn inactivity_timeout(&self) -> Duration {
        self.inactivity_timeout
    }

    /// Clients seen within the inactivity window.
    pub fn clients_connected(&self) -> Vec<ClientSnapshot> {
        self.clients
            .iter()
            .filter_map(|entry| {
                let state = entry.value().lock().unwrap();
                let idle = state.last_active.elapsed();
                (idle <= self.inactivity_timeout).then(|| ClientSnapshot {
                    client_uuid: state.client_uuid.clone(),
                    current_dir: state.current_dir.clone(),
                    active_plugin: state.active_plugin.clone(),
                    idle,
                })
            })
            .collect()
    }

    /// Whether a client state currently exists for `client_uuid`.
    pub fn has_client(&self, client_uuid: &str) -> bool {
        self.clients.contains_key(client_uuid)
    }

    /// Stop the transmit loop, the collectors and the broker session.
    pub async fn stop(&self) -> Result<()> {
        self.shutdown.cancel();
        self.core.stop().await
    }

    fn get_or_create(&self, client_uuid: &str) -> Arc<Mutex<ClientState>> {
        self.clients
            .entry(client_uuid.to_string())
            .or_insert_with(|| {
                info!(client_uuid, "creating new client state");
                Arc::new(Mutex::new(ClientState {
                    client_uuid: client_uuid.to_string(),
                    current_dir: self.default_dir.clone(),
                    active_plugin: String::new(),
                    last_active: Instant::now(),
                }))
            })
            .clone()
    }

    fn find_plugin(&self, plugin_id: &str) -> Option<Arc<dyn ShellPlugin>> {
        self.plugins
            .read()
            .unwrap()
            .iter()
            .find(|p| p.plugin_id() == plugin_id)
            .cloned()
    }

    async fn on_envelope(&self, envelope: Envelope) {
        if envelope.cmd_uuid.is_empty() || envelope.cmd.is_empty() || envelope.client_uuid.is_empty()
        {
            debug!("dropping envelope with missing essential fields");
            return;
        }

        let state = self.get_or_create(&envelope.client_uuid);
        state.lock().unwrap().last_active = Instant::now();

        match envelope.cmd.as_str() {
            kind::PING => self.handle_ping(&envelope).await,
            kind::AUTOCOMPLETE => self.handle_autocomplete(&envelope, &state).await,
            _ => self.handle_command(envelope, &state).await,
        }
    }

    async fn handle_ping(&self, envelope: &Envelope) {
        // The pong carries no data: it is a liveness stamp only.
        let mut reply = Envelope::reply_to(envelope);
        reply.cmd = kind::PONG.to_string();
        if let Err(e) = self.core.transmit(reply).await {
            debug!(error = %e, "pong transmit failed");
        }
    }

    async fn handle_autocomplete(&self, envelope: &Envelope, state: &Arc<Mutex<ClientState>>) {
        let cwd = state.lock().unwrap().current_dir.clone();
        let options = autocomplete::options(&envelope.data, &cwd);

        let mut reply = Envelope::reply_to(envelope);
        reply.cmd = kind::AUTOCOMPLETE.to_string();
        reply.data = options;
        reply.current_path = cwd.display().to_string();
        if let Err(e) = self.core.transmit(reply).await {
            debug!(error = %e, "autocomplete transmit failed");
        }
    }

    async fn handle_command(&self, envelope: Envelope, state: &Arc<Mutex<ClientState>>) {
        let line = envelope.data.trim().to_string();

        if let Some(args) = parse_plugin_config(&line) {
            let (response, prompt) = self.handle_plugin_config(state, &args);
            self.post(
                OutMessage::new(response, envelope.client_uuid, envelope.cmd_uuid)
                    .with_prompt(prompt),
            );
            return;
        }

        let active = state.lock().unwrap().active_plugin.clone();
        if !active.is_empty() {
            match self.find_plugin(&active) {
                Some(plugin) => {
                    let mut envelope = envelope;
                    envelope.custom_prompt = plugin_prompt(plugin.name());
                    plugin.on_data(envelope).await;
                }
                None => debug!(plugin = %active, "active plugin not registered"),
            }
            return;
        }

        let output = self.exec_shell(&line, state).await;
        let cwd = state.lock().unwrap().current_dir.clone();
        let mut reply = Envelope::reply_to(&envelope);
        reply.data = output;
        reply.current_path = cwd.display().to_string();
        if let Err(e) = self.core.transmit(reply).await {
            debug!(error = %e, "shell reply transmit failed");
        }
    }

    /// Run one shell line in the client's working directory.
    ///
    /// `cd` is intercepted and only mutates the client state; the process
    /// cwd is never touched, so concurrent clients cannot observe each
    /// other's directory changes.
    async fn exec_shell(&self, line: &str, state: &Arc<Mutex<ClientState>>) -> String {
        if let Some(raw) = line.strip_prefix("cd ") {
            let target = raw.trim();
            let mut dir = PathBuf::from(target);
            if !dir.is_absolute() {
                dir = state.lock().unwrap().current_dir.join(dir);
            }
            let dir = clean_path(&dir);
            return match std::fs::metadata(&dir) {
                Ok(meta) if meta.is_dir() => {
                    let mut guard = state.lock().unwrap();
                    guard.current_dir = dir.clone();
                    info!(client = %guard.client_uuid, dir = %dir.display(), "changed directory");
                    format!("Changed directory to {}\n", dir.display())
                }
                Ok(_) => format!("error: {}: not a directory\n", dir.display()),
                Err(e) => format!("error: {e}\n"),
            };
        }

        let cwd = state.lock().unwrap().current_dir.clone();
        run_shell(line, &cwd, self.cmd_timeout).await
    }

    fn handle_plugin_config(
        &self,
        state: &Arc<Mutex<ClientState>>,
        args: &[String],
    ) -> (String, String) {
        let active_prompt = {
            let guard = state.lock().unwrap();
            if guard.active_plugin.is_empty() {
                String::new()
            } else {
                plugin_prompt(&guard.active_plugin)
            }
        };

        match args {
            [cmd] if cmd == "list" => {
                let mut response = String::from("Available plugins: ... ");
                for plugin in self.plugins.read().unwrap().iter() {
                    response.push_str("\r\n");
                    response.push_str(plugin.plugin_id());
                }
                (response, active_prompt)
            }
            [cmd] if cmd == "help" => (PLUGIN_HELP.to_string(), active_prompt),
            [id, on] if on == "on" => self.start_plugin(state, id),
            [cmd] if cmd == "off" => (self.stop_plugin(state), String::new()),
            _ => (
                "plugin command not valid, try > plugin help".to_string(),
                active_prompt,
            ),
        }
    }

    fn start_plugin(&self, state: &Arc<Mutex<ClientState>>, plugin_id: &str) -> (String, String) {
        let mut guard = state.lock().unwrap();
        let current = guard.active_plugin.clone();
        if self.find_plugin(plugin_id).is_none() {
            let prompt = if current.is_empty() { String::new() } else { plugin_prompt(&current) };
            return (format!("plugin {plugin_id} not found"), prompt);
        }
        if !current.is_empty() {
            return (
                "stop current plugin before starting another one".to_string(),
                plugin_prompt(&current),
            );
        }
        guard.active_plugin = plugin_id.to_string();
        (
            format!("start plugin {plugin_id} ..."),
            plugin_prompt(plugin_id),
        )
    }

    fn stop_plugin(&self, state: &Arc<Mutex<ClientState>>) -> String {
        let mut guard = state.lock().unwrap();
        if guard.active_plugin.is_empty() {
            return "no active plugin found".to_string();
        }
        let stopped = std::mem::take(&mut guard.active_plugin);
        format!("stop plugin {stopped} ...")
    }

    fn post(&self, msg: OutMessage) {
        if self.output_tx.try_send(msg).is_err() {
            warn!("output channel full, dropping message");
        }
    }

    /// One collector pass; removals are idempotent.
    fn collect_inactive(&self) {
        self.clients.retain(|client_uuid, state| {
            let keep = state.lock().unwrap().last_active.elapsed() <= self.inactivity_timeout;
            if !keep {
                info!(%client_uuid, "client removed due to inactivity");
            }
            keep
        });
    }
}

async fn dispatch_loop(server: Arc<ServerShell>, mut rx: mpsc::Receiver<Envelope>) {
    loop {
        tokio::select! {
            _ = server.shutdown.cancelled() => break,
            envelope = rx.recv() => match envelope {
                Some(envelope) => server.on_envelope(envelope).await,
                None => break,
            }
        }
    }
}

async fn transmit_loop(server: Arc<ServerShell>, mut rx: mpsc::Receiver<OutMessage>) {
    loop {
        let msg = tokio::select! {
            _ = server.shutdown.cancelled() => break,
            msg = rx.recv() => match msg {
                Some(msg) => msg,
                None => break,
            }
        };
        if msg.data.is_empty() || msg.client_uuid.is_empty() {
            continue;
        }
        let Some(state) = server.clients.get(&msg.client_uuid).map(|e| e.value().clone()) else {
            debug!(client = %msg.client_uuid, "client not found for delivery, skipping");
            continue;
        };
        let current_path = state.lock().unwrap().current_dir.display().to_string();

        let mut envelope = Envelope {
            cmd: kind::SHELL.to_string(),
            data: msg.data,
            cmd_uuid: msg.cmd_uuid,
            client_uuid: msg.client_uuid,
            custom_prompt: msg.prompt,
            current_path,
            ..Default::default()
        };
        if envelope.cmd_uuid.is_empty() {
            envelope.cmd_uuid = mshell_core::ids::new_id();
        }
        if let Err(e) = server.core.transmit(envelope).await {
            debug!(error = %e, "output transmit failed");
        }
    }
}

async fn inactivity_loop(server: Arc<ServerShell>) {
    let mut ticker = tokio::time::interval(server.sweep_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = server.shutdown.cancelled() => break,
            _ = ticker.tick() => server.collect_inactive(),
        }
    }
}

/// Lexically resolve `.` and `..` components.
fn clean_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    if out.as_os_str().is_empty() {
        PathBuf::from("/")
    } else {
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_path_resolves_dots() {
        assert_eq!(clean_path(Path::new("/a/b/../c/./d")), PathBuf::from("/a/c/d"));
        assert_eq!(clean_path(Path::new("/a/../..")), PathBuf::from("/"));
        assert_eq!(clean_path(Path::new("/tmp/./x")), PathBuf::from("/tmp/x"));
    }

    #[test]
    fn out_message_builder() {
        let msg = OutMessage::new("hi", "C1", "U1").with_prompt("<telnet>");
        assert_eq!(msg.prompt, "<telnet>");
        assert_eq!(msg.client_uuid, "C1");
    }
}
