//! Telnet bridge plugin.
//!
//! `telnet <ip> <port>` (or `telnet connect <ip> <port>`) dials an outbound
//! TCP connection owned by the requesting client. Remote bytes are batched
//! into a fixed 512-byte buffer flushed on full or after 250 ms of silence,
//! and posted as continuations of the client's last command.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use mshell_core::constants::{
    BRIDGE_FLUSH_BUFFER, BRIDGE_FLUSH_WINDOW, BRIDGE_IDLE_TIMEOUT, BRIDGE_SWEEP,
};
use mshell_core::protocol::Envelope;

use crate::bridge::{bridge_prompt, MAX_CONNECTIONS_MSG};
use crate::plugin::ShellPlugin;
use crate::session::OutMessage;

const DEFAULT_KEYWORD: &str = "telnet";
const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

struct TelnetConnection {
    client_uuid: String,
    remote_addr: String,
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    last_command_id: Mutex<String>,
    last_active: Mutex<Instant>,
    close: CancellationToken,
}

impl TelnetConnection {
    fn touch(&self, command_id: &str) {
        *self.last_command_id.lock().unwrap() = command_id.to_string();
        *self.last_active.lock().unwrap() = Instant::now();
    }

    fn last_command_id(&self) -> String {
        self.last_command_id.lock().unwrap().clone()
    }
}

/// The telnet bridge plugin.
pub struct TelnetBridge {
    keyword: String,
    max_connections: usize,
    connections: DashMap<String, Arc<TelnetConnection>>,
    out: mpsc::Sender<OutMessage>,
}

impl TelnetBridge {
    pub fn new(max_connections: usize, keyword: Option<String>, out: mpsc::Sender<OutMessage>) -> Arc<Self> {
        let bridge = Arc::new(TelnetBridge {
            keyword: keyword.unwrap_or_else(|| DEFAULT_KEYWORD.to_string()),
            max_connections,
            connections: DashMap::new(),
            out,
        });
        tokio::spawn(idle_collector(bridge.clone()));
        bridge
    }

    fn help_text(&self) -> String {
        let k = &self.keyword;
        format!(
            "Mqtt 2 Telnet Bridge: \n \
{k} {{ip}} {{port}} -> open telnet connection \n \
{k} list -> show all active connections \n \
{k} disconnect -> close telnet connection"
        )
    }

    fn error_text(&self) -> String {
        format!("{0}: command not valid, try > {0} help", self.keyword)
    }

    fn connected_host(&self, client_uuid: &str) -> Option<String> {
        self.connections
            .get(client_uuid)
            .map(|c| c.remote_addr.clone())
    }

    fn host_owner(&self, addr: &str) -> Option<String> {
        self.connections
            .iter()
            .find(|entry| entry.value().remote_addr == addr)
            .map(|entry| entry.value().client_uuid.clone())
    }

    async fn post(&self, msg: impl Into<String>, client_uuid: &str, cmd_uuid: &str) {
        let prompt = bridge_prompt(&self.keyword, self.connected_host(client_uuid).as_deref());
        let out = OutMessage::new(msg.into(), client_uuid, cmd_uuid).with_prompt(prompt);
        if self.out.send(out).await.is_err() {
            debug!("server output channel closed");
        }
    }

    async fn exec_config(self: &Arc<Self>, client_uuid: &str, args: &[String]) -> String {
        match args {
            [cmd] if cmd == "list" => {
                let mut res = String::from("Active telnet connections: ... ");
                for entry in self.connections.iter() {
                    res.push_str(&format!(
                        "\r\n{} - {}",
                        entry.value().client_uuid,
                        entry.value().remote_addr
                    ));
                }
                res
            }
            [cmd] if cmd == "help" => self.help_text(),
            [cmd] if cmd == "disconnect" => {
                let bridge = self.clone();
                let client = client_uuid.to_string();
                tokio::spawn(async move { bridge.disconnect(&client, false).await });
                String::new()
            }
            [host, port] => self.connect(client_uuid, host, port).await,
            [cmd, host, port] if cmd == "connect" => self.connect(client_uuid, host, port).await,
            _ => self.error_text(),
        }
    }

    async fn connect(self: &Arc<Self>, client_uuid: &str, host: &str, port: &str) -> String {
        let addr = format!("{host}:{port}");

        if let Some(connected) = self.connected_host(client_uuid) {
            return format!(
                "this client is already connected to {connected}, disconnect before creating a new connection"
            );
        }
        if let Some(owner) = self.host_owner(&addr) {
            return format!("this host is already connected to another mqtt client: {owner}");
        }
        if self.connections.len() >= self.max_connections {
            return MAX_CONNECTIONS_MSG.to_string();
        }

        info!(%addr, client_uuid, "start creating connection");
        let stream = match tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(&addr)).await {
            Err(_) => return format!("error: dialling {addr} timed out"),
            Ok(Err(e)) => return e.to_string(),
            Ok(Ok(stream)) => stream,
        };
        let (read_half, write_half) = stream.into_split();

        let connection = Arc::new(TelnetConnection {
            client_uuid: client_uuid.to_string(),
            remote_addr: addr.clone(),
            writer: tokio::sync::Mutex::new(write_half),
            last_command_id: Mutex::new(String::new()),
            last_active: Mutex::new(Instant::now()),
            close: CancellationToken::new(),
        });
        self.connections
            .insert(client_uuid.to_string(), connection.clone());

        let (byte_tx, byte_rx) = mpsc::channel::<Bytes>(100);
        tokio::spawn(socket_reader(connection.clone(), read_half, byte_tx));
        tokio::spawn(flush_batcher(self.clone(), connection, byte_rx));

        format!("connection established with {addr}")
    }

    async fn disconnect(self: &Arc<Self>, client_uuid: &str, for_timeout: bool) {
        let Some((_, connection)) = self.connections.remove(client_uuid) else {
            let res = "connection not found - cant close it";
            debug!(client_uuid, res);
            self.post(res, client_uuid, "").await;
            return;
        };

        if for_timeout {
            self.post(
                "connection closed due to inactivity",
                client_uuid,
                &connection.last_command_id(),
            )
            .await;
        }

        connection.close.cancel();
        let _ = connection.writer.lock().await.shutdown().await;

        self.post(
            format!("connection closed with {}", connection.remote_addr),
            client_uuid,
            &connection.last_command_id(),
        )
        .await;
    }
}

#[async_trait]
impl ShellPlugin for TelnetBridge {
    fn plugin_id(&self) -> &str {
        &self.keyword
    }

    fn name(&self) -> &str {
        "telnet"
    }

    async fn on_data(self: Arc<Self>, envelope: Envelope) {
        if envelope.cmd_uuid.is_empty()
            || envelope.cmd.is_empty()
            || envelope.data.is_empty()
            || envelope.client_uuid.is_empty()
        {
            return;
        }

        let this = self;
        tokio::spawn(async move {
            let line = envelope.data.trim().to_string();
            let client_uuid = envelope.client_uuid;
            let cmd_uuid = envelope.cmd_uuid;

            if let Some(rest) = line.strip_prefix(this.keyword.as_str()) {
                let args: Vec<String> = rest.split_whitespace().map(str::to_string).collect();
                if !args.is_empty() {
                    let res = this.exec_config(&client_uuid, &args).await;
                    if !res.is_empty() {
                        this.post(res, &client_uuid, &cmd_uuid).await;
                    }
                    return;
                }
            }

            let Some(connection) = this.connections.get(&client_uuid).map(|e| e.value().clone())
            else {
                this.post(
                    format!(
                        "telnet bridge connection not established - try: {} help",
                        this.keyword
                    ),
                    &client_uuid,
                    &cmd_uuid,
                )
                .await;
                return;
            };

            connection.touch(&cmd_uuid);
            debug!(%line, "forwarding to telnet");
            let mut writer = connection.writer.lock().await;
            if let Err(e) = writer.write_all(format!("{line}\r\n").as_bytes()).await {
                drop(writer);
                this.post(e.to_string(), &client_uuid, &cmd_uuid).await;
            }
        });
    }
}

/// Byte-level reader: drains the socket into the inbound channel.
async fn socket_reader(
    connection: Arc<TelnetConnection>,
    mut read_half: tokio::net::tcp::OwnedReadHalf,
    byte_tx: mpsc::Sender<Bytes>,
) {
    let mut buf = [0u8; 1024];
    loop {
        tokio::select! {
            _ = connection.close.cancelled() => break,
            read = read_half.read(&mut buf) => match read {
                Ok(0) | Err(_) => {
                    debug!("closing telnet reader");
                    break;
                }
                Ok(n) => {
                    if byte_tx.send(Bytes::copy_from_slice(&buf[..n])).await.is_err() {
                        break;
                    }
                }
            }
        }
    }
}

/// Flush batcher: fixed 512-byte buffer, drained on full or on silence.
async fn flush_batcher(
    bridge: Arc<TelnetBridge>,
    connection: Arc<TelnetConnection>,
    mut byte_rx: mpsc::Receiver<Bytes>,
) {
    let mut buf: Vec<u8> = Vec::with_capacity(BRIDGE_FLUSH_BUFFER);
    loop {
        tokio::select! {
            _ = connection.close.cancelled() => break,
            chunk = byte_rx.recv() => {
                let Some(chunk) = chunk else { break };
                for byte in chunk {
                    buf.push(byte);
                    if buf.len() >= BRIDGE_FLUSH_BUFFER {
                        flush(&bridge, &connection, &mut buf).await;
                    }
                }
            }
            _ = tokio::time::sleep(BRIDGE_FLUSH_WINDOW), if !buf.is_empty() => {
                flush(&bridge, &connection, &mut buf).await;
            }
        }
    }
    if !buf.is_empty() {
        flush(&bridge, &connection, &mut buf).await;
    }
}

async fn flush(bridge: &Arc<TelnetBridge>, connection: &Arc<TelnetConnection>, buf: &mut Vec<u8>) {
    let text = String::from_utf8_lossy(buf).into_owned();
    buf.clear();
    bridge
        .post(text, &connection.client_uuid, &connection.last_command_id())
        .await;
}

async fn idle_collector(bridge: Arc<TelnetBridge>) {
    let mut ticker = tokio::time::interval(BRIDGE_SWEEP);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        ticker.tick().await;
        let stale: Vec<String> = bridge
            .connections
            .iter()
            .filter(|entry| {
                entry.value().last_active.lock().unwrap().elapsed() > BRIDGE_IDLE_TIMEOUT
            })
            .map(|entry| entry.key().clone())
            .collect();
        for client_uuid in stale {
            bridge.disconnect(&client_uuid, true).await;
        }
    }
}
