//! SSH bridge plugin.
//!
//! `ssh user@host [password] [-p port] [-i keyfile] [--raw]` dials an
//! outbound SSH connection owned by the requesting client. Host keys are
//! accepted without verification by explicit policy: the bridge target is
//! chosen interactively by the operator driving the session.
//!
//! Two modes:
//! - cooked (default): every line runs in a fresh exec channel, stdout and
//!   stderr are captured separately and joined;
//! - raw (`--raw`): one interactive shell channel, lines are written with a
//!   trailing carriage return and the single echo line is suppressed.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use russh::{client, keys, ChannelMsg};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use mshell_core::constants::{BRIDGE_IDLE_TIMEOUT, BRIDGE_SWEEP};
use mshell_core::protocol::Envelope;

use crate::bridge::{bridge_prompt, MAX_CONNECTIONS_MSG};
use crate::plugin::ShellPlugin;
use crate::session::OutMessage;

const DEFAULT_KEYWORD: &str = "ssh";
const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Accepts every host key; see the module policy note.
struct BridgeHandler;

impl client::Handler for BridgeHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

#[derive(Debug, Clone)]
struct DialParams {
    user: String,
    host: String,
    port: u16,
    password: Option<String>,
    key_path: Option<String>,
    raw: bool,
}

struct SshConnection {
    client_uuid: String,
    remote_addr: String,
    handle: tokio::sync::Mutex<client::Handle<BridgeHandler>>,
    raw: bool,
    /// Stdin of the interactive shell channel (raw mode only).
    raw_stdin: Option<tokio::sync::Mutex<russh::ChannelWriteHalf<client::Msg>>>,
    /// One-shot flag armed on every raw write; eats the echo line.
    remove_echo: Mutex<bool>,
    last_command: Mutex<String>,
    last_command_id: Mutex<String>,
    last_active: Mutex<Instant>,
    close: CancellationToken,
}

impl SshConnection {
    fn touch(&self, command_id: &str) {
        *self.last_command_id.lock().unwrap() = command_id.to_string();
        *self.last_active.lock().unwrap() = Instant::now();
    }

    fn last_command_id(&self) -> String {
        self.last_command_id.lock().unwrap().clone()
    }
}

/// The SSH bridge plugin.
pub struct SshBridge {
    keyword: String,
    max_connections: usize,
    connections: DashMap<String, Arc<SshConnection>>,
    out: mpsc::Sender<OutMessage>,
}

impl SshBridge {
    pub fn new(max_connections: usize, keyword: Option<String>, out: mpsc::Sender<OutMessage>) -> Arc<Self> {
        let bridge = Arc::new(SshBridge {
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
            "{k} <user@host> [password] [-p port] [-i keyfile] [--raw]\n\
- Connect via SSH. Options:\n\
  -p <port>     : specify port (default 22)\n\
  -i <keyfile>  : use private key authentication\n\
  --raw         : enable raw mode (interactive shell, line-by-line reading)\n\
Examples:\n\
  {k} user@host password\n\
  {k} user@host -i /path/to/keyfile --raw\n\
  {k} user@host password -p 2222 --raw"
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
            [cmd] if cmd == "help" => self.help_text(),
            [cmd] if cmd == "disconnect" => {
                let bridge = self.clone();
                let client = client_uuid.to_string();
                tokio::spawn(async move { bridge.disconnect(&client, false).await });
                "disconnected".to_string()
            }
            [user_host, rest @ ..] if user_host.matches('@').count() == 1 => {
                match parse_dial_args(user_host, rest) {
                    Some(params) => self.connect(client_uuid, params).await,
                    None => self.error_text(),
                }
            }
            _ => self.error_text(),
        }
    }

    async fn connect(self: &Arc<Self>, client_uuid: &str, params: DialParams) -> String {
        let addr = format!("{}:{}", params.host, params.port);

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

        info!(%addr, client_uuid, raw = params.raw, "start creating ssh connection");
        match self.dial(client_uuid, &addr, &params).await {
            Ok(connection) => {
                self.connections
                    .insert(client_uuid.to_string(), connection);
                format!("connection established with {addr}")
            }
            Err(message) => message,
        }
    }

    /// Dial, authenticate and (in raw mode) open the interactive shell.
    /// Errors come back as user-facing strings.
    async fn dial(
        self: &Arc<Self>,
        client_uuid: &str,
        addr: &str,
        params: &DialParams,
    ) -> std::result::Result<Arc<SshConnection>, String> {
        let config = Arc::new(client::Config::default());
        let connect = client::connect(
            config,
            (params.host.as_str(), params.port),
            BridgeHandler,
        );
        let mut handle = tokio::time::timeout(DIAL_TIMEOUT, connect)
            .await
            .map_err(|_| format!("error: dialling {addr} timed out"))?
            .map_err(|e| e.to_string())?;

        let authenticated = match (&params.key_path, &params.password) {
            (Some(key_path), _) => {
                let key = keys::load_secret_key(key_path, None)
                    .map_err(|e| format!("error reading private key: {e}"))?;
                let hash_alg = handle
                    .best_supported_rsa_hash()
                    .await
                    .ok()
                    .flatten()
                    .flatten();
                handle
                    .authenticate_publickey(
                        params.user.clone(),
                        keys::PrivateKeyWithHashAlg::new(Arc::new(key), hash_alg),
                    )
                    .await
                    .map_err(|e| e.to_string())?
                    .success()
            }
            (None, Some(password)) => handle
                .authenticate_password(params.user.clone(), password.clone())
                .await
                .map_err(|e| e.to_string())?
                .success(),
            (None, None) => false,
        };
        if !authenticated {
            return Err("authentication failed".to_string());
        }

        let mut raw_stdin = None;
        let close = CancellationToken::new();
        if params.raw {
            let mut channel = handle
                .channel_open_session()
                .await
                .map_err(|e| format!("failed to start interactive session: {e}"))?;
            channel
                .request_shell(false)
                .await
                .map_err(|e| format!("failed to start interactive session: {e}"))?;
            let (read_half, write_half) = channel.split();
            raw_stdin = Some(tokio::sync::Mutex::new(write_half));

            let connection = Arc::new(SshConnection {
                client_uuid: client_uuid.to_string(),
                remote_addr: addr.to_string(),
                handle: tokio::sync::Mutex::new(handle),
                raw: true,
                raw_stdin,
                remove_echo: Mutex::new(false),
                last_command: Mutex::new(String::new()),
                last_command_id: Mutex::new(String::new()),
                last_active: Mutex::new(Instant::now()),
                close: close.clone(),
            });
            tokio::spawn(raw_output_reader(self.clone(), connection.clone(), read_half));
            return Ok(connection);
        }

        Ok(Arc::new(SshConnection {
            client_uuid: client_uuid.to_string(),
            remote_addr: addr.to_string(),
            handle: tokio::sync::Mutex::new(handle),
            raw: false,
            raw_stdin,
            remove_echo: Mutex::new(false),
            last_command: Mutex::new(String::new()),
            last_command_id: Mutex::new(String::new()),
            last_active: Mutex::new(Instant::now()),
            close,
        }))
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
        {
            let handle = connection.handle.lock().await;
            let _ = handle
                .disconnect(russh::Disconnect::ByApplication, "", "en")
                .await;
        }

        self.post(
            format!("connection closed with {}", connection.remote_addr),
            client_uuid,
            &connection.last_command_id(),
        )
        .await;
    }

    /// Run one user line on the bridged connection.
    async fn send_command(self: &Arc<Self>, connection: &Arc<SshConnection>, line: &str) {
        if connection.raw {
            {
                let mut cmd = line.to_string();
                if !cmd.ends_with('\r') && !cmd.ends_with('\n') {
                    cmd.push('\r');
                }
                *connection.last_command.lock().unwrap() = line.to_string();
                *connection.remove_echo.lock().unwrap() = true;
                let Some(stdin) = &connection.raw_stdin else {
                    self.post("interactive channel missing", &connection.client_uuid, "")
                        .await;
                    return;
                };
                let stdin = stdin.lock().await;
                if let Err(e) = stdin.data(cmd.as_bytes()).await {
                    drop(stdin);
                    self.post(e.to_string(), &connection.client_uuid, "").await;
                    self.disconnect(&connection.client_uuid, false).await;
                }
            }
            return;
        }

        // Cooked mode: fresh exec channel per line, separate capture.
        let result = async {
            let handle = connection.handle.lock().await;
            let mut channel = handle.channel_open_session().await?;
            channel.exec(true, line).await?;

            let mut stdout = Vec::new();
            let mut stderr = Vec::new();
            while let Some(msg) = channel.wait().await {
                match msg {
                    ChannelMsg::Data { data } => stdout.extend_from_slice(&data),
                    ChannelMsg::ExtendedData { data, ext: 1 } => stderr.extend_from_slice(&data),
                    ChannelMsg::Eof | ChannelMsg::Close => break,
                    _ => {}
                }
            }
            Ok::<_, russh::Error>((stdout, stderr))
        }
        .await;

        match result {
            Ok((stdout, stderr)) => {
                let mut output = String::from_utf8_lossy(&stdout).into_owned();
                if !stderr.is_empty() {
                    output.push_str("\n--- STDERR ---\n");
                    output.push_str(&String::from_utf8_lossy(&stderr));
                }
                self.post(output, &connection.client_uuid, "").await;
            }
            Err(e) => {
                let lost = matches!(e, russh::Error::Disconnect) || e.to_string().contains("EOF");
                self.post(e.to_string(), &connection.client_uuid, "").await;
                if lost {
                    self.disconnect(&connection.client_uuid, false).await;
                }
            }
        }
    }
}

#[async_trait]
impl ShellPlugin for SshBridge {
    fn plugin_id(&self) -> &str {
        &self.keyword
    }

    fn name(&self) -> &str {
        "ssh"
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
                        "SSH plugin connection not established - try: {} help",
                        this.keyword
                    ),
                    &client_uuid,
                    &cmd_uuid,
                )
                .await;
                return;
            };

            connection.touch(&cmd_uuid);
            this.send_command(&connection, &line).await;
        });
    }
}

fn parse_dial_args(user_host: &str, rest: &[String]) -> Option<DialParams> {
    let (user, host) = user_host.split_once('@')?;
    if user.is_empty() || host.is_empty() {
        return None;
    }

    let mut params = DialParams {
        user: user.to_string(),
        host: host.to_string(),
        port: 22,
        password: None,
        key_path: None,
        raw: false,
    };

    let mut i = 0;
    while i < rest.len() {
        match rest[i].as_str() {
            "-p" => {
                params.port = rest.get(i + 1)?.parse().ok()?;
                i += 2;
            }
            "-i" => {
                params.key_path = Some(rest.get(i + 1)?.clone());
                i += 2;
            }
            "--raw" => {
                params.raw = true;
                i += 1;
            }
            other => {
                params.password = Some(other.to_string());
                i += 1;
            }
        }
    }
    Some(params)
}

/// Raw-mode reader: streams shell output lines back to the client,
/// swallowing the one echo line of the last command.
async fn raw_output_reader(
    bridge: Arc<SshBridge>,
    connection: Arc<SshConnection>,
    mut read_half: russh::ChannelReadHalf,
) {
    let mut pending = Vec::new();
    loop {
        let msg = tokio::select! {
            _ = connection.close.cancelled() => break,
            msg = read_half.wait() => msg,
        };
        match msg {
            Some(ChannelMsg::Data { data }) | Some(ChannelMsg::ExtendedData { data, .. }) => {
                pending.extend_from_slice(&data);
                while let Some(idx) = pending.iter().position(|&b| b == b'\n') {
                    let raw_line: Vec<u8> = pending.drain(..=idx).collect();
                    let line = String::from_utf8_lossy(&raw_line)
                        .trim_end_matches(['\r', '\n'])
                        .to_string();

                    let is_echo = {
                        let mut remove_echo = connection.remove_echo.lock().unwrap();
                        let last = connection.last_command.lock().unwrap();
                        if *remove_echo && line.contains(last.as_str()) && !last.is_empty() {
                            *remove_echo = false;
                            true
                        } else {
                            false
                        }
                    };
                    if !is_echo {
                        bridge
                            .post(
                                format!("{line}\r\n"),
                                &connection.client_uuid,
                                &connection.last_command_id(),
                            )
                            .await;
                    }
                }
            }
            Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => break,
            Some(_) => {}
        }
    }
    debug!("closing ssh raw reader");
}

async fn idle_collector(bridge: Arc<SshBridge>) {
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
