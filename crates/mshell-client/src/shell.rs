//! The interactive client shell.
//!
//! State machine: Disconnected -> Handshaking -> Ready. The handshake
//! repeats `whoami` until the server answers; Ready runs the line editor
//! on its own thread while the async side owns transmit, keep-alive and
//! inbound rendering.

use std::io::Write as _;
use std::path::PathBuf;
use std::sync::Arc;

use rustyline::config::Config as LineConfig;
use rustyline::error::ReadlineError;
use rustyline::history::FileHistory;
use rustyline::Editor;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

use mshell_core::broker::Broker;
use mshell_core::constants::{
    HANDSHAKE_RETRY, HISTORY_FILE, HISTORY_SIZE, KEEPALIVE_INTERVAL,
};
use mshell_core::ids;
use mshell_core::protocol::{kind, Envelope};
use mshell_core::session::{SessionCore, SessionTopics};
use mshell_core::Result;

use crate::completer::RemoteHelper;
use crate::router::ClientRouter;

const LOGIN_BANNER: &str = "-------------------------------------------------\r\n\
|  Mqtt-shell client \r\n\
|\r\n\
|  IP: {ip} \r\n\
|  SERVER VER: {server_ver} - CLIENT VER: {client_ver}\r\n\
|  CLIENT UUID: {uuid}\r\n\
|  TX: {tx}\r\n\
|  RX: {rx}\r\n\
|\r\n\
-------------------------------------------------\r\n";

/// Client shell settings.
#[derive(Debug, Clone)]
pub struct ClientShellConfig {
    pub version: String,
    pub history_file: PathBuf,
    pub history_size: usize,
    pub color_prompt: bool,
}

impl Default for ClientShellConfig {
    fn default() -> Self {
        ClientShellConfig {
            version: env!("CARGO_PKG_VERSION").to_string(),
            history_file: PathBuf::from(HISTORY_FILE),
            history_size: HISTORY_SIZE,
            color_prompt: false,
        }
    }
}

enum LineEvent {
    Line(String),
    Interrupted,
    Eof,
}

/// The interactive client session.
pub struct ClientShell {
    core: Arc<SessionCore>,
    router: Arc<ClientRouter>,
    config: ClientShellConfig,
}

impl ClientShell {
    /// Connect the session core and return a shell ready to run.
    pub async fn connect(
        broker: Arc<dyn Broker>,
        node_id: &str,
        config: ClientShellConfig,
    ) -> Result<Self> {
        let (print_tx, mut print_rx) = mpsc::unbounded_channel::<String>();
        let router = Arc::new(ClientRouter::new(ids::new_id(), print_tx));

        let core = SessionCore::new(
            broker,
            SessionTopics::client(node_id),
            config.version.clone(),
        );
        let route = router.clone();
        core.start(Arc::new(move |envelope| route.route(envelope)))
            .await?;

        tokio::spawn(async move {
            let mut stdout = std::io::stdout();
            while let Some(chunk) = print_rx.recv().await {
                let _ = stdout.write_all(chunk.as_bytes());
                let _ = stdout.flush();
            }
        });

        Ok(ClientShell {
            core,
            router,
            config,
        })
    }

    pub fn client_uuid(&self) -> &str {
        self.router.uuid()
    }

    /// Run handshake and the Ready loop until end-of-input or interrupt.
    pub async fn run(&self) -> Result<()> {
        let Some(first_reply) = self.handshake().await? else {
            return Ok(());
        };
        self.print_banner(&first_reply);

        tokio::spawn(keepalive_loop(self.core.clone(), self.router.uuid().to_string()));

        // Autocomplete request pump: words from the completer thread out to
        // the server.
        let (request_tx, mut request_rx) = mpsc::unbounded_channel::<String>();
        let (options_tx, options_rx) = std::sync::mpsc::sync_channel::<String>(8);
        self.router.set_options_sender(options_tx);
        {
            let core = self.core.clone();
            let uuid = self.router.uuid().to_string();
            tokio::spawn(async move {
                while let Some(word) = request_rx.recv().await {
                    let envelope = Envelope {
                        cmd: kind::AUTOCOMPLETE.to_string(),
                        data: word,
                        client_uuid: uuid.clone(),
                        cmd_uuid: ids::new_id(),
                        ..Default::default()
                    };
                    if let Err(e) = core.transmit(envelope).await {
                        debug!(error = %e, "autocomplete request failed");
                    }
                }
            });
        }

        let mut line_rx = self.spawn_line_editor(RemoteHelper::new(
            request_tx,
            options_rx,
            self.config.color_prompt,
        ));

        while let Some(event) = line_rx.recv().await {
            match event {
                LineEvent::Eof | LineEvent::Interrupted => break,
                LineEvent::Line(line) => {
                    let line = line.trim().to_string();
                    if line.is_empty() {
                        continue;
                    }
                    if line == "clear" {
                        print!("\x1b[2J\x1b[H");
                        let _ = std::io::stdout().flush();
                        continue;
                    }
                    let envelope = Envelope {
                        cmd: kind::SHELL.to_string(),
                        data: line,
                        client_uuid: self.router.uuid().to_string(),
                        cmd_uuid: ids::new_id(),
                        ..Default::default()
                    };
                    self.core.transmit(envelope).await?;
                }
            }
        }

        self.core.stop().await
    }

    /// Send `whoami` every few seconds until the server answers.
    /// `None` means the user interrupted the wait.
    async fn handshake(&self) -> Result<Option<Envelope>> {
        loop {
            info!("Connecting to server...");
            let wait: oneshot::Receiver<Envelope> = self.router.arm_handshake();
            let envelope = Envelope {
                cmd: kind::WHOAMI.to_string(),
                data: kind::WHOAMI.to_string(),
                client_uuid: self.router.uuid().to_string(),
                cmd_uuid: ids::new_id(),
                ..Default::default()
            };
            self.core.transmit(envelope).await?;

            tokio::select! {
                reply = wait => {
                    if let Ok(reply) = reply {
                        return Ok(Some(reply));
                    }
                }
                _ = tokio::time::sleep(HANDSHAKE_RETRY) => {
                    info!("TIMEOUT, retry...");
                }
                _ = tokio::signal::ctrl_c() => {
                    return Ok(None);
                }
            }
        }
    }

    fn print_banner(&self, reply: &Envelope) {
        info!("Connected");
        let topics = self.core.topics();
        let banner = LOGIN_BANNER
            .replace("{ip}", &reply.ip)
            .replace("{server_ver}", &reply.version)
            .replace("{client_ver}", self.core.version())
            .replace("{uuid}", self.router.uuid())
            .replace("{tx}", &topics.tx)
            .replace("{rx}", &topics.rx);
        print!("{banner}");
        let _ = std::io::stdout().flush();
    }

    /// The line editor owns its thread: rustyline is blocking and the
    /// prompt must be re-read before every line.
    fn spawn_line_editor(&self, helper: RemoteHelper) -> mpsc::UnboundedReceiver<LineEvent> {
        let (line_tx, line_rx) = mpsc::unbounded_channel();
        let router = self.router.clone();
        let history_file = self.config.history_file.clone();
        let history_size = self.config.history_size;

        std::thread::spawn(move || {
            let line_config = LineConfig::builder()
                .max_history_size(history_size)
                .unwrap_or_else(|_| LineConfig::builder())
                .auto_add_history(true)
                .build();
            let mut editor: Editor<RemoteHelper, FileHistory> =
                match Editor::with_config(line_config) {
                    Ok(editor) => editor,
                    Err(e) => {
                        eprintln!("cannot open line editor: {e}");
                        let _ = line_tx.send(LineEvent::Eof);
                        return;
                    }
                };
            editor.set_helper(Some(helper));
            let _ = editor.load_history(&history_file);

            loop {
                match editor.readline(&router.prompt()) {
                    Ok(line) => {
                        if line_tx.send(LineEvent::Line(line)).is_err() {
                            break;
                        }
                    }
                    Err(ReadlineError::Interrupted) => {
                        let _ = line_tx.send(LineEvent::Interrupted);
                        break;
                    }
                    Err(ReadlineError::Eof) => {
                        let _ = line_tx.send(LineEvent::Eof);
                        break;
                    }
                    Err(e) => {
                        eprintln!("line editor error: {e}");
                        let _ = line_tx.send(LineEvent::Eof);
                        break;
                    }
                }
            }
            let _ = editor.save_history(&history_file);
        });

        line_rx
    }
}

/// Ping every minute (and immediately on entering Ready); suspended while
/// the broker is disconnected.
async fn keepalive_loop(core: Arc<SessionCore>, client_uuid: String) {
    let mut ticker = tokio::time::interval(KEEPALIVE_INTERVAL);
    loop {
        ticker.tick().await;
        if !core.broker().is_connected() {
            continue;
        }
        let envelope = Envelope {
            cmd: kind::PING.to_string(),
            client_uuid: client_uuid.clone(),
            cmd_uuid: ids::new_id(),
            ..Default::default()
        };
        if let Err(e) = core.transmit(envelope).await {
            debug!(error = %e, "keep-alive ping failed");
        }
    }
}
