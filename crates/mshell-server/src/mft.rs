//! Server side of the MFT file-copy protocol.
//!
//! Receives `handshake-p1` requests on the copy control topic, validates
//! them, allocates a per-transfer data topic and runs the transfer in its
//! own task. At most [`MFT_MAX_TRANSFERS`] transfers run concurrently;
//! excess requests are refused during the handshake.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use mshell_core::broker::Broker;
use mshell_core::constants::{
    mft_data_topic, MFT_HANDSHAKE_TIMEOUT, MFT_MAX_TRANSFERS, MFT_TRANSFER_SWEEP, MFT_TRANSFER_TTL,
};
use mshell_core::transfer::engine::MAX_FILE_SIZE;
use mshell_core::transfer::{
    destination_path_check, direction, file_info, receive_and_verify, send_file, step,
    subscribe_frames, CpMessage, CpSession,
};
use mshell_core::{Error, Result};

struct TransferEntry {
    transfer_uuid: String,
    msg_tx: mpsc::Sender<CpMessage>,
    started: Instant,
}

/// The copy server: one instance per node, sharing nothing with the shell
/// session manager beyond the broker.
pub struct CpServer {
    session: Arc<CpSession>,
    transfers: DashMap<String, TransferEntry>,
    max_transfers: usize,
}

impl CpServer {
    pub async fn start(
        broker: Arc<dyn Broker>,
        rx_topic: impl Into<String>,
        tx_topic: impl Into<String>,
    ) -> Result<Arc<Self>> {
        let session = CpSession::new(broker, rx_topic, tx_topic);
        let server = Arc::new(CpServer {
            session: session.clone(),
            transfers: DashMap::new(),
            max_transfers: MFT_MAX_TRANSFERS,
        });

        let handler_server = server.clone();
        session
            .start(Arc::new(move |msg| {
                let server = handler_server.clone();
                tokio::spawn(async move {
                    server.on_data(msg).await;
                });
            }))
            .await?;

        tokio::spawn(registry_sweep(server.clone()));
        Ok(server)
    }

    pub async fn stop(&self) -> Result<()> {
        self.session.stop().await
    }

    pub fn is_busy(&self) -> bool {
        self.transfers.len() >= self.max_transfers
    }

    async fn on_data(self: &Arc<Self>, msg: CpMessage) {
        if msg.client_uuid.is_empty() {
            debug!("transfer message without client uuid");
            return;
        }
        match msg.step.as_str() {
            step::HANDSHAKE_P1 => self.handle_handshake(msg).await,
            step::START => {
                let Some(entry) = self.transfers.get(&msg.client_uuid) else {
                    debug!(client = %msg.client_uuid, "start for unknown transfer");
                    return;
                };
                if entry.msg_tx.try_send(msg).is_err() {
                    debug!("transfer message queue full");
                }
            }
            other => debug!(step = other, "message with unhandled step"),
        }
    }

    async fn handle_handshake(self: &Arc<Self>, mut msg: CpMessage) {
        info!(client = %msg.client_uuid, cmd = %msg.request.cmd, "new handshake request");

        if self.is_busy() {
            self.fail(msg, step::HANDSHAKE_P2, "server busy, try again").await;
            return;
        }
        if let Err(e) = self.validate_handshake(&mut msg).await {
            self.fail(msg, step::HANDSHAKE_P2, &e.to_string()).await;
            return;
        }

        let (msg_tx, msg_rx) = mpsc::channel(5);
        self.transfers.insert(
            msg.client_uuid.clone(),
            TransferEntry {
                transfer_uuid: msg.uuid.clone(),
                msg_tx,
                started: Instant::now(),
            },
        );

        let server = self.clone();
        match msg.request.cmd.as_str() {
            direction::LOCAL_TO_REMOTE => {
                tokio::spawn(async move { server.run_inbound_transfer(msg).await });
            }
            direction::REMOTE_TO_LOCAL => {
                tokio::spawn(async move { server.run_outbound_transfer(msg, msg_rx).await });
            }
            _ => unreachable!("validated above"),
        }
    }

    /// Check the handshake and fill in the server-derived fields: the
    /// resolved destination for inbound copies, size and digest for
    /// outbound ones.
    async fn validate_handshake(&self, msg: &mut CpMessage) -> Result<()> {
        if msg.uuid.is_empty() {
            return Err(Error::transfer("missing transfer uuid"));
        }
        if msg.request.client_path.is_empty() {
            return Err(Error::transfer("missing local path"));
        }
        if msg.request.server_path.is_empty() {
            return Err(Error::transfer("missing remote path"));
        }
        if !Path::new(&msg.request.server_path).is_absolute() {
            return Err(Error::transfer("path must be absolute"));
        }

        match msg.request.cmd.as_str() {
            direction::LOCAL_TO_REMOTE => {
                if msg.request.md5.is_empty() {
                    return Err(Error::transfer("missing md5"));
                }
                if msg.request.size == 0 {
                    return Err(Error::transfer("missing size"));
                }
                if msg.request.size > MAX_FILE_SIZE {
                    return Err(Error::Transfer {
                        message: format!(
                            "size too large: {} bytes (max {MAX_FILE_SIZE})",
                            msg.request.size
                        ),
                    });
                }
                let dest =
                    destination_path_check(&msg.request.server_path, &msg.request.client_path)?;
                msg.request.server_path = dest.display().to_string();
                Ok(())
            }
            direction::REMOTE_TO_LOCAL => {
                let (size, md5) = file_info(Path::new(&msg.request.server_path)).await?;
                if size == 0 {
                    return Err(Error::transfer("missing size"));
                }
                if size > MAX_FILE_SIZE {
                    return Err(Error::Transfer {
                        message: format!("size too large: {size} bytes (max {MAX_FILE_SIZE})"),
                    });
                }
                msg.request.size = size;
                msg.request.md5 = md5;
                Ok(())
            }
            _ => Err(Error::transfer("command unrecognized")),
        }
    }

    /// Client → server: receive frames into the validated destination.
    async fn run_inbound_transfer(self: &Arc<Self>, mut msg: CpMessage) {
        let client_uuid = msg.client_uuid.clone();
        let topic = mft_data_topic(&client_uuid, &msg.uuid);
        let dest = PathBuf::from(&msg.request.server_path);

        msg.step = step::HANDSHAKE_P2.to_string();
        msg.topic = topic.clone();
        if let Err(e) = self.session.transmit(msg.clone()).await {
            error!(error = %e, "handshake-p2 transmit failed");
            self.unregister(&client_uuid).await;
            return;
        }

        let broker = self.session.broker();
        let mut frames = match subscribe_frames(&broker, &topic).await {
            Ok(frames) => frames,
            Err(e) => {
                self.fail(msg, step::START, &e.to_string()).await;
                self.unregister(&client_uuid).await;
                return;
            }
        };

        msg.step = step::START.to_string();
        if let Err(e) = self.session.transmit(msg.clone()).await {
            error!(error = %e, "start transmit failed");
            let _ = broker.unsubscribe(&topic).await;
            self.unregister(&client_uuid).await;
            return;
        }

        let outcome = receive_and_verify(
            &dest,
            &mut frames,
            &msg.request.md5,
            msg.request.size,
            None,
        )
        .await;
        let _ = broker.unsubscribe(&topic).await;

        match outcome {
            Ok(()) => {
                let final_msg = format!("file received with success: {}", dest.display());
                info!(%final_msg);
                msg.step = step::END.to_string();
                msg.end_str = final_msg;
                if let Err(e) = self.session.transmit(msg).await {
                    error!(error = %e, "end transmit failed");
                }
            }
            Err(e) => {
                error!(error = %e, "inbound transfer failed");
                self.fail(msg, step::END, &e.to_string()).await;
            }
        }
        self.unregister(&client_uuid).await;
    }

    /// Server → client: wait for the client's `start`, then stream the file.
    async fn run_outbound_transfer(
        self: &Arc<Self>,
        mut msg: CpMessage,
        mut msg_rx: mpsc::Receiver<CpMessage>,
    ) {
        let client_uuid = msg.client_uuid.clone();
        let topic = mft_data_topic(&client_uuid, &msg.uuid);

        msg.step = step::HANDSHAKE_P2.to_string();
        msg.topic = topic.clone();
        if let Err(e) = self.session.transmit(msg.clone()).await {
            error!(error = %e, "handshake-p2 transmit failed");
            self.unregister(&client_uuid).await;
            return;
        }

        let start = await_step(&mut msg_rx, &msg.uuid, step::START).await;
        match start {
            Err(e) => {
                error!(error = %e, "no start from client");
            }
            Ok(start) if !start.error.is_empty() => {
                error!(error = %start.error, "client refused transfer");
            }
            Ok(_) => {
                let broker = self.session.broker();
                match send_file(&broker, Path::new(&msg.request.server_path), &topic, None).await {
                    Ok(bytes) => info!(bytes, "outbound transfer complete"),
                    Err(e) => error!(error = %e, "error in data transfer"),
                }
            }
        }
        self.unregister(&client_uuid).await;
    }

    async fn fail(&self, mut msg: CpMessage, at_step: &str, reason: &str) {
        error!(reason, "transfer refused");
        msg.step = at_step.to_string();
        msg.error = reason.to_string();
        if let Err(e) = self.session.transmit(msg).await {
            error!(error = %e, "failure transmit failed");
        }
    }

    async fn unregister(&self, client_uuid: &str) {
        self.transfers.remove(client_uuid);
    }
}

async fn await_step(
    rx: &mut mpsc::Receiver<CpMessage>,
    transfer_uuid: &str,
    wanted: &str,
) -> Result<CpMessage> {
    let deadline = tokio::time::Instant::now() + MFT_HANDSHAKE_TIMEOUT;
    loop {
        let msg = tokio::time::timeout_at(deadline, rx.recv())
            .await
            .map_err(|_| Error::Timeout)?
            .ok_or(Error::ChannelClosed)?;
        if msg.uuid == transfer_uuid && msg.step == wanted {
            return Ok(msg);
        }
    }
}

async fn registry_sweep(server: Arc<CpServer>) {
    let mut ticker = tokio::time::interval(MFT_TRANSFER_SWEEP);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        ticker.tick().await;
        server
            .transfers
            .retain(|client, entry| {
                let keep = entry.started.elapsed() < MFT_TRANSFER_TTL;
                if !keep {
                    debug!(%client, transfer = %entry.transfer_uuid, "collecting stale transfer");
                }
                keep
            });
    }
}
