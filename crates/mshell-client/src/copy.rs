//! Client half of the MFT file-copy protocol.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tracing::info;

use mshell_core::broker::Broker;
use mshell_core::constants::{MFT_END_TIMEOUT, MFT_HANDSHAKE_TIMEOUT};
use mshell_core::ids;
use mshell_core::protocol::mft::Progress;
use mshell_core::transfer::{
    destination_path_check, direction, file_info, receive_and_verify, send_file, step,
    subscribe_frames, CpMessage, CpRequest, CpSession,
};
use mshell_core::{Error, Result};

/// The copy client: one per invocation, bound to a node's copy topics.
pub struct CpClient {
    session: Arc<CpSession>,
    uuid: String,
    inbound: Mutex<mpsc::Receiver<CpMessage>>,
}

impl CpClient {
    /// Start a copy session against the node's control topics and wait for
    /// the broker to come up.
    pub async fn connect(
        broker: Arc<dyn Broker>,
        rx_topic: impl Into<String>,
        tx_topic: impl Into<String>,
    ) -> Result<Self> {
        let session = CpSession::new(broker, rx_topic, tx_topic);
        let uuid = ids::new_id();

        let (tx, rx) = mpsc::channel(5);
        let own_uuid = uuid.clone();
        session
            .start(Arc::new(move |msg| {
                if msg.client_uuid == own_uuid {
                    let _ = tx.try_send(msg);
                }
            }))
            .await?;

        // The broker adapter connects in the background; give it a moment.
        for _ in 0..50 {
            if session.broker().is_connected() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        if !session.broker().is_connected() {
            return Err(Error::broker("mqtt connection fail"));
        }

        Ok(CpClient {
            session,
            uuid,
            inbound: Mutex::new(rx),
        })
    }

    pub async fn stop(&self) -> Result<()> {
        self.session.stop().await
    }

    /// Push a local file to the server. Returns the server's final status.
    pub async fn copy_local_to_remote(
        &self,
        local: &Path,
        remote: &str,
        progress: Option<mpsc::Sender<Progress>>,
    ) -> Result<String> {
        if !remote.starts_with('/') {
            return Err(Error::transfer("remote path must be absolute"));
        }
        let (size, md5) = file_info(local).await?;
        let transfer_uuid = ids::new_id();

        let msg = CpMessage {
            uuid: transfer_uuid.clone(),
            step: step::HANDSHAKE_P1.to_string(),
            client_uuid: self.uuid.clone(),
            request: CpRequest {
                cmd: direction::LOCAL_TO_REMOTE.to_string(),
                client_path: local.display().to_string(),
                server_path: remote.to_string(),
                size,
                md5,
                protocol: String::new(),
            },
            ..Default::default()
        };
        self.session.transmit(msg).await?;

        let reply = self
            .await_step(&transfer_uuid, step::HANDSHAKE_P2, MFT_HANDSHAKE_TIMEOUT)
            .await?;
        validate_handshake(&reply)?;
        info!("handshake success, start transmission");

        self.await_step(&transfer_uuid, step::START, MFT_HANDSHAKE_TIMEOUT)
            .await?;

        let broker = self.session.broker();
        let sent = send_file(&broker, local, &reply.topic, progress.as_ref()).await?;
        info!(bytes = sent, "transmission complete");

        let end = self
            .await_step(&transfer_uuid, step::END, MFT_END_TIMEOUT)
            .await?;
        if end.error.is_empty() {
            Ok(end.end_str)
        } else {
            Err(Error::transfer(end.error))
        }
    }

    /// Pull a remote file down. Returns the resolved local path.
    pub async fn copy_remote_to_local(
        &self,
        remote: &str,
        local: &str,
        progress: Option<mpsc::Sender<Progress>>,
    ) -> Result<PathBuf> {
        if !remote.starts_with('/') {
            return Err(Error::transfer("remote path must be absolute"));
        }
        let dest = destination_path_check(local, remote)?;
        let transfer_uuid = ids::new_id();

        let msg = CpMessage {
            uuid: transfer_uuid.clone(),
            step: step::HANDSHAKE_P1.to_string(),
            client_uuid: self.uuid.clone(),
            request: CpRequest {
                cmd: direction::REMOTE_TO_LOCAL.to_string(),
                client_path: dest.display().to_string(),
                server_path: remote.to_string(),
                ..Default::default()
            },
            ..Default::default()
        };
        self.session.transmit(msg).await?;

        let reply = self
            .await_step(&transfer_uuid, step::HANDSHAKE_P2, MFT_HANDSHAKE_TIMEOUT)
            .await?;
        validate_handshake(&reply)?;
        info!("handshake success, start transmission");

        let broker = self.session.broker();
        let mut frames = subscribe_frames(&broker, &reply.topic).await?;

        let mut start = reply.clone();
        start.step = step::START.to_string();
        self.session.transmit(start).await?;

        let outcome = receive_and_verify(
            &dest,
            &mut frames,
            &reply.request.md5,
            reply.request.size,
            progress.as_ref(),
        )
        .await;
        let _ = broker.unsubscribe(&reply.topic).await;
        outcome?;

        Ok(dest)
    }

    async fn await_step(
        &self,
        transfer_uuid: &str,
        wanted: &str,
        timeout: Duration,
    ) -> Result<CpMessage> {
        let mut inbound = self.inbound.lock().await;
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let msg = tokio::time::timeout_at(deadline, inbound.recv())
                .await
                .map_err(|_| Error::Timeout)?
                .ok_or(Error::ChannelClosed)?;
            if msg.uuid == transfer_uuid && msg.step == wanted {
                return Ok(msg);
            }
        }
    }
}

fn validate_handshake(reply: &CpMessage) -> Result<()> {
    if !reply.error.is_empty() {
        return Err(Error::transfer(reply.error.clone()));
    }
    if reply.topic.is_empty() {
        return Err(Error::transfer("topic missing"));
    }
    if reply.request.md5.is_empty() {
        return Err(Error::transfer("md5 missing"));
    }
    if reply.request.size == 0 {
        return Err(Error::transfer("size missing"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_validation_rules() {
        let mut reply = CpMessage {
            topic: "/mft/c/t".into(),
            ..Default::default()
        };
        reply.request.md5 = "abc".into();
        reply.request.size = 10;
        assert!(validate_handshake(&reply).is_ok());

        let mut bad = reply.clone();
        bad.error = "server busy, try again".into();
        assert!(validate_handshake(&bad).is_err());

        let mut bad = reply.clone();
        bad.topic.clear();
        assert!(validate_handshake(&bad).is_err());

        let mut bad = reply.clone();
        bad.request.md5.clear();
        assert!(validate_handshake(&bad).is_err());

        let mut bad = reply;
        bad.request.size = 0;
        assert!(validate_handshake(&bad).is_err());
    }
}
