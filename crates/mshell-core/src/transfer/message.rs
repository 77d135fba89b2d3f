//! Handshake messages for the MFT control topics.
//!
//! Same base64(JSON) carriage as the session envelope, but a distinct
//! shape: transfers are correlated by `uuid` and sequenced by `step`.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Handshake steps, in protocol order.
pub mod step {
    pub const HANDSHAKE_P1: &str = "handshake-p1";
    pub const HANDSHAKE_P2: &str = "handshake-p2";
    pub const START: &str = "start";
    pub const END: &str = "end";
}

/// Transfer directions carried in [`CpRequest::cmd`].
pub mod direction {
    pub const LOCAL_TO_REMOTE: &str = "local2remote";
    pub const REMOTE_TO_LOCAL: &str = "remote2local";
}

/// The transfer request negotiated during the handshake.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpRequest {
    /// Direction: `local2remote` or `remote2local`.
    #[serde(default)]
    pub cmd: String,
    /// Path on the client machine.
    #[serde(default, rename = "clientpath")]
    pub client_path: String,
    /// Path on the server machine (must be absolute).
    #[serde(default, rename = "serverpath")]
    pub server_path: String,
    /// Source file size in bytes.
    #[serde(default)]
    pub size: u64,
    /// Source file MD5, lowercase hex.
    #[serde(default)]
    pub md5: String,
    /// Reserved protocol selector.
    #[serde(default)]
    pub protocol: String,
}

/// One MFT control message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpMessage {
    /// Transfer id, chosen by the initiator and echoed on every step.
    #[serde(default)]
    pub uuid: String,
    /// Handshake step, see [`step`].
    #[serde(default)]
    pub step: String,
    /// Requesting client session id.
    #[serde(default, rename = "clientuuid")]
    pub client_uuid: String,
    #[serde(default)]
    pub request: CpRequest,
    /// Sender timestamp, unix milliseconds.
    #[serde(default)]
    pub ts: i64,
    /// Error verdict; empty means success.
    #[serde(default)]
    pub error: String,
    /// Data topic allocated by the server on `handshake-p2`.
    #[serde(default)]
    pub topic: String,
    /// Human-readable final status on `end`.
    #[serde(default, rename = "endStr")]
    pub end_str: String,
}

impl CpMessage {
    pub fn encode(&self) -> Result<String> {
        let json = serde_json::to_vec(self).map_err(|e| Error::Codec {
            message: format!("transfer message serialization failed: {e}"),
        })?;
        Ok(BASE64.encode(json))
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        let raw = BASE64.decode(payload).map_err(|e| Error::Codec {
            message: format!("base64 decode failed: {e}"),
        })?;
        serde_json::from_slice(&raw).map_err(|e| Error::Codec {
            message: format!("transfer message deserialization failed: {e}"),
        })
    }
}

/// Current time in unix milliseconds.
pub fn unix_millis() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
