//! Session envelope and its base64(JSON) wire codec.
//!
//! Every control message between client and server is one JSON object,
//! UTF-8 encoded and then base64 encoded before publication. Field names
//! are fixed by the wire format; unknown fields are ignored on receipt and
//! an empty string means "absent".

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::ids;

/// Message kinds carried in [`Envelope::cmd`].
pub mod kind {
    pub const WHOAMI: &str = "whoami";
    pub const SHELL: &str = "shell";
    pub const AUTOCOMPLETE: &str = "autocomplete";
    pub const PING: &str = "ping";
    pub const PONG: &str = "pong";
    pub const BEACON: &str = "beacon";
}

/// Reserved flag bit: the peer supports remote autocompletion.
pub const FLAG_AUTOCOMPLETE: u32 = 1 << 0;

/// The session-layer control message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Sender's IPv4 address, informational only.
    #[serde(default)]
    pub ip: String,
    /// Sender's version string.
    #[serde(default)]
    pub version: String,
    /// Message kind, mandatory for dispatch.
    #[serde(default)]
    pub cmd: String,
    /// Payload body: command text, autocomplete seed or option list.
    #[serde(default)]
    pub data: String,
    /// Request id, echoed verbatim by the responder.
    #[serde(default, rename = "cmduuid")]
    pub cmd_uuid: String,
    /// Client session id; routing key on the server side.
    #[serde(default, rename = "clientuuid")]
    pub client_uuid: String,
    /// Sender timestamp, informational.
    #[serde(default)]
    pub datetime: String,
    /// Prompt override the client must render (e.g. `<ssh>`).
    #[serde(default, rename = "customprompt")]
    pub custom_prompt: String,
    /// Reserved bitfield.
    #[serde(default)]
    pub flags: u32,
    /// Server working directory as seen by this client session.
    #[serde(default, rename = "currentpath")]
    pub current_path: String,
}

impl Envelope {
    /// A fresh shell envelope with a generated request id.
    pub fn new() -> Self {
        Envelope {
            cmd: kind::SHELL.to_string(),
            cmd_uuid: ids::new_id(),
            ..Default::default()
        }
    }

    /// A reply skeleton echoing the routing ids of `req`.
    pub fn reply_to(req: &Envelope) -> Self {
        Envelope {
            cmd: kind::SHELL.to_string(),
            cmd_uuid: req.cmd_uuid.clone(),
            client_uuid: req.client_uuid.clone(),
            ..Default::default()
        }
    }

    /// Encode to the wire representation: base64 of the UTF-8 JSON object.
    pub fn encode(&self) -> Result<String> {
        let json = serde_json::to_vec(self).map_err(|e| Error::Codec {
            message: format!("envelope serialization failed: {e}"),
        })?;
        Ok(BASE64.encode(json))
    }

    /// Decode from a wire payload.
    pub fn decode(payload: &[u8]) -> Result<Self> {
        let raw = BASE64.decode(payload).map_err(|e| Error::Codec {
            message: format!("base64 decode failed: {e}"),
        })?;
        serde_json::from_slice(&raw).map_err(|e| Error::Codec {
            message: format!("envelope deserialization failed: {e}"),
        })
    }
}
