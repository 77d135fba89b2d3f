//! mshell-core: shared library for the mqtt-shell fabric.
//!
//! This crate provides:
//! - The session envelope and its base64(JSON) wire codec
//! - The MFT binary frame codec and file-transfer engine
//! - The broker adapter (trait + rumqttc-backed worker)
//! - The shared session core (topics, transmit, beacon emission)
//! - Beacon discovery scanning
//! - Logging setup and the workspace error type

pub mod beacon;
pub mod broker;
pub mod constants;
pub mod error;
pub mod ids;
pub mod logging;
pub mod net;
pub mod protocol;
pub mod session;
pub mod transfer;

pub use error::{Error, Result};
pub use logging::{init_logging, LogFormat};
