//! mshell-server: the host side of the mqtt-shell fabric.
//!
//! Exposes the local command interpreter and filesystem browsing to remote
//! clients over broker topics, routes per-client traffic to bridge plugins
//! (telnet, SSH) and serves the MFT file-copy protocol.

pub mod autocomplete;
pub mod bridge;
pub mod exec;
pub mod mft;
pub mod plugin;
pub mod session;

pub use mft::CpServer;
pub use plugin::ShellPlugin;
pub use session::{ClientSnapshot, OutMessage, ServerConfig, ServerShell};
