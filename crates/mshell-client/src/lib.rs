//! mshell-client: the remote side of the mqtt-shell fabric.
//!
//! An interactive line-editor shell bound to one server node, a beacon
//! scanner and the client half of the MFT file-copy protocol.

pub mod completer;
pub mod copy;
pub mod router;
pub mod scan;
pub mod shell;

pub use copy::CpClient;
pub use router::ClientRouter;
pub use shell::{ClientShell, ClientShellConfig};
