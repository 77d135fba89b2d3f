//! Wire protocol types for mqtt-shell.
//!
//! Two formats travel over the broker:
//! - the session [`Envelope`], carried as base64(JSON) on the control topics;
//! - the binary MFT [`mft::Frame`], carried raw on per-transfer data topics.

pub mod envelope;
pub mod mft;

pub use envelope::{kind, Envelope, FLAG_AUTOCOMPLETE};
