//! Error types for mshell-core.

use thiserror::Error;

/// Main error type for mqtt-shell operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error from underlying system calls.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Codec error during envelope or frame encoding/decoding.
    #[error("codec error: {message}")]
    Codec { message: String },

    /// Protocol violation (bad handshake step, frame out of order).
    #[error("protocol error: {message}")]
    Protocol { message: String },

    /// Broker adapter failure (connect, subscribe, publish).
    #[error("broker error: {message}")]
    Broker { message: String },

    /// Bridge plugin failure (telnet/SSH dial or pump).
    #[error("bridge error: {message}")]
    Bridge { message: String },

    /// File transfer failure (handshake validation, integrity check).
    #[error("transfer error: {message}")]
    Transfer { message: String },

    /// Invalid configuration.
    #[error("config error: {message}")]
    Config { message: String },

    /// Operation timed out.
    #[error("operation timed out")]
    Timeout,

    /// A channel peer went away.
    #[error("channel closed")]
    ChannelClosed,
}

impl Error {
    pub fn codec(message: impl Into<String>) -> Self {
        Error::Codec {
            message: message.into(),
        }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Error::Protocol {
            message: message.into(),
        }
    }

    pub fn broker(message: impl Into<String>) -> Self {
        Error::Broker {
            message: message.into(),
        }
    }

    pub fn transfer(message: impl Into<String>) -> Self {
        Error::Transfer {
            message: message.into(),
        }
    }
}

/// Convenience result type for mqtt-shell operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_codec() {
        let err = Error::codec("bad base64");
        assert_eq!(err.to_string(), "codec error: bad base64");
    }

    #[test]
    fn error_display_protocol() {
        let err = Error::protocol("missing start frame");
        assert_eq!(err.to_string(), "protocol error: missing start frame");
    }

    #[test]
    fn io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "no such file");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn error_display_timeout() {
        assert_eq!(Error::Timeout.to_string(), "operation timed out");
    }
}
