//! WolfTunnel Error Types

use thiserror::Error;

/// Result type alias for WolfTunnel operations
pub type Result<T> = std::result::Result<T, Error>;

/// WolfTunnel error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Protocol violations
    #[error("Authentication failed")]
    AuthFailed,

    #[error("Malformed handshake: {0}")]
    MalformedHandshake(String),

    #[error("Malformed frame header: {0}")]
    MalformedHeader(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    // Resource exhaustion
    #[error("Frame length {declared} exceeds maximum {max}")]
    FrameTooLarge { declared: usize, max: usize },

    // Codec errors
    #[error("Codec error: {0}")]
    Codec(String),

    // Transport errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    #[error("Read timed out after {0:?}")]
    ReadTimeout(std::time::Duration),

    #[error("Connection closed by peer")]
    ConnectionClosed,

    // Device errors
    #[error("Tunnel device error: {0}")]
    Device(String),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Operation cancelled")]
    Cancelled,
}

impl Error {
    /// Name of the failure class, used as a structured logging field
    pub fn category(&self) -> &'static str {
        match self {
            Error::Config(_) | Error::ConfigParse(_) => "configuration",
            Error::AuthFailed
            | Error::MalformedHandshake(_)
            | Error::MalformedHeader(_)
            | Error::Protocol(_) => "protocol",
            Error::FrameTooLarge { .. } => "resource",
            Error::Codec(_) => "codec",
            Error::Io(_)
            | Error::WebSocket(_)
            | Error::Tls(_)
            | Error::ReadTimeout(_)
            | Error::ConnectionClosed => "transport",
            Error::Device(_) => "device",
            Error::Internal(_) | Error::Cancelled => "internal",
        }
    }

    /// Check if this error is an orderly hang-up rather than a failure
    pub fn is_connection_closed(&self) -> bool {
        match self {
            Error::ConnectionClosed | Error::Cancelled => true,
            Error::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::UnexpectedEof
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::BrokenPipe
            ),
            Error::WebSocket(e) => matches!(
                e,
                tokio_tungstenite::tungstenite::Error::ConnectionClosed
                    | tokio_tungstenite::tungstenite::Error::AlreadyClosed
            ),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_categories() {
        assert_eq!(Error::AuthFailed.category(), "protocol");
        assert_eq!(Error::FrameTooLarge { declared: 10, max: 5 }.category(), "resource");
        assert_eq!(Error::Codec("bad".into()).category(), "codec");
        assert_eq!(Error::Config("missing key".into()).category(), "configuration");
    }

    #[test]
    fn test_eof_is_orderly_close() {
        let eof = Error::Io(std::io::Error::from(std::io::ErrorKind::UnexpectedEof));
        assert!(eof.is_connection_closed());
        assert!(!Error::AuthFailed.is_connection_closed());
    }
}
