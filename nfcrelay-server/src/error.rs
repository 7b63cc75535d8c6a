//! Server error types.

use crate::config::ConfigError;
use thiserror::Error;

/// Server errors.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] nfcrelay_protocol::ProtocolError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("unknown plugin stage: {0}")]
    UnknownStage(String),

    #[error("metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("TLS configuration error: {0}")]
    TlsConfig(String),

    #[error("TLS handshake failed: {0}")]
    TlsHandshake(String),
}

impl ServerError {
    /// Returns whether this error can only occur before the server starts
    /// accepting connections.
    pub fn is_startup_error(&self) -> bool {
        matches!(
            self,
            ServerError::Config(_)
                | ServerError::UnknownStage(_)
                | ServerError::Metrics(_)
                | ServerError::TlsConfig(_)
        )
    }

    /// Short label used for the terminations metric.
    pub fn label(&self) -> &'static str {
        match self {
            ServerError::Io(_) => "io_error",
            ServerError::Protocol(_) => "protocol_error",
            ServerError::Config(_) => "config_error",
            ServerError::UnknownStage(_) => "unknown_stage",
            ServerError::Metrics(_) => "metrics_error",
            ServerError::TlsConfig(_) => "tls_config",
            ServerError::TlsHandshake(_) => "tls_handshake",
        }
    }
}
