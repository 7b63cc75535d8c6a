//! Protocol error types.

use thiserror::Error;

/// Errors that can occur while encoding or decoding relay frames.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("incomplete frame: need {needed} more bytes")]
    IncompleteFrame { needed: usize },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    /// Returns whether the error was caused by the peer closing mid-frame.
    pub fn is_truncation(&self) -> bool {
        match self {
            ProtocolError::IncompleteFrame { .. } => true,
            ProtocolError::Io(e) => e.kind() == std::io::ErrorKind::UnexpectedEof,
            ProtocolError::FrameTooLarge { .. } => false,
        }
    }
}
