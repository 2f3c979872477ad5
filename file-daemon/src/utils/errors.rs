//! Error types for the file daemon.

use bnet::{ChannelError, ProtocolError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FdError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Configuration error: {0}")]
    Settings(#[from] ::config::ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Network error: {0}")]
    Network(#[from] ChannelError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Compression error: {0}")]
    Compression(String),

    #[error("Crypto error: {0}")]
    Crypto(#[from] crate::crypto::CryptoError),

    #[error("Bad response to {command} command: wanted {wanted}, got {got}")]
    BadResponse {
        command: String,
        wanted: String,
        got: String,
    },

    #[error("Job canceled")]
    Canceled,

    #[error("Fatal error: {0}")]
    Fatal(String),

    #[error("Daemon error: {0}")]
    Daemon(String),
}

impl FdError {
    pub fn bad_response(command: &str, wanted: &str, got: &str) -> Self {
        FdError::BadResponse {
            command: command.to_string(),
            wanted: wanted.trim_end().to_string(),
            got: got.trim_end().to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, FdError>;
