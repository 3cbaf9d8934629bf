//! Client error types.

use std::io;

use thiserror::Error;

use tern_core::error::ProtocolError;

/// Client error type.
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Connection refused: {0}")]
    ConnectionRefused(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Not connected")]
    NotConnected,

    #[error("Invalid state: {0}")]
    InvalidState(String),
}

impl From<tern_core::Error> for ClientError {
    fn from(e: tern_core::Error) -> Self {
        match e {
            tern_core::Error::Io(e) => ClientError::Io(e),
            tern_core::Error::Protocol(e) => ClientError::Protocol(e),
        }
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;
