//! Error types shared by the connection pool, transport adapter and router.

use thiserror::Error;

use crate::common::Operation;
use crate::storage::StorageError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("maximum number of connections reached: {0}")]
    CapacityExceeded(usize),

    #[error("not connected: {0}")]
    NotConnected(String),

    #[error("already connected: {0}")]
    AlreadyConnected(String),

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("message rejected by admission control: {0}")]
    Inadmissible(String),

    #[error("unsupported message operation: {0:?}")]
    UnsupportedOperation(Operation),

    /// The session is gone; the pool evicts it when it sees this.
    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    /// Deadline or transport hiccup; the session is kept.
    #[error("transient transport error: {0}")]
    TransientIo(String),

    #[error("malformed frame: {0}")]
    Decode(String),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn is_connection_closed(&self) -> bool {
        matches!(self, Error::ConnectionClosed(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Decode(err.to_string())
    }
}

impl From<base64::DecodeError> for Error {
    fn from(err: base64::DecodeError) -> Self {
        Error::Decode(format!("invalid base64 payload: {err}"))
    }
}
