//! Error taxonomy for connections, the reactor and the SFTP client.
//! Variants are grouped by *kind*, not by call site.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum NetError {
    #[error("invalid argument: {0}")]
    Argument(String),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("connection is dead")]
    Dead,

    #[error("operation was cancelled")]
    Cancelled,

    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("server returned status {status}: {message}")]
    ServerStatus { status: u32, message: String },

    #[error(transparent)]
    Proto(#[from] dirligo_proto::ProtoError),

    #[error("TLS error: {0}")]
    Tls(String),
}

pub type Result<T> = std::result::Result<T, NetError>;
