//! Error taxonomy for the wire-level crate.
//!
//! Covers the failures that can occur below the connection/session layer:
//! malformed frames, unknown status codes and request-id bookkeeping
//! failures.

use thiserror::Error;

/// Errors produced while framing, decoding or pooling SFTP requests.
#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("packet too short: need at least {need} bytes, have {have}")]
    Truncated { need: usize, have: usize },

    #[error("packet exceeds maximum size ({size} > {max})")]
    TooLarge { size: u32, max: u32 },

    #[error("unknown SFTP packet type {0}")]
    UnknownPacketType(u8),

    #[error("unrecognized SFTP status code {0:#x}")]
    UnknownStatus(u32),

    #[error("reply id {reply} does not match any pending request")]
    UnknownRequestId { reply: u32 },

    #[error("request id {0} already pending")]
    DuplicateRequestId(u32),

    #[error("timed out waiting for a reply")]
    Timeout,

    #[error("request pool shut down: {0}")]
    Shutdown(String),

    #[error("invalid attribute payload: {0}")]
    InvalidAttrs(&'static str),
}

pub type Result<T> = std::result::Result<T, ProtoError>;
