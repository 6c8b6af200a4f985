//! Error types for the muxer crate.

use devicemux_core::{CoreError, IdError};
use thiserror::Error;

use crate::protocol::ResultCode;

/// A result type using `MuxerError`.
pub type Result<T> = std::result::Result<T, MuxerError>;

/// Errors that can occur while talking to the muxer.
#[derive(Debug, Error)]
pub enum MuxerError {
    /// Socket I/O failed.
    #[error("muxer I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A frame payload was not a valid property list.
    #[error("property list error: {0}")]
    Plist(#[from] plist::Error),

    /// A frame header was malformed.
    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    /// The message carried a `MessageType` this client does not know.
    #[error("unknown message type: {0}")]
    UnknownMessageType(String),

    /// A required field was missing or had the wrong type.
    #[error("missing or invalid field: {0}")]
    MissingField(&'static str),

    /// A device reported an invalid UDID.
    #[error("invalid device identifier: {0}")]
    InvalidId(#[from] IdError),

    /// A stored pairing record could not be decoded.
    #[error("invalid pairing record: {0}")]
    PairingRecord(#[from] CoreError),

    /// The muxer replied with a message that does not answer the request.
    #[error("unexpected muxer message: expected {expected}, got {got}")]
    UnexpectedMessage {
        /// The message kind that was expected.
        expected: &'static str,
        /// The message kind that was received.
        got: &'static str,
    },

    /// The muxer answered with a non-success result code.
    #[error("muxer returned {0}")]
    Result(ResultCode),

    /// The muxer closed the connection before replying.
    #[error("muxer closed the connection")]
    ConnectionClosed,

    /// The operation was cancelled.
    #[error("operation cancelled")]
    Cancelled,
}

impl MuxerError {
    /// Check if this error is transient and the operation may be retried.
    #[must_use]
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Self::Io(_) | Self::ConnectionClosed | Self::Result(ResultCode::ConnectionRefused)
        )
    }
}
