//! Error types for the lockdown crate.

use devicemux_core::CoreError;
use plist::Dictionary;
use thiserror::Error;

/// A result type using `LockdownError`.
pub type Result<T> = std::result::Result<T, LockdownError>;

/// Errors that can occur while talking to lockdown or one of its services.
#[derive(Debug, Error)]
pub enum LockdownError {
    /// Stream I/O failed.
    #[error("lockdown I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A message was not a valid property list.
    #[error("property list error: {0}")]
    Plist(#[from] plist::Error),

    /// A frame was malformed.
    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    /// The peer closed the connection before replying.
    #[error("connection closed by device")]
    ConnectionClosed,

    /// A required field was missing or had the wrong type.
    #[error("missing or invalid field: {0}")]
    MissingField(&'static str),

    /// The peer is not the lockdown service.
    #[error("unexpected service type: {0}")]
    UnexpectedServiceType(String),

    /// The device answered a request with an error this client does not
    /// model as an outcome.
    #[error("{request} failed: {error}")]
    Protocol {
        /// The request that failed.
        request: String,
        /// The error string returned by the device.
        error: String,
        /// The raw response.
        payload: Dictionary,
    },

    /// The device's product version could not be parsed.
    #[error("invalid device data: {0}")]
    Core(#[from] CoreError),

    /// TLS configuration or handshake failed.
    #[error("TLS error: {0}")]
    Tls(String),

    /// Pairing credentials could not be generated.
    #[error("credential generation failed: {0}")]
    Credentials(String),

    /// The image mounter service rejected a command.
    #[error(transparent)]
    ImageMounter(#[from] MobileImageMounterError),
}

impl From<rustls::Error> for LockdownError {
    fn from(e: rustls::Error) -> Self {
        Self::Tls(e.to_string())
    }
}

impl From<rcgen::Error> for LockdownError {
    fn from(e: rcgen::Error) -> Self {
        Self::Credentials(e.to_string())
    }
}

impl LockdownError {
    /// Check if this error is transient and the operation may be retried.
    #[must_use]
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::Io(_) | Self::ConnectionClosed)
    }

    /// Check if the device refused a request because it is locked with a
    /// passcode. Pairing succeeds once the user unlocks it.
    #[must_use]
    pub fn is_password_protected(&self) -> bool {
        matches!(self, Self::Protocol { error, .. } if error == "PasswordProtected")
    }
}

/// The image mounter service did not complete a command.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("image mounter {command} returned {status}")]
pub struct MobileImageMounterError {
    /// The command that failed.
    pub command: String,
    /// The status received, or the error string when no status was sent.
    pub status: String,
}
