//! Error types for the sidecar crate.

use thiserror::Error;

/// Errors that can occur during a reconciliation pass.
#[derive(Error, Debug)]
pub enum SidecarError {
    /// Kubernetes API error.
    #[error("Kubernetes API error: {0}")]
    KubeApi(#[from] kube::Error),

    /// Muxer error.
    #[error("Muxer error: {0}")]
    Muxer(#[from] devicemux_muxer::MuxerError),

    /// Lockdown or device service error.
    #[error("Lockdown error: {0}")]
    Lockdown(#[from] devicemux_lockdown::LockdownError),

    /// Invalid identifier, version or pairing record.
    #[error("{0}")]
    Core(#[from] devicemux_core::CoreError),

    /// The sidecar's own pod does not exist.
    #[error("Pod not found: {0}")]
    PodNotFound(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The developer disk store could not be read.
    #[error("Developer disk store error: {0}")]
    DiskStore(String),

    /// A cluster object is missing data the sidecar relies on.
    #[error("Invalid resource {name}: {reason}")]
    InvalidResource {
        /// The object name.
        name: String,
        /// What is wrong with it.
        reason: String,
    },
}

impl SidecarError {
    /// Check if this error is retriable.
    #[must_use]
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::KubeApi(_) | Self::DiskStore(_) => true,
            Self::Muxer(e) => e.is_retriable(),
            Self::Lockdown(e) => e.is_retriable(),
            _ => false,
        }
    }

    /// Check if the device is locked with a passcode.
    #[must_use]
    pub fn is_password_protected(&self) -> bool {
        matches!(self, Self::Lockdown(e) if e.is_password_protected())
    }

    /// Check if this error came from the image mounter service.
    #[must_use]
    pub fn is_image_mounter(&self) -> bool {
        matches!(
            self,
            Self::Lockdown(devicemux_lockdown::LockdownError::ImageMounter(_))
        )
    }
}

impl From<reqwest::Error> for SidecarError {
    fn from(e: reqwest::Error) -> Self {
        Self::DiskStore(e.to_string())
    }
}

/// A specialized Result type for sidecar operations.
pub type Result<T> = std::result::Result<T, SidecarError>;

#[cfg(test)]
mod tests {
    use devicemux_lockdown::{LockdownError, MobileImageMounterError};
    use devicemux_muxer::{MuxerError, ResultCode};

    use super::*;

    #[test]
    fn retriable_follows_source() {
        assert!(SidecarError::from(MuxerError::Result(ResultCode::ConnectionRefused)).is_retriable());
        assert!(!SidecarError::from(MuxerError::Result(ResultCode::BadDevice)).is_retriable());
        assert!(SidecarError::from(LockdownError::ConnectionClosed).is_retriable());
        assert!(!SidecarError::PodNotFound("sidecar-0".into()).is_retriable());
    }

    #[test]
    fn image_mounter_errors_are_recognised() {
        let err = SidecarError::from(LockdownError::from(MobileImageMounterError {
            command: "MountImage".into(),
            status: "Failed".into(),
        }));
        assert!(err.is_image_mounter());
        assert!(!SidecarError::from(LockdownError::ConnectionClosed).is_image_mounter());
    }

    #[test]
    fn locked_device_is_recognised() {
        let locked = SidecarError::from(LockdownError::Protocol {
            request: "Pair".into(),
            error: "PasswordProtected".into(),
            payload: plist::Dictionary::new(),
        });
        assert!(locked.is_password_protected());
        assert!(!locked.is_retriable());
        assert!(!SidecarError::from(LockdownError::ConnectionClosed).is_password_protected());
    }
}
