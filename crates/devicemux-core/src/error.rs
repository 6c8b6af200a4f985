//! Common error types for devicemux.
//!
//! This module provides shared error types that are used across multiple crates.

use thiserror::Error;

/// A result type using `CoreError`.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Core errors that can occur throughout the devicemux system.
#[derive(Debug, Error)]
pub enum CoreError {
    /// An invalid identifier was provided.
    #[error("invalid identifier: {0}")]
    InvalidId(#[from] crate::ids::IdError),

    /// A product version string could not be parsed.
    #[error("invalid product version: {0}")]
    InvalidVersion(String),

    /// A pairing record is missing a required entry or has the wrong type.
    #[error("invalid pairing record: {0}")]
    InvalidPairingRecord(String),

    /// Property list encoding or decoding failed.
    #[error("property list error: {0}")]
    Plist(#[from] plist::Error),
}
