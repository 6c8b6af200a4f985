//! Core identifier types for devicemux.
//!
//! This module provides strongly-typed identifiers for attached devices.
//! A device is known to the muxer by a transient numeric [`DeviceId`] and to
//! everything else by its stable [`Udid`].

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Maximum length of a Kubernetes object name.
const MAX_NAME_LEN: usize = 63;

/// A unique device identifier (UDID).
///
/// UDIDs are either 40 hex characters (older devices) or
/// `XXXXXXXX-XXXXXXXXXXXXXXXX` (newer devices). The original casing is kept
/// because the muxer and lockdown compare UDIDs case-sensitively.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Udid(String);

impl Udid {
    /// Parse a `Udid` from a string.
    ///
    /// # Errors
    ///
    /// Returns an error if the string is empty, too long to be used as a
    /// cluster resource name, or contains characters other than ASCII
    /// alphanumerics and `-`.
    pub fn new(value: impl Into<String>) -> Result<Self, IdError> {
        let value = value.into();

        if value.is_empty() {
            return Err(IdError::Empty);
        }
        if value.len() > MAX_NAME_LEN {
            return Err(IdError::TooLong {
                max: MAX_NAME_LEN,
                got: value.len(),
            });
        }
        if let Some(c) = value
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || *c == '-'))
        {
            return Err(IdError::InvalidCharacter(c));
        }

        Ok(Self(value))
    }

    /// Return the UDID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Return the name used for cluster resources representing this device.
    ///
    /// Kubernetes names must be lowercase.
    #[must_use]
    pub fn resource_name(&self) -> String {
        self.0.to_ascii_lowercase()
    }
}

impl fmt::Debug for Udid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Udid({})", self.0)
    }
}

impl fmt::Display for Udid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Udid {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for Udid {
    type Error = IdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Udid> for String {
    fn from(id: Udid) -> Self {
        id.0
    }
}

impl AsRef<str> for Udid {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// The muxer-assigned identifier of an attached device.
///
/// Device IDs are only valid while the device stays attached; the muxer
/// assigns a new one after every re-plug.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(u32);

impl DeviceId {
    /// Create a new `DeviceId`.
    #[must_use]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Return the numeric value.
    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for DeviceId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

/// Errors that can occur when parsing identifiers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdError {
    /// The identifier was empty.
    #[error("identifier is empty")]
    Empty,

    /// The identifier is longer than allowed.
    #[error("identifier too long: max {max} characters, got {got}")]
    TooLong {
        /// Maximum allowed length.
        max: usize,
        /// Actual length.
        got: usize,
    },

    /// The identifier contains a character that is not allowed.
    #[error("invalid character in identifier: {0:?}")]
    InvalidCharacter(char),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn udid_accepts_both_formats() {
        assert!(Udid::new("a1b2c3d4e5f60718293a4b5c6d7e8f9012345678").is_ok());
        assert!(Udid::new("00008030-001A35E02E3A802E").is_ok());
    }

    #[test]
    fn udid_rejects_invalid_input() {
        assert_eq!(Udid::new(""), Err(IdError::Empty));
        assert_eq!(
            Udid::new("abc/def"),
            Err(IdError::InvalidCharacter('/'))
        );
        assert!(matches!(
            Udid::new("a".repeat(64)),
            Err(IdError::TooLong { max: 63, got: 64 })
        ));
    }

    #[test]
    fn udid_resource_name_is_lowercase() {
        let udid = Udid::new("00008030-001A35E02E3A802E").unwrap();
        assert_eq!(udid.resource_name(), "00008030-001a35e02e3a802e");
        assert_eq!(udid.as_str(), "00008030-001A35E02E3A802E");
    }

    #[test]
    fn udid_serde_roundtrip() {
        let udid = Udid::new("abc").unwrap();
        let json = serde_json::to_string(&udid).unwrap();
        assert_eq!(json, "\"abc\"");

        let parsed: Udid = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, udid);

        assert!(serde_json::from_str::<Udid>("\"\"").is_err());
    }

    #[test]
    fn device_id_display() {
        assert_eq!(DeviceId::new(42).to_string(), "42");
        assert_eq!(DeviceId::from(7).get(), 7);
    }
}
