//! Device product versions.
//!
//! Devices report their OS version as `major.minor[.build]`, for example
//! `13.4.1`. Developer disk images are published per `major.minor`, sometimes
//! with build-specific variants.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// A parsed `ProductVersion` value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProductVersion {
    /// Major version.
    pub major: u32,
    /// Minor version.
    pub minor: u32,
    /// Build (patch) component, when the device reports one.
    pub build: Option<u32>,
}

impl ProductVersion {
    /// Create a new version.
    #[must_use]
    pub const fn new(major: u32, minor: u32, build: Option<u32>) -> Self {
        Self {
            major,
            minor,
            build,
        }
    }

    /// Return the `major.minor` form of this version, without a build component.
    #[must_use]
    pub const fn major_minor(&self) -> Self {
        Self::new(self.major, self.minor, None)
    }

    /// Check whether the version has a build component.
    #[must_use]
    pub const fn has_build(&self) -> bool {
        self.build.is_some()
    }
}

impl fmt::Display for ProductVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.build {
            Some(build) => write!(f, "{}.{}.{}", self.major, self.minor, build),
            None => write!(f, "{}.{}", self.major, self.minor),
        }
    }
}

impl FromStr for ProductVersion {
    type Err = CoreError;

    /// Parse `major`, `major.minor` or `major.minor.build`.
    ///
    /// A bare major version is treated as `major.0`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || CoreError::InvalidVersion(s.to_string());

        let mut parts = s.trim().split('.');
        let major = parts
            .next()
            .and_then(|p| p.parse().ok())
            .ok_or_else(invalid)?;
        let minor = match parts.next() {
            Some(p) => p.parse().map_err(|_| invalid())?,
            None => 0,
        };
        let build = match parts.next() {
            Some(p) => Some(p.parse().map_err(|_| invalid())?),
            None => None,
        };

        if parts.next().is_some() {
            return Err(invalid());
        }

        Ok(Self::new(major, minor, build))
    }
}
