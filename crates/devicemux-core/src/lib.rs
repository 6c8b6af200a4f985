//! Core types for devicemux.
//!
//! This crate provides the identifiers, pairing record model and version
//! parsing shared by the muxer, lockdown and sidecar crates.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod ids;
pub mod pairing;
pub mod version;

pub use error::{CoreError, Result};
pub use ids::{DeviceId, IdError, Udid};
pub use pairing::PairingRecord;
pub use version::ProductVersion;
