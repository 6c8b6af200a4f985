//! Lockdown protocol client for devicemux.
//!
//! Lockdown is the per-device service reached through a muxer tunnel to port
//! 62078. This crate provides:
//!
//! - **Codec**: 4-byte big-endian length-prefixed property lists
//! - **Client**: device values, sessions, service start and pairing
//! - **TLS**: upgrading sessions and service tunnels with pairing credentials
//! - **Generator**: creating the certificates of a new pairing record
//! - **Image mounter**: uploading and mounting developer disk images
//!
//! # Example
//!
//! ```ignore
//! use devicemux_lockdown::{LockdownClient, PairingStatus, LOCKDOWN_PORT};
//!
//! let stream = muxer.connect(device.device_id, LOCKDOWN_PORT).await?;
//! let mut lockdown = LockdownClient::new(stream);
//! lockdown.query_type().await?;
//!
//! if lockdown.validate_pair(&record).await? == PairingStatus::Success {
//!     let version = lockdown.product_version().await?;
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod client;
pub mod codec;
pub mod error;
pub mod generator;
pub mod image_mounter;
pub mod protocol;
pub mod tls;

pub use client::LockdownClient;
pub use error::{LockdownError, MobileImageMounterError, Result};
pub use generator::generate_pairing_record;
pub use image_mounter::{
    ImageMounter, MobileImageMounterClient, DEVELOPER_IMAGE_TYPE, IMAGE_MOUNTER_SERVICE,
};
pub use protocol::{
    PairOutcome, PairingStatus, ServiceDescriptor, SessionInfo, LOCKDOWN_PORT,
    LOCKDOWN_SERVICE_TYPE,
};
pub use tls::TlsStream;

#[cfg(any(test, feature = "test-utils"))]
pub use image_mounter::mock::MockImageMounter;
