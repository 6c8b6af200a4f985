//! Client for the USB multiplexing daemon (usbmuxd).
//!
//! usbmuxd owns the USB connections to attached iOS devices. Clients talk to
//! it over a local socket using length-framed property list messages to:
//!
//! - list attached devices and subscribe to attach/detach events
//! - open raw tunnels to TCP ports on a device
//! - read, store and delete host pairing records
//!
//! # Example
//!
//! ```no_run
//! use devicemux_muxer::{MuxerClient, MuxerEndpoint};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = MuxerClient::new(MuxerEndpoint::from_env());
//!
//! for device in client.list_devices().await? {
//!     println!("{} attached as {}", device.udid, device.device_id);
//! }
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod client;
pub mod codec;
pub mod error;
pub mod protocol;
pub mod transport;

pub use client::{ListenAction, MuxerClient, MuxerConnection, MuxerEvent};
pub use error::{MuxerError, Result};
pub use protocol::{ConnectionType, MuxerDevice, MuxerEnvelope, MuxerMessage, ResultCode};
pub use transport::{MuxerEndpoint, MuxerStream};
