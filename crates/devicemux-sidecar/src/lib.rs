//! Kubernetes sidecar exposing attached iOS devices as `MobileDevice`
//! resources.
//!
//! The sidecar runs next to usbmuxd on a node with devices attached. It
//! keeps one `MobileDevice` per attached device and drives each device
//! towards `Ready`:
//!
//! - **Pairing**: keeps the muxer's and the cluster's pairing records in
//!   line with what the device trusts, and pairs untrusted devices in the
//!   background
//! - **Developer disk**: mounts the developer disk image matching the
//!   device's OS version
//! - **Reconciliation**: creates, updates and deletes resources as devices
//!   come and go
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐  events   ┌──────────────┐   CRUD   ┌──────────────────┐
//! │   usbmuxd    │──────────▶│  Reconciler  │─────────▶│  MobileDevice    │
//! └──────────────┘           └──────────────┘          │  Pod, Secret     │
//!        ▲                      │        │              └──────────────────┘
//!        │ lockdown     ┌───────┘        └────────┐             ▲
//!        │              ▼                         ▼             │
//! ┌──────────────┐  ┌────────────────────┐  ┌───────────────────┴──┐
//! │  DeviceHost  │◀─│ PairingProvisioner │  │ DeveloperDisk-       │
//! └──────────────┘  └────────────────────┘  │ Provisioner          │
//!                                           └──────────────────────┘
//! ```
//!
//! # Testing
//!
//! Enable the `test-utils` feature for in-memory implementations of the
//! cluster, host and store seams:
//!
//! ```ignore
//! use devicemux_sidecar::{MockDeviceHost, MockDeviceRepository, Reconciler};
//!
//! let host = Arc::new(MockDeviceHost::new());
//! host.attach(1, "00008030-001A2B3C4D5E6F70");
//! reconciler.reconcile_once().await?;
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod cluster;
pub mod conditions;
pub mod crd;
pub mod developer_disk;
pub mod disks;
pub mod error;
pub mod health;
pub mod host;
pub mod pairing;
pub mod reconciler;
pub mod registry;
pub mod stores;
pub mod types;

pub use cluster::{DeviceRepository, KubeDeviceRepository};
pub use crd::{
    ConditionStatus, ConditionType, DeviceCondition, MobileDevice, MobileDeviceSpec,
    MobileDeviceStatus,
};
pub use developer_disk::DeveloperDiskProvisioner;
pub use disks::{
    DeveloperDisk, DeveloperDiskStore, DirectoryDiskStore, DiskStoreChain, HttpDiskStore,
};
pub use error::{Result, SidecarError};
pub use host::{DeviceHost, UsbmuxHost};
pub use pairing::{PairingProvisioner, PairingSettings};
pub use reconciler::{listen_loop, Reconciler};
pub use registry::PairingTaskRegistry;
pub use stores::{MuxerRecordStore, PairingRecordStore, SecretRecordStore};
pub use types::SidecarConfig;

#[cfg(any(test, feature = "test-utils"))]
pub use cluster::mock::MockDeviceRepository;
#[cfg(any(test, feature = "test-utils"))]
pub use disks::mock::MemoryDiskStore;
#[cfg(any(test, feature = "test-utils"))]
pub use host::mock::MockDeviceHost;
#[cfg(any(test, feature = "test-utils"))]
pub use stores::mock::MemoryRecordStore;
