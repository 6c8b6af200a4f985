//! Types for the sidecar crate.

use std::path::PathBuf;
use std::time::Duration;

use devicemux_muxer::MuxerEndpoint;

use crate::{Result, SidecarError};

/// Configuration for the device sidecar.
#[derive(Debug, Clone)]
pub struct SidecarConfig {
    /// Name of the pod this sidecar runs in. Owns every `MobileDevice` it
    /// creates.
    pub pod_name: String,
    /// Namespace for `MobileDevice` resources and pairing secrets.
    pub namespace: String,
    /// Where to reach usbmuxd.
    pub muxer: MuxerEndpoint,
    /// Listen address of the health server.
    pub listen_addr: String,
    /// Directory holding developer disk images, one subdirectory per version.
    pub developer_disk_dir: Option<PathBuf>,
    /// Base URL serving developer disk images, one path segment per version.
    pub developer_disk_url: Option<String>,
    /// Delay between `Pair` attempts while the trust dialog is open.
    pub pairing_retry_interval: Duration,
    /// How long a pairing task waits for the user before giving up.
    pub pairing_timeout: Duration,
    /// Delay before resubscribing after the muxer drops the event stream.
    pub listen_retry_interval: Duration,
}

impl Default for SidecarConfig {
    fn default() -> Self {
        Self {
            pod_name: String::new(),
            namespace: "default".to_string(),
            muxer: MuxerEndpoint::default(),
            listen_addr: "0.0.0.0:8080".to_string(),
            developer_disk_dir: None,
            developer_disk_url: None,
            pairing_retry_interval: Duration::from_secs(1),
            pairing_timeout: Duration::from_secs(300),
            listen_retry_interval: Duration::from_secs(5),
        }
    }
}

impl SidecarConfig {
    /// Create a config for the given pod with default settings.
    #[must_use]
    pub fn for_pod(pod_name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            pod_name: pod_name.into(),
            namespace: namespace.into(),
            ..Default::default()
        }
    }

    /// Load configuration from environment variables.
    ///
    /// Supported environment variables:
    /// - `POD_NAME`: Name of the sidecar pod (required)
    /// - `POD_NAMESPACE`: Namespace of the sidecar pod
    /// - `USBMUXD_SOCKET_ADDRESS`: `unix:/path` or `host:port` of usbmuxd
    /// - `LISTEN_ADDR`: Health server listen address
    /// - `DEVELOPER_DISK_DIR`: Local developer disk image directory
    /// - `DEVELOPER_DISK_URL`: Base URL of a developer disk image server
    /// - `PAIRING_RETRY_INTERVAL_SECS`: Delay between pairing attempts
    /// - `PAIRING_TIMEOUT_SECS`: Time allowed for the user to trust the host
    /// - `LISTEN_RETRY_INTERVAL_SECS`: Delay before resubscribing to events
    ///
    /// # Errors
    ///
    /// Returns `SidecarError::Config` if `POD_NAME` is not set.
    pub fn from_env() -> Result<Self> {
        let mut config = Self {
            muxer: MuxerEndpoint::from_env(),
            ..Self::default()
        };

        config.pod_name = std::env::var("POD_NAME")
            .ok()
            .filter(|v| !v.is_empty())
            .ok_or_else(|| SidecarError::Config("POD_NAME must be set".to_string()))?;

        if let Ok(val) = std::env::var("POD_NAMESPACE") {
            config.namespace = val;
        }
        if let Ok(val) = std::env::var("LISTEN_ADDR") {
            config.listen_addr = val;
        }
        if let Ok(val) = std::env::var("DEVELOPER_DISK_DIR") {
            config.developer_disk_dir = Some(PathBuf::from(val));
        }
        if let Ok(val) = std::env::var("DEVELOPER_DISK_URL") {
            config.developer_disk_url = Some(val);
        }
        if let Some(secs) = env_secs("PAIRING_RETRY_INTERVAL_SECS") {
            config.pairing_retry_interval = secs;
        }
        if let Some(secs) = env_secs("PAIRING_TIMEOUT_SECS") {
            config.pairing_timeout = secs;
        }
        if let Some(secs) = env_secs("LISTEN_RETRY_INTERVAL_SECS") {
            config.listen_retry_interval = secs;
        }

        Ok(config)
    }
}

fn env_secs(name: &str) -> Option<Duration> {
    std::env::var(name)
        .ok()
        .and_then(|val| val.parse().ok())
        .map(Duration::from_secs)
}
