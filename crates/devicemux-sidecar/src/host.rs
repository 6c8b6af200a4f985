//! Device access on the local host.
//!
//! [`DeviceHost`] wraps everything the provisioners need from a device:
//! listing attached devices, pairing and opening the image mounter.
//! [`UsbmuxHost`] implements it through usbmuxd and lockdown.

use std::time::Duration;

use async_trait::async_trait;
use devicemux_core::{DeviceId, PairingRecord, ProductVersion};
use devicemux_lockdown::{
    generate_pairing_record, tls, ImageMounter, LockdownClient, LockdownError,
    MobileImageMounterClient, PairOutcome, PairingStatus, ServiceDescriptor,
    IMAGE_MOUNTER_SERVICE, LOCKDOWN_PORT,
};
use devicemux_muxer::{MuxerClient, MuxerDevice, MuxerError, MuxerStream, ResultCode};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, instrument};

use crate::Result;

/// Number of times a refused service tunnel is retried.
pub const DEFAULT_CONNECT_RETRIES: u32 = 5;

/// Delay between service tunnel attempts.
pub const DEFAULT_CONNECT_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Operations on attached devices.
#[async_trait]
pub trait DeviceHost: Send + Sync {
    /// List the attached devices.
    ///
    /// # Errors
    ///
    /// Returns an error if the muxer reply is invalid.
    async fn list_devices(&self) -> Result<Vec<MuxerDevice>>;

    /// Check whether the device trusts a pairing record.
    ///
    /// # Errors
    ///
    /// Returns an error if the device cannot be reached.
    async fn validate_pair(
        &self,
        device: &MuxerDevice,
        record: &PairingRecord,
    ) -> Result<PairingStatus>;

    /// Send a `Pair` request for a record.
    ///
    /// # Errors
    ///
    /// Returns an error if the device cannot be reached.
    async fn pair(&self, device: &MuxerDevice, record: &PairingRecord) -> Result<PairOutcome>;

    /// Generate a fresh pairing record for a device.
    ///
    /// # Errors
    ///
    /// Returns an error if the device public key or host BUID cannot be read.
    async fn new_pairing_record(&self, device: &MuxerDevice) -> Result<PairingRecord>;

    /// Read the device's product version.
    ///
    /// # Errors
    ///
    /// Returns an error if the device cannot be reached or reports an
    /// invalid version.
    async fn product_version(&self, device: &MuxerDevice) -> Result<ProductVersion>;

    /// Start the image mounter service and connect to it.
    ///
    /// # Errors
    ///
    /// Returns an error if the session, the service or its tunnel fail.
    async fn open_image_mounter(
        &self,
        device: &MuxerDevice,
        record: &PairingRecord,
    ) -> Result<Box<dyn ImageMounter>>;
}

/// Devices reached through usbmuxd.
#[derive(Debug, Clone)]
pub struct UsbmuxHost {
    muxer: MuxerClient,
    connect_retries: u32,
    connect_retry_delay: Duration,
}

impl UsbmuxHost {
    /// Create a host backed by a muxer client.
    #[must_use]
    pub fn new(muxer: MuxerClient) -> Self {
        Self {
            muxer,
            connect_retries: DEFAULT_CONNECT_RETRIES,
            connect_retry_delay: DEFAULT_CONNECT_RETRY_DELAY,
        }
    }

    /// Override the tunnel retry policy.
    #[must_use]
    pub fn with_connect_retries(mut self, retries: u32, delay: Duration) -> Self {
        self.connect_retries = retries;
        self.connect_retry_delay = delay;
        self
    }

    /// Open a tunnel, retrying while the device refuses the port.
    ///
    /// A service started through lockdown may not be listening yet when
    /// the tunnel is opened.
    async fn connect(&self, device_id: DeviceId, port: u16) -> Result<MuxerStream> {
        let mut attempt = 0;
        loop {
            match self.muxer.connect(device_id, port).await {
                Ok(stream) => return Ok(stream),
                Err(MuxerError::Result(ResultCode::ConnectionRefused))
                    if attempt < self.connect_retries =>
                {
                    attempt += 1;
                    debug!(device_id = %device_id, port, attempt, "Connection refused, retrying");
                    tokio::time::sleep(self.connect_retry_delay).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn lockdown(&self, device: &MuxerDevice) -> Result<LockdownClient<MuxerStream>> {
        let stream = self.connect(device.device_id, LOCKDOWN_PORT).await?;
        let mut client = LockdownClient::new(stream);
        client.query_type().await?;
        Ok(client)
    }
}

async fn start_image_mounter<S>(
    mut lockdown: LockdownClient<S>,
) -> std::result::Result<ServiceDescriptor, LockdownError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let service = lockdown.start_service(IMAGE_MOUNTER_SERVICE, None).await?;
    lockdown.stop_session().await?;
    Ok(service)
}

#[async_trait]
impl DeviceHost for UsbmuxHost {
    async fn list_devices(&self) -> Result<Vec<MuxerDevice>> {
        Ok(self.muxer.list_devices().await?)
    }

    async fn validate_pair(
        &self,
        device: &MuxerDevice,
        record: &PairingRecord,
    ) -> Result<PairingStatus> {
        let mut lockdown = self.lockdown(device).await?;
        Ok(lockdown.validate_pair(record).await?)
    }

    async fn pair(&self, device: &MuxerDevice, record: &PairingRecord) -> Result<PairOutcome> {
        let mut lockdown = self.lockdown(device).await?;
        Ok(lockdown.pair(record).await?)
    }

    #[instrument(skip(self, device), fields(udid = %device.udid))]
    async fn new_pairing_record(&self, device: &MuxerDevice) -> Result<PairingRecord> {
        let mut lockdown = self.lockdown(device).await?;
        let public_key = lockdown.device_public_key().await?;
        let wifi_mac_address = lockdown.wifi_mac_address().await?;
        let system_buid = self.muxer.read_buid().await?;

        let mut record = tokio::task::spawn_blocking(move || {
            generate_pairing_record(&public_key, &system_buid)
        })
        .await
        .map_err(|e| LockdownError::Credentials(format!("key generation task failed: {e}")))??;
        record.wifi_mac_address = wifi_mac_address;
        Ok(record)
    }

    async fn product_version(&self, device: &MuxerDevice) -> Result<ProductVersion> {
        let mut lockdown = self.lockdown(device).await?;
        Ok(lockdown.product_version().await?)
    }

    #[instrument(skip(self, device, record), fields(udid = %device.udid))]
    async fn open_image_mounter(
        &self,
        device: &MuxerDevice,
        record: &PairingRecord,
    ) -> Result<Box<dyn ImageMounter>> {
        let mut lockdown = self.lockdown(device).await?;
        let session = lockdown
            .start_session(&record.host_id, &record.system_buid)
            .await?;

        let service = if session.enable_ssl {
            start_image_mounter(lockdown.into_tls(record).await?).await?
        } else {
            start_image_mounter(lockdown).await?
        };
        debug!(
            port = service.port,
            ssl = service.enable_service_ssl,
            "Started image mounter service"
        );

        let stream = self.connect(device.device_id, service.port).await?;
        if service.enable_service_ssl {
            let stream = tls::upgrade(stream, record).await?;
            Ok(Box::new(MobileImageMounterClient::new(stream)))
        } else {
            Ok(Box::new(MobileImageMounterClient::new(stream)))
        }
    }
}

/// A mock device host for testing without devices.
#[cfg(any(test, feature = "test-utils"))]
pub mod mock {
    use std::collections::{HashSet, VecDeque};

    use devicemux_core::Udid;
    use devicemux_lockdown::MockImageMounter;
    use parking_lot::Mutex;

    use super::*;
    use crate::SidecarError;

    /// Escrow bag returned by a successful mock pairing.
    pub const MOCK_ESCROW_BAG: &[u8] = b"escrow";

    /// A device host with scripted devices and trust decisions.
    pub struct MockDeviceHost {
        devices: Mutex<Vec<MuxerDevice>>,
        trusted: Mutex<HashSet<String>>,
        pair_replies: Mutex<VecDeque<PairReply>>,
        pair_calls: Mutex<usize>,
        generated: Mutex<usize>,
        version: Mutex<ProductVersion>,
        validate_error: Mutex<Option<fn() -> LockdownError>>,
        mounter: MockImageMounter,
    }

    enum PairReply {
        Status(PairingStatus),
        Locked,
    }

    fn locked_error() -> LockdownError {
        LockdownError::Protocol {
            request: "Pair".to_string(),
            error: "PasswordProtected".to_string(),
            payload: plist::Dictionary::new(),
        }
    }

    impl Default for MockDeviceHost {
        fn default() -> Self {
            Self {
                devices: Mutex::new(Vec::new()),
                trusted: Mutex::new(HashSet::new()),
                pair_replies: Mutex::new(VecDeque::new()),
                pair_calls: Mutex::new(0),
                generated: Mutex::new(0),
                version: Mutex::new(ProductVersion::new(16, 4, None)),
                validate_error: Mutex::new(None),
                mounter: MockImageMounter::new(),
            }
        }
    }

    impl MockDeviceHost {
        /// Create a host with no devices.
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// Attach a USB device.
        pub fn attach(&self, device_id: u32, udid: &str) -> MuxerDevice {
            let device = MuxerDevice::usb(
                DeviceId::new(device_id),
                Udid::new(udid).unwrap_or_else(|e| panic!("invalid udid {udid}: {e}")),
            );
            self.devices.lock().push(device.clone());
            device
        }

        /// Detach every device.
        pub fn detach_all(&self) {
            self.devices.lock().clear();
        }

        /// Make every device trust records with this host ID.
        pub fn trust(&self, host_id: &str) {
            self.trusted.lock().insert(host_id.to_string());
        }

        /// Queue replies for `pair`. Once drained, `pair` reports the trust
        /// dialog as pending.
        pub fn script_pair(&self, replies: impl IntoIterator<Item = PairingStatus>) {
            self.pair_replies
                .lock()
                .extend(replies.into_iter().map(PairReply::Status));
        }

        /// Queue a `pair` reply refused because the device is locked.
        pub fn script_password_protected(&self) {
            self.pair_replies.lock().push_back(PairReply::Locked);
        }

        /// Make every `validate_pair` fail with the error built by `error`.
        pub fn fail_validation(&self, error: fn() -> LockdownError) {
            *self.validate_error.lock() = Some(error);
        }

        /// Set the reported product version.
        pub fn set_version(&self, version: ProductVersion) {
            *self.version.lock() = version;
        }

        /// Number of `pair` calls.
        #[must_use]
        pub fn pair_calls(&self) -> usize {
            *self.pair_calls.lock()
        }

        /// Number of generated pairing records.
        #[must_use]
        pub fn generated(&self) -> usize {
            *self.generated.lock()
        }

        /// The image mounter handed out by `open_image_mounter`.
        #[must_use]
        pub fn mounter(&self) -> &MockImageMounter {
            &self.mounter
        }
    }

    /// A structurally valid record with the given host ID.
    #[must_use]
    pub fn mock_record(host_id: &str) -> PairingRecord {
        PairingRecord {
            device_certificate: format!("{host_id}-device").into_bytes(),
            host_certificate: format!("{host_id}-host").into_bytes(),
            host_private_key: format!("{host_id}-host-key").into_bytes(),
            root_certificate: format!("{host_id}-root").into_bytes(),
            root_private_key: format!("{host_id}-root-key").into_bytes(),
            host_id: host_id.to_string(),
            system_buid: "MOCK-BUID".to_string(),
            escrow_bag: None,
            wifi_mac_address: None,
        }
    }

    #[async_trait]
    impl DeviceHost for MockDeviceHost {
        async fn list_devices(&self) -> Result<Vec<MuxerDevice>> {
            Ok(self.devices.lock().clone())
        }

        async fn validate_pair(
            &self,
            _device: &MuxerDevice,
            record: &PairingRecord,
        ) -> Result<PairingStatus> {
            let validate_error = *self.validate_error.lock();
            if let Some(error) = validate_error {
                return Err(SidecarError::Lockdown(error()));
            }
            if self.trusted.lock().contains(&record.host_id) {
                Ok(PairingStatus::Success)
            } else {
                Ok(PairingStatus::InvalidPairRecord)
            }
        }

        async fn pair(&self, _device: &MuxerDevice, record: &PairingRecord) -> Result<PairOutcome> {
            *self.pair_calls.lock() += 1;
            let reply = self.pair_replies.lock().pop_front();
            let status = match reply {
                Some(PairReply::Status(status)) => status,
                Some(PairReply::Locked) => return Err(SidecarError::Lockdown(locked_error())),
                None => PairingStatus::PairingDialogResponsePending,
            };

            let escrow_bag = if status == PairingStatus::Success {
                self.trust(&record.host_id);
                Some(MOCK_ESCROW_BAG.to_vec())
            } else {
                None
            };
            Ok(PairOutcome { status, escrow_bag })
        }

        async fn new_pairing_record(&self, _device: &MuxerDevice) -> Result<PairingRecord> {
            let n = {
                let mut generated = self.generated.lock();
                *generated += 1;
                *generated
            };
            Ok(mock_record(&format!("GENERATED-{n}")))
        }

        async fn product_version(&self, _device: &MuxerDevice) -> Result<ProductVersion> {
            Ok(*self.version.lock())
        }

        async fn open_image_mounter(
            &self,
            _device: &MuxerDevice,
            _record: &PairingRecord,
        ) -> Result<Box<dyn ImageMounter>> {
            Ok(Box::new(self.mounter.clone()))
        }
    }
}
