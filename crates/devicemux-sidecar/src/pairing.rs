//! Pairing record provisioning.
//!
//! A device is usable once the host holds a pairing record the device
//! trusts. Records live in two stores, the muxer's and the cluster's, which
//! can drift apart: the host is reinstalled, the device moves to another
//! node, or the user revokes trust. Each pass validates the stored records
//! against the device, copies the first trusted one over every store that
//! differs, and starts a background pairing task when neither is trusted.

use std::sync::Arc;
use std::time::Duration;

use devicemux_core::{PairingRecord, Udid};
use devicemux_lockdown::PairingStatus;
use devicemux_muxer::MuxerDevice;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::host::DeviceHost;
use crate::registry::PairingTaskRegistry;
use crate::stores::PairingRecordStore;
use crate::types::SidecarConfig;
use crate::Result;

/// Timing of background pairing tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PairingSettings {
    /// Delay between `Pair` attempts while the trust dialog is open.
    pub retry_interval: Duration,
    /// How long to wait for the user before giving up.
    pub timeout: Duration,
}

impl Default for PairingSettings {
    fn default() -> Self {
        Self::from(&SidecarConfig::default())
    }
}

impl From<&SidecarConfig> for PairingSettings {
    fn from(config: &SidecarConfig) -> Self {
        Self {
            retry_interval: config.pairing_retry_interval,
            timeout: config.pairing_timeout,
        }
    }
}

/// Keeps both pairing record stores in line with what the device trusts.
pub struct PairingProvisioner {
    host: Arc<dyn DeviceHost>,
    muxer_store: Arc<dyn PairingRecordStore>,
    cluster_store: Arc<dyn PairingRecordStore>,
    registry: Arc<PairingTaskRegistry>,
    settings: PairingSettings,
    cancel: CancellationToken,
}

impl PairingProvisioner {
    /// Create a provisioner. Pairing tasks stop when `cancel` fires.
    #[must_use]
    pub fn new(
        host: Arc<dyn DeviceHost>,
        muxer_store: Arc<dyn PairingRecordStore>,
        cluster_store: Arc<dyn PairingRecordStore>,
        registry: Arc<PairingTaskRegistry>,
        settings: PairingSettings,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            host,
            muxer_store,
            cluster_store,
            registry,
            settings,
            cancel,
        }
    }

    /// The registry of background pairing tasks.
    #[must_use]
    pub fn registry(&self) -> &Arc<PairingTaskRegistry> {
        &self.registry
    }

    /// Return the record the device trusts, after copying it to every store
    /// holding something else.
    ///
    /// Returns `None` when no stored record is trusted. A pairing task is
    /// then running for the device; this call does not wait for it.
    ///
    /// # Errors
    ///
    /// Returns an error if a store cannot be read or written, or if the
    /// device cannot be reached to validate a record.
    #[instrument(skip(self, device), fields(udid = %device.udid))]
    pub async fn provision(&self, device: &MuxerDevice) -> Result<Option<PairingRecord>> {
        let udid = &device.udid;
        let muxer_record = read_store(&*self.muxer_store, udid).await?;
        let cluster_record = read_store(&*self.cluster_store, udid).await?;

        let mut winner = None;
        for (store, record) in [
            (&self.muxer_store, &muxer_record),
            (&self.cluster_store, &cluster_record),
        ] {
            let Some(record) = record else {
                continue;
            };
            if self.validates(device, record).await? {
                debug!(store = store.name(), "Pairing record validated");
                winner = Some(record.clone());
                break;
            }
        }

        let Some(winner) = winner else {
            self.ensure_pairing(device);
            return Ok(None);
        };

        sync_store(&*self.muxer_store, udid, muxer_record.as_ref(), &winner).await?;
        sync_store(&*self.cluster_store, udid, cluster_record.as_ref(), &winner).await?;
        Ok(Some(winner))
    }

    /// Transient errors propagate. Only a device rejection counts as
    /// untrusted.
    async fn validates(&self, device: &MuxerDevice, record: &PairingRecord) -> Result<bool> {
        match self.host.validate_pair(device, record).await {
            Ok(PairingStatus::Success) => Ok(true),
            Ok(status) => {
                debug!(udid = %device.udid, status = %status, "Pairing record rejected");
                Ok(false)
            }
            Err(e) if e.is_retriable() => Err(e),
            Err(e) => {
                warn!(udid = %device.udid, error = %e, "Device rejected pairing record");
                Ok(false)
            }
        }
    }

    fn ensure_pairing(&self, device: &MuxerDevice) {
        let task = PairingTask {
            host: Arc::clone(&self.host),
            muxer_store: Arc::clone(&self.muxer_store),
            cluster_store: Arc::clone(&self.cluster_store),
            device: device.clone(),
            settings: self.settings,
            cancel: self.cancel.child_token(),
        };
        if self.registry.ensure_running(&device.udid, move || task.run()) {
            info!(udid = %device.udid, "Device not trusted, waiting for the user to pair");
        }
    }
}

/// Read a store, treating an unreadable record as absent so it gets
/// replaced.
async fn read_store(store: &dyn PairingRecordStore, udid: &Udid) -> Result<Option<PairingRecord>> {
    match store.read(udid).await {
        Ok(record) => Ok(record),
        Err(e) if e.is_retriable() => Err(e),
        Err(e) => {
            warn!(udid = %udid, store = store.name(), error = %e, "Ignoring invalid pairing record");
            Ok(None)
        }
    }
}

/// Replace the store's record with `winner` unless it already matches.
async fn sync_store(
    store: &dyn PairingRecordStore,
    udid: &Udid,
    current: Option<&PairingRecord>,
    winner: &PairingRecord,
) -> Result<()> {
    if current == Some(winner) {
        return Ok(());
    }
    if current.is_some() {
        store.delete(udid).await?;
    }
    store.write(udid, winner).await?;
    info!(udid = %udid, store = store.name(), "Updated stale pairing record");
    Ok(())
}

struct PairingTask {
    host: Arc<dyn DeviceHost>,
    muxer_store: Arc<dyn PairingRecordStore>,
    cluster_store: Arc<dyn PairingRecordStore>,
    device: MuxerDevice,
    settings: PairingSettings,
    cancel: CancellationToken,
}

impl PairingTask {
    async fn run(self) {
        let udid = self.device.udid.clone();
        tokio::select! {
            () = self.cancel.cancelled() => {
                debug!(udid = %udid, "Pairing cancelled");
            }
            result = tokio::time::timeout(self.settings.timeout, self.pair()) => match result {
                Ok(Ok(PairingStatus::Success)) => {
                    info!(udid = %udid, "Device paired");
                }
                Ok(Ok(status)) => {
                    warn!(udid = %udid, status = %status, "Device refused pairing");
                }
                Ok(Err(e)) => {
                    warn!(udid = %udid, error = %e, "Pairing failed");
                }
                Err(_) => {
                    warn!(
                        udid = %udid,
                        timeout_secs = self.settings.timeout.as_secs(),
                        "Timed out waiting for the user to trust this host"
                    );
                }
            },
        }
    }

    async fn pair(&self) -> Result<PairingStatus> {
        let udid = &self.device.udid;
        let mut record = self.host.new_pairing_record(&self.device).await?;

        loop {
            let outcome = match self.host.pair(&self.device, &record).await {
                Ok(outcome) => outcome,
                Err(e) if e.is_password_protected() => {
                    debug!(udid = %udid, "Device locked, waiting for the user");
                    tokio::time::sleep(self.settings.retry_interval).await;
                    continue;
                }
                Err(e) => return Err(e),
            };
            if outcome.status.is_pending() {
                debug!(udid = %udid, status = %outcome.status, "Waiting for the user");
                tokio::time::sleep(self.settings.retry_interval).await;
                continue;
            }
            if outcome.status != PairingStatus::Success {
                return Ok(outcome.status);
            }

            record.escrow_bag = outcome.escrow_bag;
            self.muxer_store.write(udid, &record).await?;
            self.cluster_store.write(udid, &record).await?;
            return Ok(PairingStatus::Success);
        }
    }
}

#[cfg(test)]
mod tests {
    use devicemux_core::DeviceId;
    use devicemux_lockdown::LockdownError;

    use super::*;
    use crate::host::mock::{mock_record, MockDeviceHost, MOCK_ESCROW_BAG};
    use crate::stores::mock::MemoryRecordStore;

    struct Fixture {
        host: Arc<MockDeviceHost>,
        muxer: Arc<MemoryRecordStore>,
        cluster: Arc<MemoryRecordStore>,
        cancel: CancellationToken,
        provisioner: PairingProvisioner,
        device: MuxerDevice,
    }

    fn fixture() -> Fixture {
        let host = Arc::new(MockDeviceHost::new());
        let muxer = Arc::new(MemoryRecordStore::new("muxer"));
        let cluster = Arc::new(MemoryRecordStore::new("cluster"));
        let cancel = CancellationToken::new();
        let device = host.attach(1, "abc");
        let provisioner = PairingProvisioner::new(
            host.clone(),
            muxer.clone(),
            cluster.clone(),
            Arc::new(PairingTaskRegistry::new()),
            PairingSettings {
                retry_interval: Duration::from_millis(5),
                timeout: Duration::from_secs(30),
            },
            cancel.clone(),
        );
        Fixture {
            host,
            muxer,
            cluster,
            cancel,
            provisioner,
            device,
        }
    }

    async fn wait_for_pairing(f: &Fixture) {
        while f.provisioner.registry().is_running(&f.device.udid) {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    #[tokio::test]
    async fn trusted_muxer_record_is_copied_to_cluster() {
        let f = fixture();
        let record = mock_record("HOST-A");
        f.host.trust("HOST-A");
        f.muxer.insert(&f.device.udid, record.clone());

        let winner = f.provisioner.provision(&f.device).await.unwrap();

        assert_eq!(winner, Some(record.clone()));
        assert_eq!(f.cluster.get(&f.device.udid), Some(record));
        assert_eq!(f.cluster.writes(), 1);
        assert_eq!(f.cluster.deletes(), 0);
        assert_eq!(f.muxer.writes(), 0);
    }

    #[tokio::test]
    async fn stale_store_is_rewritten_once() {
        let f = fixture();
        let stale = mock_record("HOST-OLD");
        let trusted = mock_record("HOST-NEW");
        f.host.trust("HOST-NEW");
        f.muxer.insert(&f.device.udid, stale);
        f.cluster.insert(&f.device.udid, trusted.clone());

        let winner = f.provisioner.provision(&f.device).await.unwrap();

        assert_eq!(winner, Some(trusted.clone()));
        assert_eq!(f.muxer.get(&f.device.udid), Some(trusted));
        assert_eq!(f.muxer.deletes(), 1);
        assert_eq!(f.muxer.writes(), 1);
        assert_eq!(f.cluster.deletes(), 0);
        assert_eq!(f.cluster.writes(), 0);

        f.provisioner.provision(&f.device).await.unwrap();
        assert_eq!(f.muxer.writes(), 1);
        assert_eq!(f.cluster.writes(), 0);
    }

    #[tokio::test]
    async fn untrusted_device_starts_one_pairing_task() {
        let f = fixture();

        assert!(f.provisioner.provision(&f.device).await.unwrap().is_none());
        assert!(f.provisioner.provision(&f.device).await.unwrap().is_none());

        assert_eq!(f.provisioner.registry().len(), 1);
        while f.host.pair_calls() == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        assert!(f.provisioner.provision(&f.device).await.unwrap().is_none());
        f.cancel.cancel();
        wait_for_pairing(&f).await;
        assert_eq!(f.host.generated(), 1);
        assert_eq!(f.muxer.writes(), 0);
        assert_eq!(f.cluster.writes(), 0);
    }

    #[tokio::test]
    async fn rejected_validation_counts_as_untrusted() {
        let f = fixture();
        f.host.trust("HOST-A");
        f.host.fail_validation(|| LockdownError::Protocol {
            request: "ValidatePair".to_string(),
            error: "InvalidHostID".to_string(),
            payload: plist::Dictionary::new(),
        });
        f.muxer.insert(&f.device.udid, mock_record("HOST-A"));

        assert!(f.provisioner.provision(&f.device).await.unwrap().is_none());
        assert!(f.provisioner.registry().is_running(&f.device.udid));
        f.cancel.cancel();
    }

    #[tokio::test]
    async fn transient_validation_error_keeps_trusted_records() {
        let f = fixture();
        let record = mock_record("HOST-A");
        f.host.trust("HOST-A");
        f.host.fail_validation(|| LockdownError::ConnectionClosed);
        f.muxer.insert(&f.device.udid, record.clone());
        f.cluster.insert(&f.device.udid, record.clone());

        let err = f.provisioner.provision(&f.device).await.unwrap_err();

        assert!(err.is_retriable());
        assert!(f.provisioner.registry().is_empty());
        assert_eq!(f.host.generated(), 0);
        assert_eq!(f.muxer.get(&f.device.udid), Some(record.clone()));
        assert_eq!(f.cluster.get(&f.device.udid), Some(record));
        assert_eq!(f.muxer.writes() + f.cluster.writes(), 0);
        assert_eq!(f.muxer.deletes() + f.cluster.deletes(), 0);
    }

    #[tokio::test]
    async fn accepted_pairing_is_stored_in_both_stores() {
        let f = fixture();
        f.host.script_pair([PairingStatus::PairingDialogResponsePending]);
        f.host.script_password_protected();
        f.host.script_pair([PairingStatus::Success]);

        assert!(f.provisioner.provision(&f.device).await.unwrap().is_none());
        wait_for_pairing(&f).await;

        assert_eq!(f.host.pair_calls(), 3);
        let stored = f.muxer.get(&f.device.udid).unwrap();
        assert_eq!(stored.escrow_bag.as_deref(), Some(MOCK_ESCROW_BAG));
        assert_eq!(f.cluster.get(&f.device.udid), Some(stored.clone()));

        let winner = f.provisioner.provision(&f.device).await.unwrap();
        assert_eq!(winner, Some(stored));
        assert_eq!(f.muxer.writes(), 1);
        assert_eq!(f.cluster.writes(), 1);
    }

    #[tokio::test]
    async fn denied_pairing_stores_nothing() {
        let f = fixture();
        f.host.script_pair([PairingStatus::UserDeniedPairing]);

        f.provisioner.provision(&f.device).await.unwrap();
        wait_for_pairing(&f).await;

        assert_eq!(f.host.pair_calls(), 1);
        assert!(f.muxer.get(&f.device.udid).is_none());
        assert!(f.cluster.get(&f.device.udid).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn pairing_gives_up_after_timeout() {
        let host = Arc::new(MockDeviceHost::new());
        let device = MuxerDevice::usb(DeviceId::new(1), Udid::new("abc").unwrap());
        let registry = Arc::new(PairingTaskRegistry::new());
        let provisioner = PairingProvisioner::new(
            host.clone(),
            Arc::new(MemoryRecordStore::new("muxer")),
            Arc::new(MemoryRecordStore::new("cluster")),
            Arc::clone(&registry),
            PairingSettings {
                retry_interval: Duration::from_secs(1),
                timeout: Duration::from_secs(10),
            },
            CancellationToken::new(),
        );

        provisioner.provision(&device).await.unwrap();
        tokio::time::sleep(Duration::from_secs(11)).await;
        tokio::task::yield_now().await;

        assert!(!registry.is_running(&device.udid));
        assert!((10..=11).contains(&host.pair_calls()));
    }
}
