//! Fleet reconciliation.
//!
//! The reconciler makes the `MobileDevice` resources owned by this sidecar
//! match the devices the muxer reports. A pass runs at startup and after
//! every attach, detach or paired notification:
//!
//! 1. resolve the sidecar pod, which owns every resource it creates
//! 2. create a resource for each live device that has none
//! 3. provision pairing and the developer disk, and record the outcome in
//!    the `Paired`, `DeveloperDiskMounted` and `Ready` conditions
//! 4. delete resources whose device is gone
//!
//! A failing pass ends [`Reconciler::run`] with the error.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use devicemux_core::Udid;
use devicemux_muxer::{ConnectionType, ListenAction, MuxerClient, MuxerDevice, MuxerError};
use kube::ResourceExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::cluster::DeviceRepository;
use crate::conditions::{
    REASON_MOUNTED, REASON_MOUNT_FAILED, REASON_NEW, REASON_NOT_PAIRED, REASON_NOT_TRUSTED,
    REASON_NO_DEVELOPER_DISK, REASON_PAIRED,
};
use crate::crd::{build_mobile_device, ConditionStatus, ConditionType, MobileDevice, MobileDeviceStatus};
use crate::developer_disk::DeveloperDiskProvisioner;
use crate::host::DeviceHost;
use crate::pairing::PairingProvisioner;
use crate::{Result, SidecarError};

/// Drives `MobileDevice` resources from the live device list.
pub struct Reconciler {
    pod_name: String,
    repository: Arc<dyn DeviceRepository>,
    host: Arc<dyn DeviceHost>,
    pairing: PairingProvisioner,
    disks: DeveloperDiskProvisioner,
    ready: Arc<AtomicBool>,
}

impl Reconciler {
    /// Create a reconciler for the devices of `pod_name`.
    #[must_use]
    pub fn new(
        pod_name: impl Into<String>,
        repository: Arc<dyn DeviceRepository>,
        host: Arc<dyn DeviceHost>,
        pairing: PairingProvisioner,
        disks: DeveloperDiskProvisioner,
    ) -> Self {
        Self {
            pod_name: pod_name.into(),
            repository,
            host,
            pairing,
            disks,
            ready: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Flag set once the first pass has succeeded.
    #[must_use]
    pub fn readiness(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.ready)
    }

    /// The pairing provisioner.
    #[must_use]
    pub fn pairing(&self) -> &PairingProvisioner {
        &self.pairing
    }

    /// Run a pass now and again for every message on `events`.
    ///
    /// Returns `Ok(())` when `cancel` fires or every event sender is gone.
    ///
    /// # Errors
    ///
    /// Returns the error of the first failing pass.
    pub async fn run(
        &self,
        mut events: mpsc::Receiver<()>,
        cancel: CancellationToken,
    ) -> Result<()> {
        self.pass().await?;

        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    info!("Reconciler stopped");
                    return Ok(());
                }
                event = events.recv() => {
                    if event.is_none() {
                        info!("Device event stream ended");
                        return Ok(());
                    }
                    self.pass().await?;
                }
            }
        }
    }

    async fn pass(&self) -> Result<()> {
        match self.reconcile_once().await {
            Ok(()) => {
                self.ready.store(true, Ordering::SeqCst);
                Ok(())
            }
            Err(e) => {
                error!(pod = %self.pod_name, error = %e, "Reconciliation pass failed");
                Err(e)
            }
        }
    }

    /// Run one reconciliation pass.
    ///
    /// # Errors
    ///
    /// Returns `SidecarError::PodNotFound` if the sidecar pod does not
    /// exist, or any cluster, muxer or device error other than a refused
    /// developer disk image.
    #[instrument(skip(self), fields(pod = %self.pod_name))]
    pub async fn reconcile_once(&self) -> Result<()> {
        let owner = self
            .repository
            .owner_pod()
            .await?
            .ok_or_else(|| SidecarError::PodNotFound(self.pod_name.clone()))?;

        let mut unmatched: BTreeMap<String, MobileDevice> = self
            .repository
            .list_devices()
            .await?
            .into_iter()
            .map(|device| (device.name_any(), device))
            .collect();

        let live = dedupe(self.host.list_devices().await?);
        debug!(live = live.len(), existing = unmatched.len(), "Reconciling devices");

        for device in &live {
            let name = device.udid.resource_name();
            let mut status = match unmatched.remove(&name) {
                Some(existing) => existing.status.unwrap_or_default(),
                None => {
                    let resource = build_mobile_device(&device.udid, &self.pod_name, owner.clone());
                    let created = self.repository.create_device(&resource).await?;
                    let mut status = created.status.unwrap_or_default();
                    status.set_condition(
                        ConditionType::Ready,
                        ConditionStatus::False,
                        REASON_NEW,
                        None,
                        Utc::now(),
                    );
                    status
                }
            };

            self.reconcile_device(device, &mut status).await?;
            self.repository.update_status(&name, &status).await?;
        }

        for name in unmatched.keys() {
            info!(name = %name, "Device detached, deleting MobileDevice");
            self.repository.delete_device(name).await?;
        }

        Ok(())
    }

    async fn reconcile_device(
        &self,
        device: &MuxerDevice,
        status: &mut MobileDeviceStatus,
    ) -> Result<()> {
        let record = self.pairing.provision(device).await?;

        if record.is_some() {
            status.set_condition(
                ConditionType::Paired,
                ConditionStatus::True,
                REASON_PAIRED,
                None,
                Utc::now(),
            );
        } else {
            status.set_condition(
                ConditionType::Paired,
                ConditionStatus::False,
                REASON_NOT_TRUSTED,
                Some("Waiting for the user to trust this host".to_string()),
                Utc::now(),
            );
        }

        let (mounted, reason, message) = match record {
            None => (false, REASON_NOT_PAIRED, None),
            Some(record) => match self.disks.provision(device, &record).await {
                Ok(true) => (true, REASON_MOUNTED, None),
                Ok(false) => (false, REASON_NO_DEVELOPER_DISK, None),
                Err(e) if e.is_image_mounter() => {
                    warn!(udid = %device.udid, error = %e, "Developer disk image was refused");
                    (false, REASON_MOUNT_FAILED, Some(e.to_string()))
                }
                Err(e) => return Err(e),
            },
        };
        status.set_condition(
            ConditionType::DeveloperDiskMounted,
            mounted.into(),
            reason,
            message,
            Utc::now(),
        );

        status.update_ready(Utc::now());
        Ok(())
    }
}

/// Keep one entry per UDID, preferring USB over network connections.
fn dedupe(devices: Vec<MuxerDevice>) -> Vec<MuxerDevice> {
    let mut order: Vec<Udid> = Vec::new();
    let mut by_udid: HashMap<Udid, MuxerDevice> = HashMap::new();

    for device in devices {
        match by_udid.get(&device.udid) {
            None => {
                order.push(device.udid.clone());
                by_udid.insert(device.udid.clone(), device);
            }
            Some(existing)
                if matches!(existing.connection_type, ConnectionType::Network)
                    && matches!(device.connection_type, ConnectionType::Usb) =>
            {
                by_udid.insert(device.udid.clone(), device);
            }
            Some(_) => {}
        }
    }

    order
        .into_iter()
        .filter_map(|udid| by_udid.remove(&udid))
        .collect()
}

/// Forward muxer notifications to `events` until cancelled.
///
/// Notifications are coalesced: while a pass is pending, further events
/// are dropped. The subscription is renewed after `retry_interval` when the
/// muxer closes it or cannot be reached.
pub async fn listen_loop(
    muxer: MuxerClient,
    events: mpsc::Sender<()>,
    retry_interval: Duration,
    cancel: CancellationToken,
) {
    loop {
        let tx = events.clone();
        let result = muxer
            .listen(
                move |event| {
                    debug!(event = ?event, "Device event");
                    match tx.try_send(()) {
                        Ok(()) | Err(mpsc::error::TrySendError::Full(())) => {
                            ListenAction::Continue
                        }
                        Err(mpsc::error::TrySendError::Closed(())) => ListenAction::Stop,
                    }
                },
                &cancel,
            )
            .await;

        match result {
            Ok(true) | Err(MuxerError::Cancelled) => return,
            Ok(false) => info!(endpoint = %muxer.endpoint(), "Muxer closed the event stream"),
            Err(e) => warn!(endpoint = %muxer.endpoint(), error = %e, "Muxer event stream failed"),
        }

        tokio::select! {
            () = cancel.cancelled() => return,
            () = tokio::time::sleep(retry_interval) => {}
        }
    }
}
