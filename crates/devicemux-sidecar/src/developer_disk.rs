//! Developer disk image provisioning.
//!
//! Debugging and automation services only start once a developer disk
//! image matching the device's OS version is mounted.

use std::sync::Arc;

use devicemux_core::{PairingRecord, ProductVersion};
use devicemux_lockdown::{ImageMounter, DEVELOPER_IMAGE_TYPE};
use devicemux_muxer::MuxerDevice;
use tracing::{debug, info, instrument};

use crate::disks::{DeveloperDisk, DeveloperDiskStore};
use crate::host::DeviceHost;
use crate::Result;

/// Mounts developer disk images on paired devices.
pub struct DeveloperDiskProvisioner {
    host: Arc<dyn DeviceHost>,
    store: Arc<dyn DeveloperDiskStore>,
}

impl DeveloperDiskProvisioner {
    /// Create a provisioner taking images from `store`.
    #[must_use]
    pub fn new(host: Arc<dyn DeviceHost>, store: Arc<dyn DeveloperDiskStore>) -> Self {
        Self { host, store }
    }

    /// Make sure a developer disk image is mounted.
    ///
    /// Returns `false` when no image is mounted and the store has none for
    /// the device's version.
    ///
    /// # Errors
    ///
    /// Returns an error if the image mounter cannot be reached or refuses
    /// the image.
    #[instrument(skip(self, device, record), fields(udid = %device.udid))]
    pub async fn provision(&self, device: &MuxerDevice, record: &PairingRecord) -> Result<bool> {
        let mut mounter = self.host.open_image_mounter(device, record).await?;
        let result = self.mount(device, mounter.as_mut()).await;
        if let Err(e) = mounter.hangup().await {
            debug!(error = %e, "Image mounter hangup failed");
        }
        result
    }

    async fn mount(&self, device: &MuxerDevice, mounter: &mut dyn ImageMounter) -> Result<bool> {
        if !mounter.lookup_image(DEVELOPER_IMAGE_TYPE).await?.is_empty() {
            debug!("Developer disk image already mounted");
            return Ok(true);
        }

        let version = self.host.product_version(device).await?;
        let Some(disk) = self.find_disk(version).await? else {
            info!(version = %version, "No developer disk image for device version");
            return Ok(false);
        };

        mounter
            .upload_image(DEVELOPER_IMAGE_TYPE, &disk.image, &disk.signature)
            .await?;
        mounter
            .mount_image(DEVELOPER_IMAGE_TYPE, &disk.signature)
            .await?;
        info!(version = %version, "Mounted developer disk image");
        Ok(true)
    }

    /// Look up the exact version, then `major.minor` for versions with a
    /// build component.
    async fn find_disk(&self, version: ProductVersion) -> Result<Option<DeveloperDisk>> {
        if let Some(disk) = self.store.find(&version.to_string()).await? {
            return Ok(Some(disk));
        }
        if version.has_build() {
            return self.store.find(&version.major_minor().to_string()).await;
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disks::mock::MemoryDiskStore;
    use crate::host::mock::{mock_record, MockDeviceHost};

    fn disk() -> DeveloperDisk {
        DeveloperDisk {
            image: vec![0u8; 64],
            signature: b"signature".to_vec(),
        }
    }

    fn setup() -> (Arc<MockDeviceHost>, Arc<MemoryDiskStore>, DeveloperDiskProvisioner) {
        let host = Arc::new(MockDeviceHost::new());
        let store = Arc::new(MemoryDiskStore::new());
        let provisioner = DeveloperDiskProvisioner::new(host.clone(), store.clone());
        (host, store, provisioner)
    }

    #[tokio::test]
    async fn mounted_image_needs_nothing() {
        let (host, store, provisioner) = setup();
        let device = host.attach(1, "abc");
        host.mounter().state().mounted.push(b"existing".to_vec());

        assert!(provisioner.provision(&device, &mock_record("H")).await.unwrap());
        assert!(store.lookups().is_empty());
        assert!(host.mounter().state().uploads.is_empty());
        assert_eq!(host.mounter().state().hangups, 1);
    }

    #[tokio::test]
    async fn build_version_falls_back_to_major_minor() {
        let (host, store, provisioner) = setup();
        let device = host.attach(1, "abc");
        host.set_version(ProductVersion::new(13, 4, Some(1)));
        store.insert("13.4", disk());

        assert!(provisioner.provision(&device, &mock_record("H")).await.unwrap());
        assert_eq!(store.lookups(), vec!["13.4.1".to_string(), "13.4".to_string()]);
        let state = host.mounter().state();
        assert_eq!(state.uploads.len(), 1);
        assert_eq!(state.mounts, vec![b"signature".to_vec()]);
    }

    #[tokio::test]
    async fn missing_image_is_not_an_error() {
        let (host, store, provisioner) = setup();
        let device = host.attach(1, "abc");
        host.set_version(ProductVersion::new(16, 4, None));

        assert!(!provisioner.provision(&device, &mock_record("H")).await.unwrap());
        assert_eq!(store.lookups(), vec!["16.4".to_string()]);
        assert_eq!(host.mounter().state().hangups, 1);
    }

    #[tokio::test]
    async fn refused_mount_raises_image_mounter_error() {
        let (host, store, provisioner) = setup();
        let device = host.attach(1, "abc");
        host.set_version(ProductVersion::new(16, 4, None));
        store.insert("16.4", disk());
        host.mounter().fail_mount("ImageMountFailed");

        let err = provisioner
            .provision(&device, &mock_record("H"))
            .await
            .unwrap_err();
        assert!(err.is_image_mounter());
        assert!(err.to_string().contains("ImageMountFailed"));
        assert_eq!(host.mounter().state().hangups, 1);
    }
}
