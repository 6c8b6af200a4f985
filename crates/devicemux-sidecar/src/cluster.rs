//! Cluster access for `MobileDevice` resources.
//!
//! The reconciler talks to the cluster through the [`DeviceRepository`]
//! trait. [`KubeDeviceRepository`] implements it against the API server.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::Client;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::crd::{managed_selector, MobileDevice, MobileDeviceStatus};
use crate::{Result, SidecarError};

/// Access to the cluster state of the devices managed by one sidecar pod.
#[async_trait]
pub trait DeviceRepository: Send + Sync {
    /// Return an owner reference to the sidecar pod, or `None` if the pod
    /// does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the pod cannot be read.
    async fn owner_pod(&self) -> Result<Option<OwnerReference>>;

    /// List the devices managed by this sidecar.
    ///
    /// # Errors
    ///
    /// Returns an error if listing fails.
    async fn list_devices(&self) -> Result<Vec<MobileDevice>>;

    /// Create a device resource. Creating a resource that already exists
    /// returns the existing one.
    ///
    /// # Errors
    ///
    /// Returns an error if creation fails.
    async fn create_device(&self, device: &MobileDevice) -> Result<MobileDevice>;

    /// Delete a device resource.
    ///
    /// # Errors
    ///
    /// Returns an error if deletion fails (except 404).
    async fn delete_device(&self, name: &str) -> Result<()>;

    /// Replace the status of a device resource.
    ///
    /// # Errors
    ///
    /// Returns an error if the status update fails.
    async fn update_status(&self, name: &str, status: &MobileDeviceStatus) -> Result<()>;
}

/// Kubernetes-backed device repository.
pub struct KubeDeviceRepository {
    client: Client,
    namespace: String,
    pod_name: String,
}

impl KubeDeviceRepository {
    /// Create a repository for the devices of `pod_name` in `namespace`.
    #[must_use]
    pub fn new(client: Client, namespace: impl Into<String>, pod_name: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
            pod_name: pod_name.into(),
        }
    }

    fn devices_api(&self) -> Api<MobileDevice> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn pods_api(&self) -> Api<Pod> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }
}

/// Build an owner reference to a pod.
///
/// # Errors
///
/// Returns `SidecarError::InvalidResource` if the pod has no name or UID.
pub fn pod_owner_reference(pod: &Pod) -> Result<OwnerReference> {
    let name = pod.metadata.name.clone().ok_or_else(|| SidecarError::InvalidResource {
        name: "<unnamed pod>".to_string(),
        reason: "pod has no name".to_string(),
    })?;
    let uid = pod.metadata.uid.clone().ok_or_else(|| SidecarError::InvalidResource {
        name: name.clone(),
        reason: "pod has no uid".to_string(),
    })?;

    Ok(OwnerReference {
        api_version: "v1".to_string(),
        kind: "Pod".to_string(),
        name,
        uid,
        controller: Some(true),
        block_owner_deletion: None,
    })
}

#[async_trait]
impl DeviceRepository for KubeDeviceRepository {
    async fn owner_pod(&self) -> Result<Option<OwnerReference>> {
        match self.pods_api().get_opt(&self.pod_name).await? {
            Some(pod) => Ok(Some(pod_owner_reference(&pod)?)),
            None => Ok(None),
        }
    }

    async fn list_devices(&self) -> Result<Vec<MobileDevice>> {
        let params = ListParams::default().labels(&managed_selector(&self.pod_name));
        let list = self.devices_api().list(&params).await?;
        Ok(list.items)
    }

    async fn create_device(&self, device: &MobileDevice) -> Result<MobileDevice> {
        let api = self.devices_api();
        let name = device.metadata.name.clone().unwrap_or_default();

        match api.create(&PostParams::default(), device).await {
            Ok(created) => {
                info!(name = %name, owner = %self.pod_name, "Created MobileDevice");
                Ok(created)
            }
            Err(kube::Error::Api(e)) if e.code == 409 => {
                debug!(name = %name, "MobileDevice already exists");
                Ok(api.get(&name).await?)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_device(&self, name: &str) -> Result<()> {
        match self
            .devices_api()
            .delete(name, &DeleteParams::default())
            .await
        {
            Ok(_) => {
                info!(name, "Deleted MobileDevice");
                Ok(())
            }
            Err(kube::Error::Api(e)) if e.code == 404 => {
                warn!(name, "MobileDevice not found, already deleted");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn update_status(&self, name: &str, status: &MobileDeviceStatus) -> Result<()> {
        let patch = json!({ "status": status });
        self.devices_api()
            .patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        debug!(name, "Updated MobileDevice status");
        Ok(())
    }
}

/// A mock repository for testing without a cluster.
#[cfg(any(test, feature = "test-utils"))]
pub mod mock {
    use std::collections::BTreeMap;

    use parking_lot::Mutex;

    use super::*;
    use kube::ResourceExt;

    /// A device repository that keeps resources in memory.
    pub struct MockDeviceRepository {
        owner: Mutex<Option<OwnerReference>>,
        devices: Mutex<BTreeMap<String, MobileDevice>>,
        created: Mutex<Vec<String>>,
        deleted: Mutex<Vec<String>>,
    }

    impl Default for MockDeviceRepository {
        fn default() -> Self {
            Self::new("sidecar-0")
        }
    }

    impl MockDeviceRepository {
        /// Create a repository whose sidecar pod exists.
        #[must_use]
        pub fn new(pod_name: &str) -> Self {
            let owner = OwnerReference {
                api_version: "v1".to_string(),
                kind: "Pod".to_string(),
                name: pod_name.to_string(),
                uid: format!("{pod_name}-uid"),
                controller: Some(true),
                block_owner_deletion: None,
            };
            Self {
                owner: Mutex::new(Some(owner)),
                devices: Mutex::new(BTreeMap::new()),
                created: Mutex::new(Vec::new()),
                deleted: Mutex::new(Vec::new()),
            }
        }

        /// Create a repository whose sidecar pod does not exist.
        #[must_use]
        pub fn without_owner() -> Self {
            let repo = Self::default();
            *repo.owner.lock() = None;
            repo
        }

        /// Add an existing resource.
        pub fn insert(&self, device: MobileDevice) {
            self.devices.lock().insert(device.name_any(), device);
        }

        /// Get a resource by name.
        #[must_use]
        pub fn device(&self, name: &str) -> Option<MobileDevice> {
            self.devices.lock().get(name).cloned()
        }

        /// Names of all stored resources.
        #[must_use]
        pub fn names(&self) -> Vec<String> {
            self.devices.lock().keys().cloned().collect()
        }

        /// Names passed to `create_device`.
        #[must_use]
        pub fn created(&self) -> Vec<String> {
            self.created.lock().clone()
        }

        /// Names passed to `delete_device`.
        #[must_use]
        pub fn deleted(&self) -> Vec<String> {
            self.deleted.lock().clone()
        }
    }

    #[async_trait]
    impl DeviceRepository for MockDeviceRepository {
        async fn owner_pod(&self) -> Result<Option<OwnerReference>> {
            Ok(self.owner.lock().clone())
        }

        async fn list_devices(&self) -> Result<Vec<MobileDevice>> {
            Ok(self.devices.lock().values().cloned().collect())
        }

        async fn create_device(&self, device: &MobileDevice) -> Result<MobileDevice> {
            let name = device.name_any();
            self.created.lock().push(name.clone());
            Ok(self
                .devices
                .lock()
                .entry(name)
                .or_insert_with(|| device.clone())
                .clone())
        }

        async fn delete_device(&self, name: &str) -> Result<()> {
            self.deleted.lock().push(name.to_string());
            self.devices.lock().remove(name);
            Ok(())
        }

        async fn update_status(&self, name: &str, status: &MobileDeviceStatus) -> Result<()> {
            match self.devices.lock().get_mut(name) {
                Some(device) => {
                    device.status = Some(status.clone());
                    Ok(())
                }
                None => Err(SidecarError::InvalidResource {
                    name: name.to_string(),
                    reason: "not found".to_string(),
                }),
            }
        }
    }
}
