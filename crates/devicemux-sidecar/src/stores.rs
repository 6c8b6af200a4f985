//! Pairing record stores.
//!
//! A device's pairing record lives in two places: the muxer's local store,
//! used by every process on the host that talks to the device, and a cluster
//! Secret, which survives the host being reinstalled or the device moving
//! to another node.

use std::collections::BTreeMap;

use async_trait::async_trait;
use devicemux_core::{PairingRecord, Udid};
use devicemux_muxer::MuxerClient;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::ByteString;
use kube::api::{Api, DeleteParams, ObjectMeta, PostParams};
use kube::Client;
use tracing::{debug, info};

use crate::crd::{OS_LABEL, OS_VALUE, UDID_LABEL};
use crate::{Result, SidecarError};

/// Secret type of stored pairing records.
pub const PAIRING_SECRET_TYPE: &str = "devicemux.io/pairing-record";

const DEVICE_CERTIFICATE_KEY: &str = "deviceCertificate";
const HOST_CERTIFICATE_KEY: &str = "hostCertificate";
const HOST_PRIVATE_KEY_KEY: &str = "hostPrivateKey";
const ROOT_CERTIFICATE_KEY: &str = "rootCertificate";
const ROOT_PRIVATE_KEY_KEY: &str = "rootPrivateKey";
const HOST_ID_KEY: &str = "hostId";
const SYSTEM_BUID_KEY: &str = "systemBuid";
const ESCROW_BAG_KEY: &str = "escrowBag";
const WIFI_MAC_ADDRESS_KEY: &str = "wifiMacAddress";

/// A place where pairing records are kept, keyed by UDID.
#[async_trait]
pub trait PairingRecordStore: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Read the record for a device.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unreachable or the record is invalid.
    async fn read(&self, udid: &Udid) -> Result<Option<PairingRecord>>;

    /// Store a record for a device.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be written.
    async fn write(&self, udid: &Udid, record: &PairingRecord) -> Result<()>;

    /// Delete the record for a device.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be deleted.
    async fn delete(&self, udid: &Udid) -> Result<()>;
}

/// The muxer's local pairing record store.
#[derive(Debug, Clone)]
pub struct MuxerRecordStore {
    muxer: MuxerClient,
}

impl MuxerRecordStore {
    /// Create a store backed by a muxer.
    #[must_use]
    pub fn new(muxer: MuxerClient) -> Self {
        Self { muxer }
    }
}

#[async_trait]
impl PairingRecordStore for MuxerRecordStore {
    fn name(&self) -> &'static str {
        "muxer"
    }

    async fn read(&self, udid: &Udid) -> Result<Option<PairingRecord>> {
        Ok(self.muxer.read_pairing_record(udid).await?)
    }

    async fn write(&self, udid: &Udid, record: &PairingRecord) -> Result<()> {
        Ok(self.muxer.save_pairing_record(udid, record).await?)
    }

    async fn delete(&self, udid: &Udid) -> Result<()> {
        Ok(self.muxer.delete_pairing_record(udid).await?)
    }
}

/// Pairing records stored as cluster Secrets.
///
/// Secrets carry no owner reference so they outlive the sidecar pod.
pub struct SecretRecordStore {
    client: Client,
    namespace: String,
}

impl SecretRecordStore {
    /// Create a store for Secrets in `namespace`.
    #[must_use]
    pub fn new(client: Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
        }
    }

    fn secrets_api(&self) -> Api<Secret> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }
}

/// Name of the Secret holding a device's pairing record.
#[must_use]
pub fn secret_name(udid: &Udid) -> String {
    format!("{}-pairing", udid.resource_name())
}

/// Build the Secret holding a pairing record.
#[must_use]
pub fn record_to_secret(udid: &Udid, record: &PairingRecord) -> Secret {
    let mut data = BTreeMap::new();
    let mut put = |key: &str, value: &[u8]| {
        data.insert(key.to_string(), ByteString(value.to_vec()));
    };
    put(DEVICE_CERTIFICATE_KEY, &record.device_certificate);
    put(HOST_CERTIFICATE_KEY, &record.host_certificate);
    put(HOST_PRIVATE_KEY_KEY, &record.host_private_key);
    put(ROOT_CERTIFICATE_KEY, &record.root_certificate);
    put(ROOT_PRIVATE_KEY_KEY, &record.root_private_key);
    put(HOST_ID_KEY, record.host_id.as_bytes());
    put(SYSTEM_BUID_KEY, record.system_buid.as_bytes());
    if let Some(bag) = &record.escrow_bag {
        put(ESCROW_BAG_KEY, bag);
    }
    if let Some(mac) = &record.wifi_mac_address {
        put(WIFI_MAC_ADDRESS_KEY, mac.as_bytes());
    }

    let mut labels = BTreeMap::new();
    labels.insert(OS_LABEL.to_string(), OS_VALUE.to_string());
    labels.insert(UDID_LABEL.to_string(), udid.to_string());

    Secret {
        metadata: ObjectMeta {
            name: Some(secret_name(udid)),
            labels: Some(labels),
            ..Default::default()
        },
        type_: Some(PAIRING_SECRET_TYPE.to_string()),
        data: Some(data),
        ..Default::default()
    }
}

/// Read a pairing record from a Secret.
///
/// # Errors
///
/// Returns `SidecarError::InvalidResource` if a required key is missing or a
/// text field is not UTF-8.
pub fn record_from_secret(secret: &Secret) -> Result<PairingRecord> {
    let name = secret.metadata.name.clone().unwrap_or_default();
    let empty = BTreeMap::new();
    let data = secret.data.as_ref().unwrap_or(&empty);

    let bytes = |key: &str| data.get(key).map(|v| v.0.clone());
    let required = |key: &str| {
        bytes(key).ok_or_else(|| SidecarError::InvalidResource {
            name: name.clone(),
            reason: format!("missing key {key}"),
        })
    };
    let text = |key: &str, value: Vec<u8>| {
        String::from_utf8(value).map_err(|_| SidecarError::InvalidResource {
            name: name.clone(),
            reason: format!("{key} is not UTF-8"),
        })
    };

    Ok(PairingRecord {
        device_certificate: required(DEVICE_CERTIFICATE_KEY)?,
        host_certificate: required(HOST_CERTIFICATE_KEY)?,
        host_private_key: required(HOST_PRIVATE_KEY_KEY)?,
        root_certificate: required(ROOT_CERTIFICATE_KEY)?,
        root_private_key: required(ROOT_PRIVATE_KEY_KEY)?,
        host_id: text(HOST_ID_KEY, required(HOST_ID_KEY)?)?,
        system_buid: text(SYSTEM_BUID_KEY, required(SYSTEM_BUID_KEY)?)?,
        escrow_bag: bytes(ESCROW_BAG_KEY),
        wifi_mac_address: bytes(WIFI_MAC_ADDRESS_KEY)
            .map(|v| text(WIFI_MAC_ADDRESS_KEY, v))
            .transpose()?,
    })
}

#[async_trait]
impl PairingRecordStore for SecretRecordStore {
    fn name(&self) -> &'static str {
        "cluster"
    }

    async fn read(&self, udid: &Udid) -> Result<Option<PairingRecord>> {
        match self.secrets_api().get_opt(&secret_name(udid)).await? {
            Some(secret) => Ok(Some(record_from_secret(&secret)?)),
            None => Ok(None),
        }
    }

    async fn write(&self, udid: &Udid, record: &PairingRecord) -> Result<()> {
        let api = self.secrets_api();
        let secret = record_to_secret(udid, record);
        let name = secret_name(udid);

        match api.create(&PostParams::default(), &secret).await {
            Ok(_) => {}
            Err(kube::Error::Api(e)) if e.code == 409 => {
                let mut existing = api.get(&name).await?;
                existing.data = secret.data;
                existing.type_ = secret.type_;
                api.replace(&name, &PostParams::default(), &existing).await?;
            }
            Err(e) => return Err(e.into()),
        }

        info!(udid = %udid, secret = %name, "Stored pairing record");
        Ok(())
    }

    async fn delete(&self, udid: &Udid) -> Result<()> {
        let name = secret_name(udid);
        match self
            .secrets_api()
            .delete(&name, &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 404 => {
                debug!(secret = %name, "Pairing secret already deleted");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// In-memory pairing record store for testing.
#[cfg(any(test, feature = "test-utils"))]
pub mod mock {
    use std::collections::HashMap;

    use parking_lot::Mutex;

    use super::*;

    /// A pairing record store that keeps records in memory and counts
    /// mutations.
    #[derive(Default)]
    pub struct MemoryRecordStore {
        name: &'static str,
        records: Mutex<HashMap<Udid, PairingRecord>>,
        writes: Mutex<usize>,
        deletes: Mutex<usize>,
    }

    impl MemoryRecordStore {
        /// Create an empty store.
        #[must_use]
        pub fn new(name: &'static str) -> Self {
            Self {
                name,
                ..Default::default()
            }
        }

        /// Seed a record without counting it as a write.
        pub fn insert(&self, udid: &Udid, record: PairingRecord) {
            self.records.lock().insert(udid.clone(), record);
        }

        /// Get the stored record.
        #[must_use]
        pub fn get(&self, udid: &Udid) -> Option<PairingRecord> {
            self.records.lock().get(udid).cloned()
        }

        /// Number of `write` calls.
        #[must_use]
        pub fn writes(&self) -> usize {
            *self.writes.lock()
        }

        /// Number of `delete` calls.
        #[must_use]
        pub fn deletes(&self) -> usize {
            *self.deletes.lock()
        }
    }

    #[async_trait]
    impl PairingRecordStore for MemoryRecordStore {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn read(&self, udid: &Udid) -> Result<Option<PairingRecord>> {
            Ok(self.get(udid))
        }

        async fn write(&self, udid: &Udid, record: &PairingRecord) -> Result<()> {
            *self.writes.lock() += 1;
            self.records.lock().insert(udid.clone(), record.clone());
            Ok(())
        }

        async fn delete(&self, udid: &Udid) -> Result<()> {
            *self.deletes.lock() += 1;
            self.records.lock().remove(udid);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> PairingRecord {
        PairingRecord {
            device_certificate: b"device-cert".to_vec(),
            host_certificate: b"host-cert".to_vec(),
            host_private_key: b"host-key".to_vec(),
            root_certificate: b"root-cert".to_vec(),
            root_private_key: b"root-key".to_vec(),
            host_id: "HOST-ID".to_string(),
            system_buid: "BUID".to_string(),
            escrow_bag: Some(vec![1, 2, 3]),
            wifi_mac_address: None,
        }
    }

    #[test]
    fn secret_layout() {
        let udid = Udid::new("00008030-001A2B3C4D5E6F70").unwrap();
        let secret = record_to_secret(&udid, &record());

        assert_eq!(
            secret.metadata.name.as_deref(),
            Some("00008030-001a2b3c4d5e6f70-pairing")
        );
        assert_eq!(secret.type_.as_deref(), Some(PAIRING_SECRET_TYPE));
        assert!(secret.metadata.owner_references.is_none());
        let data = secret.data.as_ref().unwrap();
        assert_eq!(data[HOST_ID_KEY].0, b"HOST-ID");
        assert_eq!(data[ESCROW_BAG_KEY].0, vec![1, 2, 3]);
        assert!(!data.contains_key(WIFI_MAC_ADDRESS_KEY));

        assert_eq!(record_from_secret(&secret).unwrap(), record());
    }

    #[test]
    fn secret_missing_key_is_invalid() {
        let udid = Udid::new("abc").unwrap();
        let mut secret = record_to_secret(&udid, &record());
        secret.data.as_mut().unwrap().remove(HOST_PRIVATE_KEY_KEY);

        let err = record_from_secret(&secret).unwrap_err();
        assert!(err.to_string().contains(HOST_PRIVATE_KEY_KEY));
    }
}
