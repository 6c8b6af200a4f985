//! Pairing records.
//!
//! A pairing record is the certificate and key bundle that proves a trust
//! relationship between this host and a device. The same record is kept in
//! two places: the muxer's local store (as a property list) and a cluster
//! secret. Both copies are compared byte for byte.

use std::fmt;
use std::io::Cursor;

use plist::{Dictionary, Value};

use crate::error::{CoreError, Result};

const DEVICE_CERTIFICATE: &str = "DeviceCertificate";
const HOST_CERTIFICATE: &str = "HostCertificate";
const HOST_PRIVATE_KEY: &str = "HostPrivateKey";
const ROOT_CERTIFICATE: &str = "RootCertificate";
const ROOT_PRIVATE_KEY: &str = "RootPrivateKey";
const HOST_ID: &str = "HostID";
const SYSTEM_BUID: &str = "SystemBUID";
const ESCROW_BAG: &str = "EscrowBag";
const WIFI_MAC_ADDRESS: &str = "WiFiMACAddress";

/// A host/device pairing record.
///
/// Certificates and keys are PEM-encoded, exactly as the muxer stores them.
/// Equality is structural.
#[derive(Clone, PartialEq, Eq)]
pub struct PairingRecord {
    /// The device certificate, signed by the root certificate.
    pub device_certificate: Vec<u8>,
    /// The host certificate, signed by the root certificate.
    pub host_certificate: Vec<u8>,
    /// The host private key.
    pub host_private_key: Vec<u8>,
    /// The self-signed root certificate.
    pub root_certificate: Vec<u8>,
    /// The root private key.
    pub root_private_key: Vec<u8>,
    /// The host identifier presented to lockdown.
    pub host_id: String,
    /// The system BUID of the host that created the record.
    pub system_buid: String,
    /// Device-encrypted blob returned on pairing, used for passcode-free
    /// reconnection.
    pub escrow_bag: Option<Vec<u8>>,
    /// The device's Wi-Fi MAC address, if known.
    pub wifi_mac_address: Option<String>,
}

impl PairingRecord {
    /// Parse a pairing record from a property list document (binary or XML).
    ///
    /// # Errors
    ///
    /// Returns an error if the document is not a dictionary or a required
    /// entry is missing.
    pub fn from_plist_bytes(bytes: &[u8]) -> Result<Self> {
        let value = Value::from_reader(Cursor::new(bytes))?;
        let dict = value.into_dictionary().ok_or_else(|| {
            CoreError::InvalidPairingRecord("document is not a dictionary".to_string())
        })?;
        Self::from_dictionary(&dict)
    }

    /// Parse a pairing record from a property list dictionary.
    ///
    /// # Errors
    ///
    /// Returns an error if a required entry is missing or has the wrong type.
    pub fn from_dictionary(dict: &Dictionary) -> Result<Self> {
        Ok(Self {
            device_certificate: required_data(dict, DEVICE_CERTIFICATE)?,
            host_certificate: required_data(dict, HOST_CERTIFICATE)?,
            host_private_key: required_data(dict, HOST_PRIVATE_KEY)?,
            root_certificate: required_data(dict, ROOT_CERTIFICATE)?,
            root_private_key: dict
                .get(ROOT_PRIVATE_KEY)
                .and_then(Value::as_data)
                .map(<[u8]>::to_vec)
                .unwrap_or_default(),
            host_id: required_string(dict, HOST_ID)?,
            system_buid: required_string(dict, SYSTEM_BUID)?,
            escrow_bag: dict
                .get(ESCROW_BAG)
                .and_then(Value::as_data)
                .map(<[u8]>::to_vec),
            wifi_mac_address: dict
                .get(WIFI_MAC_ADDRESS)
                .and_then(Value::as_string)
                .map(str::to_string),
        })
    }

    /// Convert the record into a property list dictionary.
    #[must_use]
    pub fn to_dictionary(&self) -> Dictionary {
        let mut dict = Dictionary::new();
        dict.insert(
            DEVICE_CERTIFICATE.to_string(),
            Value::Data(self.device_certificate.clone()),
        );
        dict.insert(
            HOST_CERTIFICATE.to_string(),
            Value::Data(self.host_certificate.clone()),
        );
        dict.insert(
            HOST_PRIVATE_KEY.to_string(),
            Value::Data(self.host_private_key.clone()),
        );
        dict.insert(
            ROOT_CERTIFICATE.to_string(),
            Value::Data(self.root_certificate.clone()),
        );
        dict.insert(
            ROOT_PRIVATE_KEY.to_string(),
            Value::Data(self.root_private_key.clone()),
        );
        dict.insert(HOST_ID.to_string(), Value::String(self.host_id.clone()));
        dict.insert(
            SYSTEM_BUID.to_string(),
            Value::String(self.system_buid.clone()),
        );
        if let Some(bag) = &self.escrow_bag {
            dict.insert(ESCROW_BAG.to_string(), Value::Data(bag.clone()));
        }
        if let Some(mac) = &self.wifi_mac_address {
            dict.insert(WIFI_MAC_ADDRESS.to_string(), Value::String(mac.clone()));
        }
        dict
    }

    /// Serialize the record as an XML property list document.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_plist_bytes(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        Value::Dictionary(self.to_dictionary()).to_writer_xml(&mut buf)?;
        Ok(buf)
    }

    /// The entries sent to a device in a `Pair`, `Unpair` or `ValidatePair`
    /// request. Private keys are never included.
    #[must_use]
    pub fn to_public_dictionary(&self) -> Dictionary {
        let mut dict = Dictionary::new();
        dict.insert(
            DEVICE_CERTIFICATE.to_string(),
            Value::Data(self.device_certificate.clone()),
        );
        dict.insert(
            HOST_CERTIFICATE.to_string(),
            Value::Data(self.host_certificate.clone()),
        );
        dict.insert(
            ROOT_CERTIFICATE.to_string(),
            Value::Data(self.root_certificate.clone()),
        );
        dict.insert(HOST_ID.to_string(), Value::String(self.host_id.clone()));
        dict.insert(
            SYSTEM_BUID.to_string(),
            Value::String(self.system_buid.clone()),
        );
        dict
    }
}

impl fmt::Debug for PairingRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PairingRecord")
            .field("host_id", &self.host_id)
            .field("system_buid", &self.system_buid)
            .field("escrow_bag", &self.escrow_bag.as_ref().map(Vec::len))
            .field("wifi_mac_address", &self.wifi_mac_address)
            .finish_non_exhaustive()
    }
}

fn required_data(dict: &Dictionary, key: &str) -> Result<Vec<u8>> {
    dict.get(key)
        .and_then(Value::as_data)
        .map(<[u8]>::to_vec)
        .ok_or_else(|| CoreError::InvalidPairingRecord(format!("missing data entry {key}")))
}

fn required_string(dict: &Dictionary, key: &str) -> Result<String> {
    dict.get(key)
        .and_then(Value::as_string)
        .map(str::to_string)
        .ok_or_else(|| CoreError::InvalidPairingRecord(format!("missing string entry {key}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_record() -> PairingRecord {
        PairingRecord {
            device_certificate: b"device-cert".to_vec(),
            host_certificate: b"host-cert".to_vec(),
            host_private_key: b"host-key".to_vec(),
            root_certificate: b"root-cert".to_vec(),
            root_private_key: b"root-key".to_vec(),
            host_id: "01234567-89AB-CDEF-0123-456789ABCDEF".to_string(),
            system_buid: "30642A2B-7BD3-4DD2-9F2D-2B8E44B4A0D3".to_string(),
            escrow_bag: Some(vec![1, 2, 3]),
            wifi_mac_address: Some("aa:bb:cc:dd:ee:ff".to_string()),
        }
    }

    #[test]
    fn plist_roundtrip_preserves_every_field() {
        let record = sample_record();
        let bytes = record.to_plist_bytes().unwrap();
        let parsed = PairingRecord::from_plist_bytes(&bytes).unwrap();
        assert_eq!(parsed, record);
    }

    #[test]
    fn missing_required_entry_is_rejected() {
        let mut dict = sample_record().to_dictionary();
        dict.remove(HOST_CERTIFICATE);

        let err = PairingRecord::from_dictionary(&dict).unwrap_err();
        assert!(matches!(err, CoreError::InvalidPairingRecord(msg) if msg.contains("HostCertificate")));
    }

    #[test]
    fn public_dictionary_has_no_private_keys() {
        let dict = sample_record().to_public_dictionary();
        assert!(dict.get(HOST_PRIVATE_KEY).is_none());
        assert!(dict.get(ROOT_PRIVATE_KEY).is_none());
        assert!(dict.get(ESCROW_BAG).is_none());
        assert!(dict.get(DEVICE_CERTIFICATE).is_some());
    }

    #[test]
    fn equality_is_structural() {
        let a = sample_record();
        let mut b = sample_record();
        assert_eq!(a, b);

        b.host_certificate.push(0);
        assert_ne!(a, b);
    }

    #[test]
    fn debug_output_hides_keys() {
        let debug = format!("{:?}", sample_record());
        assert!(!debug.contains("host-key"));
        assert!(debug.contains("HostID") || debug.contains("host_id"));
    }
}
