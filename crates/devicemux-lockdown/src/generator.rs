//! Pairing record generation.
//!
//! A new pairing creates a private certificate authority for the host: an
//! RSA root key with a self-signed CA certificate, a host key and
//! certificate signed by the root, and a device certificate, also signed by
//! the root, wrapping the public key the device reports as
//! `DevicePublicKey`.

use devicemux_core::PairingRecord;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, IsCa, Issuer, KeyPair,
    KeyUsagePurpose, SubjectPublicKeyInfo, PKCS_RSA_SHA256,
};
use rsa::pkcs1::{DecodeRsaPublicKey, EncodeRsaPrivateKey, LineEnding};
use rsa::pkcs8::{DecodePublicKey, EncodePrivateKey, EncodePublicKey};
use rsa::{RsaPrivateKey, RsaPublicKey};
use time::{Duration, OffsetDateTime};
use tracing::debug;
use uuid::Uuid;

use crate::error::{LockdownError, Result};

const KEY_BITS: usize = 2048;

/// Pairing certificates are valid for ten years.
const CERT_VALIDITY_DAYS: i64 = 365 * 10;

struct RsaKey {
    private: RsaPrivateKey,
    signing: KeyPair,
}

impl RsaKey {
    fn generate() -> Result<Self> {
        let private = RsaPrivateKey::new(&mut rand::rngs::OsRng, KEY_BITS)
            .map_err(|e| LockdownError::Credentials(e.to_string()))?;
        let pkcs8 = private
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| LockdownError::Credentials(e.to_string()))?;
        let signing = KeyPair::from_pem_and_sign_algo(&pkcs8, &PKCS_RSA_SHA256)?;
        Ok(Self { private, signing })
    }

    fn pkcs1_pem(&self) -> Result<Vec<u8>> {
        let pem = self
            .private
            .to_pkcs1_pem(LineEnding::LF)
            .map_err(|e| LockdownError::Credentials(e.to_string()))?;
        Ok(pem.as_bytes().to_vec())
    }
}

fn base_params() -> CertificateParams {
    let mut params = CertificateParams::default();
    params.distinguished_name = DistinguishedName::new();
    let now = OffsetDateTime::now_utc();
    params.not_before = now;
    params.not_after = now + Duration::days(CERT_VALIDITY_DAYS);
    params
}

fn leaf_params() -> CertificateParams {
    let mut params = base_params();
    params.is_ca = IsCa::ExplicitNoCa;
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params
}

/// Parse the device's public key, PKCS#1 or SubjectPublicKeyInfo PEM.
fn device_public_key(pem: &[u8]) -> Result<SubjectPublicKeyInfo> {
    let pem = std::str::from_utf8(pem)
        .map_err(|_| LockdownError::Credentials("device public key is not PEM".to_string()))?;
    let key = RsaPublicKey::from_pkcs1_pem(pem)
        .or_else(|_| RsaPublicKey::from_public_key_pem(pem))
        .map_err(|e| LockdownError::Credentials(format!("invalid device public key: {e}")))?;
    let der = key
        .to_public_key_der()
        .map_err(|e| LockdownError::Credentials(e.to_string()))?;
    Ok(SubjectPublicKeyInfo::from_der(der.as_bytes())?)
}

/// Generate a pairing record for a device.
///
/// # Errors
///
/// Returns `LockdownError::Credentials` if the device public key is invalid
/// or certificate generation fails.
pub fn generate_pairing_record(
    device_public_key_pem: &[u8],
    system_buid: &str,
) -> Result<PairingRecord> {
    let device_key = device_public_key(device_public_key_pem)?;

    let root_key = RsaKey::generate()?;
    let mut root_params = base_params();
    root_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    root_params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
    let root_cert = root_params.clone().self_signed(&root_key.signing)?;
    let issuer = Issuer::from_params(&root_params, &root_key.signing);

    let host_key = RsaKey::generate()?;
    let host_cert = leaf_params().signed_by(&host_key.signing, &issuer)?;
    let device_cert = leaf_params().signed_by(&device_key, &issuer)?;

    let host_id = Uuid::new_v4().to_string().to_uppercase();
    debug!(host_id = %host_id, "Generated pairing credentials");

    Ok(PairingRecord {
        device_certificate: device_cert.pem().into_bytes(),
        host_certificate: host_cert.pem().into_bytes(),
        host_private_key: host_key.pkcs1_pem()?,
        root_certificate: root_cert.pem().into_bytes(),
        root_private_key: root_key.pkcs1_pem()?,
        host_id,
        system_buid: system_buid.to_string(),
        escrow_bag: None,
        wifi_mac_address: None,
    })
}
