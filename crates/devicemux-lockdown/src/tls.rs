//! TLS upgrade for lockdown sessions and service tunnels.
//!
//! Devices present the certificate issued to them at pairing time, signed by
//! the host's own root. That certificate is pinned: it is the only server
//! certificate accepted, and no hostname is checked. The host certificate and
//! key from the pairing record are presented as the client identity.

use std::sync::Arc;

use devicemux_core::PairingRecord;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{CertificateError, ClientConfig, DigitallySignedStruct, SignatureScheme};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::error::{LockdownError, Result};

/// A TLS-wrapped stream to a device.
pub type TlsStream<S> = tokio_rustls::client::TlsStream<S>;

/// Name passed to the handshake. SNI is disabled and the name is never
/// checked against the device certificate.
const DEVICE_SERVER_NAME: &str = "lockdown";

/// Accepts exactly one server certificate.
#[derive(Debug)]
struct PinnedDeviceVerifier {
    device_certificate: CertificateDer<'static>,
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for PinnedDeviceVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        if end_entity.as_ref() == self.device_certificate.as_ref() {
            Ok(ServerCertVerified::assertion())
        } else {
            Err(rustls::Error::InvalidCertificate(
                CertificateError::ApplicationVerificationFailure,
            ))
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

fn pem_error(what: &str, e: &rustls::pki_types::pem::Error) -> LockdownError {
    LockdownError::Tls(format!("invalid {what}: {e}"))
}

/// Build a client configuration for a pairing record.
///
/// # Errors
///
/// Returns `LockdownError::Tls` if a certificate or key in the record cannot
/// be parsed.
pub fn client_config(record: &PairingRecord) -> Result<Arc<ClientConfig>> {
    let device_certificate = CertificateDer::from_pem_slice(&record.device_certificate)
        .map_err(|e| pem_error("device certificate", &e))?;
    let host_certificate = CertificateDer::from_pem_slice(&record.host_certificate)
        .map_err(|e| pem_error("host certificate", &e))?;
    let host_key = PrivateKeyDer::from_pem_slice(&record.host_private_key)
        .map_err(|e| pem_error("host private key", &e))?;

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let verifier = PinnedDeviceVerifier {
        device_certificate,
        provider: Arc::clone(&provider),
    };

    let mut config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(verifier))
        .with_client_auth_cert(vec![host_certificate], host_key)?;
    config.enable_sni = false;

    Ok(Arc::new(config))
}

/// Upgrade a stream to TLS using the credentials in a pairing record.
///
/// # Errors
///
/// Returns an error if the record is unusable or the handshake fails.
pub async fn upgrade<S>(stream: S, record: &PairingRecord) -> Result<TlsStream<S>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let connector = TlsConnector::from(client_config(record)?);
    let server_name = ServerName::try_from(DEVICE_SERVER_NAME)
        .map_err(|e| LockdownError::Tls(e.to_string()))?;

    let stream = connector
        .connect(server_name, stream)
        .await
        .map_err(|e| LockdownError::Tls(format!("handshake failed: {e}")))?;
    debug!(host_id = %record.host_id, "TLS session established");
    Ok(stream)
}
