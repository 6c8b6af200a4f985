//! Lockdown client.
//!
//! Lockdown is the per-device service that exposes device properties,
//! handles pairing and starts other services. It is reached by opening a
//! muxer tunnel to [`LOCKDOWN_PORT`](crate::protocol::LOCKDOWN_PORT).

use devicemux_core::{PairingRecord, ProductVersion};
use plist::{Dictionary, Value};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, instrument};

use crate::codec::PlistChannel;
use crate::error::{LockdownError, Result};
use crate::protocol::{
    get_u64, LockdownRequest, LockdownResponse, PairOutcome, PairingStatus, ServiceDescriptor,
    SessionInfo, LOCKDOWN_SERVICE_TYPE, PAIRING_PROTOCOL_VERSION,
};
use crate::tls::{self, TlsStream};

/// Default client label.
pub const DEFAULT_LABEL: &str = "devicemux";

/// A connection to a device's lockdown service.
#[derive(Debug)]
pub struct LockdownClient<S> {
    channel: PlistChannel<S>,
    label: String,
    session_id: Option<String>,
}

impl<S> LockdownClient<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Wrap a stream connected to the lockdown port.
    pub fn new(stream: S) -> Self {
        Self {
            channel: PlistChannel::new(stream),
            label: DEFAULT_LABEL.to_string(),
            session_id: None,
        }
    }

    /// Use a custom client label.
    #[must_use]
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    /// The active session, if any.
    #[must_use]
    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    async fn request(&mut self, request: &LockdownRequest) -> Result<LockdownResponse> {
        let reply = self
            .channel
            .exchange(&request.to_dictionary(&self.label))
            .await?;
        LockdownResponse::from_dictionary(request.name(), reply)
    }

    /// Check that the peer is lockdown.
    ///
    /// # Errors
    ///
    /// Returns `LockdownError::UnexpectedServiceType` if another service
    /// answers.
    pub async fn query_type(&mut self) -> Result<String> {
        let response = self
            .request(&LockdownRequest::new("QueryType"))
            .await?
            .into_success()?;
        let service_type = response
            .get("Type")
            .and_then(Value::as_string)
            .ok_or(LockdownError::MissingField("Type"))?;

        if service_type != LOCKDOWN_SERVICE_TYPE {
            return Err(LockdownError::UnexpectedServiceType(service_type.to_string()));
        }
        Ok(service_type.to_string())
    }

    /// Read a value. Returns `None` if the device has no such value.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails for any other reason.
    pub async fn get_value(
        &mut self,
        domain: Option<&str>,
        key: Option<&str>,
    ) -> Result<Option<Value>> {
        let response = self
            .request(&LockdownRequest::new("GetValue").domain(domain).key(key))
            .await?;
        if response.error() == Some("MissingValue") {
            return Ok(None);
        }
        Ok(response.into_success()?.value().cloned())
    }

    /// Write a value.
    ///
    /// # Errors
    ///
    /// Returns an error if the device rejects the value.
    pub async fn set_value(&mut self, domain: Option<&str>, key: &str, value: Value) -> Result<()> {
        self.request(
            &LockdownRequest::new("SetValue")
                .domain(domain)
                .key(Some(key))
                .value(value),
        )
        .await?
        .into_success()?;
        Ok(())
    }

    /// Read the device's public key (PEM), used to generate a pairing record.
    ///
    /// # Errors
    ///
    /// Returns an error if the value is missing.
    pub async fn device_public_key(&mut self) -> Result<Vec<u8>> {
        self.get_value(None, Some("DevicePublicKey"))
            .await?
            .and_then(Value::into_data)
            .ok_or(LockdownError::MissingField("DevicePublicKey"))
    }

    /// Read the device's Wi-Fi MAC address, if it reports one.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails.
    pub async fn wifi_mac_address(&mut self) -> Result<Option<String>> {
        Ok(self
            .get_value(None, Some("WiFiAddress"))
            .await?
            .and_then(Value::into_string))
    }

    /// Read and parse the device's `ProductVersion`.
    ///
    /// # Errors
    ///
    /// Returns an error if the value is missing or malformed.
    pub async fn product_version(&mut self) -> Result<ProductVersion> {
        let version = self
            .get_value(None, Some("ProductVersion"))
            .await?
            .and_then(Value::into_string)
            .ok_or(LockdownError::MissingField("ProductVersion"))?;
        Ok(version.parse()?)
    }

    /// Start an authenticated session.
    ///
    /// # Errors
    ///
    /// Returns `LockdownError::Protocol` if the device rejects the host.
    #[instrument(skip(self))]
    pub async fn start_session(&mut self, host_id: &str, system_buid: &str) -> Result<SessionInfo> {
        let response = self
            .request(
                &LockdownRequest::new("StartSession")
                    .field("HostID", host_id)
                    .field("SystemBUID", system_buid),
            )
            .await?
            .into_success()?;

        let session_id = response
            .get("SessionID")
            .and_then(Value::as_string)
            .ok_or(LockdownError::MissingField("SessionID"))?
            .to_string();
        let enable_ssl = response
            .get("EnableSessionSSL")
            .and_then(Value::as_boolean)
            .unwrap_or(false);

        debug!(session_id = %session_id, enable_ssl, "Lockdown session started");
        self.session_id = Some(session_id.clone());
        Ok(SessionInfo {
            session_id,
            enable_ssl,
        })
    }

    /// Stop the active session. Does nothing without a session.
    ///
    /// # Errors
    ///
    /// Returns an error if the device rejects the request.
    pub async fn stop_session(&mut self) -> Result<()> {
        let Some(session_id) = self.session_id.take() else {
            return Ok(());
        };
        self.request(&LockdownRequest::new("StopSession").field("SessionID", session_id))
            .await?
            .into_success()?;
        Ok(())
    }

    /// Upgrade the connection to TLS with the record's credentials.
    ///
    /// # Errors
    ///
    /// Returns an error if the handshake fails.
    pub async fn into_tls(self, record: &PairingRecord) -> Result<LockdownClient<TlsStream<S>>> {
        let stream = tls::upgrade(self.channel.into_inner(), record).await?;
        Ok(LockdownClient {
            channel: PlistChannel::new(stream),
            label: self.label,
            session_id: self.session_id,
        })
    }

    /// Start a service on the device.
    ///
    /// # Errors
    ///
    /// Returns `LockdownError::Protocol` if the device refuses to start the
    /// service.
    #[instrument(skip(self, escrow_bag))]
    pub async fn start_service(
        &mut self,
        name: &str,
        escrow_bag: Option<&[u8]>,
    ) -> Result<ServiceDescriptor> {
        let mut request = LockdownRequest::new("StartService").field("Service", name);
        if let Some(bag) = escrow_bag {
            request = request.field("EscrowBag", Value::Data(bag.to_vec()));
        }
        let response = self.request(&request).await?.into_success()?;

        let port = response
            .get("Port")
            .and_then(get_u64)
            .and_then(|p| u16::try_from(p).ok())
            .ok_or(LockdownError::MissingField("Port"))?;
        let enable_service_ssl = response
            .get("EnableServiceSSL")
            .and_then(Value::as_boolean)
            .unwrap_or(false);
        let service_name = response
            .get("Service")
            .and_then(Value::as_string)
            .unwrap_or(name)
            .to_string();

        Ok(ServiceDescriptor {
            port,
            enable_service_ssl,
            service_name,
        })
    }

    fn pairing_request(request: &'static str, record: &PairingRecord) -> LockdownRequest {
        LockdownRequest::new(request)
            .field("PairRecord", record.to_public_dictionary())
            .field("ProtocolVersion", PAIRING_PROTOCOL_VERSION)
    }

    fn pairing_status(response: &LockdownResponse) -> Result<PairingStatus> {
        let error = response.error();
        PairingStatus::from_error(error)
            .ok_or_else(|| response.protocol_error(error.unwrap_or_default().to_string()))
    }

    /// Ask the device to trust this host.
    ///
    /// The first request shows the trust dialog and returns
    /// `PairingDialogResponsePending`; repeat it until the user answers.
    ///
    /// # Errors
    ///
    /// Returns `LockdownError::Protocol` for errors that are not pairing
    /// outcomes.
    #[instrument(skip(self, record), fields(host_id = %record.host_id))]
    pub async fn pair(&mut self, record: &PairingRecord) -> Result<PairOutcome> {
        let mut options = Dictionary::new();
        options.insert("ExtendedPairingErrors".to_string(), Value::Boolean(true));

        let response = self
            .request(&Self::pairing_request("Pair", record).field("PairingOptions", options))
            .await?;
        let status = Self::pairing_status(&response)?;
        let escrow_bag = response
            .get("EscrowBag")
            .and_then(Value::as_data)
            .map(<[u8]>::to_vec);

        Ok(PairOutcome { status, escrow_bag })
    }

    /// Check that the device still trusts a pairing record.
    ///
    /// # Errors
    ///
    /// Returns `LockdownError::Protocol` for errors that are not pairing
    /// outcomes.
    #[instrument(skip(self, record), fields(host_id = %record.host_id))]
    pub async fn validate_pair(&mut self, record: &PairingRecord) -> Result<PairingStatus> {
        let response = self
            .request(&Self::pairing_request("ValidatePair", record))
            .await?;
        Self::pairing_status(&response)
    }

    /// Remove the device's trust in a pairing record.
    ///
    /// # Errors
    ///
    /// Returns `LockdownError::Protocol` for errors that are not pairing
    /// outcomes.
    pub async fn unpair(&mut self, record: &PairingRecord) -> Result<PairingStatus> {
        let response = self.request(&Self::pairing_request("Unpair", record)).await?;
        Self::pairing_status(&response)
    }

    /// Return the underlying stream.
    pub fn into_inner(self) -> S {
        self.channel.into_inner()
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::DuplexStream;
    use tokio::task::JoinHandle;

    use super::*;
    use crate::codec::{read_plist, write_plist};

    fn sample_record() -> PairingRecord {
        PairingRecord {
            device_certificate: b"device".to_vec(),
            host_certificate: b"host".to_vec(),
            host_private_key: b"host-key".to_vec(),
            root_certificate: b"root".to_vec(),
            root_private_key: b"root-key".to_vec(),
            host_id: "HOST-ID".to_string(),
            system_buid: "BUID".to_string(),
            escrow_bag: None,
            wifi_mac_address: None,
        }
    }

    /// A device that answers each request with the next scripted reply,
    /// handing every request to `check` first.
    fn scripted_device(
        replies: Vec<Dictionary>,
        check: fn(usize, &Dictionary),
    ) -> (LockdownClient<DuplexStream>, JoinHandle<()>) {
        let (client_io, mut device_io) = tokio::io::duplex(64 * 1024);
        let handle = tokio::spawn(async move {
            for (i, reply) in replies.into_iter().enumerate() {
                let request = read_plist(&mut device_io).await.unwrap();
                check(i, &request);
                write_plist(&mut device_io, &reply).await.unwrap();
            }
        });
        (LockdownClient::new(client_io), handle)
    }

    fn reply(request: &str, fields: &[(&str, Value)]) -> Dictionary {
        let mut dict = Dictionary::new();
        dict.insert("Request".to_string(), Value::String(request.to_string()));
        for (name, value) in fields {
            dict.insert((*name).to_string(), value.clone());
        }
        dict
    }

    fn error(request: &str, error: &str) -> Dictionary {
        reply(request, &[("Error", Value::String(error.to_string()))])
    }

    fn no_check(_: usize, _: &Dictionary) {}

    #[tokio::test]
    async fn query_type_accepts_lockdown() {
        let (mut client, device) = scripted_device(
            vec![reply(
                "QueryType",
                &[("Type", Value::String(LOCKDOWN_SERVICE_TYPE.to_string()))],
            )],
            |_, request| {
                assert_eq!(request.get("Label").and_then(Value::as_string), Some("devicemux"));
            },
        );
        assert_eq!(client.query_type().await.unwrap(), LOCKDOWN_SERVICE_TYPE);
        device.await.unwrap();
    }

    #[tokio::test]
    async fn query_type_rejects_other_service() {
        let (mut client, device) = scripted_device(
            vec![reply(
                "QueryType",
                &[("Type", Value::String("com.apple.afc".to_string()))],
            )],
            no_check,
        );
        assert!(matches!(
            client.query_type().await,
            Err(LockdownError::UnexpectedServiceType(t)) if t == "com.apple.afc"
        ));
        device.await.unwrap();
    }

    #[tokio::test]
    async fn get_value_and_missing_value() {
        let (mut client, device) = scripted_device(
            vec![
                reply(
                    "GetValue",
                    &[("Value", Value::String("13.4.1".to_string()))],
                ),
                error("GetValue", "MissingValue"),
            ],
            |i, request| {
                if i == 0 {
                    assert_eq!(
                        request.get("Key").and_then(Value::as_string),
                        Some("ProductVersion")
                    );
                }
            },
        );

        let version = client.product_version().await.unwrap();
        assert_eq!(version, ProductVersion::new(13, 4, Some(1)));
        assert!(client
            .get_value(None, Some("Nonexistent"))
            .await
            .unwrap()
            .is_none());
        device.await.unwrap();
    }

    #[tokio::test]
    async fn pair_reports_pending_then_success_with_escrow_bag() {
        let (mut client, device) = scripted_device(
            vec![
                error("Pair", "PairingDialogResponsePending"),
                reply("Pair", &[("EscrowBag", Value::Data(vec![9, 9]))]),
            ],
            |_, request| {
                let record = request
                    .get("PairRecord")
                    .and_then(Value::as_dictionary)
                    .unwrap();
                assert!(record.get("HostPrivateKey").is_none());
                assert_eq!(
                    record.get("HostID").and_then(Value::as_string),
                    Some("HOST-ID")
                );
                let options = request
                    .get("PairingOptions")
                    .and_then(Value::as_dictionary)
                    .unwrap();
                assert_eq!(
                    options
                        .get("ExtendedPairingErrors")
                        .and_then(Value::as_boolean),
                    Some(true)
                );
            },
        );

        let record = sample_record();
        let first = client.pair(&record).await.unwrap();
        assert_eq!(first.status, PairingStatus::PairingDialogResponsePending);
        assert!(first.escrow_bag.is_none());

        let second = client.pair(&record).await.unwrap();
        assert_eq!(second.status, PairingStatus::Success);
        assert_eq!(second.escrow_bag, Some(vec![9, 9]));
        device.await.unwrap();
    }

    #[tokio::test]
    async fn pairing_errors_map_onto_statuses_or_faults() {
        let (mut client, device) = scripted_device(
            vec![
                reply("ValidatePair", &[]),
                error("ValidatePair", "InvalidPairRecord"),
                error("ValidatePair", "InvalidHostID"),
                error("Pair", "PasswordProtected"),
            ],
            no_check,
        );

        let record = sample_record();
        assert_eq!(
            client.validate_pair(&record).await.unwrap(),
            PairingStatus::Success
        );
        assert_eq!(
            client.validate_pair(&record).await.unwrap(),
            PairingStatus::InvalidPairRecord
        );
        assert!(matches!(
            client.validate_pair(&record).await,
            Err(LockdownError::Protocol { error, .. }) if error == "InvalidHostID"
        ));
        let err = client.pair(&record).await.unwrap_err();
        assert!(err.is_password_protected());
        device.await.unwrap();
    }

    #[tokio::test]
    async fn start_session_and_service() {
        let (mut client, device) = scripted_device(
            vec![
                reply(
                    "StartSession",
                    &[
                        ("SessionID", Value::String("S1".to_string())),
                        ("EnableSessionSSL", Value::Boolean(false)),
                    ],
                ),
                reply(
                    "StartService",
                    &[
                        ("Port", Value::Integer(49_152_u64.into())),
                        ("EnableServiceSSL", Value::Boolean(true)),
                        (
                            "Service",
                            Value::String("com.apple.mobile.mobile_image_mounter".to_string()),
                        ),
                    ],
                ),
                reply("StopSession", &[]),
            ],
            |i, request| {
                if i == 1 {
                    assert_eq!(
                        request.get("EscrowBag").and_then(Value::as_data),
                        Some(&[1_u8, 2][..])
                    );
                }
            },
        );

        let session = client.start_session("HOST-ID", "BUID").await.unwrap();
        assert_eq!(session.session_id, "S1");
        assert!(!session.enable_ssl);
        assert_eq!(client.session_id(), Some("S1"));

        let service = client
            .start_service("com.apple.mobile.mobile_image_mounter", Some(&[1, 2]))
            .await
            .unwrap();
        assert_eq!(service.port, 49152);
        assert!(service.enable_service_ssl);

        client.stop_session().await.unwrap();
        assert!(client.session_id().is_none());
        device.await.unwrap();
    }

    #[tokio::test]
    async fn rejected_session_is_protocol_error() {
        let (mut client, device) =
            scripted_device(vec![error("StartSession", "InvalidHostID")], no_check);
        assert!(matches!(
            client.start_session("HOST-ID", "BUID").await,
            Err(LockdownError::Protocol { request, .. }) if request == "StartSession"
        ));
        device.await.unwrap();
    }
}
