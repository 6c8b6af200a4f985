//! usbmuxd client.
//!
//! Every operation opens a fresh socket; connections are never pooled. A
//! [`MuxerConnection`] wraps one socket for framed request/reply traffic and
//! can be turned into a raw tunnel with [`MuxerConnection::connect`].

use devicemux_core::{DeviceId, PairingRecord, Udid};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::codec::{read_message, write_message};
use crate::error::{MuxerError, Result};
use crate::protocol::{MuxerDevice, MuxerEnvelope, MuxerMessage, ResultCode};
use crate::transport::{MuxerEndpoint, MuxerStream};

/// A notification delivered to a `listen` handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MuxerEvent {
    /// A device was attached.
    Attached(MuxerDevice),
    /// A device was detached.
    Detached(DeviceId),
    /// A device was paired with the host.
    Paired(DeviceId),
}

/// What a `listen` handler wants to happen next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenAction {
    /// Keep listening.
    Continue,
    /// Stop listening and close the connection.
    Stop,
}

/// A framed connection to the muxer.
#[derive(Debug)]
pub struct MuxerConnection<S> {
    stream: S,
    envelope: MuxerEnvelope,
    next_tag: u32,
}

impl<S> MuxerConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Wrap a connected socket.
    pub fn new(stream: S, envelope: MuxerEnvelope) -> Self {
        Self {
            stream,
            envelope,
            next_tag: 1,
        }
    }

    /// Send a message, returning the tag it was sent with.
    ///
    /// # Errors
    ///
    /// Returns an error if the message cannot be written.
    pub async fn send(&mut self, message: &MuxerMessage) -> Result<u32> {
        let tag = self.next_tag;
        self.next_tag = self.next_tag.wrapping_add(1);
        write_message(&mut self.stream, message, &self.envelope, tag).await?;
        Ok(tag)
    }

    /// Receive the next message, or `None` if the muxer closed the connection.
    ///
    /// # Errors
    ///
    /// Returns an error if reading or decoding fails.
    pub async fn receive(&mut self) -> Result<Option<MuxerMessage>> {
        Ok(read_message(&mut self.stream).await?.map(|(_, message)| message))
    }

    /// Send a request and wait for its reply.
    ///
    /// # Errors
    ///
    /// Returns `MuxerError::ConnectionClosed` if the muxer closes the
    /// connection before replying.
    pub async fn request(&mut self, message: &MuxerMessage) -> Result<MuxerMessage> {
        self.send(message).await?;
        self.receive().await?.ok_or(MuxerError::ConnectionClosed)
    }

    async fn request_success(&mut self, message: &MuxerMessage) -> Result<()> {
        match self.request(message).await? {
            MuxerMessage::Result {
                code: ResultCode::Success,
            } => Ok(()),
            MuxerMessage::Result { code } => Err(MuxerError::Result(code)),
            other => Err(MuxerError::UnexpectedMessage {
                expected: "Result",
                got: other.name(),
            }),
        }
    }

    /// Ask the muxer to connect to `port` on a device.
    ///
    /// On success the socket stops carrying muxer frames and becomes a raw
    /// byte stream to the device port, so the connection is consumed.
    ///
    /// # Errors
    ///
    /// Returns `MuxerError::Result` if the muxer refuses the connection.
    pub async fn connect(mut self, device_id: DeviceId, port: u16) -> Result<S> {
        self.request_success(&MuxerMessage::Connect { device_id, port })
            .await?;
        Ok(self.stream)
    }

    /// Return the underlying socket.
    pub fn into_inner(self) -> S {
        self.stream
    }
}

/// Client for the usbmuxd daemon.
#[derive(Debug, Clone)]
pub struct MuxerClient {
    endpoint: MuxerEndpoint,
    envelope: MuxerEnvelope,
}

impl MuxerClient {
    /// Create a client for the given endpoint.
    #[must_use]
    pub fn new(endpoint: MuxerEndpoint) -> Self {
        Self {
            endpoint,
            envelope: MuxerEnvelope::default(),
        }
    }

    /// Use a custom client envelope.
    #[must_use]
    pub fn with_envelope(mut self, envelope: MuxerEnvelope) -> Self {
        self.envelope = envelope;
        self
    }

    /// The endpoint this client connects to.
    #[must_use]
    pub fn endpoint(&self) -> &MuxerEndpoint {
        &self.endpoint
    }

    /// Open a new framed connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket cannot be opened.
    pub async fn open(&self) -> Result<MuxerConnection<MuxerStream>> {
        let stream = self.endpoint.connect().await?;
        Ok(MuxerConnection::new(stream, self.envelope.clone()))
    }

    /// List the attached devices.
    ///
    /// An unreachable muxer is reported as an empty list.
    ///
    /// # Errors
    ///
    /// Returns an error if the muxer sends an invalid reply.
    #[instrument(skip(self), fields(endpoint = %self.endpoint))]
    pub async fn list_devices(&self) -> Result<Vec<MuxerDevice>> {
        let mut conn = match self.open().await {
            Ok(conn) => conn,
            Err(e) => {
                debug!(error = %e, "Muxer unreachable, reporting no devices");
                return Ok(Vec::new());
            }
        };

        match conn.request(&MuxerMessage::ListDevices).await? {
            MuxerMessage::DeviceList { devices } => Ok(devices),
            MuxerMessage::Result { code } => Err(MuxerError::Result(code)),
            other => Err(MuxerError::UnexpectedMessage {
                expected: "DeviceList",
                got: other.name(),
            }),
        }
    }

    /// Subscribe to device notifications.
    ///
    /// The handler runs for every attach, detach and paired notification.
    /// Returns `Ok(false)` when the muxer closes the connection and
    /// `Ok(true)` when the handler returns [`ListenAction::Stop`].
    ///
    /// # Errors
    ///
    /// Returns `MuxerError::Cancelled` if `cancel` fires, or an error if the
    /// muxer rejects the subscription or sends an invalid frame.
    pub async fn listen<F>(&self, mut handler: F, cancel: &CancellationToken) -> Result<bool>
    where
        F: FnMut(MuxerEvent) -> ListenAction + Send,
    {
        let mut conn = tokio::select! {
            () = cancel.cancelled() => return Err(MuxerError::Cancelled),
            conn = self.open() => conn?,
        };

        tokio::select! {
            () = cancel.cancelled() => return Err(MuxerError::Cancelled),
            reply = conn.request_success(&MuxerMessage::Listen) => reply?,
        }
        debug!(endpoint = %self.endpoint, "Listening for device events");

        loop {
            let message = tokio::select! {
                () = cancel.cancelled() => return Err(MuxerError::Cancelled),
                message = conn.receive() => message?,
            };

            let event = match message {
                None => return Ok(false),
                Some(MuxerMessage::DeviceAttached { device }) => MuxerEvent::Attached(device),
                Some(MuxerMessage::DeviceDetached { device_id }) => MuxerEvent::Detached(device_id),
                Some(MuxerMessage::DevicePaired { device_id }) => MuxerEvent::Paired(device_id),
                Some(other) => {
                    warn!(message = other.name(), "Ignoring unexpected message on listen connection");
                    continue;
                }
            };

            if handler(event) == ListenAction::Stop {
                return Ok(true);
            }
        }
    }

    /// Open a raw tunnel to `port` on a device.
    ///
    /// # Errors
    ///
    /// Returns `MuxerError::Result` if the muxer refuses the connection.
    #[instrument(skip(self))]
    pub async fn connect(&self, device_id: DeviceId, port: u16) -> Result<MuxerStream> {
        self.open().await?.connect(device_id, port).await
    }

    /// Read the stored pairing record for a device.
    ///
    /// Returns `None` if the muxer has no record.
    ///
    /// # Errors
    ///
    /// Returns an error if the muxer is unreachable or the record is invalid.
    pub async fn read_pairing_record(&self, udid: &Udid) -> Result<Option<PairingRecord>> {
        let mut conn = self.open().await?;
        let reply = conn
            .request(&MuxerMessage::ReadPairingRecord { id: udid.clone() })
            .await?;

        match reply {
            MuxerMessage::PairingRecordData { data } => {
                Ok(Some(PairingRecord::from_plist_bytes(&data)?))
            }
            MuxerMessage::Result {
                code: ResultCode::BadDevice,
            } => Ok(None),
            MuxerMessage::Result { code } => Err(MuxerError::Result(code)),
            other => Err(MuxerError::UnexpectedMessage {
                expected: "PairRecordData",
                got: other.name(),
            }),
        }
    }

    /// Store a pairing record for a device.
    ///
    /// # Errors
    ///
    /// Returns an error if the muxer is unreachable or rejects the record.
    pub async fn save_pairing_record(&self, udid: &Udid, record: &PairingRecord) -> Result<()> {
        let data = record.to_plist_bytes()?;
        let mut conn = self.open().await?;
        conn.request_success(&MuxerMessage::SavePairingRecord {
            id: udid.clone(),
            data,
        })
        .await
    }

    /// Delete the stored pairing record for a device.
    ///
    /// # Errors
    ///
    /// Returns an error if the muxer is unreachable or rejects the request.
    pub async fn delete_pairing_record(&self, udid: &Udid) -> Result<()> {
        let mut conn = self.open().await?;
        conn.request_success(&MuxerMessage::DeletePairingRecord { id: udid.clone() })
            .await
    }

    /// Read the host's system BUID.
    ///
    /// # Errors
    ///
    /// Returns an error if the muxer is unreachable or sends an invalid reply.
    pub async fn read_buid(&self) -> Result<String> {
        let mut conn = self.open().await?;
        match conn.request(&MuxerMessage::ReadBuid).await? {
            MuxerMessage::Buid { buid } => Ok(buid),
            MuxerMessage::Result { code } => Err(MuxerError::Result(code)),
            other => Err(MuxerError::UnexpectedMessage {
                expected: "BUID",
                got: other.name(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{UnixListener, UnixStream};
    use tokio::task::JoinHandle;

    use super::*;

    fn udid(s: &str) -> Udid {
        Udid::new(s).unwrap()
    }

    /// A muxer peer that answers one connection with a scripted exchange.
    fn spawn_peer<F, Fut>(path: &Path, script: F) -> JoinHandle<()>
    where
        F: FnOnce(UnixStream) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send,
    {
        let listener = UnixListener::bind(path).unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            script(stream).await;
        })
    }

    async fn expect(stream: &mut UnixStream) -> (u32, MuxerMessage) {
        let (header, message) = read_message(stream).await.unwrap().unwrap();
        (header.tag, message)
    }

    async fn reply(stream: &mut UnixStream, message: MuxerMessage, tag: u32) {
        write_message(stream, &message, &MuxerEnvelope::default(), tag)
            .await
            .unwrap();
    }

    fn client_for(path: &Path) -> MuxerClient {
        MuxerClient::new(MuxerEndpoint::Unix(path.to_path_buf()))
    }

    #[tokio::test]
    async fn list_devices_on_unreachable_socket_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let client = client_for(&dir.path().join("usbmuxd"));
        assert!(client.list_devices().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn list_devices_returns_reply() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("usbmuxd");
        let device = MuxerDevice::usb(DeviceId::new(1), udid("abc"));
        let expected = device.clone();

        let peer = spawn_peer(&path, move |mut stream| async move {
            let (tag, message) = expect(&mut stream).await;
            assert_eq!(message, MuxerMessage::ListDevices);
            reply(&mut stream, MuxerMessage::DeviceList { devices: vec![device] }, tag).await;
        });

        let devices = client_for(&path).list_devices().await.unwrap();
        assert_eq!(devices, vec![expected]);
        peer.await.unwrap();
    }

    #[tokio::test]
    async fn connect_hands_over_raw_stream() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("usbmuxd");

        let peer = spawn_peer(&path, |mut stream| async move {
            let (tag, message) = expect(&mut stream).await;
            assert_eq!(
                message,
                MuxerMessage::Connect {
                    device_id: DeviceId::new(7),
                    port: 62078
                }
            );
            // The tunnel payload follows the Result frame in the same write.
            let mut bytes = crate::codec::encode_frame(
                &MuxerMessage::Result {
                    code: ResultCode::Success,
                },
                &MuxerEnvelope::default(),
                tag,
            )
            .unwrap();
            bytes.extend_from_slice(b"hello");
            stream.write_all(&bytes).await.unwrap();

            let mut echo = [0u8; 4];
            stream.read_exact(&mut echo).await.unwrap();
            assert_eq!(&echo, b"ping");
        });

        let mut tunnel = client_for(&path)
            .connect(DeviceId::new(7), 62078)
            .await
            .unwrap();

        let mut greeting = [0u8; 5];
        tunnel.read_exact(&mut greeting).await.unwrap();
        assert_eq!(&greeting, b"hello");
        tunnel.write_all(b"ping").await.unwrap();
        peer.await.unwrap();
    }

    #[tokio::test]
    async fn connect_refused_is_retriable_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("usbmuxd");

        let peer = spawn_peer(&path, |mut stream| async move {
            let (tag, _) = expect(&mut stream).await;
            reply(
                &mut stream,
                MuxerMessage::Result {
                    code: ResultCode::ConnectionRefused,
                },
                tag,
            )
            .await;
        });

        let err = client_for(&path)
            .connect(DeviceId::new(7), 1234)
            .await
            .unwrap_err();
        assert!(matches!(err, MuxerError::Result(ResultCode::ConnectionRefused)));
        assert!(err.is_retriable());
        peer.await.unwrap();
    }

    #[tokio::test]
    async fn listen_returns_false_when_peer_closes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("usbmuxd");

        let peer = spawn_peer(&path, |mut stream| async move {
            let (tag, message) = expect(&mut stream).await;
            assert_eq!(message, MuxerMessage::Listen);
            reply(&mut stream, MuxerMessage::Result { code: ResultCode::Success }, tag).await;
            reply(
                &mut stream,
                MuxerMessage::DeviceAttached {
                    device: MuxerDevice::usb(DeviceId::new(1), Udid::new("abc").unwrap()),
                },
                0,
            )
            .await;
            reply(
                &mut stream,
                MuxerMessage::DeviceDetached {
                    device_id: DeviceId::new(1),
                },
                0,
            )
            .await;
        });

        let mut events = Vec::new();
        let stopped = client_for(&path)
            .listen(
                |event| {
                    events.push(event);
                    ListenAction::Continue
                },
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(!stopped);
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[0], MuxerEvent::Attached(d) if d.udid == udid("abc")));
        assert_eq!(events[1], MuxerEvent::Detached(DeviceId::new(1)));
        peer.await.unwrap();
    }

    #[tokio::test]
    async fn listen_returns_true_when_handler_stops() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("usbmuxd");

        let peer = spawn_peer(&path, |mut stream| async move {
            let (tag, _) = expect(&mut stream).await;
            reply(&mut stream, MuxerMessage::Result { code: ResultCode::Success }, tag).await;
            reply(
                &mut stream,
                MuxerMessage::DevicePaired {
                    device_id: DeviceId::new(4),
                },
                0,
            )
            .await;
            // Hold the connection open until the client hangs up.
            let mut buf = [0u8; 1];
            let _ = stream.read(&mut buf).await;
        });

        let stopped = client_for(&path)
            .listen(|_| ListenAction::Stop, &CancellationToken::new())
            .await
            .unwrap();

        assert!(stopped);
        peer.await.unwrap();
    }

    #[tokio::test]
    async fn listen_rejected_subscription_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("usbmuxd");

        let peer = spawn_peer(&path, |mut stream| async move {
            let (tag, _) = expect(&mut stream).await;
            reply(
                &mut stream,
                MuxerMessage::Result {
                    code: ResultCode::BadVersion,
                },
                tag,
            )
            .await;
        });

        let result = client_for(&path)
            .listen(|_| ListenAction::Continue, &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(MuxerError::Result(ResultCode::BadVersion))));
        peer.await.unwrap();
    }

    #[tokio::test]
    async fn listen_cancellation_closes_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("usbmuxd");
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();

        let peer = spawn_peer(&path, move |mut stream| async move {
            let (tag, _) = expect(&mut stream).await;
            reply(&mut stream, MuxerMessage::Result { code: ResultCode::Success }, tag).await;
            trigger.cancel();
            // The client drops its end once cancelled.
            assert!(!matches!(read_message(&mut stream).await, Ok(Some(_))));
        });

        let result = client_for(&path)
            .listen(|_| ListenAction::Continue, &cancel)
            .await;
        assert!(matches!(result, Err(MuxerError::Cancelled)));
        peer.await.unwrap();
    }

    #[tokio::test]
    async fn read_missing_pairing_record_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("usbmuxd");

        let peer = spawn_peer(&path, |mut stream| async move {
            let (tag, message) = expect(&mut stream).await;
            assert_eq!(message, MuxerMessage::ReadPairingRecord { id: udid("abc") });
            reply(
                &mut stream,
                MuxerMessage::Result {
                    code: ResultCode::BadDevice,
                },
                tag,
            )
            .await;
        });

        let record = client_for(&path)
            .read_pairing_record(&udid("abc"))
            .await
            .unwrap();
        assert!(record.is_none());
        peer.await.unwrap();
    }

    #[tokio::test]
    async fn save_then_read_pairing_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("usbmuxd");
        let record = PairingRecord {
            device_certificate: b"device".to_vec(),
            host_certificate: b"host".to_vec(),
            host_private_key: b"host-key".to_vec(),
            root_certificate: b"root".to_vec(),
            root_private_key: b"root-key".to_vec(),
            host_id: "HOST".to_string(),
            system_buid: "BUID".to_string(),
            escrow_bag: None,
            wifi_mac_address: None,
        };

        let listener = UnixListener::bind(&path).unwrap();
        let peer = tokio::spawn(async move {
            let (mut save, _) = listener.accept().await.unwrap();
            let (tag, message) = expect(&mut save).await;
            let MuxerMessage::SavePairingRecord { id, data } = message else {
                panic!("expected SavePairRecord");
            };
            assert_eq!(id, udid("abc"));
            reply(&mut save, MuxerMessage::Result { code: ResultCode::Success }, tag).await;

            let (mut read, _) = listener.accept().await.unwrap();
            let (tag, _) = expect(&mut read).await;
            reply(&mut read, MuxerMessage::PairingRecordData { data }, tag).await;
        });

        let client = client_for(&path);
        client
            .save_pairing_record(&udid("abc"), &record)
            .await
            .unwrap();
        let read = client.read_pairing_record(&udid("abc")).await.unwrap();
        assert_eq!(read, Some(record));
        peer.await.unwrap();
    }

    #[tokio::test]
    async fn delete_pairing_record_reports_muxer_result() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("usbmuxd");

        let listener = UnixListener::bind(&path).unwrap();
        let peer = tokio::spawn(async move {
            for code in [ResultCode::Success, ResultCode::BadDevice] {
                let (mut stream, _) = listener.accept().await.unwrap();
                let (tag, message) = expect(&mut stream).await;
                assert_eq!(
                    message,
                    MuxerMessage::DeletePairingRecord { id: udid("abc") }
                );
                reply(&mut stream, MuxerMessage::Result { code }, tag).await;
            }
        });

        let client = client_for(&path);
        client.delete_pairing_record(&udid("abc")).await.unwrap();
        assert!(matches!(
            client.delete_pairing_record(&udid("abc")).await,
            Err(MuxerError::Result(ResultCode::BadDevice))
        ));
        peer.await.unwrap();
    }

    #[tokio::test]
    async fn read_buid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("usbmuxd");

        let peer = spawn_peer(&path, |mut stream| async move {
            let (tag, message) = expect(&mut stream).await;
            assert_eq!(message, MuxerMessage::ReadBuid);
            reply(
                &mut stream,
                MuxerMessage::Buid {
                    buid: "30642A2B".to_string(),
                },
                tag,
            )
            .await;
        });

        assert_eq!(client_for(&path).read_buid().await.unwrap(), "30642A2B");
        peer.await.unwrap();
    }

    #[tokio::test]
    async fn connection_request_over_duplex() {
        let (client_io, mut server_io) = tokio::io::duplex(4096);
        let mut conn = MuxerConnection::new(client_io, MuxerEnvelope::default());

        let peer = tokio::spawn(async move {
            let (header, message) = read_message(&mut server_io).await.unwrap().unwrap();
            assert_eq!(header.tag, 1);
            assert_eq!(message, MuxerMessage::ListDevices);
            write_message(
                &mut server_io,
                &MuxerMessage::DeviceList { devices: vec![] },
                &MuxerEnvelope::default(),
                header.tag,
            )
            .await
            .unwrap();
        });

        let reply = conn.request(&MuxerMessage::ListDevices).await.unwrap();
        assert_eq!(reply, MuxerMessage::DeviceList { devices: vec![] });
        peer.await.unwrap();

        assert!(matches!(
            conn.request(&MuxerMessage::ListDevices).await,
            Err(MuxerError::ConnectionClosed | MuxerError::Io(_))
        ));
    }
}
