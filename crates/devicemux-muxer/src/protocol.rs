//! usbmuxd message model.
//!
//! Every message is a property list dictionary. Requests carry a fixed
//! envelope identifying the client; replies and notifications are
//! self-describing through their `MessageType` entry, except for the few
//! replies usbmuxd sends without one, which are recognised by their payload.
//!
//! Each variant has an explicit encode and parse path. Unknown message
//! types are rejected rather than ignored.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use devicemux_core::{DeviceId, Udid};
use plist::{Dictionary, Value};

use crate::error::{MuxerError, Result};

/// The `kLibUSBMuxVersion` sent with every request.
pub const LIB_USBMUX_VERSION: u64 = 3;

const MESSAGE_TYPE: &str = "MessageType";
const DEVICE_ID: &str = "DeviceID";
const PROPERTIES: &str = "Properties";
const PORT_NUMBER: &str = "PortNumber";
const PAIR_RECORD_ID: &str = "PairRecordID";
const PAIR_RECORD_DATA: &str = "PairRecordData";
const DEVICE_LIST: &str = "DeviceList";
const NUMBER: &str = "Number";
const BUID: &str = "BUID";

/// Fields identifying this client to the muxer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MuxerEnvelope {
    /// Bundle identifier.
    pub bundle_id: String,
    /// Client version string.
    pub client_version: String,
    /// Program name.
    pub program_name: String,
}

impl Default for MuxerEnvelope {
    fn default() -> Self {
        Self {
            bundle_id: "io.devicemux.sidecar".to_string(),
            client_version: concat!("devicemux-", env!("CARGO_PKG_VERSION")).to_string(),
            program_name: "devicemux".to_string(),
        }
    }
}

impl MuxerEnvelope {
    fn write_into(&self, dict: &mut Dictionary) {
        dict.insert("BundleID".to_string(), Value::String(self.bundle_id.clone()));
        dict.insert(
            "ClientVersionString".to_string(),
            Value::String(self.client_version.clone()),
        );
        dict.insert("ProgName".to_string(), Value::String(self.program_name.clone()));
        dict.insert(
            "kLibUSBMuxVersion".to_string(),
            Value::Integer(LIB_USBMUX_VERSION.into()),
        );
    }
}

/// Result codes returned by the muxer in a `Result` message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResultCode {
    /// The request succeeded.
    Success,
    /// The request was malformed.
    BadCommand,
    /// The device or record does not exist.
    BadDevice,
    /// The device refused the connection (nothing listens on the port).
    ConnectionRefused,
    /// The protocol version is not supported.
    BadVersion,
    /// Any other code.
    Other(u64),
}

impl ResultCode {
    /// Convert a numeric result code.
    #[must_use]
    pub const fn from_code(code: u64) -> Self {
        match code {
            0 => Self::Success,
            1 => Self::BadCommand,
            2 => Self::BadDevice,
            3 => Self::ConnectionRefused,
            6 => Self::BadVersion,
            other => Self::Other(other),
        }
    }

    /// Return the numeric result code.
    #[must_use]
    pub const fn code(self) -> u64 {
        match self {
            Self::Success => 0,
            Self::BadCommand => 1,
            Self::BadDevice => 2,
            Self::ConnectionRefused => 3,
            Self::BadVersion => 6,
            Self::Other(code) => code,
        }
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Other(code) => write!(f, "result code {code}"),
            known => write!(f, "{known:?} ({})", known.code()),
        }
    }
}

/// How a device is connected to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionType {
    /// Attached over USB.
    Usb,
    /// Reachable over the network.
    Network,
}

impl ConnectionType {
    fn as_str(self) -> &'static str {
        match self {
            Self::Usb => "USB",
            Self::Network => "Network",
        }
    }
}

/// A device as reported by the muxer.
///
/// This is an immutable snapshot; the next `ListDevices` reply supersedes it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MuxerDevice {
    /// The muxer-assigned device ID.
    pub device_id: DeviceId,
    /// The device UDID.
    pub udid: Udid,
    /// How the device is connected.
    pub connection_type: ConnectionType,
    /// The device address, for network devices.
    pub address: Option<IpAddr>,
    /// USB product ID, when attached over USB.
    pub product_id: Option<u32>,
    /// USB location ID, when attached over USB.
    pub location_id: Option<u32>,
}

impl MuxerDevice {
    /// Create a USB-attached device.
    #[must_use]
    pub fn usb(device_id: DeviceId, udid: Udid) -> Self {
        Self {
            device_id,
            udid,
            connection_type: ConnectionType::Usb,
            address: None,
            product_id: None,
            location_id: None,
        }
    }

    fn from_properties(device_id: DeviceId, props: &Dictionary) -> Result<Self> {
        let udid = Udid::new(
            props
                .get("SerialNumber")
                .and_then(Value::as_string)
                .ok_or(MuxerError::MissingField("SerialNumber"))?,
        )?;

        let connection_type = match props.get("ConnectionType").and_then(Value::as_string) {
            Some("Network") => ConnectionType::Network,
            _ => ConnectionType::Usb,
        };

        let address = props
            .get("NetworkAddress")
            .and_then(Value::as_data)
            .and_then(parse_sockaddr);

        Ok(Self {
            device_id,
            udid,
            connection_type,
            address,
            product_id: get_u32(props, "ProductID"),
            location_id: get_u32(props, "LocationID"),
        })
    }

    fn to_properties(&self) -> Dictionary {
        let mut props = Dictionary::new();
        props.insert(
            "ConnectionType".to_string(),
            Value::String(self.connection_type.as_str().to_string()),
        );
        props.insert(
            DEVICE_ID.to_string(),
            Value::Integer(u64::from(self.device_id.get()).into()),
        );
        props.insert(
            "SerialNumber".to_string(),
            Value::String(self.udid.to_string()),
        );
        if let Some(product_id) = self.product_id {
            props.insert("ProductID".to_string(), Value::Integer(u64::from(product_id).into()));
        }
        if let Some(location_id) = self.location_id {
            props.insert(
                "LocationID".to_string(),
                Value::Integer(u64::from(location_id).into()),
            );
        }
        if let Some(address) = self.address {
            props.insert("NetworkAddress".to_string(), Value::Data(encode_sockaddr(address)));
        }
        props
    }

    fn to_attached_dictionary(&self) -> Dictionary {
        let mut dict = Dictionary::new();
        dict.insert(MESSAGE_TYPE.to_string(), Value::String("Attached".to_string()));
        dict.insert(
            DEVICE_ID.to_string(),
            Value::Integer(u64::from(self.device_id.get()).into()),
        );
        dict.insert(PROPERTIES.to_string(), Value::Dictionary(self.to_properties()));
        dict
    }

    fn from_attached_dictionary(dict: &Dictionary) -> Result<Self> {
        let device_id = required_device_id(dict)?;
        let props = dict
            .get(PROPERTIES)
            .and_then(Value::as_dictionary)
            .ok_or(MuxerError::MissingField(PROPERTIES))?;
        Self::from_properties(device_id, props)
    }
}

/// A message exchanged with the muxer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MuxerMessage {
    /// Subscribe to attach/detach/paired notifications.
    Listen,
    /// Open a tunnel to a port on a device.
    Connect {
        /// Target device.
        device_id: DeviceId,
        /// Target port, in host byte order.
        port: u16,
    },
    /// List the attached devices.
    ListDevices,
    /// Read the host's system BUID.
    ReadBuid,
    /// Read a stored pairing record.
    ReadPairingRecord {
        /// The device UDID.
        id: Udid,
    },
    /// Store a pairing record.
    SavePairingRecord {
        /// The device UDID.
        id: Udid,
        /// The record, as a property list document.
        data: Vec<u8>,
    },
    /// Delete a stored pairing record.
    DeletePairingRecord {
        /// The device UDID.
        id: Udid,
    },
    /// Outcome of a request.
    Result {
        /// The result code.
        code: ResultCode,
    },
    /// A device was attached.
    DeviceAttached {
        /// The attached device.
        device: MuxerDevice,
    },
    /// A device was detached.
    DeviceDetached {
        /// The detached device.
        device_id: DeviceId,
    },
    /// A device was paired with the host.
    DevicePaired {
        /// The paired device.
        device_id: DeviceId,
    },
    /// Reply to `ListDevices`.
    DeviceList {
        /// The attached devices.
        devices: Vec<MuxerDevice>,
    },
    /// Reply to `ReadPairingRecord`.
    PairingRecordData {
        /// The record, as a property list document.
        data: Vec<u8>,
    },
    /// Reply to `ReadBuid`.
    Buid {
        /// The system BUID.
        buid: String,
    },
}

impl MuxerMessage {
    /// The name of this message kind, as used in logs and errors.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Listen => "Listen",
            Self::Connect { .. } => "Connect",
            Self::ListDevices => "ListDevices",
            Self::ReadBuid => "ReadBUID",
            Self::ReadPairingRecord { .. } => "ReadPairRecord",
            Self::SavePairingRecord { .. } => "SavePairRecord",
            Self::DeletePairingRecord { .. } => "DeletePairRecord",
            Self::Result { .. } => "Result",
            Self::DeviceAttached { .. } => "Attached",
            Self::DeviceDetached { .. } => "Detached",
            Self::DevicePaired { .. } => "Paired",
            Self::DeviceList { .. } => "DeviceList",
            Self::PairingRecordData { .. } => "PairRecordData",
            Self::Buid { .. } => "BUID",
        }
    }

    /// Check whether this message is a request sent by a client.
    #[must_use]
    pub const fn is_request(&self) -> bool {
        matches!(
            self,
            Self::Listen
                | Self::Connect { .. }
                | Self::ListDevices
                | Self::ReadBuid
                | Self::ReadPairingRecord { .. }
                | Self::SavePairingRecord { .. }
                | Self::DeletePairingRecord { .. }
        )
    }

    /// Encode the message as a property list dictionary.
    ///
    /// Requests carry the client envelope; replies and notifications do not.
    #[must_use]
    pub fn to_dictionary(&self, envelope: &MuxerEnvelope) -> Dictionary {
        let mut dict = Dictionary::new();

        if self.is_request() {
            envelope.write_into(&mut dict);
        }

        match self {
            Self::Listen | Self::ListDevices | Self::ReadBuid => {
                dict.insert(MESSAGE_TYPE.to_string(), Value::String(self.name().to_string()));
            }
            Self::Connect { device_id, port } => {
                dict.insert(MESSAGE_TYPE.to_string(), Value::String(self.name().to_string()));
                dict.insert(
                    DEVICE_ID.to_string(),
                    Value::Integer(u64::from(device_id.get()).into()),
                );
                // usbmuxd expects the port in network byte order.
                dict.insert(
                    PORT_NUMBER.to_string(),
                    Value::Integer(u64::from(port.to_be()).into()),
                );
            }
            Self::ReadPairingRecord { id } | Self::DeletePairingRecord { id } => {
                dict.insert(MESSAGE_TYPE.to_string(), Value::String(self.name().to_string()));
                dict.insert(PAIR_RECORD_ID.to_string(), Value::String(id.to_string()));
            }
            Self::SavePairingRecord { id, data } => {
                dict.insert(MESSAGE_TYPE.to_string(), Value::String(self.name().to_string()));
                dict.insert(PAIR_RECORD_ID.to_string(), Value::String(id.to_string()));
                dict.insert(PAIR_RECORD_DATA.to_string(), Value::Data(data.clone()));
            }
            Self::Result { code } => {
                dict.insert(MESSAGE_TYPE.to_string(), Value::String(self.name().to_string()));
                dict.insert(NUMBER.to_string(), Value::Integer(code.code().into()));
            }
            Self::DeviceAttached { device } => {
                dict = device.to_attached_dictionary();
            }
            Self::DeviceDetached { device_id } | Self::DevicePaired { device_id } => {
                dict.insert(MESSAGE_TYPE.to_string(), Value::String(self.name().to_string()));
                dict.insert(
                    DEVICE_ID.to_string(),
                    Value::Integer(u64::from(device_id.get()).into()),
                );
            }
            Self::DeviceList { devices } => {
                let list = devices
                    .iter()
                    .map(|d| Value::Dictionary(d.to_attached_dictionary()))
                    .collect();
                dict.insert(DEVICE_LIST.to_string(), Value::Array(list));
            }
            Self::PairingRecordData { data } => {
                dict.insert(PAIR_RECORD_DATA.to_string(), Value::Data(data.clone()));
            }
            Self::Buid { buid } => {
                dict.insert(BUID.to_string(), Value::String(buid.clone()));
            }
        }

        dict
    }

    /// Parse a message from a property list dictionary.
    ///
    /// # Errors
    ///
    /// Returns `MuxerError::UnknownMessageType` for an unrecognised
    /// `MessageType`, or `MuxerError::MissingField` if the message cannot be
    /// identified or lacks a required field.
    pub fn from_dictionary(dict: &Dictionary) -> Result<Self> {
        let Some(message_type) = dict.get(MESSAGE_TYPE) else {
            return Self::from_untyped_reply(dict);
        };
        let message_type = message_type
            .as_string()
            .ok_or(MuxerError::MissingField(MESSAGE_TYPE))?;

        match message_type {
            "Listen" => Ok(Self::Listen),
            "ListDevices" => Ok(Self::ListDevices),
            "ReadBUID" => Ok(Self::ReadBuid),
            "Connect" => parse_connect(dict),
            "ReadPairRecord" => Ok(Self::ReadPairingRecord {
                id: required_record_id(dict)?,
            }),
            "SavePairRecord" => Ok(Self::SavePairingRecord {
                id: required_record_id(dict)?,
                data: required_record_data(dict)?,
            }),
            "DeletePairRecord" => Ok(Self::DeletePairingRecord {
                id: required_record_id(dict)?,
            }),
            "Result" => {
                let code = get_u64(dict, NUMBER).ok_or(MuxerError::MissingField(NUMBER))?;
                Ok(Self::Result {
                    code: ResultCode::from_code(code),
                })
            }
            "Attached" => Ok(Self::DeviceAttached {
                device: MuxerDevice::from_attached_dictionary(dict)?,
            }),
            "Detached" => Ok(Self::DeviceDetached {
                device_id: required_device_id(dict)?,
            }),
            "Paired" => Ok(Self::DevicePaired {
                device_id: required_device_id(dict)?,
            }),
            other => Err(MuxerError::UnknownMessageType(other.to_string())),
        }
    }

    /// Replies usbmuxd sends without a `MessageType`.
    fn from_untyped_reply(dict: &Dictionary) -> Result<Self> {
        if let Some(list) = dict.get(DEVICE_LIST) {
            let entries = list
                .as_array()
                .ok_or(MuxerError::MissingField(DEVICE_LIST))?;
            let devices = entries
                .iter()
                .map(|entry| {
                    entry
                        .as_dictionary()
                        .ok_or(MuxerError::MissingField(DEVICE_LIST))
                        .and_then(MuxerDevice::from_attached_dictionary)
                })
                .collect::<Result<Vec<_>>>()?;
            return Ok(Self::DeviceList { devices });
        }

        if dict.contains_key(PAIR_RECORD_DATA) {
            return Ok(Self::PairingRecordData {
                data: required_record_data(dict)?,
            });
        }

        if let Some(buid) = dict.get(BUID) {
            let buid = buid.as_string().ok_or(MuxerError::MissingField(BUID))?;
            return Ok(Self::Buid {
                buid: buid.to_string(),
            });
        }

        Err(MuxerError::MissingField(MESSAGE_TYPE))
    }
}

fn parse_connect(dict: &Dictionary) -> Result<MuxerMessage> {
    let device_id = required_device_id(dict)?;
    let raw_port = get_u64(dict, PORT_NUMBER)
        .and_then(|p| u16::try_from(p).ok())
        .ok_or(MuxerError::MissingField(PORT_NUMBER))?;

    Ok(MuxerMessage::Connect {
        device_id,
        port: u16::from_be(raw_port),
    })
}

fn required_device_id(dict: &Dictionary) -> Result<DeviceId> {
    get_u32(dict, DEVICE_ID)
        .map(DeviceId::new)
        .ok_or(MuxerError::MissingField(DEVICE_ID))
}

fn required_record_id(dict: &Dictionary) -> Result<Udid> {
    let id = dict
        .get(PAIR_RECORD_ID)
        .and_then(Value::as_string)
        .ok_or(MuxerError::MissingField(PAIR_RECORD_ID))?;
    Ok(Udid::new(id)?)
}

fn required_record_data(dict: &Dictionary) -> Result<Vec<u8>> {
    dict.get(PAIR_RECORD_DATA)
        .and_then(Value::as_data)
        .map(<[u8]>::to_vec)
        .ok_or(MuxerError::MissingField(PAIR_RECORD_DATA))
}

fn get_u64(dict: &Dictionary, key: &str) -> Option<u64> {
    let value = dict.get(key)?;
    value.as_unsigned_integer().or_else(|| {
        value
            .as_signed_integer()
            .and_then(|v| u64::try_from(v).ok())
    })
}

fn get_u32(dict: &Dictionary, key: &str) -> Option<u32> {
    get_u64(dict, key).and_then(|v| u32::try_from(v).ok())
}

/// Parse a BSD `sockaddr` as sent in `NetworkAddress`.
///
/// Byte 1 is the address family: 2 for IPv4, 30 (Darwin) or 10 (Linux) for
/// IPv6.
fn parse_sockaddr(bytes: &[u8]) -> Option<IpAddr> {
    match bytes.get(1)? {
        2 => {
            let octets: [u8; 4] = bytes.get(4..8)?.try_into().ok()?;
            Some(IpAddr::V4(Ipv4Addr::from(octets)))
        }
        10 | 30 => {
            let octets: [u8; 16] = bytes.get(8..24)?.try_into().ok()?;
            Some(IpAddr::V6(Ipv6Addr::from(octets)))
        }
        _ => None,
    }
}

fn encode_sockaddr(address: IpAddr) -> Vec<u8> {
    match address {
        IpAddr::V4(v4) => {
            let mut bytes = vec![16, 2, 0, 0];
            bytes.extend_from_slice(&v4.octets());
            bytes.resize(16, 0);
            bytes
        }
        IpAddr::V6(v6) => {
            let mut bytes = vec![28, 30, 0, 0, 0, 0, 0, 0];
            bytes.extend_from_slice(&v6.octets());
            bytes.resize(28, 0);
            bytes
        }
    }
}
