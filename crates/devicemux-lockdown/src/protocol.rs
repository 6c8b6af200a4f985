//! Lockdown message model.

use std::fmt;

use plist::{Dictionary, Value};

use crate::error::{LockdownError, Result};

/// The TCP port lockdown listens on, reached through a muxer `Connect`.
pub const LOCKDOWN_PORT: u16 = 0xF27E;

/// The service type reported by `QueryType`.
pub const LOCKDOWN_SERVICE_TYPE: &str = "com.apple.mobile.lockdown";

/// Pairing protocol version sent with pairing requests.
pub const PAIRING_PROTOCOL_VERSION: &str = "2";

/// A lockdown request.
#[derive(Debug, Clone, PartialEq)]
pub struct LockdownRequest {
    request: &'static str,
    domain: Option<String>,
    key: Option<String>,
    value: Option<Value>,
    extra: Dictionary,
}

impl LockdownRequest {
    /// Create a request of the given kind.
    #[must_use]
    pub fn new(request: &'static str) -> Self {
        Self {
            request,
            domain: None,
            key: None,
            value: None,
            extra: Dictionary::new(),
        }
    }

    /// Set the `Domain` field.
    #[must_use]
    pub fn domain(mut self, domain: Option<&str>) -> Self {
        self.domain = domain.map(str::to_string);
        self
    }

    /// Set the `Key` field.
    #[must_use]
    pub fn key(mut self, key: Option<&str>) -> Self {
        self.key = key.map(str::to_string);
        self
    }

    /// Set the `Value` field.
    #[must_use]
    pub fn value(mut self, value: Value) -> Self {
        self.value = Some(value);
        self
    }

    /// Add a request-specific field.
    #[must_use]
    pub fn field(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.extra.insert(name.to_string(), value.into());
        self
    }

    /// The request kind.
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.request
    }

    /// Encode the request with the client label.
    #[must_use]
    pub fn to_dictionary(&self, label: &str) -> Dictionary {
        let mut dict = Dictionary::new();
        dict.insert("Label".to_string(), Value::String(label.to_string()));
        dict.insert("Request".to_string(), Value::String(self.request.to_string()));
        if let Some(domain) = &self.domain {
            dict.insert("Domain".to_string(), Value::String(domain.clone()));
        }
        if let Some(key) = &self.key {
            dict.insert("Key".to_string(), Value::String(key.clone()));
        }
        if let Some(value) = &self.value {
            dict.insert("Value".to_string(), value.clone());
        }
        for (name, value) in &self.extra {
            dict.insert(name.clone(), value.clone());
        }
        dict
    }
}

/// A lockdown response.
#[derive(Debug, Clone, PartialEq)]
pub struct LockdownResponse {
    request: String,
    payload: Dictionary,
}

impl LockdownResponse {
    /// Wrap a response dictionary, checking it answers `request`.
    ///
    /// # Errors
    ///
    /// Returns an error if the response echoes a different request.
    pub fn from_dictionary(request: &str, payload: Dictionary) -> Result<Self> {
        match payload.get("Request").and_then(Value::as_string) {
            Some(echo) if echo != request => Err(LockdownError::InvalidFrame(format!(
                "response to {echo} received for {request}"
            ))),
            _ => Ok(Self {
                request: request.to_string(),
                payload,
            }),
        }
    }

    /// The error string, if the request failed.
    #[must_use]
    pub fn error(&self) -> Option<&str> {
        self.payload.get("Error").and_then(Value::as_string)
    }

    /// The `Value` field.
    #[must_use]
    pub fn value(&self) -> Option<&Value> {
        self.payload.get("Value")
    }

    /// Look up a field.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.payload.get(name)
    }

    /// Fail with `LockdownError::Protocol` if the response carries an error.
    ///
    /// # Errors
    ///
    /// Returns the error carried by the response.
    pub fn into_success(self) -> Result<Self> {
        match self.error() {
            Some(error) => Err(self.protocol_error(error.to_string())),
            None => Ok(self),
        }
    }

    pub(crate) fn protocol_error(&self, error: String) -> LockdownError {
        LockdownError::Protocol {
            request: self.request.clone(),
            error,
            payload: self.payload.clone(),
        }
    }
}

/// Outcome of a `Pair`, `Unpair` or `ValidatePair` request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PairingStatus {
    /// The request succeeded.
    Success,
    /// The user tapped "Don't Trust".
    UserDeniedPairing,
    /// The trust dialog is still showing.
    PairingDialogResponsePending,
    /// The device does not accept the pairing record.
    InvalidPairRecord,
}

impl PairingStatus {
    /// Map a lockdown error string onto a status. `None` means success.
    ///
    /// Returns `None` for error strings that are not pairing outcomes.
    #[must_use]
    pub fn from_error(error: Option<&str>) -> Option<Self> {
        match error {
            None => Some(Self::Success),
            Some("UserDeniedPairing") => Some(Self::UserDeniedPairing),
            Some("PairingDialogResponsePending") => Some(Self::PairingDialogResponsePending),
            Some("InvalidPairRecord") => Some(Self::InvalidPairRecord),
            Some(_) => None,
        }
    }

    /// Whether pairing may still succeed if the request is repeated.
    #[must_use]
    pub const fn is_pending(self) -> bool {
        matches!(self, Self::PairingDialogResponsePending)
    }
}

impl fmt::Display for PairingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Success => "Success",
            Self::UserDeniedPairing => "UserDeniedPairing",
            Self::PairingDialogResponsePending => "PairingDialogResponsePending",
            Self::InvalidPairRecord => "InvalidPairRecord",
        };
        f.write_str(s)
    }
}

/// Result of a `Pair` request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairOutcome {
    /// The pairing status.
    pub status: PairingStatus,
    /// The escrow bag returned by a successful pairing.
    pub escrow_bag: Option<Vec<u8>>,
}

/// A lockdown session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    /// The session identifier.
    pub session_id: String,
    /// Whether the connection must be upgraded to TLS.
    pub enable_ssl: bool,
}

/// A service started through lockdown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDescriptor {
    /// The device port the service listens on.
    pub port: u16,
    /// Whether the service tunnel must be upgraded to TLS.
    pub enable_service_ssl: bool,
    /// The service name.
    pub service_name: String,
}

pub(crate) fn get_u64(value: &Value) -> Option<u64> {
    value
        .as_unsigned_integer()
        .or_else(|| value.as_signed_integer().and_then(|v| u64::try_from(v).ok()))
}
