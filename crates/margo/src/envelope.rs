use serde::{Deserialize, Serialize};

use crate::error::{ErrorKind, MargoError};

/// Wire-level error code, carried in every envelope regardless of
/// direction. A small closed set rather than a string, so it
/// round-trips exactly and cheaply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WireErrorCode {
    Success,
    InvalidArgument,
    NoEntry,
    NoMatch,
    Timeout,
    Cancelled,
    Permission,
    NoDevice,
    Other,
}

impl WireErrorCode {
    pub fn from_kind(kind: ErrorKind) -> Self {
        match kind {
            ErrorKind::InvalidArgument => WireErrorCode::InvalidArgument,
            ErrorKind::NoEntry => WireErrorCode::NoEntry,
            ErrorKind::NoMatch => WireErrorCode::NoMatch,
            ErrorKind::Timeout => WireErrorCode::Timeout,
            ErrorKind::Cancelled => WireErrorCode::Cancelled,
            ErrorKind::Permission => WireErrorCode::Permission,
            ErrorKind::NoDevice => WireErrorCode::NoDevice,
            ErrorKind::Other => WireErrorCode::Other,
        }
    }

    /// `provider` is only meaningful for `NoMatch` — every other variant
    /// ignores it.
    pub fn into_error(self, message: impl Into<String>, provider: u16) -> Option<MargoError> {
        let message = message.into();
        match self {
            WireErrorCode::Success => None,
            WireErrorCode::InvalidArgument => Some(MargoError::InvalidArgument(message)),
            WireErrorCode::NoEntry => Some(MargoError::NoEntry(message)),
            WireErrorCode::NoMatch => Some(MargoError::NoMatch { name: message, provider }),
            WireErrorCode::Timeout => Some(MargoError::Timeout),
            WireErrorCode::Cancelled => Some(MargoError::Cancelled),
            WireErrorCode::Permission => Some(MargoError::Permission(message)),
            WireErrorCode::NoDevice => Some(MargoError::NoDevice(message)),
            WireErrorCode::Other => Some(MargoError::Other(message)),
        }
    }
}

/// A fixed-size header plus an opaque application payload: the parent
/// RPC id propagates a cause chain for observability, the error code
/// carries target-side failures across the wire without losing the
/// distinction from transport failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub parent_rpc_id: u64,
    pub error: WireErrorCode,
    pub error_message: String,
    /// Only populated for `WireErrorCode::NoMatch`, where `error_message`
    /// carries the bare RPC name and this carries the provider id the
    /// name was registered under no match for.
    #[serde(default)]
    pub error_provider: u16,
    pub payload: Vec<u8>,
}

impl Envelope {
    pub fn request(parent_rpc_id: u64, payload: Vec<u8>) -> Self {
        Self {
            parent_rpc_id,
            error: WireErrorCode::Success,
            error_message: String::new(),
            error_provider: 0,
            payload,
        }
    }

    pub fn success_response(payload: Vec<u8>) -> Self {
        Self {
            parent_rpc_id: 0,
            error: WireErrorCode::Success,
            error_message: String::new(),
            error_provider: 0,
            payload,
        }
    }

    pub fn error_response(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            parent_rpc_id: 0,
            error: WireErrorCode::from_kind(kind),
            error_message: message.into(),
            error_provider: 0,
            payload: Vec::new(),
        }
    }

    /// A `NoMatch` response that keeps the name and provider structurally
    /// separate, so the client decodes `MargoError::NoMatch { name,
    /// provider }` without parsing a formatted sentence back apart.
    pub fn no_match_response(name: impl Into<String>, provider: u16) -> Self {
        Self {
            parent_rpc_id: 0,
            error: WireErrorCode::NoMatch,
            error_message: name.into(),
            error_provider: provider,
            payload: Vec::new(),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("envelope serialization is infallible")
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, MargoError> {
        serde_json::from_slice(bytes).map_err(|e| MargoError::Other(format!("malformed envelope: {e}")))
    }

    pub fn into_result(self) -> Result<Vec<u8>, MargoError> {
        match self.error.into_error(self.error_message, self.error_provider) {
            None => Ok(self.payload),
            Some(e) => Err(e),
        }
    }
}
