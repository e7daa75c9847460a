use thiserror::Error;

/// The application-level error kinds, as a language type. Transport-level
/// failures (`margo_transport::TransportError`) are folded into the
/// matching variant at the boundary rather than wrapped opaquely, so
/// callers can match on `kind()` regardless of which layer raised it.
#[derive(Debug, Error, Clone)]
pub enum MargoError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("no entry: {0}")]
    NoEntry(String),

    #[error("registration known but not for provider {provider}: {name}")]
    NoMatch { name: String, provider: u16 },

    #[error("operation timed out")]
    Timeout,

    #[error("operation was cancelled")]
    Cancelled,

    #[error("permission denied: {0}")]
    Permission(String),

    #[error("peer unreachable: {0}")]
    NoDevice(String),

    #[error("{0}")]
    Other(String),
}

/// A short, stable name for each kind, independent of the `Display`
/// message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidArgument,
    NoEntry,
    NoMatch,
    Timeout,
    Cancelled,
    Permission,
    NoDevice,
    Other,
}

impl MargoError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            MargoError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            MargoError::NoEntry(_) => ErrorKind::NoEntry,
            MargoError::NoMatch { .. } => ErrorKind::NoMatch,
            MargoError::Timeout => ErrorKind::Timeout,
            MargoError::Cancelled => ErrorKind::Cancelled,
            MargoError::Permission(_) => ErrorKind::Permission,
            MargoError::NoDevice(_) => ErrorKind::NoDevice,
            MargoError::Other(_) => ErrorKind::Other,
        }
    }
}

impl From<margo_transport::TransportError> for MargoError {
    fn from(e: margo_transport::TransportError) -> Self {
        match e {
            margo_transport::TransportError::InvalidArgument(s) => MargoError::InvalidArgument(s),
            margo_transport::TransportError::NoEntry(s) => MargoError::NoEntry(s),
            margo_transport::TransportError::NoDevice(s) => MargoError::NoDevice(s),
            margo_transport::TransportError::Cancelled => MargoError::Cancelled,
            margo_transport::TransportError::Other(s) => MargoError::Other(s),
        }
    }
}

impl From<anyhow::Error> for MargoError {
    fn from(e: anyhow::Error) -> Self {
        MargoError::Other(e.to_string())
    }
}
