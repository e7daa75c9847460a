use thiserror::Error;

/// Transport-level failures: the subset of error kinds a transport
/// itself can originate, independent of any application-level error
/// the RPC target returns.
#[derive(Debug, Error, Clone)]
pub enum TransportError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("no entry: {0}")]
    NoEntry(String),

    #[error("peer unreachable: {0}")]
    NoDevice(String),

    #[error("operation was cancelled")]
    Cancelled,

    #[error("transport error: {0}")]
    Other(String),
}
