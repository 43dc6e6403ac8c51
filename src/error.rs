//! Error types for the coordinator engine

use meshcoord_shared::codec::CodecError;
use thiserror::Error;

/// Failure of a single command, delivered to the caller through its ticket
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CommandError {
    #[error("endpoint not found: {address} ep {endpoint}")]
    EndpointNotFound { address: String, endpoint: u8 },

    #[error("timeout after {after_ms}ms")]
    Timeout { after_ms: u64 },

    #[error("transport error: {0}")]
    Transport(String),
}

impl From<TransportError> for CommandError {
    fn from(err: TransportError) -> Self {
        CommandError::Transport(err.to_string())
    }
}

/// Synchronous rejection of an enqueue request
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DispatchError {
    #[error("command dispatcher is closed")]
    Closed,

    #[error("cmdType {0} not supported")]
    UnsupportedKind(String),
}

/// Errors raised by a transport adapter
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("transport not started")]
    NotStarted,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serial port error: {0}")]
    Serial(#[from] tokio_serial::Error),

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("{0}")]
    Remote(String),

    #[error("request timed out")]
    Timeout,

    #[error("transport link closed")]
    Closed,
}

/// Best-effort persistence failures; logged, never surfaced to callers
#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid config: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("invalid PAN id {0:?} (expected hex, e.g. 0x1a62)")]
    InvalidPanId(String),

    #[error("invalid network key: {0}")]
    InvalidNetworkKey(String),
}

/// Failure of a network management operation (bind, unbind, remove, permit join)
#[derive(Error, Debug)]
pub enum ManagementError {
    #[error("source endpoint {address} {endpoint} unknown")]
    UnknownSource { address: String, endpoint: u8 },

    #[error("destination endpoint {address} {endpoint} unknown")]
    UnknownDestination { address: String, endpoint: u8 },

    #[error(transparent)]
    Transport(#[from] TransportError),
}
