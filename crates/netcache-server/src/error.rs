//! Error types for the netcache server

use std::fmt;

#[derive(Debug)]
pub enum NetcacheError {
    Store(netcache_store::StoreError),
    /// Malformed frame, unknown command or command on the wrong endpoint
    Protocol(String),
    Io(Box<std::io::Error>),
    Config(String),
    Encode(String),
    IdleTimeout,
}

impl fmt::Display for NetcacheError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetcacheError::Store(err) => write!(f, "Store error: {}", err),
            NetcacheError::Protocol(msg) => write!(f, "Protocol violation: {}", msg),
            NetcacheError::Io(err) => write!(f, "IO error: {}", err),
            NetcacheError::Config(msg) => write!(f, "Configuration error: {}", msg),
            NetcacheError::Encode(msg) => write!(f, "Encode error: {}", msg),
            NetcacheError::IdleTimeout => write!(f, "Timed out waiting for a command"),
        }
    }
}

impl std::error::Error for NetcacheError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            NetcacheError::Store(err) => Some(err),
            NetcacheError::Io(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

impl From<netcache_store::StoreError> for NetcacheError {
    fn from(err: netcache_store::StoreError) -> Self {
        NetcacheError::Store(err)
    }
}

impl From<std::io::Error> for NetcacheError {
    fn from(err: std::io::Error) -> Self {
        NetcacheError::Io(Box::new(err))
    }
}

impl From<serde_json::Error> for NetcacheError {
    fn from(err: serde_json::Error) -> Self {
        NetcacheError::Encode(err.to_string())
    }
}

impl From<tracing_subscriber::filter::ParseError> for NetcacheError {
    fn from(err: tracing_subscriber::filter::ParseError) -> Self {
        NetcacheError::Config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, NetcacheError>;
