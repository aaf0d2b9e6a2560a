//! Error types for the aggregation pipeline

use std::fmt;

/// Persistence layer failure
#[derive(Debug)]
pub enum StoreError {
    Database(rusqlite::Error),
    Io(std::io::Error),
    /// A stored value could not be decoded (bad decimal, unknown event kind)
    Decode(String),
    Schema(String),
    /// The connection mutex was poisoned by a panicking writer
    Lock,
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        StoreError::Database(err)
    }
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::Io(err)
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Database(e) => write!(f, "Database error: {}", e),
            StoreError::Io(e) => write!(f, "IO error: {}", e),
            StoreError::Decode(msg) => write!(f, "Decode error: {}", msg),
            StoreError::Schema(msg) => write!(f, "Schema error: {}", msg),
            StoreError::Lock => write!(f, "Database connection lock poisoned"),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StoreError::Database(e) => Some(e),
            StoreError::Io(e) => Some(e),
            _ => None,
        }
    }
}

/// Balance oracle failure; callers fall back to delta accounting
#[derive(Debug)]
pub enum OracleError {
    Http(reqwest::Error),
    Malformed(String),
    InvalidAddress(String),
    NotConfigured,
}

impl From<reqwest::Error> for OracleError {
    fn from(err: reqwest::Error) -> Self {
        OracleError::Http(err)
    }
}

impl fmt::Display for OracleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OracleError::Http(e) => write!(f, "HTTP error: {}", e),
            OracleError::Malformed(msg) => write!(f, "Malformed balance response: {}", msg),
            OracleError::InvalidAddress(msg) => write!(f, "Invalid address: {}", msg),
            OracleError::NotConfigured => write!(f, "Balance oracle not configured"),
        }
    }
}

impl std::error::Error for OracleError {}

/// The consumer side of the dispatcher has shut down
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchError;

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Event dispatcher closed")
    }
}

impl std::error::Error for DispatchError {}

/// Failure of one live polling pass
#[derive(Debug)]
pub enum IngestError {
    Store(StoreError),
    Dispatch(DispatchError),
}

impl From<StoreError> for IngestError {
    fn from(err: StoreError) -> Self {
        IngestError::Store(err)
    }
}

impl From<DispatchError> for IngestError {
    fn from(err: DispatchError) -> Self {
        IngestError::Dispatch(err)
    }
}

impl fmt::Display for IngestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IngestError::Store(e) => write!(f, "Store error: {}", e),
            IngestError::Dispatch(e) => write!(f, "Dispatch error: {}", e),
        }
    }
}

impl std::error::Error for IngestError {}

/// Failure of a single resync cycle
#[derive(Debug)]
pub enum ResyncError {
    BeginTimeout(String),
    EndTimeout(String),
    Dispatch(DispatchError),
    Store(StoreError),
}

impl From<DispatchError> for ResyncError {
    fn from(err: DispatchError) -> Self {
        ResyncError::Dispatch(err)
    }
}

impl From<StoreError> for ResyncError {
    fn from(err: StoreError) -> Self {
        ResyncError::Store(err)
    }
}

impl fmt::Display for ResyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResyncError::BeginTimeout(hash) => {
                write!(f, "Begin re-sync of {} not acknowledged in time", hash)
            }
            ResyncError::EndTimeout(hash) => {
                write!(f, "End re-sync of {} not acknowledged in time", hash)
            }
            ResyncError::Dispatch(e) => write!(f, "Dispatch error: {}", e),
            ResyncError::Store(e) => write!(f, "Store error: {}", e),
        }
    }
}

impl std::error::Error for ResyncError {}

/// Failure while processing one event inside the engine
#[derive(Debug)]
pub enum EngineError {
    Baseline(StoreError),
}

impl From<StoreError> for EngineError {
    fn from(err: StoreError) -> Self {
        EngineError::Baseline(err)
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::Baseline(e) => write!(f, "Baseline load failed: {}", e),
        }
    }
}

impl std::error::Error for EngineError {}

#[derive(Debug)]
pub enum ConfigError {
    InvalidValue(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::InvalidValue(msg) => write!(f, "Invalid configuration value: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}
