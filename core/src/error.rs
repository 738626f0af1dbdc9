use std::fmt;
use thiserror::Error;

/// Which store operation failed. Carried by every `StoreError`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOp {
    Connect,
    Store,
    GetSimilar,
    Cleanup,
    UpdateStatus,
    Close,
}

impl fmt::Display for StoreOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StoreOp::Connect      => "connect",
            StoreOp::Store        => "store",
            StoreOp::GetSimilar   => "get_similar",
            StoreOp::Cleanup      => "cleanup",
            StoreOp::UpdateStatus => "update_status",
            StoreOp::Close        => "close",
        })
    }
}

/// Rejected at detector construction. Never raised mid-operation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid time window: must be between 1 second and 100 years")]
    InvalidTimeWindow,

    #[error("invalid cleanup interval: must be positive")]
    InvalidCleanupInterval,

    #[error("invalid max records per key: must be at least 1")]
    InvalidMaxRecords,

    #[error("invalid amount precision: at most 15 decimal places")]
    InvalidAmountPrecision,

    #[error("missing redis config for storage type 'redis'")]
    MissingRedisConfig,

    #[error("missing sqlite config for storage type 'sqlite'")]
    MissingSqliteConfig,

    #[error("unsupported storage type '{0}'")]
    UnsupportedStorageType(String),

    #[error("invalid risk rule '{name}': {reason}")]
    InvalidRule { name: String, reason: String },
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("{op} cancelled")]
    Cancelled { op: StoreOp },

    #[error("{op} timed out")]
    TimedOut { op: StoreOp },

    #[error("{op} on closed store")]
    Closed { op: StoreOp },

    #[error("{op} failed: redis error: {source}")]
    Redis {
        op: StoreOp,
        #[source]
        source: redis::RedisError,
    },

    #[error("{op} failed: database error: {source}")]
    Database {
        op: StoreOp,
        #[source]
        source: rusqlite::Error,
    },

    #[error("{op} failed: serialization error: {source}")]
    Serialization {
        op: StoreOp,
        #[source]
        source: serde_json::Error,
    },

    #[error("{op} failed: lock poisoned")]
    Poisoned { op: StoreOp },

    #[error("could not start sweeper thread: {0}")]
    Spawn(#[source] std::io::Error),
}

impl StoreError {
    pub fn op(&self) -> Option<StoreOp> {
        match self {
            StoreError::Cancelled { op }
            | StoreError::TimedOut { op }
            | StoreError::Closed { op }
            | StoreError::Redis { op, .. }
            | StoreError::Database { op, .. }
            | StoreError::Serialization { op, .. }
            | StoreError::Poisoned { op } => Some(*op),
            StoreError::Spawn(_) => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, StoreError::Cancelled { .. })
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, StoreError::TimedOut { .. })
    }

    pub(crate) fn redis(op: StoreOp, source: redis::RedisError) -> Self {
        if source.is_timeout() {
            StoreError::TimedOut { op }
        } else {
            StoreError::Redis { op, source }
        }
    }

    pub(crate) fn database(op: StoreOp, source: rusqlite::Error) -> Self {
        StoreError::Database { op, source }
    }

    pub(crate) fn serialization(op: StoreOp, source: serde_json::Error) -> Self {
        StoreError::Serialization { op, source }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Error, Debug)]
pub enum DedupError {
    #[error("invalid config: {0}")]
    Config(#[from] ConfigError),

    #[error("get similar transactions failed: {0}")]
    Lookup(#[source] StoreError),

    #[error("store transaction failed: {0}")]
    Record(#[source] StoreError),

    #[error("update transaction status failed: {0}")]
    StatusUpdate(#[source] StoreError),

    #[error("storage error: {0}")]
    Storage(#[source] StoreError),

    #[error("transaction '{transaction_id}' not found")]
    TransactionNotFound { transaction_id: String },
}

impl DedupError {
    /// The underlying store error, if this failure came from the store.
    pub fn store_error(&self) -> Option<&StoreError> {
        match self {
            DedupError::Lookup(e)
            | DedupError::Record(e)
            | DedupError::StatusUpdate(e)
            | DedupError::Storage(e) => Some(e),
            _ => None,
        }
    }
}

pub type DedupResult<T> = Result<T, DedupError>;
