//! Error types for the shard runtime, the service directory and the ledger

use crate::shard::ShardId;
use std::path::PathBuf;

/// Result type alias for shard-seckill operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types that can occur in shard-seckill operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The directory has no service instance on this shard
    #[error("sharded instance does not exist on shard {0}")]
    NoInstance(ShardId),

    /// The directory is already started
    #[error("directory is already started")]
    AlreadyStarted,

    /// Shard index out of range
    #[error("shard not found: {0}")]
    ShardNotFound(ShardId),

    /// The shard's event loop has exited
    #[error("shard {0} is stopped")]
    ShardStopped(ShardId),

    /// A shard-local operation was attempted from a non-shard thread
    #[error("not running on a shard thread")]
    NotOnShard,

    /// Blocking on a result that only the current shard can produce
    #[error("shard {0} cannot block on its own pending work")]
    SelfWait(ShardId),

    /// A submitted task panicked
    #[error("task panicked on shard {shard}: {message}")]
    TaskPanicked {
        /// Shard the task ran on
        shard: ShardId,
        /// Panic payload, if it was a string
        message: String,
    },

    /// A foreign pointer whose value was already lost
    #[error("foreign pointer is empty")]
    EmptyForeign,

    /// Invalid configuration
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Failed to spawn a shard thread
    #[error("failed to spawn shard {shard}: {source}")]
    SpawnFailed {
        /// Shard that failed to start
        shard: ShardId,
        /// Underlying OS error
        #[source]
        source: std::io::Error,
    },

    /// Malformed seed snapshot or WAL data
    #[error("recovery failed at {}:{line}: {reason}", path.display())]
    Recovery {
        /// File being loaded
        path: PathBuf,
        /// 1-based line number
        line: usize,
        /// What was wrong with it
        reason: String,
    },

    /// WAL append failed
    #[error("WAL append failed: {0}")]
    Wal(#[source] std::io::Error),

    /// Request could not be mapped to a ledger operation
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Response rendering failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Builds a recovery error for `path` at `line`
    pub(crate) fn recovery(path: impl Into<PathBuf>, line: usize, reason: impl Into<String>) -> Self {
        Error::Recovery {
            path: path.into(),
            line,
            reason: reason.into(),
        }
    }
}
