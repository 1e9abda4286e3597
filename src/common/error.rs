//! Error types for minishard

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // === Lifecycle ===
    #[error("cancelled")]
    Cancelled,

    // === Discovery store ===
    #[error("discovery store error: {0}")]
    Store(String),

    #[error("malformed value at {key}: {reason}")]
    Decode { key: String, reason: String },

    // === Lookup ===
    #[error("version {0} not found")]
    VersionNotFound(i64),

    #[error("shard {shard} not found in version {version}")]
    ShardNotFound { shard: u64, version: i64 },

    // === Shard engine ===
    #[error("shard operation failed on shard {shard}: {reason}")]
    ShardOp { shard: u64, reason: String },

    // === Config ===
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    // === I/O ===
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // === Generic ===
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Did the operation end because its cancel signal fired?
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }

    /// Decode failure for a stored value at `key`.
    pub fn decode(key: &str, err: serde_json::Error) -> Self {
        Error::Decode {
            key: key.to_string(),
            reason: err.to_string(),
        }
    }

    /// Shard engine failure on `shard`.
    pub fn shard_op(shard: u64, err: impl std::fmt::Display) -> Self {
        Error::ShardOp {
            shard,
            reason: err.to_string(),
        }
    }
}
