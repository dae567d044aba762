//! Engine-internal error type.
//!
//! Client-visible outcomes are expressed as [`crate::types::Status`];
//! `EngineError` is for fallible internal paths (disk I/O, corrupt files,
//! serialization) and is never shown to a memcached client directly.

use std::io;

use thiserror::Error;

use crate::types::Vbid;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Internal failure raised by the persistence and scheduling layers.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Underlying filesystem failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// A persisted record failed its checksum or framing checks.
    #[error("corruption detected: {0}")]
    Corruption(String),
    /// A vbucket-state record could not be encoded or decoded.
    #[error("state record error: {0}")]
    StateRecord(#[from] serde_json::Error),
    /// The vbucket has no on-disk file yet.
    #[error("no persisted file for {0}")]
    NoVBucketFile(Vbid),
    /// A caller passed an argument the engine cannot honor.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// A snappy-compressed value failed to inflate.
    #[error("decompression error: {0}")]
    Decompress(String),
}

impl EngineError {
    /// Shorthand for a corruption error with an owned description.
    pub fn corrupt(msg: impl Into<String>) -> EngineError {
        EngineError::Corruption(msg.into())
    }
}
