//! Error types for the change feed.

use crate::types::{RecordId, Sequence};
use thiserror::Error;

/// Main error type for feed operations.
///
/// Only conditions that stop the pipeline surface here. An empty poll,
/// cancellation and a saturated subscriber queue are handled where they are
/// detected and never become a `FeedError`.
#[derive(Debug, Error)]
pub enum FeedError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Collection not found: {0}")]
    CollectionNotFound(String),

    #[error("Record not found: {0}")]
    RecordNotFound(RecordId),

    #[error("Record already exists: {0}")]
    RecordExists(RecordId),

    #[error("Invalid record: {0}")]
    InvalidRecord(String),

    #[error("Cursor invalidated at {position:?} (earliest retained is {earliest:?})")]
    CursorInvalidated {
        position: Sequence,
        earliest: Sequence,
    },

    #[error("Log truncated below cursor: offset {offset}, length {len}")]
    LogTruncated { offset: u64, len: u64 },

    #[error("Store not initialized: {0}")]
    NotInitialized(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Invalid log format: {0}")]
    InvalidFormat(String),

    #[error("Checksum mismatch: expected {expected}, got {got}")]
    ChecksumMismatch { expected: u32, got: u32 },

    #[error("Store is locked by another process")]
    Locked,

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Feed worker panicked")]
    WorkerPanicked,
}

impl From<serde_json::Error> for FeedError {
    fn from(e: serde_json::Error) -> Self {
        FeedError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::encode::Error> for FeedError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        FeedError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for FeedError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        FeedError::Deserialization(e.to_string())
    }
}

/// Result type for feed operations.
pub type Result<T> = std::result::Result<T, FeedError>;
