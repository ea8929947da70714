//! Error types shared by the storage, durability and ingestion paths.

use std::path::PathBuf;

use thiserror::Error;

use crate::metric::MetricKind;

/// A metric failed validation before reaching any backend.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("unknown metric type: {0:?}")]
    UnknownKind(String),

    #[error("metric id must not be empty")]
    EmptyId,

    #[error("{kind} metric {id:?} has no {field}")]
    MissingField {
        id: String,
        kind: MetricKind,
        field: &'static str,
    },

    #[error("invalid {kind} value {raw:?}")]
    InvalidNumber { kind: MetricKind, raw: String },
}

/// Errors surfaced by a storage backend or the durability writer.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("{kind} metric {id:?} not found")]
    NotFound { id: String, kind: MetricKind },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("snapshot file {path:?}: {source}")]
    Snapshot {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("snapshot file {path:?} is corrupt: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to encode snapshot: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("storage operation timed out")]
    Timeout,

    #[error("metric fan-in channel closed")]
    Closed,
}

impl StorageError {
    /// Whether the caller sent bad input, as opposed to a backend fault.
    pub fn is_client_error(&self) -> bool {
        matches!(self, Self::Validation(_) | Self::NotFound { .. })
    }
}

pub type Result<T, E = StorageError> = std::result::Result<T, E>;
