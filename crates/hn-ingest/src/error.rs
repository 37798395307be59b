//! Error types for hn-ingest
//!
//! Only failures the operator has to act on end up here. Missing items,
//! exhausted retries and cancellation are normal outcomes and are modeled as
//! values by the fetcher and orchestrator instead.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for ingestion operations
pub type Result<T> = std::result::Result<T, IngestError>;

#[derive(Error, Debug)]
pub enum IngestError {
    /// File system operation failed
    #[error("File operation failed: {0}. Check file permissions and disk space.")]
    Io(#[from] std::io::Error),

    /// HTTP request to the item API failed
    #[error("Request to the item API failed: {0}. Check your network connection and HN_API_BASE_URL.")]
    Http(#[from] reqwest::Error),

    #[error("Failed to encode or decode JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),

    #[error("Arrow error: {0}")]
    Arrow(#[from] arrow_schema::ArrowError),

    /// Checkpoint file exists but is not a valid checkpoint
    #[error("Checkpoint file '{path}' is malformed: {source}. Fix or remove it ('hn-ingest reset') to start over.")]
    CheckpointParse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// Output directory cannot be created or written
    #[error("Archive directory '{path}' is not writable: {source}")]
    ArchiveNotWritable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Configuration error: {0}. Check your environment variables and command-line flags.")]
    Config(String),

    /// Consolidation could not complete; the previous layout is still active
    #[error("Migration failed: {0}")]
    Migration(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl IngestError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn migration(msg: impl Into<String>) -> Self {
        Self::Migration(msg.into())
    }

    pub fn not_writable(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::ArchiveNotWritable {
            path: path.into(),
            source,
        }
    }
}
