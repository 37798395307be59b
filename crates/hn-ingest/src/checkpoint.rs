//! Durable ingestion progress
//!
//! A single JSON document records how far ingestion got and which archive
//! layout it writes. Saves replace the whole file through a temporary file and
//! a rename, so a reader only ever sees a complete snapshot.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::error::{IngestError, Result};
use crate::writer::PartitionStyle;

/// Default checkpoint location, relative to the working directory
pub const DEFAULT_CHECKPOINT_PATH: &str = "checkpoint.json";

/// Progress record of one archive
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Highest id whose batch has been flushed
    pub last_fetched_id: i64,

    /// Remote max id observed at the last run start
    pub max_item_id: i64,

    /// Cumulative count of items returned with data
    pub items_fetched: u64,

    /// Cumulative count of rows written
    pub items_written: u64,

    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    /// Layout this archive is written in
    ///
    /// Records written before the field existed were all time-partitioned.
    #[serde(default = "legacy_partition_style")]
    pub partition_style: PartitionStyle,
}

fn legacy_partition_style() -> PartitionStyle {
    PartitionStyle::Hive
}

impl Checkpoint {
    /// Fresh progress record starting before id 1
    pub fn new(max_item_id: i64, partition_style: PartitionStyle) -> Self {
        let now = Utc::now();
        Self {
            last_fetched_id: 0,
            max_item_id,
            items_fetched: 0,
            items_written: 0,
            started_at: now,
            updated_at: now,
            partition_style,
        }
    }

    /// Record a completed batch. Does not persist.
    pub fn update(&mut self, last_id: i64, fetched: u64, written: u64) {
        self.last_fetched_id = self.last_fetched_id.max(last_id);
        self.items_fetched += fetched;
        self.items_written += written;
        self.updated_at = Utc::now();
    }

    /// Refresh the remote max id observed at run start
    pub fn refresh_max(&mut self, max_item_id: i64) {
        self.max_item_id = max_item_id;
        self.updated_at = Utc::now();
    }

    pub fn progress_pct(&self) -> f64 {
        if self.max_item_id <= 0 {
            return 0.0;
        }
        self.last_fetched_id as f64 / self.max_item_id as f64 * 100.0
    }

    pub fn remaining(&self) -> i64 {
        (self.max_item_id - self.last_fetched_id).max(0)
    }
}

/// File-backed checkpoint persistence
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    path: PathBuf,
}

impl CheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    /// Load the persisted checkpoint
    ///
    /// A missing or unreadable file means "no checkpoint". Content that is not
    /// a valid checkpoint is an error: the caller decides whether to start over.
    pub fn load(&self) -> Result<Option<Checkpoint>> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Checkpoint unreadable, ignoring");
                return Ok(None);
            },
        };

        let checkpoint = serde_json::from_str(&raw).map_err(|source| IngestError::CheckpointParse {
            path: self.path.clone(),
            source,
        })?;

        Ok(Some(checkpoint))
    }

    /// Atomically replace the persisted checkpoint
    pub fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| IngestError::not_writable(parent, e))?;
        }

        let json = serde_json::to_string_pretty(checkpoint)?;
        let tmp = self.tmp_path();

        {
            let mut file = fs::File::create(&tmp).map_err(|e| IngestError::not_writable(&tmp, e))?;
            file.write_all(json.as_bytes())?;
            file.write_all(b"\n")?;
            file.sync_all()?;
        }

        fs::rename(&tmp, &self.path)?;

        debug!(
            path = %self.path.display(),
            last_fetched_id = checkpoint.last_fetched_id,
            "Checkpoint saved"
        );
        Ok(())
    }

    /// Remove the checkpoint. Returns whether a file was removed.
    pub fn delete(&self) -> Result<bool> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".tmp");
        PathBuf::from(name)
    }
}
