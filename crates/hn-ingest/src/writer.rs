//! Buffered parquet writer for the item archive
//!
//! Two layouts are supported:
//!
//! - `flat`: `chunk-00000.parquet`, `chunk-00001.parquet`, ... directly under
//!   the output directory, one file per flush.
//! - `hive`: `year=YYYY/month=M/data-00000.parquet`, with one buffer per
//!   month and the `year`/`month` columns stored in the file. Items without a
//!   timestamp cannot be placed and are dropped.
//!
//! Buffered rows only become durable on flush. Callers must call
//! [`ColumnarWriter::flush_all`] before recording progress.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::error::{IngestError, Result};
use crate::item::Item;
use crate::schema::{self, ARCHIVE_EXT};

const FLAT_PREFIX: &str = "chunk-";
const HIVE_PREFIX: &str = "data-";

/// Archive directory layout
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PartitionStyle {
    #[default]
    Flat,
    Hive,
}

impl PartitionStyle {
    pub fn as_str(&self) -> &'static str {
        match self {
            PartitionStyle::Flat => "flat",
            PartitionStyle::Hive => "hive",
        }
    }
}

impl FromStr for PartitionStyle {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "flat" => Ok(PartitionStyle::Flat),
            "hive" => Ok(PartitionStyle::Hive),
            other => Err(format!("unknown partition style '{other}', expected 'flat' or 'hive'")),
        }
    }
}

impl fmt::Display for PartitionStyle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct WriterConfig {
    pub output_dir: PathBuf,
    pub partition_style: PartitionStyle,

    /// Rows per buffer before it is flushed on its own
    pub buffer_rows: usize,

    pub row_group_size: usize,
}

impl WriterConfig {
    pub fn new(output_dir: impl Into<PathBuf>, partition_style: PartitionStyle) -> Self {
        Self {
            output_dir: output_dir.into(),
            partition_style,
            buffer_rows: crate::config::DEFAULT_BUFFER_ROWS,
            row_group_size: schema::DEFAULT_ROW_GROUP_SIZE,
        }
    }

    pub fn with_buffer_rows(mut self, buffer_rows: usize) -> Self {
        self.buffer_rows = buffer_rows;
        self
    }

    pub fn with_row_group_size(mut self, row_group_size: usize) -> Self {
        self.row_group_size = row_group_size;
        self
    }
}

/// Files and rows made durable by one flush
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushSummary {
    pub files_written: usize,
    pub rows_written: usize,
}

impl FlushSummary {
    fn add(&mut self, other: FlushSummary) {
        self.files_written += other.files_written;
        self.rows_written += other.rows_written;
    }
}

enum Buffer {
    Flat(Vec<Item>),
    Hive(BTreeMap<(i32, u32), Vec<Item>>),
}

impl Buffer {
    fn len(&self) -> usize {
        match self {
            Buffer::Flat(rows) => rows.len(),
            Buffer::Hive(partitions) => partitions.values().map(Vec::len).sum(),
        }
    }
}

/// Buffers archived items and flushes them as immutable parquet files
pub struct ColumnarWriter {
    config: WriterConfig,
    buffer: Buffer,
    dropped_untimed: u64,
    dropped_since_flush: u64,
    totals: FlushSummary,
}

impl ColumnarWriter {
    /// Create the writer and its output directory
    pub fn new(config: WriterConfig) -> Result<Self> {
        if config.buffer_rows == 0 {
            return Err(IngestError::config("buffer rows must be greater than 0"));
        }

        fs::create_dir_all(&config.output_dir)
            .map_err(|e| IngestError::not_writable(&config.output_dir, e))?;

        let buffer = match config.partition_style {
            PartitionStyle::Flat => Buffer::Flat(Vec::new()),
            PartitionStyle::Hive => Buffer::Hive(BTreeMap::new()),
        };

        debug!(
            output_dir = %config.output_dir.display(),
            partition_style = %config.partition_style,
            "Writer ready"
        );

        Ok(Self {
            config,
            buffer,
            dropped_untimed: 0,
            dropped_since_flush: 0,
            totals: FlushSummary::default(),
        })
    }

    pub fn partition_style(&self) -> PartitionStyle {
        self.config.partition_style
    }

    pub fn output_dir(&self) -> &Path {
        &self.config.output_dir
    }

    /// Rows held in memory, not yet durable
    pub fn buffered_rows(&self) -> usize {
        self.buffer.len()
    }

    /// Items dropped by the hive layout for lack of a timestamp
    pub fn dropped_untimed(&self) -> u64 {
        self.dropped_untimed
    }

    /// Everything flushed by this writer so far
    pub fn totals(&self) -> FlushSummary {
        self.totals
    }

    /// Buffer one item, flushing if its buffer is full
    ///
    /// Returns whether the item was accepted.
    pub fn add_item(&mut self, item: Item) -> Result<bool> {
        let item = item.into_archived();
        let threshold = self.config.buffer_rows;

        let full_partition = match &mut self.buffer {
            Buffer::Flat(rows) => {
                rows.push(item);
                if rows.len() < threshold {
                    return Ok(true);
                }
                None
            },
            Buffer::Hive(partitions) => {
                let Some(key) = item.partition_key() else {
                    self.dropped_untimed += 1;
                    self.dropped_since_flush += 1;
                    debug!(id = item.id, "Dropping item without timestamp");
                    return Ok(false);
                };
                let rows = partitions.entry(key).or_default();
                rows.push(item);
                if rows.len() < threshold {
                    return Ok(true);
                }
                Some(key)
            },
        };

        match full_partition {
            Some(key) => self.flush_partition(key)?,
            None => self.flush_flat()?,
        };

        Ok(true)
    }

    /// Buffer many items. Returns how many were accepted.
    pub fn add_items<I>(&mut self, items: I) -> Result<usize>
    where
        I: IntoIterator<Item = Item>,
    {
        let mut accepted = 0;
        for item in items {
            if self.add_item(item)? {
                accepted += 1;
            }
        }
        Ok(accepted)
    }

    /// Flush every buffered row
    pub fn flush_all(&mut self) -> Result<FlushSummary> {
        let summary = match &self.buffer {
            Buffer::Flat(_) => self.flush_flat()?,
            Buffer::Hive(partitions) => {
                let keys: Vec<_> = partitions
                    .iter()
                    .filter(|(_, rows)| !rows.is_empty())
                    .map(|(key, _)| *key)
                    .collect();

                let mut summary = FlushSummary::default();
                for key in keys {
                    summary.add(self.flush_partition(key)?);
                }
                summary
            },
        };

        if self.dropped_since_flush > 0 {
            warn!(
                dropped = self.dropped_since_flush,
                dropped_total = self.dropped_untimed,
                "Items without timestamp dropped by hive layout"
            );
            self.dropped_since_flush = 0;
        }

        Ok(summary)
    }

    fn flush_flat(&mut self) -> Result<FlushSummary> {
        let Buffer::Flat(rows) = &mut self.buffer else {
            return Ok(FlushSummary::default());
        };
        if rows.is_empty() {
            return Ok(FlushSummary::default());
        }

        let mut rows = std::mem::take(rows);
        let dir = self.config.output_dir.clone();
        let n = next_file_index(&dir, FLAT_PREFIX)?;
        let path = dir.join(format!("{FLAT_PREFIX}{n:05}.{ARCHIVE_EXT}"));

        self.write_rows(&path, &mut rows, false)
    }

    fn flush_partition(&mut self, key: (i32, u32)) -> Result<FlushSummary> {
        let Buffer::Hive(partitions) = &mut self.buffer else {
            return Ok(FlushSummary::default());
        };
        let Some(mut rows) = partitions.remove(&key).filter(|rows| !rows.is_empty()) else {
            return Ok(FlushSummary::default());
        };

        let (year, month) = key;
        let dir = self
            .config
            .output_dir
            .join(format!("year={year}"))
            .join(format!("month={month}"));
        fs::create_dir_all(&dir).map_err(|e| IngestError::not_writable(&dir, e))?;

        let n = next_file_index(&dir, "")?;
        let path = dir.join(format!("{HIVE_PREFIX}{n:05}.{ARCHIVE_EXT}"));

        self.write_rows(&path, &mut rows, true)
    }

    fn write_rows(
        &mut self,
        path: &Path,
        rows: &mut [Item],
        with_partition_columns: bool,
    ) -> Result<FlushSummary> {
        rows.sort_unstable_by_key(|item| item.id);

        let batch = schema::items_to_batch(rows, with_partition_columns)?;
        let bytes = schema::write_parquet(path, &batch, self.config.row_group_size)?;

        info!(
            path = %path.display(),
            rows = rows.len(),
            bytes,
            "Flushed archive file"
        );

        let summary = FlushSummary {
            files_written: 1,
            rows_written: rows.len(),
        };
        self.totals.add(summary);
        Ok(summary)
    }

    /// Durable archive statistics, read from disk
    pub fn get_stats(&self) -> Result<ArchiveStats> {
        ArchiveStats::scan(&self.config.output_dir)
    }
}

/// Index for the next `{prefix}NNNNN.parquet` file directly in `dir`
///
/// One past the highest index present, so a gap left by a removed file is
/// never reused and an existing file is never replaced.
fn next_file_index(dir: &Path, prefix: &str) -> Result<u32> {
    let mut next = 0;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(index) = name.to_str().and_then(|name| file_index(name, prefix)) else {
            continue;
        };
        next = next.max(index.saturating_add(1));
    }
    Ok(next)
}

/// `NNNNN` of `{prefix}[name-]NNNNN.parquet`
fn file_index(name: &str, prefix: &str) -> Option<u32> {
    let stem = name.strip_prefix(prefix)?.strip_suffix(&format!(".{ARCHIVE_EXT}"))?;
    let digits = stem.rsplit('-').next()?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// One `year=*/month=*` directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionInfo {
    pub year: i32,
    pub month: u32,
    pub file_count: usize,
    pub total_size: u64,
}

/// Files and bytes in an archive directory, across both layouts
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArchiveStats {
    pub partition_count: usize,
    pub file_count: usize,
    pub total_size: u64,

    /// Hive partitions, ordered by year then month
    pub partitions: Vec<PartitionInfo>,
}

fn parse_partition_dir(name: &str, key: &str) -> Option<u32> {
    name.strip_prefix(key)?.strip_prefix('=')?.parse().ok()
}

impl ArchiveStats {
    /// Count top-level files and `year=*/month=*` partitions under `dir`
    ///
    /// A missing directory is an empty archive.
    pub fn scan(dir: &Path) -> Result<Self> {
        let mut stats = ArchiveStats::default();
        if !dir.exists() {
            return Ok(stats);
        }

        let mut partitions: BTreeMap<(i32, u32), PartitionInfo> = BTreeMap::new();

        for entry in WalkDir::new(dir).min_depth(1).max_depth(3) {
            let entry = entry.map_err(|e| IngestError::Other(e.into()))?;
            if !entry.file_type().is_file()
                || entry.path().extension().and_then(|e| e.to_str()) != Some(ARCHIVE_EXT)
            {
                continue;
            }
            let size = entry.metadata().map_err(|e| IngestError::Other(e.into()))?.len();

            match entry.depth() {
                1 => {
                    stats.file_count += 1;
                    stats.total_size += size;
                },
                3 => {
                    let Some(key) = partition_of(entry.path()) else {
                        continue;
                    };
                    let info = partitions.entry(key).or_insert(PartitionInfo {
                        year: key.0,
                        month: key.1,
                        file_count: 0,
                        total_size: 0,
                    });
                    info.file_count += 1;
                    info.total_size += size;
                    stats.file_count += 1;
                    stats.total_size += size;
                },
                _ => {},
            }
        }

        stats.partition_count = partitions.len();
        stats.partitions = partitions.into_values().collect();
        Ok(stats)
    }

    pub fn is_empty(&self) -> bool {
        self.file_count == 0
    }
}

/// `(year, month)` of a file at `.../year=Y/month=M/file`
fn partition_of(path: &Path) -> Option<(i32, u32)> {
    let month_dir = path.parent()?;
    let year_dir = month_dir.parent()?;
    let month = parse_partition_dir(month_dir.file_name()?.to_str()?, "month")?;
    let year = parse_partition_dir(year_dir.file_name()?.to_str()?, "year")?;
    Some((i32::try_from(year).ok()?, month))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use arrow_array::Array;
    use tempfile::TempDir;

    // 2024-03-15 and 2024-04-15, UTC
    const MARCH: i64 = 1_710_460_800;
    const APRIL: i64 = 1_713_139_200;

    fn item(id: i64, time: Option<i64>) -> Item {
        Item {
            id,
            kind: Some("comment".into()),
            time,
            text: Some(format!("comment {id}")),
            ..Item::default()
        }
    }

    fn writer(dir: &TempDir, style: PartitionStyle, buffer_rows: usize) -> ColumnarWriter {
        ColumnarWriter::new(
            WriterConfig::new(dir.path().join("items"), style).with_buffer_rows(buffer_rows),
        )
        .unwrap()
    }

    #[test]
    fn test_partition_style_parse_and_display() {
        assert_eq!("flat".parse::<PartitionStyle>().unwrap(), PartitionStyle::Flat);
        assert_eq!("HIVE".parse::<PartitionStyle>().unwrap(), PartitionStyle::Hive);
        assert!("daily".parse::<PartitionStyle>().is_err());
        assert_eq!(PartitionStyle::Hive.to_string(), "hive");
        assert_eq!(serde_json::to_string(&PartitionStyle::Flat).unwrap(), "\"flat\"");
    }

    #[test]
    fn test_flat_flush_numbers_files() {
        let dir = TempDir::new().unwrap();
        let mut writer = writer(&dir, PartitionStyle::Flat, 1000);

        assert_eq!(writer.add_items((1..=3).map(|id| item(id, Some(MARCH)))).unwrap(), 3);
        assert_eq!(writer.buffered_rows(), 3);

        let summary = writer.flush_all().unwrap();
        assert_eq!(summary, FlushSummary { files_written: 1, rows_written: 3 });
        assert_eq!(writer.buffered_rows(), 0);

        writer.add_item(item(4, None)).unwrap();
        writer.flush_all().unwrap();

        let out = dir.path().join("items");
        assert!(out.join("chunk-00000.parquet").exists());
        assert!(out.join("chunk-00001.parquet").exists());
    }

    #[test]
    fn test_flat_numbering_resumes_across_writers() {
        let dir = TempDir::new().unwrap();
        {
            let mut first = writer(&dir, PartitionStyle::Flat, 1000);
            first.add_item(item(1, None)).unwrap();
            first.flush_all().unwrap();
        }

        let mut second = writer(&dir, PartitionStyle::Flat, 1000);
        second.add_item(item(2, None)).unwrap();
        second.flush_all().unwrap();

        assert!(dir.path().join("items/chunk-00001.parquet").exists());
    }

    #[test]
    fn test_numbering_skips_past_gaps() {
        let dir = TempDir::new().unwrap();
        let mut writer = writer(&dir, PartitionStyle::Flat, 1000);
        for id in 1..=3 {
            writer.add_item(item(id, None)).unwrap();
            writer.flush_all().unwrap();
        }

        let out = dir.path().join("items");
        fs::remove_file(out.join("chunk-00001.parquet")).unwrap();
        let before = schema::summarize_file(&out.join("chunk-00002.parquet")).unwrap();

        writer.add_item(item(4, None)).unwrap();
        writer.flush_all().unwrap();

        assert!(out.join("chunk-00003.parquet").exists());
        assert!(!out.join("chunk-00001.parquet").exists());
        assert_eq!(schema::summarize_file(&out.join("chunk-00002.parquet")).unwrap(), before);
    }

    #[test]
    fn test_hive_numbering_continues_after_legacy_files() {
        let dir = TempDir::new().unwrap();
        let month_dir = dir.path().join("items/year=2024/month=3");
        fs::create_dir_all(&month_dir).unwrap();
        let legacy = schema::items_to_batch(&[item(1, Some(MARCH))], true).unwrap();
        schema::write_parquet(&month_dir.join("part-00004.parquet"), &legacy, 100).unwrap();

        let mut writer = writer(&dir, PartitionStyle::Hive, 1000);
        writer.add_item(item(2, Some(MARCH))).unwrap();
        writer.flush_all().unwrap();

        assert!(month_dir.join("data-00005.parquet").exists());
    }

    #[test]
    fn test_file_index_parsing() {
        assert_eq!(file_index("chunk-00042.parquet", FLAT_PREFIX), Some(42));
        assert_eq!(file_index("part-00007.parquet", ""), Some(7));
        assert_eq!(file_index("chunk-00001.parquet.tmp", FLAT_PREFIX), None);
        assert_eq!(file_index("hn.parquet", ""), None);
        assert_eq!(file_index("data-00003.parquet", FLAT_PREFIX), None);
    }

    #[test]
    fn test_empty_flush_writes_nothing() {
        let dir = TempDir::new().unwrap();
        let mut writer = writer(&dir, PartitionStyle::Flat, 10);
        assert_eq!(writer.flush_all().unwrap(), FlushSummary::default());
        assert!(writer.get_stats().unwrap().is_empty());
    }

    #[test]
    fn test_threshold_triggers_flush() {
        let dir = TempDir::new().unwrap();
        let mut writer = writer(&dir, PartitionStyle::Flat, 2);

        writer.add_items((1..=5).map(|id| item(id, None))).unwrap();

        assert_eq!(writer.buffered_rows(), 1);
        assert_eq!(writer.totals().files_written, 2);
    }

    #[test]
    fn test_hive_groups_by_month_and_drops_untimed() {
        let dir = TempDir::new().unwrap();
        let mut writer = writer(&dir, PartitionStyle::Hive, 1000);

        let accepted = writer
            .add_items(vec![
                item(1, Some(MARCH)),
                item(2, Some(APRIL)),
                item(3, None),
                item(4, Some(MARCH)),
            ])
            .unwrap();
        assert_eq!(accepted, 3);
        assert_eq!(writer.dropped_untimed(), 1);

        let summary = writer.flush_all().unwrap();
        assert_eq!(summary, FlushSummary { files_written: 2, rows_written: 3 });

        let out = dir.path().join("items");
        assert!(out.join("year=2024/month=3/data-00000.parquet").exists());
        assert!(out.join("year=2024/month=4/data-00000.parquet").exists());

        let stats = writer.get_stats().unwrap();
        assert_eq!(stats.partition_count, 2);
        assert_eq!(stats.file_count, 2);
        assert_eq!(stats.partitions[0].month, 3);
    }

    #[test]
    fn test_hive_partition_flushes_independently() {
        let dir = TempDir::new().unwrap();
        let mut writer = writer(&dir, PartitionStyle::Hive, 2);

        writer.add_item(item(1, Some(MARCH))).unwrap();
        writer.add_item(item(2, Some(APRIL))).unwrap();
        writer.add_item(item(3, Some(MARCH))).unwrap();

        assert_eq!(writer.totals().files_written, 1);
        assert_eq!(writer.buffered_rows(), 1);
    }

    #[test]
    fn test_tombstones_are_nulled_on_write() {
        let dir = TempDir::new().unwrap();
        let mut writer = writer(&dir, PartitionStyle::Flat, 10);

        let mut dead = item(7, Some(MARCH));
        dead.dead = true;
        dead.score = Some(3);
        writer.add_item(dead).unwrap();
        writer.flush_all().unwrap();

        let batches = schema::read_parquet(&dir.path().join("items/chunk-00000.parquet")).unwrap();
        let batch = &batches[0];
        assert!(batch.column_by_name("text").unwrap().is_null(0));
        assert!(batch.column_by_name("score").unwrap().is_null(0));
        assert!(!batch.column_by_name("time").unwrap().is_null(0));
    }

    #[test]
    fn test_rewriting_same_items_gives_identical_rows() {
        let dir = TempDir::new().unwrap();
        let mut writer = writer(&dir, PartitionStyle::Hive, 1000);

        let story = Item {
            by: Some("pg".into()),
            title: Some("Y Combinator".into()),
            score: Some(57),
            kids: Some(vec![15, 234509]),
            ..item(1, Some(MARCH))
        };
        let tombstone = Item {
            deleted: true,
            parent: Some(1),
            text: Some("removed".into()),
            ..item(2, Some(MARCH))
        };

        for _ in 0..2 {
            writer.add_items([story.clone(), tombstone.clone()]).unwrap();
            writer.flush_all().unwrap();
        }

        let month = dir.path().join("items/year=2024/month=3");
        let first = schema::read_parquet(&month.join("data-00000.parquet")).unwrap();
        let second = schema::read_parquet(&month.join("data-00001.parquet")).unwrap();

        assert_eq!(first[0].num_rows(), 2);
        assert_eq!(first, second);
        assert!(first[0].column_by_name("text").unwrap().is_null(1));
    }

    #[test]
    fn test_stats_count_both_layouts() {
        let dir = TempDir::new().unwrap();
        {
            let mut flat = writer(&dir, PartitionStyle::Flat, 10);
            flat.add_item(item(1, None)).unwrap();
            flat.flush_all().unwrap();
        }
        {
            let mut hive = writer(&dir, PartitionStyle::Hive, 10);
            hive.add_item(item(2, Some(APRIL))).unwrap();
            hive.flush_all().unwrap();
        }

        let stats = ArchiveStats::scan(&dir.path().join("items")).unwrap();
        assert_eq!(stats.file_count, 2);
        assert_eq!(stats.partition_count, 1);
        assert!(stats.total_size > 0);
    }

    #[test]
    fn test_stats_of_missing_dir() {
        let dir = TempDir::new().unwrap();
        let stats = ArchiveStats::scan(&dir.path().join("nope")).unwrap();
        assert_eq!(stats, ArchiveStats::default());
    }
}
