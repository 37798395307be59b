//! Offline consolidation of an archive into one sorted file
//!
//! Files from both layouts are unioned by column name onto the flat schema,
//! merged by `id` and written as `hn.parquet` into a staging directory next
//! to the archive. With `swap`, the staging directory replaces the archive
//! and the old one is kept as a timestamped backup.
//!
//! Archive files are already sorted by `id`, so the merge streams through
//! them with one batch per file in memory. A file found out of order is
//! sorted into a temporary copy first.

use arrow_array::{new_null_array, Array, ArrayRef, Int64Array, RecordBatch};
use arrow_schema::SchemaRef;
use chrono::Utc;
use parquet::arrow::arrow_reader::ParquetRecordBatchReader;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};
use walkdir::WalkDir;

use crate::checkpoint::CheckpointStore;
use crate::error::{IngestError, Result};
use crate::schema::{self, ArchiveFileWriter, ARCHIVE_EXT};
use crate::writer::PartitionStyle;

/// Name of the consolidated file
pub const CONSOLIDATED_FILE: &str = "hn.parquet";

/// Rows held per source file during the merge
const MERGE_BATCH_ROWS: usize = 8192;

/// Staging subdirectory for sorted copies of out-of-order files
const PRESORT_DIR: &str = "presort";

/// What a migration would read
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationPlan {
    pub total_items: u64,
    pub id_range: Option<(i64, i64)>,
    pub source_file_count: usize,
    pub source_files: Vec<PathBuf>,
}

impl MigrationPlan {
    /// Summarize every archive file under `source_dirs`, either layout
    ///
    /// Reads the footer and the `id` column of each file, nothing else.
    pub fn collect(source_dirs: &[PathBuf]) -> Result<Self> {
        let mut plan = Self::default();

        for dir in source_dirs {
            if !dir.exists() {
                continue;
            }
            for entry in WalkDir::new(dir).sort_by_file_name() {
                let entry = entry.map_err(|e| IngestError::Other(e.into()))?;
                if entry.file_type().is_file()
                    && entry.path().extension().and_then(|e| e.to_str()) == Some(ARCHIVE_EXT)
                {
                    plan.source_files.push(entry.into_path());
                }
            }
        }

        for path in &plan.source_files {
            let summary = schema::summarize_file(path)?;
            plan.total_items += summary.rows;
            plan.id_range = match (plan.id_range, summary.id_range) {
                (Some((lo, hi)), Some((a, b))) => Some((lo.min(a), hi.max(b))),
                (range, None) | (None, range) => range,
            };
        }

        plan.source_file_count = plan.source_files.len();
        Ok(plan)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MigrateOptions {
    /// Plan only, write nothing
    pub dry_run: bool,

    /// Replace the archive with the consolidated directory
    pub swap: bool,
}

#[derive(Debug, Clone)]
pub struct MigrationResult {
    pub plan: MigrationPlan,
    pub rows_written: u64,

    /// Consolidated file, at its final location
    pub output_file: Option<PathBuf>,

    /// Where the previous archive went, when swapped
    pub backup_dir: Option<PathBuf>,

    pub swapped: bool,
    pub dry_run: bool,
}

pub struct Consolidator {
    output_dir: PathBuf,
    checkpoints: CheckpointStore,
    row_group_size: usize,
}

/// `path` without trailing separators or `.` components
///
/// A path that still has no final name (`..`, `/`) is resolved against the
/// filesystem when it exists.
fn normalize(path: PathBuf) -> PathBuf {
    let cleaned: PathBuf = path.components().collect();
    if cleaned.file_name().is_some() {
        return cleaned;
    }
    fs::canonicalize(&cleaned).unwrap_or(cleaned)
}

/// `path` with `suffix` appended to its last component
fn sibling(path: &Path, suffix: &str) -> PathBuf {
    match path.file_name() {
        Some(name) => {
            let mut name = name.to_owned();
            name.push(suffix);
            path.with_file_name(name)
        },
        None => {
            let mut name: OsString = path.as_os_str().to_owned();
            name.push(suffix);
            PathBuf::from(name)
        },
    }
}

impl Consolidator {
    pub fn new(
        output_dir: impl Into<PathBuf>,
        checkpoints: CheckpointStore,
        row_group_size: usize,
    ) -> Self {
        Self {
            output_dir: normalize(output_dir.into()),
            checkpoints,
            row_group_size,
        }
    }

    pub fn staging_dir(&self) -> PathBuf {
        sibling(&self.output_dir, ".consolidated")
    }

    /// Inspect every archive file under `source_dirs`, either layout
    pub fn plan(&self, source_dirs: &[PathBuf]) -> Result<MigrationPlan> {
        MigrationPlan::collect(source_dirs)
    }

    /// Consolidate the active archive
    pub fn migrate(&self, options: MigrateOptions) -> Result<MigrationResult> {
        let plan = self.plan(std::slice::from_ref(&self.output_dir))?;

        info!(
            files = plan.source_file_count,
            items = plan.total_items,
            dry_run = options.dry_run,
            swap = options.swap,
            "Migration planned"
        );

        if options.dry_run {
            return Ok(MigrationResult {
                plan,
                rows_written: 0,
                output_file: None,
                backup_dir: None,
                swapped: false,
                dry_run: true,
            });
        }

        if plan.source_files.is_empty() {
            return Err(IngestError::migration(format!(
                "no archive files under {}",
                self.output_dir.display()
            )));
        }

        let staging = self.staging_dir();
        let staged_file = match self.write_consolidated(&plan, &staging) {
            Ok(path) => path,
            Err(e) => {
                if let Err(cleanup) = fs::remove_dir_all(&staging) {
                    warn!(path = %staging.display(), error = %cleanup, "Could not remove staging directory");
                }
                return Err(e);
            },
        };

        let rows_written = schema::summarize_file(&staged_file)?.rows;
        if rows_written != plan.total_items {
            fs::remove_dir_all(&staging)?;
            return Err(IngestError::migration(format!(
                "consolidated file has {rows_written} rows, expected {}",
                plan.total_items
            )));
        }

        if !options.swap {
            return Ok(MigrationResult {
                plan,
                rows_written,
                output_file: Some(staged_file),
                backup_dir: None,
                swapped: false,
                dry_run: false,
            });
        }

        let backup = self.swap_in(&staging)?;

        Ok(MigrationResult {
            plan,
            rows_written,
            output_file: Some(self.output_dir.join(CONSOLIDATED_FILE)),
            backup_dir: Some(backup),
            swapped: true,
            dry_run: false,
        })
    }

    fn write_consolidated(&self, plan: &MigrationPlan, staging: &Path) -> Result<PathBuf> {
        let target = schema::item_schema(false);

        if staging.exists() {
            warn!(path = %staging.display(), "Removing stale staging directory");
            fs::remove_dir_all(staging)?;
        }
        fs::create_dir_all(staging).map_err(|e| IngestError::not_writable(staging, e))?;

        let presort_dir = staging.join(PRESORT_DIR);
        let mut sources = Vec::with_capacity(plan.source_files.len());
        for path in &plan.source_files {
            if schema::ids_ascending(path)? {
                sources.push(path.clone());
            } else {
                let copy = presort_dir.join(format!("{:05}.{ARCHIVE_EXT}", sources.len()));
                self.write_sorted_copy(path, &copy, &target)?;
                sources.push(copy);
            }
        }

        let path = staging.join(CONSOLIDATED_FILE);
        let mut out = ArchiveFileWriter::create(&path, target.clone(), self.row_group_size)?;
        let rows = merge_by_id(&sources, &target, &mut out, MERGE_BATCH_ROWS)?;
        let bytes = out.finish()?;

        if presort_dir.exists() {
            fs::remove_dir_all(&presort_dir)?;
        }

        info!(path = %path.display(), rows, bytes, "Wrote consolidated file");
        Ok(path)
    }

    /// Sort one out-of-order file by `id` into `copy`
    fn write_sorted_copy(&self, path: &Path, copy: &Path, target: &SchemaRef) -> Result<()> {
        warn!(path = %path.display(), "Archive file is not sorted by id, sorting a copy");

        let batches = schema::read_parquet(path)?
            .iter()
            .map(|batch| project(batch, target))
            .collect::<Result<Vec<_>>>()?;
        let merged = arrow_select::concat::concat_batches(target, &batches)?;
        drop(batches);

        let id_idx = target.index_of("id")?;
        let indices = arrow_ord::sort::sort_to_indices(merged.column(id_idx), None, None)?;
        let sorted = arrow_select::take::take_record_batch(&merged, &indices)?;

        if let Some(dir) = copy.parent() {
            fs::create_dir_all(dir).map_err(|e| IngestError::not_writable(dir, e))?;
        }
        schema::write_parquet(copy, &sorted, self.row_group_size)?;
        Ok(())
    }

    /// Archive to backup, staging to archive, checkpoint to flat
    ///
    /// Any failure after the first rename undoes the completed renames, so
    /// the old layout stays active.
    fn swap_in(&self, staging: &Path) -> Result<PathBuf> {
        let stamp = Utc::now().format("%Y%m%dT%H%M%SZ");
        let backup = sibling(&self.output_dir, &format!(".backup-{stamp}"));

        fs::rename(&self.output_dir, &backup).map_err(|e| {
            IngestError::migration(format!(
                "could not move {} to {}: {e}",
                self.output_dir.display(),
                backup.display()
            ))
        })?;

        if let Err(e) = fs::rename(staging, &self.output_dir) {
            self.rollback(&backup, None);
            return Err(IngestError::migration(format!(
                "could not activate {}: {e}",
                staging.display()
            )));
        }

        if let Err(e) = self.mark_flat() {
            self.rollback(&backup, Some(staging));
            return Err(IngestError::migration(format!("could not update checkpoint: {e}")));
        }

        info!(
            archive = %self.output_dir.display(),
            backup = %backup.display(),
            "Consolidated archive swapped in"
        );
        Ok(backup)
    }

    fn mark_flat(&self) -> Result<()> {
        if let Some(mut checkpoint) = self.checkpoints.load()? {
            checkpoint.partition_style = PartitionStyle::Flat;
            checkpoint.updated_at = Utc::now();
            self.checkpoints.save(&checkpoint)?;
        }
        Ok(())
    }

    fn rollback(&self, backup: &Path, staging: Option<&Path>) {
        if let Some(staging) = staging {
            if let Err(e) = fs::rename(&self.output_dir, staging) {
                error!(
                    from = %self.output_dir.display(),
                    to = %staging.display(),
                    error = %e,
                    "Rollback failed"
                );
                return;
            }
        }
        if let Err(e) = fs::rename(backup, &self.output_dir) {
            error!(
                from = %backup.display(),
                to = %self.output_dir.display(),
                error = %e,
                "Rollback failed"
            );
        }
    }
}

/// Reshape a batch onto `target` by column name
///
/// Missing columns become nulls, extra columns are dropped and differing
/// types are cast.
fn project(batch: &RecordBatch, target: &SchemaRef) -> Result<RecordBatch> {
    let columns = target
        .fields()
        .iter()
        .map(|field| -> Result<ArrayRef> {
            Ok(match batch.column_by_name(field.name()) {
                Some(column) if column.data_type() == field.data_type() => column.clone(),
                Some(column) => arrow_cast::cast(column, field.data_type())?,
                None => new_null_array(field.data_type(), batch.num_rows()),
            })
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(RecordBatch::try_new(target.clone(), columns)?)
}

/// Read position in one id-sorted source file
struct MergeSource {
    batches: ParquetRecordBatchReader,
    current: RecordBatch,
    ids: Int64Array,
    row: usize,
}

impl MergeSource {
    fn open(path: &Path, target: &SchemaRef, batch_rows: usize) -> Result<Option<Self>> {
        let mut batches = schema::batch_reader(path, batch_rows)?;
        let Some(current) = next_projected(&mut batches, target)? else {
            return Ok(None);
        };

        Ok(Some(Self {
            ids: id_column(&current)?,
            current,
            batches,
            row: 0,
        }))
    }

    fn id(&self) -> i64 {
        self.ids.value(self.row)
    }

    fn has_row(&self) -> bool {
        self.row < self.current.num_rows()
    }

    /// Load the next batch, false once the file is used up
    fn refill(&mut self, target: &SchemaRef) -> Result<bool> {
        match next_projected(&mut self.batches, target)? {
            Some(batch) => {
                self.ids = id_column(&batch)?;
                self.current = batch;
                self.row = 0;
                Ok(true)
            },
            None => Ok(false),
        }
    }
}

fn next_projected(
    batches: &mut ParquetRecordBatchReader,
    target: &SchemaRef,
) -> Result<Option<RecordBatch>> {
    for batch in batches.by_ref() {
        let batch = batch?;
        if batch.num_rows() > 0 {
            return Ok(Some(project(&batch, target)?));
        }
    }
    Ok(None)
}

fn id_column(batch: &RecordBatch) -> Result<Int64Array> {
    batch
        .column_by_name("id")
        .and_then(|column| column.as_any().downcast_ref::<Int64Array>())
        .cloned()
        .ok_or_else(|| IngestError::migration("id column is not int64"))
}

/// Merge id-sorted files into `out`, returning the rows written
///
/// Equal ids keep the order of `sources`.
fn merge_by_id(
    sources: &[PathBuf],
    target: &SchemaRef,
    out: &mut ArchiveFileWriter,
    batch_rows: usize,
) -> Result<u64> {
    let mut cursors = Vec::with_capacity(sources.len());
    for path in sources {
        if let Some(cursor) = MergeSource::open(path, target, batch_rows)? {
            cursors.push(cursor);
        }
    }

    let mut heap: BinaryHeap<Reverse<(i64, usize)>> = cursors
        .iter()
        .enumerate()
        .map(|(i, cursor)| Reverse((cursor.id(), i)))
        .collect();

    // (cursor, row) pairs into the cursors' current batches
    let mut pending: Vec<(usize, usize)> = Vec::with_capacity(batch_rows);
    let mut written = 0;

    while let Some(Reverse((_, i))) = heap.pop() {
        pending.push((i, cursors[i].row));
        cursors[i].row += 1;

        if !cursors[i].has_row() {
            written += emit(&cursors, &mut pending, target, out)?;
            if !cursors[i].refill(target)? {
                continue;
            }
        }
        heap.push(Reverse((cursors[i].id(), i)));

        if pending.len() >= batch_rows {
            written += emit(&cursors, &mut pending, target, out)?;
        }
    }
    written += emit(&cursors, &mut pending, target, out)?;

    Ok(written)
}

/// Gather `pending` rows into one batch and write it
fn emit(
    cursors: &[MergeSource],
    pending: &mut Vec<(usize, usize)>,
    target: &SchemaRef,
    out: &mut ArchiveFileWriter,
) -> Result<u64> {
    if pending.is_empty() {
        return Ok(0);
    }

    let columns = (0..target.fields().len())
        .map(|col| -> Result<ArrayRef> {
            let arrays: Vec<&dyn Array> = cursors
                .iter()
                .map(|cursor| cursor.current.column(col).as_ref())
                .collect();
            Ok(arrow_select::interleave::interleave(&arrays, &pending[..])?)
        })
        .collect::<Result<Vec<_>>>()?;

    out.write(&RecordBatch::try_new(target.clone(), columns)?)?;

    let rows = pending.len() as u64;
    pending.clear();
    Ok(rows)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::checkpoint::Checkpoint;
    use crate::item::Item;
    use crate::writer::{ColumnarWriter, WriterConfig};
    use arrow_array::{Array, Int32Array, Int64Array};
    use arrow_schema::{DataType, Field, Schema};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn write_items(dir: &Path, style: PartitionStyle, ids: impl Iterator<Item = i64>) {
        let mut writer = ColumnarWriter::new(WriterConfig::new(dir, style)).unwrap();
        writer
            .add_items(ids.map(|id| Item {
                id,
                time: Some(1_700_000_000 + id),
                ..Item::default()
            }))
            .unwrap();
        writer.flush_all().unwrap();
    }

    #[test]
    fn test_project_fills_and_casts() {
        let legacy = Arc::new(Schema::new(vec![
            Field::new("id", DataType::Int32, false),
            Field::new("year", DataType::Int16, true),
        ]));
        let batch = RecordBatch::try_new(
            legacy,
            vec![
                Arc::new(Int32Array::from(vec![3, 1])),
                Arc::new(arrow_array::Int16Array::from(vec![2024, 2024])),
            ],
        )
        .unwrap();

        let projected = project(&batch, &schema::item_schema(false)).unwrap();

        assert_eq!(projected.schema(), schema::item_schema(false));
        let ids = projected.column(0).as_any().downcast_ref::<Int64Array>().unwrap();
        assert_eq!(ids.values(), &[3, 1]);
        assert_eq!(projected.column_by_name("title").unwrap().null_count(), 2);
        assert!(projected.column_by_name("year").is_none());
    }

    #[test]
    fn test_dry_run_writes_nothing() {
        let dir = TempDir::new().unwrap();
        let out = dir.path().join("items");
        write_items(&out, PartitionStyle::Flat, 1..=10);

        let consolidator =
            Consolidator::new(&out, CheckpointStore::new(dir.path().join("cp.json")), 1000);
        let result = consolidator
            .migrate(MigrateOptions {
                dry_run: true,
                swap: true,
            })
            .unwrap();

        assert!(result.dry_run);
        assert_eq!(result.plan.total_items, 10);
        assert_eq!(result.plan.id_range, Some((1, 10)));
        assert!(!consolidator.staging_dir().exists());
    }

    #[test]
    fn test_empty_archive_is_an_error() {
        let dir = TempDir::new().unwrap();
        let consolidator = Consolidator::new(
            dir.path().join("items"),
            CheckpointStore::new(dir.path().join("cp.json")),
            1000,
        );
        assert!(matches!(
            consolidator.migrate(MigrateOptions::default()),
            Err(IngestError::Migration(_))
        ));
    }

    #[test]
    fn test_swap_updates_checkpoint() {
        let dir = TempDir::new().unwrap();
        let out = dir.path().join("items");
        write_items(&out, PartitionStyle::Hive, 1..=20);

        let store = CheckpointStore::new(dir.path().join("cp.json"));
        store.save(&Checkpoint::new(20, PartitionStyle::Hive)).unwrap();

        let result = Consolidator::new(&out, store.clone(), 1000)
            .migrate(MigrateOptions {
                dry_run: false,
                swap: true,
            })
            .unwrap();

        assert!(result.swapped);
        assert!(out.join(CONSOLIDATED_FILE).exists());
        assert!(result.backup_dir.unwrap().join("year=2023").exists());
        assert_eq!(store.load().unwrap().unwrap().partition_style, PartitionStyle::Flat);
    }

    #[test]
    fn test_failed_checkpoint_update_rolls_back() {
        let dir = TempDir::new().unwrap();
        let out = dir.path().join("items");
        write_items(&out, PartitionStyle::Flat, 1..=5);

        let store = CheckpointStore::new(dir.path().join("cp.json"));
        fs::write(store.path(), "not a checkpoint").unwrap();

        let consolidator = Consolidator::new(&out, store, 1000);
        let err = consolidator
            .migrate(MigrateOptions {
                dry_run: false,
                swap: true,
            })
            .unwrap_err();

        assert!(matches!(err, IngestError::Migration(_)));
        assert!(out.join("chunk-00000.parquet").exists());
        assert!(!out.join(CONSOLIDATED_FILE).exists());
        assert!(consolidator.staging_dir().join(CONSOLIDATED_FILE).exists());
    }

    #[test]
    fn test_siblings_ignore_trailing_separator() {
        let store = CheckpointStore::new("cp.json");
        let consolidator = Consolidator::new("data/items/", store, 1000);

        assert_eq!(consolidator.output_dir, PathBuf::from("data/items"));
        assert_eq!(consolidator.staging_dir(), PathBuf::from("data/items.consolidated"));
        assert_eq!(
            sibling(Path::new("data/items"), ".backup-x"),
            PathBuf::from("data/items.backup-x")
        );
        assert_eq!(normalize(PathBuf::from("data/./items//")), PathBuf::from("data/items"));
    }

    fn write_ids(path: &Path, ids: &[i64]) {
        let items: Vec<Item> = ids
            .iter()
            .map(|&id| Item {
                id,
                text: Some(format!("item {id}")),
                ..Item::default()
            })
            .collect();
        schema::write_parquet(path, &schema::items_to_batch(&items, false).unwrap(), 1000).unwrap();
    }

    fn merged_rows(path: &Path) -> Vec<(i64, String)> {
        schema::read_parquet(path)
            .unwrap()
            .iter()
            .flat_map(|batch| {
                let ids = batch
                    .column_by_name("id")
                    .unwrap()
                    .as_any()
                    .downcast_ref::<Int64Array>()
                    .unwrap();
                let text = batch
                    .column_by_name("text")
                    .unwrap()
                    .as_any()
                    .downcast_ref::<arrow_array::LargeStringArray>()
                    .unwrap();
                (0..batch.num_rows())
                    .map(|i| (ids.value(i), text.value(i).to_string()))
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    #[test]
    fn test_merge_interleaves_sources_across_batches() {
        let dir = TempDir::new().unwrap();
        let sources = vec![
            dir.path().join("a.parquet"),
            dir.path().join("b.parquet"),
            dir.path().join("c.parquet"),
        ];
        write_ids(&sources[0], &(1..=30).step_by(3).collect::<Vec<_>>());
        write_ids(&sources[1], &(2..=30).step_by(3).collect::<Vec<_>>());
        write_ids(&sources[2], &[3, 6, 9, 12, 12, 40]);

        let target = schema::item_schema(false);
        let out_path = dir.path().join("merged.parquet");
        let mut out = ArchiveFileWriter::create(&out_path, target.clone(), 1000).unwrap();
        let written = merge_by_id(&sources, &target, &mut out, 4).unwrap();
        out.finish().unwrap();

        let rows = merged_rows(&out_path);
        let ids: Vec<i64> = rows.iter().map(|(id, _)| *id).collect();
        let mut expected: Vec<i64> = (1..=30).filter(|id| id % 3 != 0).collect();
        expected.extend([3, 6, 9, 12, 12, 40]);
        expected.sort();

        assert_eq!(written, expected.len() as u64);
        assert_eq!(ids, expected);
        assert!(rows.iter().all(|(id, text)| *text == format!("item {id}")));
    }

    #[test]
    fn test_out_of_order_file_is_sorted_before_merge() {
        let dir = TempDir::new().unwrap();
        let out = dir.path().join("items");
        write_items(&out, PartitionStyle::Flat, [2, 4, 6].into_iter());
        write_ids(&out.join("legacy.parquet"), &[5, 1, 3]);

        let consolidator =
            Consolidator::new(&out, CheckpointStore::new(dir.path().join("cp.json")), 1000);
        let result = consolidator.migrate(MigrateOptions::default()).unwrap();

        let file = result.output_file.unwrap();
        let ids: Vec<i64> = merged_rows(&file).iter().map(|(id, _)| *id).collect();
        assert_eq!(ids, vec![1, 2, 3, 4, 5, 6]);
        assert!(!consolidator.staging_dir().join(PRESORT_DIR).exists());

        // The source file itself is left as it was
        let legacy: Vec<i64> = merged_rows(&out.join("legacy.parquet")).iter().map(|(id, _)| *id).collect();
        assert_eq!(legacy, vec![5, 1, 3]);
    }
}
