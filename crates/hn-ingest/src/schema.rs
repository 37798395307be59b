//! Archive row schema and parquet encoding
//!
//! All archive files share one row schema. The time-partitioned layout adds
//! `year`/`month` columns; readers union files by column name, so flat and
//! partitioned files can sit side by side.

use arrow_array::builder::{
    BooleanBuilder, Int16Builder, Int32Builder, Int64Builder, Int8Builder, LargeStringBuilder,
    ListBuilder, StringBuilder, TimestampSecondBuilder,
};
use arrow_array::{Array, ArrayRef, Int64Array, RecordBatch};
use arrow_schema::{DataType, Field, Schema, SchemaRef, TimeUnit};
use parquet::arrow::arrow_reader::{ParquetRecordBatchReader, ParquetRecordBatchReaderBuilder};
use parquet::arrow::{ArrowWriter, ProjectionMask};
use parquet::basic::{Compression, ZstdLevel};
use parquet::file::metadata::ParquetMetaData;
use parquet::file::properties::{EnabledStatistics, WriterProperties, WriterVersion};
use parquet::file::statistics::Statistics;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::{IngestError, Result};
use crate::item::Item;

/// File extension of archive files
pub const ARCHIVE_EXT: &str = "parquet";

/// Columns only present in the time-partitioned layout
pub const PARTITION_COLUMNS: [&str; 2] = ["year", "month"];

/// Default rows per row group
pub const DEFAULT_ROW_GROUP_SIZE: usize = 100_000;

const ZSTD_LEVEL: i32 = 3;

fn id_list_field(name: &str) -> Field {
    Field::new(
        name,
        DataType::List(Arc::new(Field::new("item", DataType::Int64, true))),
        true,
    )
}

/// Row schema, optionally with the partition columns appended
pub fn item_schema(with_partition_columns: bool) -> SchemaRef {
    let mut fields = vec![
        Field::new("id", DataType::Int64, false),
        Field::new("type", DataType::Utf8, true),
        Field::new("by", DataType::Utf8, true),
        Field::new(
            "time",
            DataType::Timestamp(TimeUnit::Second, Some("UTC".into())),
            true,
        ),
        Field::new("text", DataType::LargeUtf8, true),
        Field::new("url", DataType::Utf8, true),
        Field::new("title", DataType::Utf8, true),
        Field::new("score", DataType::Int32, true),
        Field::new("descendants", DataType::Int32, true),
        Field::new("parent", DataType::Int64, true),
        id_list_field("kids"),
        Field::new("dead", DataType::Boolean, true),
        Field::new("deleted", DataType::Boolean, true),
        Field::new("poll", DataType::Int64, true),
        id_list_field("parts"),
    ];

    if with_partition_columns {
        fields.push(Field::new("year", DataType::Int16, true));
        fields.push(Field::new("month", DataType::Int8, true));
    }

    Arc::new(Schema::new(fields))
}

fn append_id_list(builder: &mut ListBuilder<Int64Builder>, ids: Option<&Vec<i64>>) {
    match ids {
        Some(ids) => {
            builder.values().append_slice(ids);
            builder.append(true);
        },
        None => builder.append(false),
    }
}

/// Encode archived items as one record batch
///
/// Items are written as given; callers apply [`Item::into_archived`] first.
pub fn items_to_batch(items: &[Item], with_partition_columns: bool) -> Result<RecordBatch> {
    let n = items.len();

    let mut id = Int64Builder::with_capacity(n);
    let mut kind = StringBuilder::new();
    let mut by = StringBuilder::new();
    let mut time = TimestampSecondBuilder::with_capacity(n).with_timezone("UTC");
    let mut text = LargeStringBuilder::new();
    let mut url = StringBuilder::new();
    let mut title = StringBuilder::new();
    let mut score = Int32Builder::with_capacity(n);
    let mut descendants = Int32Builder::with_capacity(n);
    let mut parent = Int64Builder::with_capacity(n);
    let mut kids = ListBuilder::new(Int64Builder::new());
    let mut dead = BooleanBuilder::with_capacity(n);
    let mut deleted = BooleanBuilder::with_capacity(n);
    let mut poll = Int64Builder::with_capacity(n);
    let mut parts = ListBuilder::new(Int64Builder::new());
    let mut year = Int16Builder::with_capacity(n);
    let mut month = Int8Builder::with_capacity(n);

    for item in items {
        id.append_value(item.id);
        kind.append_option(item.kind.as_deref());
        by.append_option(item.by.as_deref());
        time.append_option(item.time);
        text.append_option(item.text.as_deref());
        url.append_option(item.url.as_deref());
        title.append_option(item.title.as_deref());
        score.append_option(item.score);
        descendants.append_option(item.descendants);
        parent.append_option(item.parent);
        append_id_list(&mut kids, item.kids.as_ref());
        dead.append_value(item.dead);
        deleted.append_value(item.deleted);
        poll.append_option(item.poll);
        append_id_list(&mut parts, item.parts.as_ref());

        if with_partition_columns {
            let key = item.partition_key();
            // Out-of-range years are stored as null rather than wrapped
            year.append_option(key.and_then(|(y, _)| i16::try_from(y).ok()));
            month.append_option(key.and_then(|(_, m)| i8::try_from(m).ok()));
        }
    }

    let mut columns: Vec<ArrayRef> = vec![
        Arc::new(id.finish()),
        Arc::new(kind.finish()),
        Arc::new(by.finish()),
        Arc::new(time.finish()),
        Arc::new(text.finish()),
        Arc::new(url.finish()),
        Arc::new(title.finish()),
        Arc::new(score.finish()),
        Arc::new(descendants.finish()),
        Arc::new(parent.finish()),
        Arc::new(kids.finish()),
        Arc::new(dead.finish()),
        Arc::new(deleted.finish()),
        Arc::new(poll.finish()),
        Arc::new(parts.finish()),
    ];

    if with_partition_columns {
        columns.push(Arc::new(year.finish()));
        columns.push(Arc::new(month.finish()));
    }

    Ok(RecordBatch::try_new(
        item_schema(with_partition_columns),
        columns,
    )?)
}

/// Parquet properties used for every archive file
///
/// Statistics and a bounded row-group size let the query layer prune row
/// groups on `id` and `time`, so these are not tunable beyond the size.
pub fn writer_properties(row_group_size: usize) -> Result<WriterProperties> {
    Ok(WriterProperties::builder()
        .set_writer_version(WriterVersion::PARQUET_2_0)
        .set_compression(Compression::ZSTD(ZstdLevel::try_new(ZSTD_LEVEL)?))
        .set_dictionary_enabled(true)
        .set_statistics_enabled(EnabledStatistics::Page)
        .set_max_row_group_size(row_group_size)
        .build())
}

/// Incremental writer for one archive file
///
/// Rows go to `{path}.tmp` and the final name only appears once the footer
/// is written and synced.
pub struct ArchiveFileWriter {
    path: PathBuf,
    tmp: PathBuf,
    writer: ArrowWriter<File>,
}

impl ArchiveFileWriter {
    pub fn create(path: &Path, schema: SchemaRef, row_group_size: usize) -> Result<Self> {
        let tmp = path.with_extension(format!("{ARCHIVE_EXT}.tmp"));
        let file = File::create(&tmp).map_err(|e| IngestError::not_writable(&tmp, e))?;
        let writer = ArrowWriter::try_new(file, schema, Some(writer_properties(row_group_size)?))?;

        Ok(Self {
            path: path.to_path_buf(),
            tmp,
            writer,
        })
    }

    pub fn write(&mut self, batch: &RecordBatch) -> Result<()> {
        self.writer.write(batch)?;
        Ok(())
    }

    /// Close the file and move it into place, returning its size
    pub fn finish(self) -> Result<u64> {
        let file = self.writer.into_inner()?;
        file.sync_all()?;
        fs::rename(&self.tmp, &self.path)?;

        Ok(fs::metadata(&self.path)?.len())
    }
}

/// Write a batch to `path`, going through a temporary file
pub fn write_parquet(path: &Path, batch: &RecordBatch, row_group_size: usize) -> Result<u64> {
    let mut writer = ArchiveFileWriter::create(path, batch.schema(), row_group_size)?;
    writer.write(batch)?;
    writer.finish()
}

/// Row count and id range of one archive file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileSummary {
    pub rows: u64,
    pub id_range: Option<(i64, i64)>,
}

fn merge_range(range: Option<(i64, i64)>, lo: i64, hi: i64) -> Option<(i64, i64)> {
    Some(match range {
        Some((a, b)) => (a.min(lo), b.max(hi)),
        None => (lo, hi),
    })
}

/// `id` range from row-group statistics, if every row group carries them
fn id_range_from_stats(metadata: &ParquetMetaData, leaf: usize) -> Option<Option<(i64, i64)>> {
    let mut range = None;
    for row_group in metadata.row_groups() {
        if row_group.num_rows() == 0 {
            continue;
        }
        match row_group.column(leaf).statistics() {
            Some(Statistics::Int64(stats)) => {
                let (lo, hi) = (stats.min_opt()?, stats.max_opt()?);
                range = merge_range(range, *lo, *hi);
            },
            _ => return None,
        }
    }
    Some(range)
}

/// Row count and id range of a file, from its footer when possible
///
/// Falls back to scanning the `id` column when statistics are missing.
pub fn summarize_file(path: &Path) -> Result<FileSummary> {
    let builder = ParquetRecordBatchReaderBuilder::try_new(File::open(path)?)?;
    let rows = builder.metadata().file_metadata().num_rows().max(0) as u64;

    let leaf = builder
        .parquet_schema()
        .columns()
        .iter()
        .position(|column| column.path().string() == "id");

    if let Some(id_range) = leaf.and_then(|leaf| id_range_from_stats(builder.metadata(), leaf)) {
        return Ok(FileSummary { rows, id_range });
    }

    let mut id_range = None;
    for batch in id_reader(builder)? {
        let batch = batch?;
        let ids = batch
            .column(0)
            .as_any()
            .downcast_ref::<Int64Array>()
            .ok_or_else(|| IngestError::migration(format!("{}: id column is not int64", path.display())))?;

        for id in ids.iter().flatten() {
            id_range = merge_range(id_range, id, id);
        }
    }

    Ok(FileSummary { rows, id_range })
}

fn id_reader(builder: ParquetRecordBatchReaderBuilder<File>) -> Result<ParquetRecordBatchReader> {
    let id_idx = builder.schema().index_of("id")?;
    let mask = ProjectionMask::roots(builder.parquet_schema(), [id_idx]);
    Ok(builder.with_projection(mask).build()?)
}

/// Whether `id` never decreases from one row to the next
///
/// Only the `id` column is read. Null ids are skipped.
pub fn ids_ascending(path: &Path) -> Result<bool> {
    let reader = id_reader(ParquetRecordBatchReaderBuilder::try_new(File::open(path)?)?)?;

    let mut last = i64::MIN;
    for batch in reader {
        let ids = arrow_cast::cast(batch?.column(0), &DataType::Int64)?;
        let ids = ids
            .as_any()
            .downcast_ref::<Int64Array>()
            .ok_or_else(|| IngestError::migration(format!("{}: id column is not numeric", path.display())))?;

        for id in ids.iter().flatten() {
            if id < last {
                return Ok(false);
            }
            last = id;
        }
    }
    Ok(true)
}

/// Stream the batches of a parquet file, `batch_rows` at a time
pub fn batch_reader(path: &Path, batch_rows: usize) -> Result<ParquetRecordBatchReader> {
    Ok(ParquetRecordBatchReaderBuilder::try_new(File::open(path)?)?
        .with_batch_size(batch_rows)
        .build()?)
}

/// Read every batch of a parquet file
pub fn read_parquet(path: &Path) -> Result<Vec<RecordBatch>> {
    let reader = ParquetRecordBatchReaderBuilder::try_new(File::open(path)?)?.build()?;
    reader.map(|batch| batch.map_err(IngestError::from)).collect()
}
