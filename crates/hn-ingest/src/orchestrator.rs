//! Batch loop driving fetch, write and checkpoint
//!
//! Each batch is a contiguous id range. Its items are streamed into the
//! writer, the writer is flushed, and only then is the checkpoint advanced
//! and saved. A checkpoint therefore never claims ids whose rows are not on
//! disk. A batch interrupted by cancellation is flushed but not claimed; the
//! next run fetches it again.

use futures::StreamExt;
use std::fmt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::checkpoint::{Checkpoint, CheckpointStore};
use crate::config::DEFAULT_BATCH_SIZE;
use crate::error::{IngestError, Result};
use crate::fetcher::ItemSource;
use crate::progress::{self, SharedReporter};
use crate::writer::{ArchiveStats, ColumnarWriter, PartitionStyle, WriterConfig};

/// Options for one fetch run
#[derive(Debug, Clone)]
pub struct FetchOptions {
    /// First id; negative means that many ids before the current max
    pub start: Option<i64>,

    /// Last id, inclusive
    pub end: Option<i64>,

    /// Continue from the checkpoint when no start is given
    pub resume: bool,

    pub batch_size: usize,

    /// Layout for a fresh archive, overriding the default
    pub partition_style: Option<PartitionStyle>,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            start: None,
            end: None,
            resume: true,
            batch_size: DEFAULT_BATCH_SIZE,
            partition_style: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Init,
    FetchingMaxId,
    ResolvingStart,
    BatchLoop,
    Draining,
    Done,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunState::Init => "init",
            RunState::FetchingMaxId => "fetching_max_id",
            RunState::ResolvingStart => "resolving_start",
            RunState::BatchLoop => "batch_loop",
            RunState::Draining => "draining",
            RunState::Done => "done",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,

    /// Stopped by cancellation; progress up to the last claimed batch is saved
    Interrupted,
}

#[derive(Debug, Clone)]
pub struct RunReport {
    pub outcome: RunOutcome,
    pub start_id: i64,
    pub target_max: i64,
    pub last_fetched_id: i64,

    /// Items returned with data during this run
    pub items_fetched: u64,

    /// Rows accepted by the writer during this run
    pub items_written: u64,

    /// Batches claimed by the checkpoint
    pub batches: u64,

    pub partition_style: PartitionStyle,
    pub stats: ArchiveStats,
}

pub struct Orchestrator<S> {
    source: S,
    store: CheckpointStore,
    writer_config: WriterConfig,
    reporter: SharedReporter,
    cancel: CancellationToken,
    state: RunState,
}

impl<S: ItemSource> Orchestrator<S> {
    /// `writer_config.partition_style` is the layout for fresh archives
    pub fn new(
        source: S,
        store: CheckpointStore,
        writer_config: WriterConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            source,
            store,
            writer_config,
            reporter: progress::noop(),
            cancel,
            state: RunState::Init,
        }
    }

    pub fn with_reporter(mut self, reporter: SharedReporter) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    fn transition(&mut self, next: RunState) {
        debug!(from = %self.state, to = %next, "Run state");
        self.state = next;
    }

    /// Pick the first id and the checkpoint to advance
    fn resolve_start(&self, options: &FetchOptions, api_max: i64) -> Result<(i64, Checkpoint)> {
        let existing = self.store.load()?;
        let existing_style = existing.as_ref().map(|c| c.partition_style);

        if let Some(start) = options.start {
            let start_id = if start < 0 {
                (api_max + start).max(1)
            } else {
                start.max(1)
            };
            let style = options
                .partition_style
                .or(existing_style)
                .unwrap_or(self.writer_config.partition_style);

            info!(start_id, partition_style = %style, "Starting from explicit id");
            let mut checkpoint = Checkpoint::new(api_max, style);
            checkpoint.last_fetched_id = start_id - 1;
            return Ok((start_id, checkpoint));
        }

        if options.resume {
            if let Some(mut checkpoint) = existing {
                if let Some(requested) = options.partition_style {
                    if requested != checkpoint.partition_style {
                        warn!(
                            requested = %requested,
                            active = %checkpoint.partition_style,
                            "Archive layout is fixed by the checkpoint, ignoring requested layout"
                        );
                    }
                }
                checkpoint.refresh_max(api_max);
                let start_id = checkpoint.last_fetched_id + 1;
                info!(
                    start_id,
                    partition_style = %checkpoint.partition_style,
                    "Resuming from checkpoint"
                );
                return Ok((start_id, checkpoint));
            }
        }

        let style = options
            .partition_style
            .or(existing_style)
            .unwrap_or(self.writer_config.partition_style);
        info!(partition_style = %style, "Starting fresh fetch");
        Ok((1, Checkpoint::new(api_max, style)))
    }

    /// Run the batch loop until the range is exhausted or cancelled
    pub async fn run(&mut self, options: FetchOptions) -> Result<RunReport> {
        if options.batch_size == 0 {
            return Err(IngestError::config("batch size must be greater than 0"));
        }

        self.transition(RunState::FetchingMaxId);
        let api_max = self.source.get_max_id().await?;
        info!(api_max, "Remote max item id");

        self.transition(RunState::ResolvingStart);
        let (start_id, mut checkpoint) = self.resolve_start(&options, api_max)?;
        let target_max = options.end.map_or(api_max, |end| end.min(api_max));

        let mut writer = ColumnarWriter::new(WriterConfig {
            partition_style: checkpoint.partition_style,
            ..self.writer_config.clone()
        })?;
        self.store.save(&checkpoint)?;

        info!(
            start_id,
            target_max,
            total = (target_max - start_id + 1).max(0),
            "Fetch range resolved"
        );
        self.reporter.run_started(start_id, target_max);

        let mut report = RunReport {
            outcome: RunOutcome::Completed,
            start_id,
            target_max,
            last_fetched_id: checkpoint.last_fetched_id,
            items_fetched: 0,
            items_written: 0,
            batches: 0,
            partition_style: checkpoint.partition_style,
            stats: ArchiveStats::default(),
        };

        self.transition(RunState::BatchLoop);
        let batch_size = i64::try_from(options.batch_size)
            .map_err(|_| IngestError::config("batch size out of range"))?;
        let mut current = start_id;

        while current <= target_max {
            if self.cancel.is_cancelled() {
                report.outcome = RunOutcome::Interrupted;
                break;
            }

            let batch_end = current.saturating_add(batch_size).min(target_max + 1);
            self.reporter.batch_started(current, batch_end);

            let mut found = 0u64;
            let mut accepted = 0u64;
            {
                let mut results = self.source.fetch_items(current..batch_end);
                while let Some((_id, item)) = results.next().await {
                    self.reporter.item_completed(item.is_some());
                    if let Some(item) = item {
                        found += 1;
                        if writer.add_item(item)? {
                            accepted += 1;
                        }
                    }
                }
            }

            let flushed = writer.flush_all()?;

            if self.cancel.is_cancelled() {
                info!(
                    batch_start = current,
                    batch_end,
                    flushed_rows = flushed.rows_written,
                    "Batch interrupted, not recorded"
                );
                report.outcome = RunOutcome::Interrupted;
                break;
            }

            checkpoint.update(batch_end - 1, found, accepted);
            self.store.save(&checkpoint)?;

            report.items_fetched += found;
            report.items_written += accepted;
            report.batches += 1;
            report.last_fetched_id = checkpoint.last_fetched_id;

            info!(
                batch_start = current,
                batch_end,
                found,
                written = accepted,
                progress_pct = checkpoint.progress_pct(),
                "Batch complete"
            );

            current = batch_end;
        }

        if report.outcome == RunOutcome::Interrupted {
            self.transition(RunState::Draining);
            writer.flush_all()?;
            self.store.save(&checkpoint)?;
            info!(
                last_fetched_id = checkpoint.last_fetched_id,
                "Progress saved after interruption"
            );
        }

        if writer.dropped_untimed() > 0 {
            warn!(
                dropped = writer.dropped_untimed(),
                "Items without timestamp were not archived"
            );
        }

        report.stats = writer.get_stats()?;
        self.reporter.run_finished();
        self.transition(RunState::Done);

        Ok(report)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::item::Item;
    use futures::stream::{self, BoxStream};
    use std::future::Future;
    use std::ops::Range;
    use tempfile::TempDir;

    /// Every id exists, with a fixed timestamp
    struct Dense {
        max: i64,
    }

    impl ItemSource for Dense {
        fn get_max_id(&self) -> impl Future<Output = Result<i64>> + Send {
            let max = self.max;
            async move { Ok(max) }
        }

        fn fetch_items(&self, ids: Range<i64>) -> BoxStream<'_, (i64, Option<Item>)> {
            stream::iter(ids.map(|id| {
                (
                    id,
                    Some(Item {
                        id,
                        time: Some(1_700_000_000),
                        ..Item::default()
                    }),
                )
            }))
            .boxed()
        }
    }

    fn orchestrator(dir: &TempDir, max: i64) -> Orchestrator<Dense> {
        Orchestrator::new(
            Dense { max },
            CheckpointStore::new(dir.path().join("checkpoint.json")),
            WriterConfig::new(dir.path().join("items"), PartitionStyle::Flat),
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn test_batches_cover_range() {
        let dir = TempDir::new().unwrap();
        let mut orch = orchestrator(&dir, 25);

        let report = orch
            .run(FetchOptions {
                batch_size: 10,
                ..FetchOptions::default()
            })
            .await
            .unwrap();

        assert_eq!(report.outcome, RunOutcome::Completed);
        assert_eq!(report.batches, 3);
        assert_eq!(report.last_fetched_id, 25);
        assert_eq!(report.items_written, 25);
        assert_eq!(report.stats.file_count, 3);
        assert_eq!(orch.state(), RunState::Done);
    }

    #[tokio::test]
    async fn test_negative_start_counts_back_from_max() {
        let dir = TempDir::new().unwrap();
        let mut orch = orchestrator(&dir, 100);

        let report = orch
            .run(FetchOptions {
                start: Some(-10),
                ..FetchOptions::default()
            })
            .await
            .unwrap();

        assert_eq!(report.start_id, 90);
        assert_eq!(report.items_fetched, 11);
    }

    #[tokio::test]
    async fn test_end_caps_range() {
        let dir = TempDir::new().unwrap();
        let mut orch = orchestrator(&dir, 100);

        let report = orch
            .run(FetchOptions {
                end: Some(40),
                ..FetchOptions::default()
            })
            .await
            .unwrap();

        assert_eq!(report.target_max, 40);
        assert_eq!(report.last_fetched_id, 40);
    }

    #[tokio::test]
    async fn test_nothing_to_do_when_caught_up() {
        let dir = TempDir::new().unwrap();
        let mut orch = orchestrator(&dir, 10);
        orch.run(FetchOptions::default()).await.unwrap();

        let report = orch.run(FetchOptions::default()).await.unwrap();
        assert_eq!(report.start_id, 11);
        assert_eq!(report.batches, 0);
        assert_eq!(report.outcome, RunOutcome::Completed);
    }

    #[tokio::test]
    async fn test_zero_batch_size_rejected() {
        let dir = TempDir::new().unwrap();
        let mut orch = orchestrator(&dir, 10);
        let err = orch
            .run(FetchOptions {
                batch_size: 0,
                ..FetchOptions::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::Config(_)));
    }

    #[test]
    fn test_run_state_display() {
        assert_eq!(RunState::FetchingMaxId.to_string(), "fetching_max_id");
    }
}
