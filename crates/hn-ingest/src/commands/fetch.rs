//! `hn-ingest fetch` command implementation

use colored::Colorize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::checkpoint::CheckpointStore;
use crate::config::IngestConfig;
use crate::error::Result;
use crate::fetcher::HnFetcher;
use crate::orchestrator::{FetchOptions, Orchestrator, RunOutcome};
use crate::progress::ConsoleProgress;
use hn_common::{format_bytes, format_count};

/// Fetch items until caught up or cancelled
pub async fn run(config: &IngestConfig, options: FetchOptions, cancel: CancellationToken) -> Result<()> {
    let progress = Arc::new(ConsoleProgress::new(config.concurrency));

    let fetcher = HnFetcher::connect(config.fetcher(), &cancel)?.with_reporter(progress.clone());
    let mut orchestrator = Orchestrator::new(
        fetcher,
        CheckpointStore::new(&config.checkpoint_path),
        config.writer(config.default_partition_style),
        cancel,
    )
    .with_reporter(progress);

    let result = orchestrator.run(options).await;
    orchestrator.source().shutdown();
    let report = result?;

    if report.outcome == RunOutcome::Interrupted {
        println!("{}", "Interrupted, progress saved.".yellow());
        println!("  Last ID: {}", format_count(report.last_fetched_id));
        println!("{}", "Run 'hn-ingest fetch' to resume.".dimmed());
        return Ok(());
    }

    println!("{}", "Fetch complete!".green().bold());
    println!("  Layout: {}", report.partition_style);
    if report.stats.partition_count > 0 {
        println!("  Partitions: {}", report.stats.partition_count);
    }
    println!("  Files: {}", report.stats.file_count);
    println!("  Total size: {}", format_bytes(report.stats.total_size));
    println!("  Items written: {}", format_count(report.items_written as i64));
    println!("  Last ID: {}", format_count(report.last_fetched_id));
    println!();
    println!("{}", "Run 'hn-ingest fetch' again to sync new items".dimmed());

    Ok(())
}
