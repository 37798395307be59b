//! `hn-ingest stats` command implementation
//!
//! Shows storage, data coverage and checkpoint state. The remote max id is
//! looked up on a best-effort basis; being offline only hides coverage.

use colored::Colorize;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::checkpoint::CheckpointStore;
use crate::config::IngestConfig;
use crate::consolidate::MigrationPlan;
use crate::error::Result;
use crate::fetcher::HnFetcher;
use crate::writer::{ArchiveStats, PartitionInfo};
use hn_common::{format_bytes, format_count};

const REMOTE_TIMEOUT: Duration = Duration::from_secs(5);

async fn remote_max_id(config: &IngestConfig, cancel: &CancellationToken) -> Option<i64> {
    let fetcher =
        HnFetcher::connect(config.fetcher().with_request_timeout(REMOTE_TIMEOUT), cancel).ok()?;
    match fetcher.get_max_id().await {
        Ok(max) => Some(max),
        Err(e) => {
            debug!(error = %e, "Remote max id unavailable");
            None
        },
    }
}

pub async fn run(config: &IngestConfig, tree: bool, cancel: CancellationToken) -> Result<()> {
    let stats = ArchiveStats::scan(&config.output_dir)?;
    let remote_max = remote_max_id(config, &cancel).await;

    println!();
    println!("{}", "=== HN Data Statistics ===".cyan().bold());
    println!();

    if let Some(max) = remote_max {
        println!("{}", "HN API:".bold());
        println!("  Current max item ID: {}", format_count(max));
        println!();
    }

    if stats.is_empty() {
        println!(
            "{}",
            "No local data yet. Run 'hn-ingest fetch' to start downloading.".yellow()
        );
        println!();
        println!("{}", "Example: hn-ingest fetch --start -1000  # fetch last 1000 items".dimmed());
        return Ok(());
    }

    let plan = MigrationPlan::collect(std::slice::from_ref(&config.output_dir))?;

    println!("{}", "Storage:".bold());
    println!("  Directory: {}", config.output_dir.display());
    println!("  Partitions: {}", stats.partition_count);
    println!("  Files: {}", stats.file_count);
    println!("  Total size: {}", format_bytes(stats.total_size));
    if plan.total_items > 0 {
        let avg = plan.total_items / stats.file_count.max(1) as u64;
        println!("  Avg items/file: {}", format_count(avg as i64));
    }

    if plan.total_items > 0 {
        println!();
        println!("{}", "Data Coverage:".bold());
        println!("  Total items: {}", format_count(plan.total_items as i64));
        if let Some((min_id, max_id)) = plan.id_range {
            println!("  ID range: {} - {}", format_count(min_id), format_count(max_id));
            if let Some(current) = remote_max.filter(|m| *m > 0) {
                let pct = max_id as f64 / current as f64 * 100.0;
                println!(
                    "  Coverage: {:.2}% ({} items remaining)",
                    pct,
                    format_count((current - max_id).max(0))
                );
            }
        }
    }

    let store = CheckpointStore::new(&config.checkpoint_path);
    match store.load() {
        Ok(Some(checkpoint)) => {
            println!();
            println!("{}", "Active Checkpoint:".bold());
            println!("  Last fetched ID: {}", format_count(checkpoint.last_fetched_id));
            println!("  Items fetched: {}", format_count(checkpoint.items_fetched as i64));
            println!("  Layout: {}", checkpoint.partition_style);
            println!("  Progress: {:.2}%", checkpoint.progress_pct());
            println!("  Started: {}", checkpoint.started_at.to_rfc3339());
        },
        Ok(None) => {},
        Err(e) => {
            println!();
            println!("{} {}", "Checkpoint unusable:".red(), e);
        },
    }

    if tree {
        println!();
        println!("{}", "Partition Tree:".bold());
        print_tree(&config.output_dir.display().to_string(), &stats.partitions);
    }

    println!();
    Ok(())
}

/// Keep the first and last `edge` entries, or everything if short enough
fn abbreviate<T>(items: &[T], edge: usize) -> (Vec<&T>, usize, Vec<&T>) {
    if items.len() <= edge * 2 + 1 {
        return (items.iter().collect(), 0, Vec::new());
    }
    let hidden = items.len() - edge * 2;
    (
        items[..edge].iter().collect(),
        hidden,
        items[items.len() - edge..].iter().collect(),
    )
}

fn print_tree(root: &str, partitions: &[PartitionInfo]) {
    println!("{}", root.bold());
    if partitions.is_empty() {
        println!("  {}", "(no year/month partitions)".dimmed());
        return;
    }

    let mut years: BTreeMap<i32, Vec<&PartitionInfo>> = BTreeMap::new();
    for partition in partitions {
        years.entry(partition.year).or_default().push(partition);
    }
    let years: Vec<_> = years.into_iter().collect();

    let (head, hidden, tail) = abbreviate(&years, 3);
    for (year, months) in &head {
        print_year(*year, months);
    }
    if hidden > 0 {
        println!("  {}", format!("... ({hidden} more years)").dimmed());
    }
    for (year, months) in &tail {
        print_year(*year, months);
    }
}

fn print_year(year: i32, months: &[&PartitionInfo]) {
    let files: usize = months.iter().map(|m| m.file_count).sum();
    let size: u64 = months.iter().map(|m| m.total_size).sum();
    println!(
        "  {} ({} files, {})",
        format!("year={year}").blue(),
        files,
        format_bytes(size)
    );

    let (head, hidden, tail) = abbreviate(months, 2);
    for month in head {
        print_month(month);
    }
    if hidden > 0 {
        println!("    {}", format!("... ({hidden} more months)").dimmed());
    }
    for month in tail {
        print_month(month);
    }
}

fn print_month(month: &PartitionInfo) {
    println!(
        "    month={} ({} files, {})",
        month.month,
        month.file_count,
        format_bytes(month.total_size)
    );
}
