//! HN Ingest Library
//!
//! Resumable ingestion of the Hacker News item set into a local parquet
//! archive.
//!
//! # Overview
//!
//! - **Fetcher**: bounded-concurrency reads from the item API, with retry and
//!   cancellation ([`fetcher`])
//! - **Writer**: buffered parquet files in a flat or time-partitioned layout
//!   ([`writer`])
//! - **Checkpoint**: durable progress for exact resume ([`checkpoint`])
//! - **Orchestrator**: the fetch, flush, checkpoint batch loop
//!   ([`orchestrator`])
//! - **Consolidator**: offline merge of an archive into one sorted file
//!   ([`consolidate`])
//!
//! # Example
//!
//! ```no_run
//! use hn_ingest::{CheckpointStore, FetchOptions, HnFetcher, IngestConfig, Orchestrator};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> hn_ingest::Result<()> {
//!     let config = IngestConfig::from_env()?;
//!     let cancel = CancellationToken::new();
//!
//!     let fetcher = HnFetcher::connect(config.fetcher(), &cancel)?;
//!     let mut orchestrator = Orchestrator::new(
//!         fetcher,
//!         CheckpointStore::new(&config.checkpoint_path),
//!         config.writer(config.default_partition_style),
//!         cancel,
//!     );
//!
//!     let report = orchestrator.run(FetchOptions::default()).await?;
//!     println!("last id: {}", report.last_fetched_id);
//!     Ok(())
//! }
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod checkpoint;
pub mod commands;
pub mod config;
pub mod consolidate;
pub mod error;
pub mod fetcher;
pub mod item;
pub mod orchestrator;
pub mod progress;
pub mod schema;
pub mod writer;

// Re-export commonly used types
pub use checkpoint::{Checkpoint, CheckpointStore};
pub use config::{FetcherConfig, IngestConfig};
pub use consolidate::{Consolidator, MigrateOptions, MigrationPlan, MigrationResult};
pub use error::{IngestError, Result};
pub use fetcher::{FetchOutcome, HnFetcher, ItemSource};
pub use item::{Item, ItemKind};
pub use orchestrator::{FetchOptions, Orchestrator, RunOutcome, RunReport, RunState};
pub use progress::{ConsoleProgress, NoopReporter, ProgressReporter};
pub use writer::{ArchiveStats, ColumnarWriter, FlushSummary, PartitionStyle, WriterConfig};

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// hn-ingest - Hacker News archive ingestion
#[derive(Parser, Debug)]
#[command(name = "hn-ingest")]
#[command(author, version, about, long_about = None)]
#[command(arg_required_else_help = true)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Archive directory
    #[arg(short, long, env = "HN_OUTPUT_DIR", global = true)]
    pub output: Option<PathBuf>,

    /// Checkpoint file
    #[arg(long, env = "HN_CHECKPOINT_PATH", global = true)]
    pub checkpoint: Option<PathBuf>,
}

/// Available CLI commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Fetch items into the archive, resuming from the checkpoint
    Fetch {
        /// Maximum concurrent requests
        #[arg(short, long, env = "HN_CONCURRENCY")]
        concurrency: Option<usize>,

        /// Ids per batch; progress is saved after each batch
        #[arg(short, long, env = "HN_BATCH_SIZE")]
        batch_size: Option<usize>,

        /// Resume from the checkpoint (default)
        #[arg(long, overrides_with = "no_resume")]
        resume: bool,

        /// Ignore the checkpoint and start from id 1
        #[arg(long, overrides_with = "resume")]
        no_resume: bool,

        /// First id to fetch; negative counts back from the current max (e.g. -1000)
        #[arg(short, long, allow_negative_numbers = true)]
        start: Option<i64>,

        /// Last id to fetch (defaults to the current max)
        #[arg(short, long)]
        end: Option<i64>,

        /// Layout for a new archive: flat or hive
        #[arg(long, env = "HN_PARTITION_STYLE")]
        partition_style: Option<PartitionStyle>,
    },

    /// Show archive statistics
    Stats {
        /// Show the year/month partition tree
        #[arg(short, long)]
        tree: bool,
    },

    /// Delete the checkpoint and optionally the archive
    Reset {
        /// Also delete the archive directory
        #[arg(long)]
        data: bool,

        /// Skip confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },

    /// Consolidate the archive into one sorted file
    Migrate {
        /// Show what would be done without writing anything
        #[arg(long)]
        dry_run: bool,

        /// Replace the archive with the consolidated file, keeping a backup
        #[arg(long)]
        swap: bool,
    },
}
