//! Build automation tasks for hn-ingest
//!
//! Currently generates the CLI reference from the clap definitions.

use clap::Parser;
use std::fs;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "xtask")]
#[command(about = "Build automation tasks for hn-ingest", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Parser)]
enum Command {
    /// Generate the CLI reference in Markdown
    GenerateCliDocs {
        /// Output directory for generated documentation
        #[arg(short, long, default_value = "docs")]
        output_dir: String,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::GenerateCliDocs { output_dir } => generate_cli_docs(&output_dir)?,
    }

    Ok(())
}

fn generate_cli_docs(output_dir: &str) -> anyhow::Result<()> {
    println!("Generating CLI documentation...");

    let markdown = clap_markdown::help_markdown::<hn_ingest::Cli>();

    let content = format!(
        r#"# hn-ingest CLI Reference

Generated from the CLI source code. Last updated: {}.

## Overview

hn-ingest mirrors every item of the Hacker News API into a local Parquet
archive. Fetching is resumable: progress is checkpointed after each batch
and `hn-ingest fetch` picks up where the last run stopped.

## Quick Start

```bash
# Fetch the most recent 1000 items
hn-ingest fetch --start -1000

# Resume a full mirror from the checkpoint
hn-ingest fetch

# Inspect the archive
hn-ingest stats --tree

# Merge every archive file into one sorted file
hn-ingest migrate --swap
```

## Commands

{}

## Environment Variables

- `HN_API_BASE_URL` - Item API root (default: `https://hacker-news.firebaseio.com/v0`)
- `HN_OUTPUT_DIR` - Archive directory (default: `data/items`)
- `HN_CHECKPOINT_PATH` - Checkpoint file (default: `checkpoint.json`)
- `HN_CONCURRENCY` - Maximum requests in flight
- `HN_BATCH_SIZE` - Ids per checkpointed batch
- `HN_PARTITION_STYLE` - Layout for a fresh archive, `flat` or `hive`
- `HN_MAX_RETRIES`, `HN_RETRY_BASE_DELAY_MS`, `HN_REQUEST_TIMEOUT_SECS` - Retry policy
- `HN_BUFFER_ROWS`, `HN_ROW_GROUP_SIZE` - Parquet file and row group sizing
- `LOG_LEVEL`, `LOG_OUTPUT`, `LOG_FORMAT`, `LOG_DIR`, `LOG_FILTER` - Logging

A `.env` file in the working directory is loaded before the environment is read.

---

*To update, run `cargo xtask generate-cli-docs`.*
"#,
        chrono::Utc::now().format("%Y-%m-%d"),
        markdown
    );

    let output_path = PathBuf::from(output_dir);
    fs::create_dir_all(&output_path)?;

    let file_path = output_path.join("cli-reference.md");
    fs::write(&file_path, content)?;

    println!("✅ Generated CLI documentation at: {}", file_path.display());

    Ok(())
}
