//! hn-ingest - Main entry point

use anyhow::Context;
use clap::Parser;
use colored::Colorize;
use hn_common::logging::{init_logging, LogConfig, LogLevel, LogOutput};
use hn_ingest::commands;
use hn_ingest::{Cli, Commands, FetchOptions, IngestConfig, MigrateOptions};
use std::process;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    // A missing .env file is fine
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    // Progress bars own the terminal unless verbose; logs go to stderr
    let log_config = LogConfig::builder()
        .level(if cli.verbose { LogLevel::Debug } else { LogLevel::Warn })
        .output(LogOutput::Console)
        .log_file_prefix("hn-ingest")
        .build();

    // Environment variables take precedence
    let log_config = log_config.merge_env().unwrap_or_else(|e| {
        eprintln!("Ignoring invalid logging environment: {e}");
        LogConfig::default()
    });

    let _log_guard = match init_logging(&log_config) {
        Ok(guard) => Some(guard),
        Err(e) => {
            eprintln!("Logging disabled: {e}");
            None
        },
    };

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Interrupt received, finishing current batch");
                eprintln!("\n{}", "Interrupted! Saving progress...".yellow());
                cancel.cancel();
            }
        }
    });

    if let Err(e) = execute_command(cli, cancel).await {
        error!(error = %format!("{e:#}"), "Command failed");
        eprintln!("{} {e:#}", "Error:".red().bold());
        process::exit(1);
    }
}

/// Environment configuration with global CLI overrides applied
fn load_config(cli: &Cli) -> anyhow::Result<IngestConfig> {
    let mut config = IngestConfig::from_env().context("invalid configuration")?;

    if let Some(output) = &cli.output {
        config.output_dir = output.clone();
    }
    if let Some(checkpoint) = &cli.checkpoint {
        config.checkpoint_path = checkpoint.clone();
    }

    Ok(config)
}

async fn execute_command(cli: Cli, cancel: CancellationToken) -> anyhow::Result<()> {
    let mut config = load_config(&cli)?;

    match cli.command {
        Commands::Fetch {
            concurrency,
            batch_size,
            resume: _,
            no_resume,
            start,
            end,
            partition_style,
        } => {
            if let Some(concurrency) = concurrency {
                config.concurrency = concurrency;
            }
            if let Some(batch_size) = batch_size {
                config.batch_size = batch_size;
            }
            config.validate()?;

            let options = FetchOptions {
                start,
                end,
                resume: !no_resume,
                batch_size: config.batch_size,
                partition_style,
            };
            commands::fetch::run(&config, options, cancel).await?;
        },

        Commands::Stats { tree } => commands::stats::run(&config, tree, cancel).await?,

        Commands::Reset { data, yes } => commands::reset::run(&config, data, yes)?,

        Commands::Migrate { dry_run, swap } => {
            commands::migrate::run(&config, MigrateOptions { dry_run, swap })?
        },
    }

    Ok(())
}
