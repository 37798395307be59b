//! `hn-ingest migrate` command implementation

use colored::Colorize;

use crate::checkpoint::CheckpointStore;
use crate::config::IngestConfig;
use crate::consolidate::{Consolidator, MigrateOptions, MigrationPlan};
use crate::error::Result;
use hn_common::format_count;

fn print_plan(plan: &MigrationPlan) {
    println!("{}", "Migration plan:".bold());
    println!("  Source files: {}", plan.source_file_count);
    println!("  Total items: {}", format_count(plan.total_items as i64));
    match plan.id_range {
        Some((lo, hi)) => println!("  ID range: {} - {}", format_count(lo), format_count(hi)),
        None => println!("  ID range: (empty)"),
    }
}

/// Consolidate the archive into one sorted file
pub fn run(config: &IngestConfig, options: MigrateOptions) -> Result<()> {
    let consolidator = Consolidator::new(
        &config.output_dir,
        CheckpointStore::new(&config.checkpoint_path),
        config.row_group_size,
    );

    let result = consolidator.migrate(options)?;
    print_plan(&result.plan);
    println!();

    if result.dry_run {
        println!("{}", "Dry run: nothing was written.".yellow());
        println!(
            "{}",
            "Run 'hn-ingest migrate --swap' to consolidate and activate.".dimmed()
        );
        return Ok(());
    }

    println!(
        "{} Wrote {} rows",
        "✓".green(),
        format_count(result.rows_written as i64)
    );
    if let Some(file) = &result.output_file {
        println!("  File: {}", file.display());
    }

    if result.swapped {
        if let Some(backup) = &result.backup_dir {
            println!("  Previous archive: {}", backup.display());
        }
        println!("{} Consolidated archive is now active (layout: flat)", "✓".green());
    } else {
        println!(
            "{}",
            "Not swapped in. Re-run with --swap to activate it.".dimmed()
        );
    }

    Ok(())
}
