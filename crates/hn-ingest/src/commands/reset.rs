//! `hn-ingest reset` command implementation

use colored::Colorize;
use inquire::Confirm;
use std::fs;

use crate::checkpoint::CheckpointStore;
use crate::config::IngestConfig;
use crate::error::{IngestError, Result};
use crate::writer::ArchiveStats;
use hn_common::format_bytes;

/// Delete the checkpoint, and the archive with `data`
pub fn run(config: &IngestConfig, data: bool, yes: bool) -> Result<()> {
    let store = CheckpointStore::new(&config.checkpoint_path);
    let remove_data = data && config.output_dir.exists();

    if !store.exists() && !remove_data {
        println!("Nothing to reset.");
        return Ok(());
    }

    if !yes {
        let prompt = if remove_data {
            let stats = ArchiveStats::scan(&config.output_dir)?;
            format!(
                "Delete the checkpoint and {} ({} files, {})?",
                config.output_dir.display(),
                stats.file_count,
                format_bytes(stats.total_size)
            )
        } else {
            "Delete the checkpoint? The next fetch starts from id 1.".to_string()
        };

        let confirmed = Confirm::new(&prompt)
            .with_default(false)
            .prompt()
            .map_err(|e| IngestError::Other(e.into()))?;

        if !confirmed {
            println!("Aborted.");
            return Ok(());
        }
    }

    if store.delete()? {
        println!("{} Checkpoint deleted", "✓".green());
    }

    if remove_data {
        fs::remove_dir_all(&config.output_dir)?;
        println!("{} Deleted {}", "✓".green(), config.output_dir.display());
    }

    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::checkpoint::Checkpoint;
    use crate::writer::PartitionStyle;
    use tempfile::TempDir;

    fn config(dir: &TempDir) -> IngestConfig {
        IngestConfig {
            output_dir: dir.path().join("items"),
            checkpoint_path: dir.path().join("checkpoint.json"),
            ..IngestConfig::default()
        }
    }

    #[test]
    fn test_reset_checkpoint_only() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir);
        CheckpointStore::new(&config.checkpoint_path)
            .save(&Checkpoint::new(10, PartitionStyle::Flat))
            .unwrap();
        fs::create_dir_all(&config.output_dir).unwrap();

        run(&config, false, true).unwrap();

        assert!(!config.checkpoint_path.exists());
        assert!(config.output_dir.exists());
    }

    #[test]
    fn test_reset_with_data() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir);
        fs::create_dir_all(&config.output_dir).unwrap();

        run(&config, true, true).unwrap();

        assert!(!config.output_dir.exists());
    }

    #[test]
    fn test_reset_with_nothing_to_do() {
        let dir = TempDir::new().unwrap();
        run(&config(&dir), true, true).unwrap();
    }
}
