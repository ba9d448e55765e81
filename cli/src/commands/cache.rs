//! `sbuild cache` command.

use std::path::PathBuf;

use clap::{Args, Subcommand};
use sbuild_runtime::BlobCache;

use crate::output::{format_bytes, short_digest};

#[derive(Args)]
pub struct CacheArgs {
    /// Cache directory (default: ~/.cache/sbuild)
    #[arg(long)]
    pub cache_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub action: CacheAction,
}

#[derive(Subcommand)]
pub enum CacheAction {
    /// List cached blobs
    List {
        /// Print entries as JSON
        #[arg(long)]
        json: bool,
    },
    /// Remove every cached blob
    Clean,
}

pub async fn execute(args: CacheArgs) -> Result<(), Box<dyn std::error::Error>> {
    let dir = args.cache_dir.unwrap_or_else(super::default_cache_dir);

    match args.action {
        CacheAction::List { json } => {
            let cache = BlobCache::new(&dir)?;
            let mut entries = cache.list_entries()?;
            entries.sort_by(|a, b| b.last_accessed.cmp(&a.last_accessed));

            if json {
                println!("{}", serde_json::to_string_pretty(&entries)?);
                return Ok(());
            }
            println!("{:<14} {:>10}", "DIGEST", "SIZE");
            for entry in &entries {
                println!(
                    "{:<14} {:>10}",
                    short_digest(&entry.digest),
                    format_bytes(entry.size_bytes)
                );
            }
            println!(
                "{} blobs, {} total",
                entries.len(),
                format_bytes(entries.iter().map(|e| e.size_bytes).sum())
            );
        }
        CacheAction::Clean => {
            if dir.exists() {
                let freed = BlobCache::new(&dir)?.total_size()?;
                std::fs::remove_dir_all(&dir)
                    .map_err(|e| format!("Failed to remove {}: {}", dir.display(), e))?;
                println!("Removed {} ({})", dir.display(), format_bytes(freed));
            } else {
                println!("Cache {} is empty", dir.display());
            }
        }
    }
    Ok(())
}
