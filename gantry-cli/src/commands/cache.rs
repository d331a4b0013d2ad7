use crate::commands::ConfigArgs;
use crate::output;

use clap::{Args, Subcommand};
use color_eyre::Result;
use tracing::info;

use gantry_engine::CacheStore;

/// Manage the dependency cache
#[derive(Args, Debug)]
pub struct CacheArgs {
    #[command(flatten)]
    pub config: ConfigArgs,

    #[command(subcommand)]
    pub command: CacheCommand,
}

#[derive(Subcommand, Debug)]
pub enum CacheCommand {
    /// List cached environments
    List,

    /// Remove cached environments
    Clear {
        /// Only clear entries of this version (e.g., 3.10)
        #[arg(long)]
        version: Option<String>,
    },

    /// Show the cache directory path
    Path,
}

pub async fn execute(args: CacheArgs) -> Result<()> {
    let config = args.config.load()?;
    let cache = CacheStore::new(&config.cache_dir);

    match args.command {
        CacheCommand::List => {
            output::status("Cache", &format!("in {}", cache.root().display()));

            let entries = cache.list().await?;
            if entries.is_empty() {
                output::dim("  No environments cached");
                return Ok(());
            }
            let mut total = 0;
            for entry in &entries {
                total += entry.size_bytes;
                println!(
                    "  {:<24} {:>10}  {} files",
                    entry.key.to_string(),
                    human_size(entry.size_bytes),
                    entry.file_count
                );
            }
            println!();
            output::dim(&format!(
                "  {} environment(s), {} total",
                entries.len(),
                human_size(total)
            ));
        }

        CacheCommand::Clear { version } => {
            let removed = cache.clear(version.as_deref()).await?;
            info!(removed, version = ?version, root = %cache.root().display(), "cache cleared");
            match version {
                Some(v) => output::success(&format!("Removed {} entries for {}", removed, v)),
                None => output::success(&format!("Removed {} entries", removed)),
            }
        }

        CacheCommand::Path => {
            println!("{}", cache.root().display());
        }
    }

    Ok(())
}

fn human_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.1} {}", size, UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_human_size() {
        assert_eq!(human_size(512), "512 B");
        assert_eq!(human_size(2048), "2.0 KiB");
        assert_eq!(human_size(5 * 1024 * 1024 + 512 * 1024), "5.5 MiB");
    }
}
