pub mod cache;
pub mod run;
pub mod trigger;
pub mod validate;

use std::path::PathBuf;

use clap::Args;
use color_eyre::Result;
use tracing::debug;

use gantry_engine::EngineConfig;

/// Engine settings shared by commands that touch the cache or work dirs
#[derive(Args, Debug, Clone, Default)]
pub struct ConfigArgs {
    /// Engine configuration file (YAML)
    #[arg(long, value_name = "FILE", global = true)]
    pub config: Option<PathBuf>,

    /// Dependency cache directory
    #[arg(long, value_name = "DIR", global = true)]
    pub cache_dir: Option<PathBuf>,

    /// Root for per-run working directories
    #[arg(long, value_name = "DIR", global = true)]
    pub work_dir: Option<PathBuf>,
}

impl ConfigArgs {
    /// File, then GANTRY_* environment, then flags
    pub fn load(&self) -> Result<EngineConfig> {
        let config = match &self.config {
            Some(path) => EngineConfig::from_file(path).map_err(|e| {
                color_eyre::eyre::eyre!("Failed to load config {}: {}", path.display(), e)
            })?,
            None => EngineConfig::default(),
        };
        let mut config = config.with_env_overrides(|name| std::env::var(name).ok());

        if let Some(dir) = &self.cache_dir {
            config.cache_dir = dir.clone();
        }
        if let Some(dir) = &self.work_dir {
            config.work_dir = dir.clone();
        }
        debug!(
            file = ?self.config,
            cache_dir = %config.cache_dir.display(),
            work_dir = %config.work_dir.display(),
            "engine configuration resolved"
        );
        Ok(config)
    }
}

/// Flags describing the triggering event
#[derive(Args, Debug, Clone, Default)]
pub struct EventArgs {
    /// Push to this branch
    #[arg(long, value_name = "BRANCH", group = "event")]
    pub branch: Option<String>,

    /// Tag with this name
    #[arg(long, value_name = "TAG", group = "event")]
    pub tag: Option<String>,

    /// Pull request into this branch
    #[arg(long, value_name = "BRANCH", group = "event")]
    pub pull_request_target: Option<String>,

    /// Manual dispatch (the default when no event flag is given)
    #[arg(long, group = "event")]
    pub manual: bool,
}

impl EventArgs {
    pub fn event(&self) -> gantry_engine::TriggerEvent {
        use gantry_engine::TriggerEvent;

        if let Some(branch) = &self.branch {
            TriggerEvent::Push {
                branch: branch.clone(),
            }
        } else if let Some(name) = &self.tag {
            TriggerEvent::Tag { name: name.clone() }
        } else if let Some(target) = &self.pull_request_target {
            TriggerEvent::PullRequest {
                target: target.clone(),
            }
        } else {
            TriggerEvent::Manual
        }
    }
}
