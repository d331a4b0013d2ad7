// Engine Configuration
// Engine-level settings: cache and work locations, readiness timing, parallelism

use crate::error::EngineResult;

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable overriding [`EngineConfig::cache_dir`]
pub const CACHE_DIR_ENV: &str = "GANTRY_CACHE_DIR";

/// Environment variable overriding [`EngineConfig::work_dir`]
pub const WORK_DIR_ENV: &str = "GANTRY_WORK_DIR";

/// Configuration for the orchestration engine
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Cache directory (default: ~/.gantry/cache/)
    pub cache_dir: PathBuf,
    /// Root for per-cell environment directories
    pub work_dir: PathBuf,
    /// How long a service may take to accept connections
    pub readiness_timeout_secs: u64,
    /// Delay between readiness probes
    pub readiness_interval_ms: u64,
    /// Cap on concurrently running cells (None = matrix size)
    pub max_parallel: Option<usize>,
    /// Container runtime executable used for services
    pub container_binary: String,
    /// Shell used for steps and installers ("sh" or "bash")
    pub shell: String,
    /// Keep per-cell environment directories after the run
    pub keep_work_dirs: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let cache_dir = dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".gantry")
            .join("cache");

        Self {
            cache_dir,
            work_dir: std::env::temp_dir().join("gantry-work"),
            readiness_timeout_secs: 60,
            readiness_interval_ms: 500,
            max_parallel: None,
            container_binary: "docker".to_string(),
            shell: "sh".to_string(),
            keep_work_dirs: false,
        }
    }
}

impl EngineConfig {
    /// Load configuration from a YAML file; missing keys take their defaults
    pub fn from_file(path: impl AsRef<Path>) -> EngineResult<Self> {
        let content = fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> EngineResult<Self> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(content)?)
    }

    /// Apply `GANTRY_*` overrides obtained through `lookup`
    pub fn with_env_overrides<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = lookup(CACHE_DIR_ENV).filter(|v| !v.is_empty()) {
            self.cache_dir = PathBuf::from(dir);
        }
        if let Some(dir) = lookup(WORK_DIR_ENV).filter(|v| !v.is_empty()) {
            self.work_dir = PathBuf::from(dir);
        }
        self
    }

    pub fn readiness_timeout(&self) -> Duration {
        Duration::from_secs(self.readiness_timeout_secs)
    }

    pub fn readiness_interval(&self) -> Duration {
        Duration::from_millis(self.readiness_interval_ms.max(1))
    }
}
