// Environment Builder
// Resolves an isolated per-cell environment from the cache or by installing it

use crate::cache::{CacheKey, CacheStore};
use crate::environment::installer::{DependencyInstaller, InstallRequest};
use crate::error::{EngineError, EngineResult};

use std::collections::HashMap;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// Variable pointing at the environment directory
pub const ENV_DIR_VAR: &str = "GANTRY_ENV_DIR";

/// Variable holding the cell's matrix version
pub const MATRIX_VERSION_VAR: &str = "GANTRY_MATRIX_VERSION";

/// An isolated environment owned by one cell
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvironmentHandle {
    pub version: String,
    pub dir: PathBuf,
    pub cache_key: CacheKey,
    pub cache_hit: bool,
}

impl EnvironmentHandle {
    pub fn bin_dir(&self) -> PathBuf {
        self.dir.join("bin")
    }

    /// Variables steps see inside this environment
    pub fn env_vars(&self) -> HashMap<String, String> {
        let mut vars = HashMap::new();
        vars.insert(ENV_DIR_VAR.to_string(), self.dir.to_string_lossy().to_string());
        vars.insert(MATRIX_VERSION_VAR.to_string(), self.version.clone());

        let mut paths = vec![self.bin_dir()];
        if let Some(existing) = std::env::var_os("PATH") {
            paths.extend(std::env::split_paths(&existing));
        }
        if let Ok(joined) = std::env::join_paths(paths) {
            vars.insert("PATH".to_string(), os_to_string(joined));
        }
        vars
    }
}

fn os_to_string(value: OsString) -> String {
    value.to_string_lossy().to_string()
}

/// Builds cell environments on top of the cache
#[derive(Clone)]
pub struct EnvironmentBuilder {
    cache: Arc<CacheStore>,
    installer: Arc<dyn DependencyInstaller>,
    work_root: PathBuf,
    workspace: PathBuf,
}

impl EnvironmentBuilder {
    pub fn new(
        cache: Arc<CacheStore>,
        installer: Arc<dyn DependencyInstaller>,
        work_root: impl Into<PathBuf>,
        workspace: impl Into<PathBuf>,
    ) -> Self {
        Self {
            cache,
            installer,
            work_root: work_root.into(),
            workspace: workspace.into(),
        }
    }

    pub fn cache(&self) -> &Arc<CacheStore> {
        &self.cache
    }

    /// Environment directory used for `version`
    pub fn env_dir(&self, version: &str) -> PathBuf {
        let segment: String = version
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' { c } else { '_' })
            .collect();
        self.work_root.join(format!("cell-{}", segment)).join("env")
    }

    /// Materialize the environment for (`version`, `lockfile_hash`).
    ///
    /// On a hit the cached tree is copied in. On a miss the installer builds
    /// the directory and the result is written back under the same key.
    #[instrument(skip(self, lockfile_hash))]
    pub async fn resolve(
        &self,
        version: &str,
        lockfile_hash: &str,
    ) -> EngineResult<(EnvironmentHandle, bool)> {
        let key = CacheKey::new(version, lockfile_hash);
        let dir = self.env_dir(version);

        if let Some(entry) = self.cache.materialize(&key, &dir).await? {
            info!(key = %key, files = entry.file_count, "environment restored from cache");
            return Ok((self.handle(key, dir, true), true));
        }

        reset_dir(&dir)?;
        let handle = self.handle(key.clone(), dir.clone(), false);
        let env = handle.env_vars();
        self.installer
            .install(InstallRequest {
                version,
                env_dir: &dir,
                workspace: &self.workspace,
                env: &env,
            })
            .await?;

        match self.cache.store(&key, &dir).await {
            Ok(_) => {}
            Err(e @ EngineError::CacheWriteConflict { .. }) => return Err(e),
            Err(e) => warn!(key = %key, error = %e, "could not write environment to cache"),
        }

        info!(key = %key, "environment installed");
        Ok((handle, false))
    }

    fn handle(&self, cache_key: CacheKey, dir: PathBuf, cache_hit: bool) -> EnvironmentHandle {
        EnvironmentHandle {
            version: cache_key.version.clone(),
            dir,
            cache_key,
            cache_hit,
        }
    }

    /// Remove the environment directory of `version`
    pub fn discard(&self, version: &str) -> EngineResult<()> {
        let dir = self.env_dir(version);
        let cell_dir = dir.parent().unwrap_or(&dir);
        if cell_dir.exists() {
            fs::remove_dir_all(cell_dir)?;
        }
        Ok(())
    }
}

fn reset_dir(dir: &Path) -> EngineResult<()> {
    if dir.exists() {
        fs::remove_dir_all(dir)?;
    }
    fs::create_dir_all(dir)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::cache::hash_bytes;
    use crate::environment::installer::NoopInstaller;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Writes a marker file and counts invocations
    #[derive(Default)]
    struct CountingInstaller {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl DependencyInstaller for CountingInstaller {
        async fn install(&self, request: InstallRequest<'_>) -> EngineResult<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(EngineError::DependencyInstallFailed {
                    version: request.version.to_string(),
                    exit_code: Some(1),
                    output: "resolver failed".to_string(),
                });
            }
            fs::create_dir_all(request.env_dir.join("bin"))?;
            fs::write(
                request.env_dir.join("bin").join("tool"),
                format!("built for {}", request.version),
            )?;
            Ok(())
        }
    }

    fn builder(root: &Path, installer: Arc<dyn DependencyInstaller>) -> EnvironmentBuilder {
        EnvironmentBuilder::new(
            Arc::new(CacheStore::new(root.join("cache"))),
            installer,
            root.join("work"),
            root,
        )
    }

    #[tokio::test]
    async fn test_miss_then_hit_with_identical_content() {
        let dir = tempfile::tempdir().unwrap();
        let installer = Arc::new(CountingInstaller::default());
        let builder = builder(dir.path(), installer.clone());
        let hash = hash_bytes(b"poetry.lock A");

        let (first, hit) = builder.resolve("3.9", &hash).await.unwrap();
        assert!(!hit);
        assert!(!first.cache_hit);
        let built = fs::read_to_string(first.bin_dir().join("tool")).unwrap();

        let (second, hit) = builder.resolve("3.9", &hash).await.unwrap();
        assert!(hit);
        assert!(second.cache_hit);
        assert_eq!(fs::read_to_string(second.bin_dir().join("tool")).unwrap(), built);
        assert_eq!(installer.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_new_lockfile_hash_misses() {
        let dir = tempfile::tempdir().unwrap();
        let installer = Arc::new(CountingInstaller::default());
        let builder = builder(dir.path(), installer.clone());

        builder.resolve("3.9", &hash_bytes(b"A")).await.unwrap();
        let (_, hit) = builder.resolve("3.9", &hash_bytes(b"B")).await.unwrap();

        assert!(!hit);
        assert_eq!(installer.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_install_failure_is_not_cached() {
        let dir = tempfile::tempdir().unwrap();
        let installer = Arc::new(CountingInstaller {
            fail: true,
            ..Default::default()
        });
        let builder = builder(dir.path(), installer);
        let hash = hash_bytes(b"A");

        let err = builder.resolve("3.7", &hash).await.unwrap_err();
        assert!(matches!(err, EngineError::DependencyInstallFailed { .. }));
        assert!(builder
            .cache()
            .lookup(&CacheKey::new("3.7", hash))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_env_vars() {
        let dir = tempfile::tempdir().unwrap();
        let builder = builder(dir.path(), Arc::new(NoopInstaller));

        let (handle, _) = builder.resolve("3.10", &hash_bytes(b"")).await.unwrap();
        let vars = handle.env_vars();

        assert_eq!(vars[MATRIX_VERSION_VAR], "3.10");
        assert_eq!(vars[ENV_DIR_VAR], handle.dir.to_string_lossy());
        let first_path = std::env::split_paths(&vars["PATH"]).next().unwrap();
        assert_eq!(first_path, handle.bin_dir());

        builder.discard("3.10").unwrap();
        assert!(!handle.dir.exists());
    }
}
