// Cache Store
// Directory-backed store of installed dependency trees, keyed by CacheKey

use crate::cache::key::CacheKey;
use crate::error::{EngineError, EngineResult};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

const ENTRY_FILE: &str = "entry.json";
const ARTIFACT_DIR: &str = "artifact";
const STAGING_DIR: &str = ".staging";

/// Metadata of a stored entry (`entry.json`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: CacheKey,
    /// sha256 over the artifact tree
    pub digest: String,
    pub size_bytes: u64,
    pub file_count: u64,
    /// Seconds since the Unix epoch
    pub created_at: u64,
    /// Entry directory on disk
    #[serde(skip)]
    pub path: PathBuf,
}

impl CacheEntry {
    pub fn artifact_path(&self) -> PathBuf {
        self.path.join(ARTIFACT_DIR)
    }
}

/// Content-addressed cache of dependency-install artifacts.
///
/// Layout: `<root>/<version>/<lockfile-hash>/{artifact/, entry.json}`. An
/// entry becomes visible through a single directory rename, so readers
/// see the previous entry or none, never a partial one. Writers of the
/// same key are serialized; different keys never share a lock.
pub struct CacheStore {
    root: PathBuf,
    locks: Mutex<HashMap<CacheKey, Arc<RwLock<()>>>>,
    /// Digests written by this process, per key
    written: Mutex<HashMap<CacheKey, String>>,
}

impl CacheStore {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            locks: Mutex::new(HashMap::new()),
            written: Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn entry_path(&self, key: &CacheKey) -> PathBuf {
        self.root.join(key.relative_path())
    }

    fn key_lock(&self, key: &CacheKey) -> Arc<RwLock<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.entry(key.clone()).or_default().clone()
    }

    /// Metadata of the entry for `key`, if present
    pub async fn lookup(&self, key: &CacheKey) -> EngineResult<Option<CacheEntry>> {
        let lock = self.key_lock(key);
        let _read = lock.read().await;

        let path = self.entry_path(key);
        blocking(move || read_entry(&path)).await
    }

    /// Copy the cached artifact for `key` into `dest`.
    ///
    /// Returns `None` on a miss. An entry whose content no longer matches its
    /// recorded digest is treated as a miss, and the next `store` for the key
    /// replaces it whatever its digest.
    pub async fn materialize(&self, key: &CacheKey, dest: &Path) -> EngineResult<Option<CacheEntry>> {
        let lock = self.key_lock(key);
        let _read = lock.read().await;

        let path = self.entry_path(key);
        let dest = dest.to_path_buf();

        let found = blocking(move || {
            let Some(entry) = read_entry(&path)? else {
                return Ok(Found::Nothing);
            };

            if tree_digest(&entry.artifact_path())? != entry.digest {
                return Ok(Found::Corrupt);
            }

            if dest.exists() {
                fs::remove_dir_all(&dest)?;
            }
            copy_tree(&entry.artifact_path(), &dest)?;
            Ok(Found::Entry(entry))
        })
        .await?;

        match found {
            Found::Entry(entry) => Ok(Some(entry)),
            Found::Nothing => Ok(None),
            Found::Corrupt => {
                warn!(key = %key, "cache entry does not match its digest, ignoring");
                self.forget_written(key);
                Ok(None)
            }
        }
    }

    /// Store the tree at `source` under `key`.
    ///
    /// Storing identical content again is a no-op. Storing different content
    /// for a key this process already wrote is a [`EngineError::CacheWriteConflict`].
    pub async fn store(&self, key: &CacheKey, source: &Path) -> EngineResult<CacheEntry> {
        let lock = self.key_lock(key);
        let _write = lock.write().await;

        let source_dir = source.to_path_buf();
        let digest = blocking(move || Ok(tree_digest(&source_dir)?)).await?;

        if let Some(previous) = self.written_digest(key) {
            if previous != digest {
                return Err(EngineError::CacheWriteConflict {
                    key: key.to_string(),
                    reason: format!(
                        "content digest {} differs from {} written earlier in this run",
                        &digest[..12],
                        &previous[..previous.len().min(12)]
                    ),
                });
            }
        }

        let root = self.root.clone();
        let target = self.entry_path(key);
        let source = source.to_path_buf();
        let entry_key = key.clone();
        let entry_digest = digest.clone();

        let entry = blocking(move || {
            if let Some(existing) = read_entry(&target)? {
                if existing.digest == entry_digest {
                    return Ok(existing);
                }
            }

            let staging_root = root.join(STAGING_DIR);
            fs::create_dir_all(&staging_root)?;
            let staging = staging_root.join(unique_name());

            let written = (|| -> EngineResult<CacheEntry> {
                let (file_count, size_bytes) = copy_tree(&source, &staging.join(ARTIFACT_DIR))?;
                let entry = CacheEntry {
                    key: entry_key,
                    digest: entry_digest,
                    size_bytes,
                    file_count,
                    created_at: unix_now(),
                    path: target.clone(),
                };
                fs::write(staging.join(ENTRY_FILE), serde_json::to_vec_pretty(&entry)?)?;
                swap_into_place(&staging, &target, &staging_root)?;
                Ok(entry)
            })();

            if written.is_err() && staging.exists() {
                let _ = fs::remove_dir_all(&staging);
            }
            written
        })
        .await?;

        self.written
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.clone(), digest);

        info!(key = %key, files = entry.file_count, bytes = entry.size_bytes, "cache entry stored");
        Ok(entry)
    }

    fn forget_written(&self, key: &CacheKey) {
        self.written
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key);
    }

    fn written_digest(&self, key: &CacheKey) -> Option<String> {
        self.written
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned()
    }

    /// All entries, ordered by version then hash
    pub async fn list(&self) -> EngineResult<Vec<CacheEntry>> {
        let root = self.root.clone();
        blocking(move || list_entries(&root)).await
    }

    /// Remove the entry for `key`. Returns whether one existed.
    pub async fn remove(&self, key: &CacheKey) -> EngineResult<bool> {
        let lock = self.key_lock(key);
        let _write = lock.write().await;

        let path = self.entry_path(key);
        let removed = blocking(move || {
            if !path.exists() {
                return Ok(false);
            }
            fs::remove_dir_all(&path)?;
            Ok(true)
        })
        .await?;

        self.forget_written(key);
        Ok(removed)
    }

    /// Remove every entry, or only those of `version`. Returns how many went.
    pub async fn clear(&self, version: Option<&str>) -> EngineResult<usize> {
        let mut removed = 0;
        for entry in self.list().await? {
            if version.map_or(true, |v| v == entry.key.version) && self.remove(&entry.key).await? {
                removed += 1;
            }
        }

        let root = self.root.clone();
        blocking(move || {
            let staging = root.join(STAGING_DIR);
            if staging.exists() {
                fs::remove_dir_all(staging)?;
            }
            Ok(prune_empty_dirs(&root)?)
        })
        .await?;

        debug!(removed, version = ?version, "cache cleared");
        Ok(removed)
    }
}

/// What `materialize` found on disk
enum Found {
    Nothing,
    Corrupt,
    Entry(CacheEntry),
}

async fn blocking<F, T>(f: F) -> EngineResult<T>
where
    F: FnOnce() -> EngineResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| EngineError::Io(io::Error::new(io::ErrorKind::Other, e)))?
}

fn read_entry(path: &Path) -> EngineResult<Option<CacheEntry>> {
    let entry_file = path.join(ENTRY_FILE);
    if !entry_file.is_file() {
        return Ok(None);
    }

    let content = fs::read(&entry_file)?;
    let mut entry: CacheEntry = serde_json::from_slice(&content)?;
    entry.path = path.to_path_buf();
    Ok(Some(entry))
}

fn list_entries(root: &Path) -> EngineResult<Vec<CacheEntry>> {
    let mut entries = Vec::new();
    if !root.is_dir() {
        return Ok(entries);
    }

    for version_dir in fs::read_dir(root)? {
        let version_dir = version_dir?;
        if !version_dir.file_type()?.is_dir() || version_dir.file_name() == STAGING_DIR {
            continue;
        }
        for hash_dir in fs::read_dir(version_dir.path())? {
            let hash_dir = hash_dir?;
            if !hash_dir.file_type()?.is_dir() {
                continue;
            }
            match read_entry(&hash_dir.path()) {
                Ok(Some(entry)) => entries.push(entry),
                Ok(None) => {}
                Err(e) => warn!(path = %hash_dir.path().display(), error = %e, "unreadable cache entry"),
            }
        }
    }

    entries.sort_by(|a, b| a.key.cmp(&b.key));
    Ok(entries)
}

/// Make `staging` the entry at `target` using renames only
fn swap_into_place(staging: &Path, target: &Path, staging_root: &Path) -> io::Result<()> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }

    if target.exists() {
        let retired = staging_root.join(format!("{}-old", unique_name()));
        fs::rename(target, &retired)?;
        if let Err(e) = fs::rename(staging, target) {
            let _ = fs::rename(&retired, target);
            return Err(e);
        }
        fs::remove_dir_all(retired)?;
    } else {
        fs::rename(staging, target)?;
    }
    Ok(())
}

fn prune_empty_dirs(root: &Path) -> io::Result<()> {
    if !root.is_dir() {
        return Ok(());
    }
    for dir in fs::read_dir(root)? {
        let dir = dir?;
        if dir.file_type()?.is_dir() && fs::read_dir(dir.path())?.next().is_none() {
            fs::remove_dir(dir.path())?;
        }
    }
    Ok(())
}

/// Recursively copy `src` to `dst`, preserving symlinks. Returns (files, bytes).
pub(crate) fn copy_tree(src: &Path, dst: &Path) -> io::Result<(u64, u64)> {
    fs::create_dir_all(dst)?;
    let mut files = 0;
    let mut bytes = 0;

    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        let target = dst.join(entry.file_name());

        if file_type.is_dir() {
            let (f, b) = copy_tree(&entry.path(), &target)?;
            files += f;
            bytes += b;
        } else if file_type.is_symlink() {
            copy_symlink(&entry.path(), &target)?;
            files += 1;
        } else {
            bytes += fs::copy(entry.path(), &target)?;
            files += 1;
        }
    }

    Ok((files, bytes))
}

#[cfg(unix)]
fn copy_symlink(src: &Path, dst: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(fs::read_link(src)?, dst)
}

#[cfg(not(unix))]
fn copy_symlink(src: &Path, dst: &Path) -> io::Result<()> {
    fs::copy(src, dst).map(|_| ())
}

/// sha256 over relative paths, entry kinds and contents, in sorted order
pub(crate) fn tree_digest(root: &Path) -> io::Result<String> {
    let mut hasher = Sha256::new();
    digest_dir(root, Path::new(""), &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

fn digest_dir(dir: &Path, relative: &Path, hasher: &mut Sha256) -> io::Result<()> {
    let mut entries = fs::read_dir(dir)?.collect::<io::Result<Vec<_>>>()?;
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let file_type = entry.file_type()?;
        let rel = relative.join(entry.file_name());
        let rel_str = rel.to_string_lossy();

        if file_type.is_dir() {
            hasher.update(b"d\0");
            hasher.update(rel_str.as_bytes());
            hasher.update(b"\0");
            digest_dir(&entry.path(), &rel, hasher)?;
        } else if file_type.is_symlink() {
            hasher.update(b"l\0");
            hasher.update(rel_str.as_bytes());
            hasher.update(b"\0");
            hasher.update(fs::read_link(entry.path())?.to_string_lossy().as_bytes());
            hasher.update(b"\0");
        } else {
            let content = fs::read(entry.path())?;
            hasher.update(b"f\0");
            hasher.update(rel_str.as_bytes());
            hasher.update(b"\0");
            hasher.update((content.len() as u64).to_le_bytes());
            hasher.update(&content);
        }
    }
    Ok(())
}

fn unique_name() -> String {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    format!(
        "{}-{}-{}",
        std::process::id(),
        unix_now_nanos(),
        COUNTER.fetch_add(1, Ordering::Relaxed)
    )
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

fn unix_now_nanos() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default()
}
