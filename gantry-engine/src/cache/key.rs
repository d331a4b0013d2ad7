// Cache Key
// Identifies an installed dependency set by environment version and lockfile content

use crate::error::{EngineError, EngineResult};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

/// Key of a cache entry: environment version plus sha256 of the lockfile
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CacheKey {
    pub version: String,
    pub lockfile_hash: String,
}

impl CacheKey {
    pub fn new(version: impl Into<String>, lockfile_hash: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            lockfile_hash: lockfile_hash.into(),
        }
    }

    /// Key for `version` with the hash of `lockfile` (or of no content)
    pub fn for_lockfile(version: impl Into<String>, lockfile: Option<&Path>) -> EngineResult<Self> {
        let hash = match lockfile {
            Some(path) => hash_lockfile(path)?,
            None => hash_bytes(&[]),
        };
        Ok(Self::new(version, hash))
    }

    /// Location of the entry below the cache root
    pub fn relative_path(&self) -> PathBuf {
        PathBuf::from(path_segment(&self.version)).join(path_segment(&self.lockfile_hash))
    }

    pub fn short_hash(&self) -> &str {
        let end = self.lockfile_hash.len().min(12);
        &self.lockfile_hash[..end]
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.version, self.short_hash())
    }
}

/// Hex-encoded sha256 of `bytes`
pub fn hash_bytes(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Hex-encoded sha256 of a lockfile's content
pub fn hash_lockfile(path: &Path) -> EngineResult<String> {
    let bytes = fs::read(path).map_err(|e| {
        EngineError::InvalidInput(format!("Cannot read lockfile {}: {}", path.display(), e))
    })?;
    Ok(hash_bytes(&bytes))
}

/// Keep one path component per key part
fn path_segment(raw: &str) -> String {
    let segment: String = raw
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' => '_',
            c => c,
        })
        .collect();

    match segment.as_str() {
        "" | "." | ".." => format!("_{}", segment),
        _ => segment,
    }
}
