//! Versioned config store.
//!
//! One [`ConfigStore`] owns one config directory. Each named config lives in
//! `<dir>/<name>.json`. The store keeps a per-instance document cache and a
//! per-instance lock table; clones of a store share both.

mod cache;
mod configs;
mod lock;
mod writer;

use crate::config::{LockConfig, StoreConfig};
use crate::error::{Result, StoreError};
use cache::DocumentCache;
use lock::LockManager;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Handle to a config directory.
#[derive(Clone)]
pub struct ConfigStore {
    dir: Arc<PathBuf>,
    cache: Arc<DocumentCache>,
    locks: Arc<LockManager>,
}

impl ConfigStore {
    /// Open a store rooted at `dir` with default lock settings.
    ///
    /// The directory is created lazily on first write.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self::with_lock_config(dir, LockConfig::default())
    }

    /// Open a store from loaded configuration.
    pub fn open(config: &StoreConfig) -> Self {
        Self::with_lock_config(config.config_dir.clone(), config.lock.clone())
    }

    fn with_lock_config(dir: impl Into<PathBuf>, lock: LockConfig) -> Self {
        Self {
            dir: Arc::new(dir.into()),
            cache: Arc::new(DocumentCache::default()),
            locks: Arc::new(LockManager::new(lock)),
        }
    }

    /// The directory this store manages.
    pub fn config_dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the file backing `name`.
    pub fn config_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.json"))
    }

    /// Path of the sentinel present while `name` is locked.
    pub fn lock_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.json.lock"))
    }

    /// Current re-entrancy depth of the lock on `name` (0 when free).
    pub fn lock_depth(&self, name: &str) -> usize {
        self.locks.depth(name)
    }

    /// Drop every cached document.
    pub fn clear_cache(&self) {
        self.cache.invalidate_all();
        tracing::debug!(dir = %self.dir.display(), "Config cache cleared");
    }

    /// Reject names that would escape the config directory.
    pub(crate) fn validate_name(name: &str) -> Result<()> {
        let reason = if name.is_empty() {
            "name is empty"
        } else if name == "." || name == ".." {
            "name is a relative path component"
        } else if name.contains(['/', '\\', '\0']) {
            "name contains a path separator"
        } else {
            return Ok(());
        };
        Err(StoreError::InvalidName {
            name: name.to_string(),
            reason,
        })
    }
}
