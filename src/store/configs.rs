//! Named config operations.

use super::ConfigStore;
use crate::error::{Result, StoreError};
use crate::types::{ConfigDocument, DEFAULT_CONFIG_NAME, RESERVED_FILENAMES};
use std::io::ErrorKind;
use std::sync::Arc;
use tokio::fs;
use tracing::{debug, info};

impl ConfigStore {
    /// Create `name` with a fresh id at version 1.
    ///
    /// Fails with [`StoreError::AlreadyExists`] if the file is present.
    pub async fn init(&self, name: &str) -> Result<Arc<ConfigDocument>> {
        self.with_lock(name, move || async move {
            if self.exists(name).await? {
                return Err(StoreError::AlreadyExists {
                    name: name.to_string(),
                });
            }
            let doc = self.write_document(name, ConfigDocument::new()).await?;
            info!(name, id = %doc.id(), "Config created");
            Ok(doc)
        })
        .await
    }

    /// Load `name`, from cache when possible.
    ///
    /// A missing file yields a fresh version-1 document that is cached but
    /// not written; it becomes durable only through `init`, `save` or
    /// `update`.
    pub async fn load(&self, name: &str) -> Result<Arc<ConfigDocument>> {
        Self::validate_name(name)?;
        if let Some(doc) = self.cache.get(name) {
            return Ok(doc);
        }

        let path = self.config_path(name);
        let doc = match fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice::<ConfigDocument>(&bytes).map_err(|source| {
                StoreError::Corrupt {
                    name: name.to_string(),
                    source,
                }
            })?,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(name, "Config file absent, using empty document");
                ConfigDocument::new()
            }
            Err(e) => return Err(StoreError::io(&path, e)),
        };

        let doc = Arc::new(doc);
        self.cache.set(name, Arc::clone(&doc));
        debug!(name, version = doc.version(), "Config loaded");
        Ok(doc)
    }

    /// Write `doc` to `name` with its version incremented.
    ///
    /// Not lock-guarded and performs no conflict check: concurrent unlocked
    /// saves of one name overwrite each other. Use [`update`](Self::update)
    /// for read-modify-write.
    pub async fn save(&self, doc: &ConfigDocument, name: &str) -> Result<Arc<ConfigDocument>> {
        Self::validate_name(name)?;
        self.persist(name, doc).await
    }

    /// Replace `name` with `f(current)` under the name's lock.
    ///
    /// `current` is read fresh from disk. Returns the persisted document.
    pub async fn update<F>(&self, name: &str, f: F) -> Result<Arc<ConfigDocument>>
    where
        F: FnOnce(&ConfigDocument) -> ConfigDocument,
    {
        self.try_update(name, |current| Ok::<_, StoreError>(f(current)))
            .await
    }

    /// Like [`update`](Self::update), but `f` may fail. Nothing is written
    /// on failure and the error is returned after the lock is released.
    pub async fn try_update<F, E>(&self, name: &str, f: F) -> Result<Arc<ConfigDocument>, E>
    where
        F: FnOnce(&ConfigDocument) -> Result<ConfigDocument, E>,
        E: From<StoreError>,
    {
        self.with_lock(name, move || async move {
            self.cache.invalidate(name);
            let current = self.load(name).await?;
            let next = f(&current)?;
            let persisted = self.persist(name, &next).await?;
            debug!(name, version = persisted.version(), "Config updated");
            Ok::<_, E>(persisted)
        })
        .await
    }

    /// Remove `name` from disk and cache.
    ///
    /// The default config cannot be deleted.
    pub async fn delete(&self, name: &str) -> Result<()> {
        Self::validate_name(name)?;
        if name == DEFAULT_CONFIG_NAME {
            return Err(StoreError::Forbidden {
                name: name.to_string(),
            });
        }

        let path = self.config_path(name);
        match fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(StoreError::NotFound {
                    name: name.to_string(),
                });
            }
            Err(e) => return Err(StoreError::io(&path, e)),
        }

        self.cache.invalidate(name);
        info!(name, "Config deleted");
        Ok(())
    }

    /// Whether `name` has a file on disk.
    pub async fn exists(&self, name: &str) -> Result<bool> {
        Self::validate_name(name)?;
        let path = self.config_path(name);
        fs::try_exists(&path)
            .await
            .map_err(|e| StoreError::io(&path, e))
    }

    /// Names of all configs in the directory, sorted.
    ///
    /// Files owned by other components (`.credentials.json`,
    /// `update-state.json`) are skipped.
    pub async fn list(&self) -> Result<Vec<String>> {
        let dir = self.config_dir();
        let mut entries = match fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::io(dir, e)),
        };

        let mut names = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StoreError::io(dir, e))?
        {
            let file_name = entry.file_name();
            let Some(file_name) = file_name.to_str() else {
                continue;
            };
            if RESERVED_FILENAMES.contains(&file_name) {
                continue;
            }
            let Some(name) = file_name.strip_suffix(".json") else {
                continue;
            };
            if name.is_empty() {
                continue;
            }
            let file_type = entry
                .file_type()
                .await
                .map_err(|e| StoreError::io(entry.path(), e))?;
            if file_type.is_file() {
                names.push(name.to_string());
            }
        }

        names.sort();
        Ok(names)
    }

    /// Load the default config, creating it first if absent.
    pub async fn get_or_create_default(&self) -> Result<Arc<ConfigDocument>> {
        let name = DEFAULT_CONFIG_NAME;
        self.with_lock(name, move || async move {
            if self.exists(name).await? {
                self.load(name).await
            } else {
                self.init(name).await
            }
        })
        .await
    }
}
