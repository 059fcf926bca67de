//! Atomic document writes.
//!
//! Documents are written to a temp file in the target directory, synced, and
//! renamed over `<name>.json`, so readers see either the old or the new file.
//! Files are owner read/write only since payloads may carry tokens.

use super::ConfigStore;
use crate::error::{Result, StoreError};
use crate::types::ConfigDocument;
use std::path::Path;
use std::sync::Arc;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use uuid::Uuid;

impl ConfigStore {
    /// Persist `doc` under `name` with its version incremented.
    ///
    /// Returns the document as written and caches it.
    pub(crate) async fn persist(
        &self,
        name: &str,
        doc: &ConfigDocument,
    ) -> Result<Arc<ConfigDocument>> {
        let next = doc.bumped().ok_or_else(|| StoreError::VersionOverflow {
            name: name.to_string(),
        })?;
        self.write_document(name, next).await
    }

    /// Write `doc` exactly as given.
    pub(crate) async fn write_document(
        &self,
        name: &str,
        doc: ConfigDocument,
    ) -> Result<Arc<ConfigDocument>> {
        let dir = self.config_dir();
        fs::create_dir_all(dir)
            .await
            .map_err(|e| StoreError::io(dir, e))?;

        let mut body = serde_json::to_vec_pretty(&doc).map_err(StoreError::Serialize)?;
        body.push(b'\n');

        let target = self.config_path(name);
        let tmp = dir.join(format!(".{name}.json.{}.tmp", Uuid::new_v4().simple()));

        if let Err(e) = write_private(&tmp, &body).await {
            discard(&tmp).await;
            return Err(e);
        }
        if let Err(e) = fs::rename(&tmp, &target).await {
            discard(&tmp).await;
            return Err(StoreError::io(&target, e));
        }
        restrict_permissions(&target).await?;

        let doc = Arc::new(doc);
        self.cache.set(name, Arc::clone(&doc));
        debug!(name, version = doc.version(), "Config persisted");
        Ok(doc)
    }
}

async fn write_private(path: &Path, body: &[u8]) -> Result<()> {
    let mut options = fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    options.mode(0o600);

    let mut file = options
        .open(path)
        .await
        .map_err(|e| StoreError::io(path, e))?;
    file.write_all(body)
        .await
        .map_err(|e| StoreError::io(path, e))?;
    file.sync_all().await.map_err(|e| StoreError::io(path, e))?;
    Ok(())
}

/// Force owner read/write only, whatever the umask or previous mode.
async fn restrict_permissions(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
            .await
            .map_err(|e| StoreError::io(path, e))?;
    }
    #[cfg(not(unix))]
    let _ = path;
    Ok(())
}

async fn discard(tmp: &Path) {
    if let Err(e) = fs::remove_file(tmp).await
        && e.kind() != std::io::ErrorKind::NotFound
    {
        warn!(path = %tmp.display(), error = %e, "Failed to remove temp file");
    }
}
