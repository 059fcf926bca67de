//! Core data types for the config store.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Name of the privileged default config.
pub const DEFAULT_CONFIG_NAME: &str = "rediacc";

/// Filenames in the config directory owned by other components.
pub const RESERVED_FILENAMES: &[&str] = &[".credentials.json", "update-state.json"];

/// Keys managed by the store itself.
const RESERVED_KEYS: &[&str] = &["id", "version"];

/// A single named config document.
///
/// `id` and `version` are owned by the store. Everything else is opaque
/// payload carried through verbatim. Documents are values: updates build a
/// new document from the old one with [`with_field`](Self::with_field) and
/// [`without_field`](Self::without_field).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigDocument {
    id: Uuid,
    #[serde(deserialize_with = "positive_version")]
    version: u64,
    #[serde(flatten)]
    fields: Map<String, Value>,
}

impl ConfigDocument {
    /// Create an empty document with a fresh id at version 1.
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            version: 1,
            fields: Map::new(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// Payload fields, excluding `id` and `version`.
    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    /// Look up a payload field.
    pub fn field(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// Return a copy with `key` set to `value`.
    ///
    /// `id` and `version` cannot be set this way; such calls return the
    /// document unchanged.
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        let key = key.into();
        if RESERVED_KEYS.contains(&key.as_str()) {
            tracing::warn!(key = %key, "Ignoring attempt to overwrite a store-managed key");
            return self;
        }
        self.fields.insert(key, value.into());
        self
    }

    /// Return a copy with `key` removed.
    pub fn without_field(mut self, key: &str) -> Self {
        self.fields.remove(key);
        self
    }

    /// The document as it will be persisted next, or `None` once the
    /// version counter is exhausted.
    pub(crate) fn bumped(&self) -> Option<Self> {
        Some(Self {
            id: self.id,
            version: self.version.checked_add(1)?,
            fields: self.fields.clone(),
        })
    }
}

impl Default for ConfigDocument {
    fn default() -> Self {
        Self::new()
    }
}

fn positive_version<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let version = u64::deserialize(deserializer)?;
    if version == 0 {
        return Err(serde::de::Error::custom("version must be positive"));
    }
    Ok(version)
}
