//! Per-store document cache.

use crate::types::ConfigDocument;
use dashmap::DashMap;
use std::sync::Arc;

/// Last known document per config name.
///
/// Never authoritative: the file on disk is. Entries are shared as `Arc` so
/// repeated loads hand out the same document.
#[derive(Default)]
pub(crate) struct DocumentCache {
    entries: DashMap<String, Arc<ConfigDocument>>,
}

impl DocumentCache {
    pub(crate) fn get(&self, name: &str) -> Option<Arc<ConfigDocument>> {
        self.entries.get(name).map(|entry| Arc::clone(entry.value()))
    }

    pub(crate) fn set(&self, name: &str, doc: Arc<ConfigDocument>) {
        self.entries.insert(name.to_string(), doc);
    }

    pub(crate) fn invalidate(&self, name: &str) {
        self.entries.remove(name);
    }

    pub(crate) fn invalidate_all(&self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_returns_same_instance() {
        let cache = DocumentCache::default();
        let doc = Arc::new(ConfigDocument::new());
        cache.set("a", Arc::clone(&doc));

        let first = cache.get("a").unwrap();
        let second = cache.get("a").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert!(Arc::ptr_eq(&first, &doc));
    }

    #[test]
    fn test_invalidate_is_per_name() {
        let cache = DocumentCache::default();
        cache.set("a", Arc::new(ConfigDocument::new()));
        cache.set("b", Arc::new(ConfigDocument::new()));

        cache.invalidate("a");
        assert!(cache.get("a").is_none());
        assert!(cache.get("b").is_some());

        cache.invalidate_all();
        assert!(cache.get("b").is_none());
    }
}
