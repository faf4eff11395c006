//! Process-lifetime `name//version` → metadata-lines cache.

use std::collections::HashMap;

use crate::catalog::{RefMetadata, RemoteCatalog};

#[derive(Default)]
pub struct MetadataCache {
    entries: HashMap<String, Vec<String>>,
}

impl MetadataCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-fill from a test fixture (`examples/original_source`'s disk-backed
    /// cache format, already parsed by [`crate::catalog::load_cache_fixture`]).
    pub fn from_entries(entries: Vec<(String, Vec<String>)>) -> Self {
        MetadataCache {
            entries: entries.into_iter().collect(),
        }
    }

    fn key(name: &str, version: &str) -> String {
        format!("{name}//{version}")
    }

    /// Returns the cached metadata lines for `name//version`, querying the
    /// catalog on a miss. A tool failure is cached as an empty list by
    /// [`RemoteCatalog::get_ref_metadata`] itself, so misses are cheap to
    /// repeat.
    pub async fn get(&mut self, catalog: &RemoteCatalog, name: &str, version: &str) -> RefMetadata {
        let key = Self::key(name, version);
        if let Some(lines) = self.entries.get(&key) {
            return RefMetadata(lines.clone());
        }
        let metadata = catalog.get_ref_metadata(name, version).await;
        self.entries.insert(key, metadata.0.clone());
        metadata
    }

    #[cfg(test)]
    pub fn insert_for_test(&mut self, name: &str, version: &str, lines: Vec<String>) {
        self.entries.insert(Self::key(name, version), lines);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_hit_does_not_need_a_catalog() {
        let mut cache = MetadataCache::new();
        cache.insert_for_test("org.example.App", "1.0", vec!["[Application]".to_owned()]);
        assert_eq!(cache.entries.len(), 1);
    }
}
