use std::collections::BTreeMap;

use crate::types::ContentHash;

/// Content hash to the relative paths carrying that content, in insertion order.
///
/// Empty payloads are never indexed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContentIndex {
    paths_by_hash: BTreeMap<ContentHash, Vec<String>>,
}

impl ContentIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, hash: &str, relative_path: &str, size: u64) -> bool {
        if size == 0 || hash.is_empty() {
            return false;
        }

        let paths = self.paths_by_hash.entry(hash.to_string()).or_default();
        if paths.iter().any(|path| path == relative_path) {
            return false;
        }
        paths.push(relative_path.to_string());

        true
    }

    /// The deterministic copy source for `hash`: the first path recorded.
    pub fn first_path(&self, hash: &str) -> Option<&str> {
        self.paths_by_hash
            .get(hash)
            .and_then(|paths| paths.first())
            .map(String::as_str)
    }

    pub fn remove_path(&mut self, relative_path: &str) {
        for paths in self.paths_by_hash.values_mut() {
            paths.retain(|path| path != relative_path);
        }
        self.paths_by_hash.retain(|_, paths| !paths.is_empty());
    }

    pub fn len(&self) -> usize {
        self.paths_by_hash.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths_by_hash.is_empty()
    }
}
