//! In-memory metadata index over the cache directory.
//!
//! Maps each decoded key to the file's last observed modification date
//! and size, and maintains the aggregate byte count as entries are
//! inserted, replaced and removed. The index is rebuilt from a directory
//! scan at startup; between mutations it is the single source of truth
//! for eviction ordering.

use std::time::SystemTime;

use rustc_hash::FxHashMap;

/// Last observed filesystem state of one cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Entry {
    /// Modification date at last observation.
    pub modified: SystemTime,
    /// Size in bytes at last observation.
    pub size: u64,
}

/// Key-to-entry map plus running byte total.
#[derive(Debug, Default)]
pub struct Index {
    entries: FxHashMap<String, Entry>,
    byte_count: u64,
}

impl Index {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sum of all entry sizes.
    pub fn byte_count(&self) -> u64 {
        self.byte_count
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn get(&self, key: &str) -> Option<&Entry> {
        self.entries.get(key)
    }

    /// Record an observation, adjusting the byte count by the size delta
    /// when the key was already present.
    pub fn insert_or_replace(&mut self, key: String, modified: SystemTime, size: u64) {
        let previous: Option<Entry> = self.entries.insert(key, Entry { modified, size });
        self.byte_count = self.byte_count - previous.map_or(0, |e| e.size) + size;
    }

    /// Update the modification date of an existing entry, if any.
    pub fn touch(&mut self, key: &str, modified: SystemTime) {
        if let Some(entry) = self.entries.get_mut(key) {
            entry.modified = modified;
        }
    }

    /// Drop an entry and subtract its size. Returns the removed entry.
    pub fn remove(&mut self, key: &str) -> Option<Entry> {
        let removed: Option<Entry> = self.entries.remove(key);
        if let Some(entry) = removed {
            self.byte_count -= entry.size;
        }
        removed
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.byte_count = 0;
    }

    /// Iterate entries in unspecified order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Entry)> {
        self.entries.iter()
    }

    /// Keys ordered largest entry first; ties broken by key.
    pub fn keys_by_size_desc(&self) -> Vec<String> {
        let mut keys: Vec<(&String, &Entry)> = self.entries.iter().collect();
        keys.sort_by(|(ka, ea), (kb, eb)| eb.size.cmp(&ea.size).then_with(|| ka.cmp(kb)));
        keys.into_iter().map(|(key, _)| key.clone()).collect()
    }

    /// Keys ordered oldest entry first; ties broken by key.
    pub fn keys_by_date_asc(&self) -> Vec<String> {
        let mut keys: Vec<(&String, &Entry)> = self.entries.iter().collect();
        keys.sort_by(|(ka, ea), (kb, eb)| ea.modified.cmp(&eb.modified).then_with(|| ka.cmp(kb)));
        keys.into_iter().map(|(key, _)| key.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn at(seconds: u64) -> SystemTime {
        SystemTime::UNIX_EPOCH + Duration::from_secs(seconds)
    }

    #[test]
    fn test_insert_and_replace_accounting() {
        let mut index = Index::new();
        index.insert_or_replace("a".into(), at(1), 10);
        index.insert_or_replace("b".into(), at(2), 5);
        assert_eq!(index.byte_count(), 15);

        // Replacing adjusts by the delta, not the full size.
        index.insert_or_replace("a".into(), at(3), 4);
        assert_eq!(index.byte_count(), 9);
        assert_eq!(index.len(), 2);
    }

    #[test]
    fn test_remove_accounting() {
        let mut index = Index::new();
        index.insert_or_replace("a".into(), at(1), 10);
        assert_eq!(index.remove("a").map(|e| e.size), Some(10));
        assert_eq!(index.byte_count(), 0);
        assert!(index.remove("a").is_none());
        assert_eq!(index.byte_count(), 0);
    }

    #[test]
    fn test_keys_by_size_desc() {
        let mut index = Index::new();
        index.insert_or_replace("small".into(), at(1), 1);
        index.insert_or_replace("big".into(), at(2), 100);
        index.insert_or_replace("mid".into(), at(3), 10);
        assert_eq!(index.keys_by_size_desc(), vec!["big", "mid", "small"]);
    }

    #[test]
    fn test_keys_by_date_asc() {
        let mut index = Index::new();
        index.insert_or_replace("new".into(), at(30), 1);
        index.insert_or_replace("old".into(), at(10), 1);
        index.insert_or_replace("mid".into(), at(20), 1);
        assert_eq!(index.keys_by_date_asc(), vec!["old", "mid", "new"]);
    }

    #[test]
    fn test_sort_ties_break_by_key() {
        let mut index = Index::new();
        index.insert_or_replace("b".into(), at(1), 1);
        index.insert_or_replace("a".into(), at(1), 1);
        assert_eq!(index.keys_by_date_asc(), vec!["a", "b"]);
        assert_eq!(index.keys_by_size_desc(), vec!["a", "b"]);
    }

    #[test]
    fn test_touch_updates_date_only() {
        let mut index = Index::new();
        index.insert_or_replace("a".into(), at(1), 10);
        index.touch("a", at(9));
        let entry: Entry = *index.get("a").unwrap();
        assert_eq!(entry.modified, at(9));
        assert_eq!(entry.size, 10);
        assert_eq!(index.byte_count(), 10);

        // Touching an absent key is a no-op.
        index.touch("missing", at(9));
        assert!(index.get("missing").is_none());
    }

    #[test]
    fn test_clear() {
        let mut index = Index::new();
        index.insert_or_replace("a".into(), at(1), 10);
        index.clear();
        assert!(index.is_empty());
        assert_eq!(index.byte_count(), 0);
    }
}
