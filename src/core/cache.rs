// Identifier -> decoded record memo owned by a single store.
// Unbounded; cleared only when the owning store replaces its buffer.
// Uses RefCell, so the owning store is !Sync by construction.
use std::cell::RefCell;
use std::collections::HashMap;

use crate::core::codec::Record;

#[derive(Debug, Default)]
pub struct LookupCache {
    entries: RefCell<HashMap<Vec<u8>, Record>>,
}

impl LookupCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &[u8]) -> Option<Record> {
        self.entries.borrow().get(id).cloned()
    }

    pub fn insert(&self, record: &Record) {
        self.entries
            .borrow_mut()
            .insert(record.id().to_vec(), record.clone());
    }

    /// Caches `record` unless the id is already present, so the first match wins.
    pub fn insert_if_absent(&self, record: &Record) {
        let mut entries = self.entries.borrow_mut();
        entries
            .entry(record.id().to_vec())
            .or_insert_with(|| record.clone());
    }

    pub fn clear(&mut self) {
        self.entries.get_mut().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.borrow().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::LookupCache;
    use crate::core::codec::Record;
    use bstr::BString;

    fn record(values: &[&str]) -> Record {
        Record::new(values.iter().map(|value| BString::from(*value)).collect())
    }

    #[test]
    fn insert_then_get() {
        let cache = LookupCache::new();
        assert!(cache.get(b"1").is_none());
        cache.insert(&record(&["1", "root"]));
        assert_eq!(cache.get(b"1"), Some(record(&["1", "root"])));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn first_insert_wins_when_absent_only() {
        let cache = LookupCache::new();
        cache.insert_if_absent(&record(&["X", "a"]));
        cache.insert_if_absent(&record(&["X", "b"]));
        assert_eq!(cache.get(b"X"), Some(record(&["X", "a"])));
    }

    #[test]
    fn clear_drops_everything() {
        let mut cache = LookupCache::new();
        cache.insert(&record(&["1"]));
        cache.insert(&record(&["2"]));
        cache.clear();
        assert!(cache.is_empty());
    }
}
