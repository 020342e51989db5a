use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use crate::store::{KvStore, StoreError, StoreResult, Versioned};

#[derive(Debug, Default)]
struct MemoryState {
    tables: HashMap<String, HashMap<String, Versioned<Vec<u8>>>>,
    next_index: u64,
}

/// In-process store honouring the [`KvStore`] contract.
///
/// `set_available(false)` makes every call fail with
/// [`StoreError::Unavailable`], which is how tests simulate an unreachable
/// backing store.
#[derive(Debug)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    available: AtomicBool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            available: AtomicBool::new(true),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, MemoryState>> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store offline".to_string()));
        }
        self.state
            .lock()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".to_string()))
    }
}

impl KvStore for MemoryStore {
    fn get(&self, table: &str, key: &str) -> StoreResult<Option<Versioned<Vec<u8>>>> {
        let state = self.lock()?;
        Ok(state.tables.get(table).and_then(|t| t.get(key)).cloned())
    }

    fn insert_if_absent(&self, table: &str, key: &str, value: Vec<u8>) -> StoreResult<u64> {
        let mut state = self.lock()?;
        state.next_index += 1;
        let create_index = state.next_index;

        let entries = state.tables.entry(table.to_string()).or_default();
        if entries.contains_key(key) {
            return Err(StoreError::AlreadyExists(key.to_string()));
        }
        entries.insert(
            key.to_string(),
            Versioned {
                version: 1,
                create_index,
                value,
            },
        );
        Ok(create_index)
    }

    fn compare_and_swap(
        &self,
        table: &str,
        key: &str,
        expected_version: u64,
        value: Vec<u8>,
    ) -> StoreResult<u64> {
        let mut state = self.lock()?;
        let entry = state
            .tables
            .get_mut(table)
            .and_then(|t| t.get_mut(key))
            .ok_or_else(|| StoreError::NotFound(key.to_string()))?;

        if entry.version != expected_version {
            return Err(StoreError::VersionConflict {
                key: key.to_string(),
                expected: expected_version,
                actual: entry.version,
            });
        }
        entry.version += 1;
        entry.value = value;
        Ok(entry.version)
    }

    fn delete(&self, table: &str, key: &str, expected_version: u64) -> StoreResult<()> {
        let mut state = self.lock()?;
        let entries = state
            .tables
            .get_mut(table)
            .ok_or_else(|| StoreError::NotFound(key.to_string()))?;
        let actual = entries
            .get(key)
            .map(|e| e.version)
            .ok_or_else(|| StoreError::NotFound(key.to_string()))?;

        if actual != expected_version {
            return Err(StoreError::VersionConflict {
                key: key.to_string(),
                expected: expected_version,
                actual,
            });
        }
        entries.remove(key);
        Ok(())
    }

    fn scan(&self, table: &str) -> StoreResult<Vec<(String, Versioned<Vec<u8>>)>> {
        let state = self.lock()?;
        let mut entries: Vec<(String, Versioned<Vec<u8>>)> = state
            .tables
            .get(table)
            .map(|t| t.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default();
        entries.sort_by_key(|(_, v)| v.create_index);
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_if_absent_rejects_duplicates() {
        let store = MemoryStore::new();
        store.insert_if_absent("t", "k", b"1".to_vec()).unwrap();
        let err = store.insert_if_absent("t", "k", b"2".to_vec()).unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists(_)));
        assert_eq!(store.get("t", "k").unwrap().unwrap().value, b"1".to_vec());
    }

    #[test]
    fn scan_orders_by_creation_index() {
        let store = MemoryStore::new();
        for key in ["c", "a", "b"] {
            store.insert_if_absent("t", key, Vec::new()).unwrap();
        }
        let keys: Vec<String> = store
            .scan("t")
            .unwrap()
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        assert_eq!(keys, vec!["c", "a", "b"]);
    }

    #[test]
    fn creation_index_is_monotonic_across_tables() {
        let store = MemoryStore::new();
        let a = store.insert_if_absent("x", "1", Vec::new()).unwrap();
        let b = store.insert_if_absent("y", "1", Vec::new()).unwrap();
        assert!(b > a);
    }

    #[test]
    fn delete_requires_current_version() {
        let store = MemoryStore::new();
        store.insert_if_absent("t", "k", Vec::new()).unwrap();
        store.compare_and_swap("t", "k", 1, Vec::new()).unwrap();
        assert!(store.delete("t", "k", 1).is_err());
        store.delete("t", "k", 2).unwrap();
        assert!(store.get("t", "k").unwrap().is_none());
    }

    #[test]
    fn offline_store_fails_every_call() {
        let store = MemoryStore::new();
        store.set_available(false);
        assert!(matches!(
            store.get("t", "k").unwrap_err(),
            StoreError::Unavailable(_)
        ));
        store.set_available(true);
        assert!(store.get("t", "k").unwrap().is_none());
    }
}
