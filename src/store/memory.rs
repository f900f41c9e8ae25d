//! In-memory store and recycle bin

use crate::Result;
use crate::store::{RecycleBin, StoredTest, TestStore};
use std::collections::HashMap;
use std::sync::Mutex;

/// In-memory test store, keyed by qr_code_hash
#[derive(Debug, Default)]
pub struct MemoryTestStore {
    entries: Mutex<HashMap<String, StoredTest>>,
}

impl MemoryTestStore {
    /// Create an empty in-memory store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of persisted entries
    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    /// Whether the store is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl TestStore for MemoryTestStore {
    fn load(&self) -> Result<Vec<StoredTest>> {
        let entries = self
            .entries
            .lock()
            .map_err(|_| crate::Error::Storage("store mutex poisoned".to_string()))?;
        Ok(entries.values().cloned().collect())
    }

    fn upsert(&self, entry: &StoredTest) -> Result<()> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| crate::Error::Storage("store mutex poisoned".to_string()))?;
        entries.insert(entry.qr_code_hash().to_string(), entry.clone());
        Ok(())
    }

    fn remove(&self, qr_code_hash: &str) -> Result<()> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| crate::Error::Storage("store mutex poisoned".to_string()))?;
        entries.remove(qr_code_hash);
        Ok(())
    }
}

/// In-memory recycle bin collecting soft-deleted tests
#[derive(Debug, Default)]
pub struct MemoryRecycleBin {
    items: Mutex<Vec<StoredTest>>,
}

impl MemoryRecycleBin {
    /// Create an empty recycle bin
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the recycled entries
    pub fn items(&self) -> Vec<StoredTest> {
        self.items.lock().map(|i| i.clone()).unwrap_or_default()
    }
}

impl RecycleBin for MemoryRecycleBin {
    fn recycle(&self, entry: StoredTest) {
        if let Ok(mut items) = self.items.lock() {
            items.push(entry);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{CoronaTest, hash_qr_payload};
    use chrono::Utc;

    fn entry(payload: &str) -> StoredTest {
        StoredTest::User(CoronaTest::pcr(
            hash_qr_payload(payload),
            "token".to_string(),
            Utc::now(),
            false,
            false,
        ))
    }

    #[test]
    fn test_upsert_replaces_same_hash() {
        let store = MemoryTestStore::new();
        store.upsert(&entry("guid-1")).expect("Failed to upsert");
        store.upsert(&entry("guid-1")).expect("Failed to upsert");
        store.upsert(&entry("guid-2")).expect("Failed to upsert");
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_remove() {
        let store = MemoryTestStore::new();
        let e = entry("guid-1");
        store.upsert(&e).expect("Failed to upsert");
        store.remove(e.qr_code_hash()).expect("Failed to remove");
        assert!(store.is_empty());
    }

    #[test]
    fn test_recycle_bin_collects() {
        let bin = MemoryRecycleBin::new();
        bin.recycle(entry("guid-1"));
        assert_eq!(bin.items().len(), 1);
    }
}
