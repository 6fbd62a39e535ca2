//! Store - the adapter between sync records and local data.
//!
//! A [`Store`] knows how to turn a local item into a [`Record`] and how to
//! create, update or remove local items from incoming records. The provided
//! methods implement the generic dispatch and batch application on top of
//! the required ones.

use crate::{Error, Record, RecordId, Result};
use serde_json::Value;
use std::collections::HashMap;
use tracing::{trace, warn};

/// Local data store for one engine.
pub trait Store {
    /// Whether an item with this id exists locally.
    fn item_exists(&self, id: &str) -> Result<bool>;

    /// Build the outgoing record for `id`. Items that no longer exist
    /// produce a tombstone.
    fn create_record(&self, id: &str, collection: &str) -> Result<Record>;

    fn create(&mut self, record: &Record) -> Result<()>;

    fn update(&mut self, record: &Record) -> Result<()>;

    fn remove(&mut self, record: &Record) -> Result<()>;

    /// Re-key a local item.
    fn change_item_id(&mut self, old_id: &str, new_id: &str) -> Result<()>;

    fn get_all_ids(&self) -> Result<Vec<RecordId>>;

    /// Delete all local data.
    fn wipe(&mut self) -> Result<()>;

    /// Find a local item that holds the same data as `record` under another
    /// id. Stores opt in to duplicate detection by overriding this.
    fn find_dupe(&self, _record: &Record) -> Result<Option<RecordId>> {
        Ok(None)
    }

    /// Apply one incoming record.
    fn apply_incoming(&mut self, record: &Record) -> Result<()> {
        if record.deleted() {
            self.remove(record)
        } else if !self.item_exists(&record.id)? {
            self.create(record)
        } else {
            self.update(record)
        }
    }

    /// Apply a batch of incoming records, returning the ids that failed.
    ///
    /// A failing record does not stop the batch, except for
    /// [`Error::AbortApplyIncoming`], whose cause is returned immediately.
    fn apply_incoming_batch(&mut self, records: &[Record]) -> Result<Vec<RecordId>> {
        let mut failed = Vec::new();
        for record in records {
            match self.apply_incoming(record) {
                Ok(()) => {}
                Err(Error::AbortApplyIncoming(cause)) => return Err(*cause),
                Err(e) => {
                    warn!(id = %record.id, error = %e, "failed to apply incoming record");
                    failed.push(record.id.clone());
                }
            }
        }
        Ok(failed)
    }
}

/// A store of JSON objects held in memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    items: HashMap<RecordId, Value>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            items: HashMap::new(),
        }
    }

    /// Insert or replace a local item.
    pub fn insert(&mut self, id: impl Into<RecordId>, data: Value) {
        self.items.insert(id.into(), data);
    }

    /// Remove a local item, returning its data.
    pub fn delete(&mut self, id: &str) -> Option<Value> {
        self.items.remove(id)
    }

    pub fn get(&self, id: &str) -> Option<&Value> {
        self.items.get(id)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl Store for MemoryStore {
    fn item_exists(&self, id: &str) -> Result<bool> {
        Ok(self.items.contains_key(id))
    }

    fn create_record(&self, id: &str, collection: &str) -> Result<Record> {
        Ok(match self.items.get(id) {
            Some(data) => Record::new(id, collection, data.clone()),
            None => Record::tombstone(id, collection),
        })
    }

    fn create(&mut self, record: &Record) -> Result<()> {
        trace!(id = %record.id, "creating item");
        self.items.insert(record.id.clone(), record.data());
        Ok(())
    }

    fn update(&mut self, record: &Record) -> Result<()> {
        trace!(id = %record.id, "updating item");
        match self.items.get_mut(&record.id) {
            Some(data) => {
                *data = record.data();
                Ok(())
            }
            None => Err(Error::Store(format!("no item to update: {}", record.id))),
        }
    }

    fn remove(&mut self, record: &Record) -> Result<()> {
        trace!(id = %record.id, "removing item");
        self.items.remove(&record.id);
        Ok(())
    }

    fn change_item_id(&mut self, old_id: &str, new_id: &str) -> Result<()> {
        match self.items.remove(old_id) {
            Some(data) => {
                self.items.insert(new_id.to_string(), data);
                Ok(())
            }
            None => Err(Error::Store(format!("no item to re-key: {old_id}"))),
        }
    }

    fn get_all_ids(&self) -> Result<Vec<RecordId>> {
        let mut ids: Vec<_> = self.items.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }

    fn wipe(&mut self) -> Result<()> {
        self.items.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn apply_incoming_dispatches() {
        let mut store = MemoryStore::new();

        store
            .apply_incoming(&Record::new("a", "c", json!({"v": 1})))
            .unwrap();
        assert_eq!(store.get("a"), Some(&json!({"v": 1})));

        store
            .apply_incoming(&Record::new("a", "c", json!({"v": 2})))
            .unwrap();
        assert_eq!(store.get("a"), Some(&json!({"v": 2})));

        store.apply_incoming(&Record::tombstone("a", "c")).unwrap();
        assert!(store.is_empty());
    }

    #[test]
    fn create_record_for_missing_item_is_tombstone() {
        let store = MemoryStore::new();
        let record = store.create_record("gone", "tabs").unwrap();
        assert!(record.deleted());
        assert_eq!(record.collection, "tabs");
    }

    #[test]
    fn change_item_id_moves_data() {
        let mut store = MemoryStore::new();
        store.insert("old", json!({"x": 1}));
        store.change_item_id("old", "new").unwrap();
        assert!(!store.item_exists("old").unwrap());
        assert_eq!(store.get("new"), Some(&json!({"x": 1})));
        assert!(store.change_item_id("old", "other").is_err());
    }

    /// Fails on ids starting with "bad", aborts on ids starting with "stop".
    struct FlakyStore {
        inner: MemoryStore,
    }

    impl Store for FlakyStore {
        fn item_exists(&self, id: &str) -> Result<bool> {
            self.inner.item_exists(id)
        }
        fn create_record(&self, id: &str, collection: &str) -> Result<Record> {
            self.inner.create_record(id, collection)
        }
        fn create(&mut self, record: &Record) -> Result<()> {
            if record.id.starts_with("bad") {
                return Err(Error::Store("rejected".into()));
            }
            if record.id.starts_with("stop") {
                return Err(Error::abort(Error::Store("disk full".into())));
            }
            self.inner.create(record)
        }
        fn update(&mut self, record: &Record) -> Result<()> {
            self.inner.update(record)
        }
        fn remove(&mut self, record: &Record) -> Result<()> {
            self.inner.remove(record)
        }
        fn change_item_id(&mut self, old_id: &str, new_id: &str) -> Result<()> {
            self.inner.change_item_id(old_id, new_id)
        }
        fn get_all_ids(&self) -> Result<Vec<RecordId>> {
            self.inner.get_all_ids()
        }
        fn wipe(&mut self) -> Result<()> {
            self.inner.wipe()
        }
    }

    #[test]
    fn batch_isolates_failures() {
        let mut store = FlakyStore {
            inner: MemoryStore::new(),
        };
        let records = vec![
            Record::new("ok1", "c", json!({})),
            Record::new("bad1", "c", json!({})),
            Record::new("ok2", "c", json!({})),
        ];

        let failed = store.apply_incoming_batch(&records).unwrap();
        assert_eq!(failed, vec!["bad1".to_string()]);
        assert_eq!(store.inner.len(), 2);
    }

    #[test]
    fn batch_abort_returns_cause() {
        let mut store = FlakyStore {
            inner: MemoryStore::new(),
        };
        let records = vec![
            Record::new("ok1", "c", json!({})),
            Record::new("stop", "c", json!({})),
            Record::new("ok2", "c", json!({})),
        ];

        let err = store.apply_incoming_batch(&records).unwrap_err();
        assert_eq!(err.to_string(), "store error: disk full");
        // Nothing after the abort was applied.
        assert!(!store.inner.item_exists("ok2").unwrap());
    }
}
