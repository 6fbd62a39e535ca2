//! Injected preference storage.
//!
//! Engines and the engine manager keep their small scalar state (sync ids,
//! timestamps, enabled flags, declined engines) in a [`PrefStore`] handed to
//! them at construction.

use crate::persist::JsonFile;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

/// Key/value preference storage shared between engines.
pub trait PrefStore: Send + Sync {
    fn get(&self, key: &str) -> Option<Value>;
    fn set(&self, key: &str, value: Value);
    fn reset(&self, key: &str);

    fn get_str(&self, key: &str) -> Option<String> {
        match self.get(key)? {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    fn get_bool(&self, key: &str, default: bool) -> bool {
        self.get(key).and_then(|v| v.as_bool()).unwrap_or(default)
    }

    fn get_u64(&self, key: &str, default: u64) -> u64 {
        match self.get(key) {
            Some(Value::Number(n)) => n.as_u64().unwrap_or(default),
            // Timestamps used to be stored as strings.
            Some(Value::String(s)) => s.parse().unwrap_or(default),
            _ => default,
        }
    }
}

/// Shared handle to a preference store.
pub type SharedPrefs = Arc<dyn PrefStore>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Preferences held in memory only.
#[derive(Debug, Default)]
pub struct MemoryPrefs {
    values: Mutex<BTreeMap<String, Value>>,
}

impl MemoryPrefs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> SharedPrefs {
        Arc::new(Self::new())
    }
}

impl PrefStore for MemoryPrefs {
    fn get(&self, key: &str) -> Option<Value> {
        lock(&self.values).get(key).cloned()
    }

    fn set(&self, key: &str, value: Value) {
        lock(&self.values).insert(key.to_string(), value);
    }

    fn reset(&self, key: &str) {
        lock(&self.values).remove(key);
    }
}

/// Preferences persisted to a JSON file on every change.
#[derive(Debug)]
pub struct JsonPrefs {
    file: JsonFile,
    values: Mutex<BTreeMap<String, Value>>,
}

impl JsonPrefs {
    /// Open (or start) a preference file. Unreadable files start empty.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let file = JsonFile::new(path);
        let values = file.load().unwrap_or_default();
        Self {
            file,
            values: Mutex::new(values),
        }
    }

    fn save(&self, values: &BTreeMap<String, Value>) {
        self.file.save_or_warn(values);
    }
}

impl PrefStore for JsonPrefs {
    fn get(&self, key: &str) -> Option<Value> {
        lock(&self.values).get(key).cloned()
    }

    fn set(&self, key: &str, value: Value) {
        let mut values = lock(&self.values);
        values.insert(key.to_string(), value);
        self.save(&values);
    }

    fn reset(&self, key: &str) {
        let mut values = lock(&self.values);
        if values.remove(key).is_some() {
            self.save(&values);
        }
    }
}
