//! The engine abstraction shared by every data type that syncs.
//!
//! An [`Engine`] owns a [`Tracker`](crate::Tracker) and a
//! [`Store`](crate::Store) for one collection. The
//! [`EngineManager`](crate::EngineManager) drives engines through this
//! object-safe trait; [`SyncEngine`](crate::SyncEngine) is the standard
//! implementation.

use crate::session::SyncSession;
use crate::{Result, Timestamp};
use serde::Serialize;

/// What happened to incoming records during one sync.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IncomingCounts {
    /// Records handed to the store.
    pub applied: usize,
    /// Applied records that did not fail.
    pub succeeded: usize,
    /// Records that failed to decrypt, reconcile or apply.
    pub failed: usize,
    /// Failures that did not already fail in the previous sync.
    pub new_failed: usize,
    /// Records skipped by reconciliation.
    pub reconciled: usize,
}

/// Summary of one engine sync.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStats {
    pub incoming: IncomingCounts,
    pub uploaded: usize,
    pub upload_failed: usize,
    /// Ids deleted from the server.
    pub deleted: usize,
}

/// How to treat a record that fails HMAC verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryStrategy {
    /// Skip the record silently.
    Ignore,
    /// Decrypt again with freshly fetched keys.
    Retry,
    /// Count the record as failed.
    Error,
}

/// A value built on first use.
///
/// Construction is deferred until [`get_mut`](Lazy::get_mut) is first
/// called; [`is_initialized`](Lazy::is_initialized) reports whether that
/// has happened.
pub struct Lazy<T> {
    value: Option<T>,
    init: Box<dyn Fn() -> T + Send>,
}

impl<T> Lazy<T> {
    pub fn new(init: impl Fn() -> T + Send + 'static) -> Self {
        Self {
            value: None,
            init: Box::new(init),
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.value.is_some()
    }

    pub fn get(&self) -> Option<&T> {
        self.value.as_ref()
    }

    pub fn get_mut(&mut self) -> &mut T {
        let init = &self.init;
        self.value.get_or_insert_with(|| init())
    }

    /// Drop the value; the next access builds a fresh one.
    pub fn reset(&mut self) {
        self.value = None;
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for Lazy<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.value {
            Some(value) => f.debug_tuple("Lazy").field(value).finish(),
            None => f.write_str("Lazy(<uninitialized>)"),
        }
    }
}

/// A synchronizable data type.
pub trait Engine {
    /// Lowercase name, also the server collection name.
    fn name(&self) -> &str;

    fn display_name(&self) -> &str;

    /// Engines with lower values sync first.
    fn sync_priority(&self) -> i32;

    fn enabled(&self) -> bool;

    fn set_enabled(&mut self, enabled: bool);

    /// How urgently this engine wants to sync.
    fn score(&self) -> u32;

    /// Run one sync. Returns `None` if the engine is disabled.
    fn sync(&mut self, session: &mut SyncSession<'_>) -> Result<Option<SyncStats>>;

    /// Forget sync state so the next sync starts from scratch.
    fn reset_client(&mut self) -> Result<()>;

    /// Delete all local data for this engine.
    fn wipe_client(&mut self) -> Result<()>;

    /// Delete this engine's server collection.
    fn wipe_server(&mut self, session: &mut SyncSession<'_>) -> Result<()>;

    /// Server modification time of the collection, if known. Incoming
    /// records are only fetched when it is later than the last sync.
    fn set_last_modified(&mut self, last_modified: Option<Timestamp>);

    /// Whether a record on the server can be decrypted with current keys.
    fn can_decrypt(&mut self, session: &SyncSession<'_>) -> bool;

    fn start_tracking(&mut self);

    fn stop_tracking(&mut self);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn lazy_builds_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let mut lazy = Lazy::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            vec![1, 2, 3]
        });

        assert!(!lazy.is_initialized());
        assert!(lazy.get().is_none());

        lazy.get_mut().push(4);
        assert!(lazy.is_initialized());
        assert_eq!(lazy.get_mut().len(), 4);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        lazy.reset();
        assert_eq!(lazy.get_mut().len(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn stats_serialize_camel_case() {
        let stats = SyncStats {
            upload_failed: 2,
            ..SyncStats::default()
        };
        let json = serde_json::to_value(stats).unwrap();
        assert_eq!(json["uploadFailed"], 2);
        assert_eq!(json["incoming"]["newFailed"], 0);
    }
}
