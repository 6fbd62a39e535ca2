//! End-to-end sync scenarios for recsync-engine
//!
//! Each test drives a real `SyncEngine` against a `MemoryServer`, with a
//! manual clock so record ages are exact.

use recsync_engine::{
    CollectionKeys, Engine, EngineConfig, EngineManager, EngineMeta, Error, FailureCode,
    KeyBundle, ManualClock, MemoryPrefs, MemoryServer, MemoryStore, PrefStore, Record, RecordId,
    Result, SharedPrefs, Store, SyncEngine, SyncSession, SyncStats, Timestamp,
};
use serde_json::{json, Value};
use std::sync::Arc;

const COLL: &str = "tabs";
const START: Timestamp = 1_000_000;

struct Harness {
    clock: ManualClock,
    server: MemoryServer,
    root: KeyBundle,
    prefs: SharedPrefs,
}

impl Harness {
    fn new() -> Self {
        let clock = ManualClock::new(START);
        let server = MemoryServer::new(Arc::new(clock.clone()));
        Self {
            clock,
            server,
            root: KeyBundle::generate(),
            prefs: MemoryPrefs::shared(),
        }
    }

    fn engine(&self) -> SyncEngine<MemoryStore> {
        self.engine_with(EngineConfig::default())
    }

    fn engine_with(&self, config: EngineConfig) -> SyncEngine<MemoryStore> {
        self.named_engine(COLL, config)
    }

    fn named_engine(&self, name: &str, config: EngineConfig) -> SyncEngine<MemoryStore> {
        let mut engine = SyncEngine::new(
            name,
            config,
            self.prefs.clone(),
            Arc::new(self.clock.clone()),
            MemoryStore::new,
        );
        engine.set_enabled(true);
        engine
    }

    fn session(&self) -> SyncSession<'_> {
        SyncSession::open(&self.server, self.root.clone()).unwrap()
    }

    /// Sync the way the engine manager does: last-modified from
    /// info/collections, meta/global written back afterwards.
    fn sync<S: Store>(&self, engine: &mut SyncEngine<S>) -> Result<SyncStats> {
        let mut session = self.session();
        engine.set_last_modified(session.last_modified(COLL));
        let result = engine.sync(&mut session);
        session.finish().unwrap();
        result.map(Option::unwrap_or_default)
    }

    /// First sync with one local item, so later syncs are incremental.
    fn bootstrap(&self, engine: &mut SyncEngine<MemoryStore>) {
        engine.store().insert("seed", json!({"seed": true}));
        let stats = self.sync(engine).unwrap();
        assert_eq!(stats.uploaded, 1);
        assert_ne!(engine.last_sync(), 0);
    }

    fn key(&self) -> KeyBundle {
        self.session().key_for_collection(COLL).clone()
    }

    fn put_remote(&self, id: &str, data: Value) -> Timestamp {
        let bso = Record::new(id, COLL, data).encrypt(&self.key()).unwrap();
        self.server.insert_record(COLL, bso)
    }

    fn remote_data(&self, id: &str) -> Option<Value> {
        let key = self.key();
        self.server
            .record(COLL, id)
            .map(|bso| bso.decrypt(&key, COLL).unwrap().data())
    }
}

// ============================================================================
// Upload and idempotence
// ============================================================================

#[test]
fn first_sync_uploads_everything() {
    let h = Harness::new();
    let mut engine = h.engine();
    engine.store().insert("a", json!({"url": "https://a.example"}));
    engine.store().insert("b", json!({"url": "https://b.example"}));

    let stats = h.sync(&mut engine).unwrap();
    assert_eq!(stats.uploaded, 2);
    assert_eq!(h.remote_data("a"), Some(json!({"url": "https://a.example"})));

    let session = h.session();
    let meta = session.engine_meta(COLL).unwrap();
    assert_eq!(meta.version, 1);
    assert_eq!(meta.sync_id, engine.sync_id());
}

#[test]
fn second_sync_without_changes_is_a_no_op() {
    let h = Harness::new();
    let mut engine = h.engine();
    engine.store().insert("a", json!({"v": 1}));
    h.sync(&mut engine).unwrap();

    h.clock.advance(60_000);
    h.server.reset_request_counts();
    let stats = h.sync(&mut engine).unwrap();

    assert_eq!(stats.incoming.applied, 0);
    assert_eq!(stats.uploaded, 0);
    assert_eq!(h.server.request_counts().posts, 0);
}

#[test]
fn uploads_are_batched() {
    let h = Harness::new();
    let config = EngineConfig {
        max_upload_records: 2,
        ..EngineConfig::default()
    };
    let mut engine = h.engine_with(config);
    h.bootstrap(&mut engine);

    for id in ["a", "b", "c", "d", "e"] {
        engine.store().insert(id, json!({"n": id}));
        engine.tracker_mut().add_changed_id(id, None);
    }
    h.server.reset_request_counts();
    let stats = h.sync(&mut engine).unwrap();

    assert_eq!(stats.uploaded, 5);
    assert_eq!(h.server.request_counts().posts, 3);
}

// ============================================================================
// Reconciliation
// ============================================================================

#[test]
fn younger_local_change_wins() {
    let h = Harness::new();
    let mut engine = h.engine();
    h.bootstrap(&mut engine);

    h.clock.advance(1_000);
    h.put_remote("a", json!({"v": "remote"}));
    h.clock.advance(10_000);
    engine.store().insert("a", json!({"v": "local"}));
    engine.tracker_mut().add_changed_id("a", None);
    h.clock.advance(1_000);

    let stats = h.sync(&mut engine).unwrap();
    assert_eq!(stats.incoming.reconciled, 1);
    assert_eq!(stats.incoming.applied, 0);
    assert_eq!(engine.store().get("a"), Some(&json!({"v": "local"})));
    // The local version replaces the remote one.
    assert_eq!(h.remote_data("a"), Some(json!({"v": "local"})));
}

#[test]
fn younger_remote_change_wins() {
    let h = Harness::new();
    let mut engine = h.engine();
    h.bootstrap(&mut engine);

    engine.store().insert("a", json!({"v": "local"}));
    engine.tracker_mut().add_changed_id("a", Some(START + 500));
    h.clock.advance(10_000);
    h.put_remote("a", json!({"v": "remote"}));
    h.clock.advance(1_000);

    let stats = h.sync(&mut engine).unwrap();
    assert_eq!(stats.incoming.applied, 1);
    assert_eq!(engine.store().get("a"), Some(&json!({"v": "remote"})));
}

#[test]
fn identical_record_is_not_uploaded() {
    let h = Harness::new();
    let mut engine = h.engine();
    h.bootstrap(&mut engine);

    h.clock.advance(1_000);
    h.put_remote("a", json!({"v": 1}));
    engine.store().insert("a", json!({"v": 1}));
    engine.tracker_mut().add_changed_id("a", None);

    let stats = h.sync(&mut engine).unwrap();
    assert_eq!(stats.incoming.reconciled, 1);
    assert_eq!(stats.uploaded, 0);
    assert!(engine.tracker().changed_ids().is_empty());
}

#[test]
fn deleting_never_synced_item_sends_no_server_delete() {
    let h = Harness::new();
    let mut engine = h.engine();
    h.bootstrap(&mut engine);

    engine.store().insert("x", json!({"v": 1}));
    engine.tracker_mut().add_changed_id("x", None);
    h.clock.advance(1_000);
    engine.store().delete("x");
    engine.tracker_mut().add_changed_id("x", None);

    h.server.reset_request_counts();
    let stats = h.sync(&mut engine).unwrap();

    assert_eq!(stats.deleted, 0);
    assert!(engine.pending_deletes().is_empty());
    assert_eq!(h.server.request_counts().deletes, 0);
    assert!(h.server.deleted_ids().iter().all(|(_, ids)| !ids.contains(&"x".to_string())));
    // A tombstone is uploaded instead.
    assert_eq!(h.remote_data("x"), Some(json!({"deleted": true})));
}

#[test]
fn remote_deletion_removes_local_item() {
    let h = Harness::new();
    let mut engine = h.engine();
    engine.store().insert("a", json!({"v": 1}));
    h.sync(&mut engine).unwrap();

    h.clock.advance(1_000);
    let bso = Record::tombstone("a", COLL).encrypt(&h.key()).unwrap();
    h.server.insert_record(COLL, bso);

    let stats = h.sync(&mut engine).unwrap();
    assert_eq!(stats.incoming.applied, 1);
    assert!(engine.store().get("a").is_none());
}

// ============================================================================
// Failures and cleanup
// ============================================================================

#[test]
fn failed_upload_keeps_changes_tracked() {
    let h = Harness::new();
    let mut engine = h.engine();
    h.bootstrap(&mut engine);

    for id in ["a", "b"] {
        engine.store().insert(id, json!({"v": id}));
        engine.tracker_mut().add_changed_id(id, None);
    }

    h.server.set_fail_posts(true);
    let err = h.sync(&mut engine).unwrap_err();
    assert_eq!(err.failure_code(), Some(FailureCode::EngineUploadFail));
    assert_eq!(engine.tracker().changed_ids().len(), 2);
    assert!(engine.modified_ids().is_empty());

    h.server.set_fail_posts(false);
    let stats = h.sync(&mut engine).unwrap();
    assert_eq!(stats.uploaded, 2);
    assert!(engine.tracker().changed_ids().is_empty());
}

#[test]
fn cleanup_after_incoming_restores_modified_ids() {
    let h = Harness::new();
    let mut engine = h.engine();
    h.bootstrap(&mut engine);

    engine.store().insert("a", json!({"v": 1}));
    engine.tracker_mut().add_changed_id("a", Some(START + 10));

    let mut session = h.session();
    engine.sync_startup(&mut session).unwrap();
    engine.process_incoming(&mut session).unwrap();
    assert!(engine.tracker().changed_ids().is_empty());
    assert!(engine.modified_ids().contains_key("a"));

    // Interrupted before upload.
    engine.sync_cleanup();
    assert_eq!(engine.tracker().changed_ids().get("a"), Some(&(START + 10)));
    assert!(engine.modified_ids().is_empty());
}

#[test]
fn partial_upload_failure_retries_next_time() {
    let h = Harness::new();
    let mut engine = h.engine();
    h.bootstrap(&mut engine);

    for id in ["a", "b"] {
        engine.store().insert(id, json!({"v": id}));
        engine.tracker_mut().add_changed_id(id, None);
    }
    h.server.reject_ids(["b"]);

    let stats = h.sync(&mut engine).unwrap();
    assert_eq!(stats.uploaded, 1);
    assert_eq!(stats.upload_failed, 1);
    let pending: Vec<&RecordId> = engine.tracker().changed_ids().keys().collect();
    assert_eq!(pending, vec!["b"]);
}

#[test]
fn failed_download_is_tagged() {
    let h = Harness::new();
    let mut engine = h.engine();
    h.bootstrap(&mut engine);
    h.clock.advance(1_000);
    h.put_remote("a", json!({}));

    let mut session = h.session();
    engine.set_last_modified(session.last_modified(COLL));
    h.server.set_fail_gets(true);
    let err = engine.sync(&mut session).unwrap_err();
    assert_eq!(err.failure_code(), Some(FailureCode::EngineDownloadFail));
    assert!(engine.store().get("a").is_none());
}

// ============================================================================
// Startup: versions and sync ids
// ============================================================================

#[test]
fn newer_engine_version_on_server_fails() {
    let h = Harness::new();
    let mut engine = h.engine();
    h.bootstrap(&mut engine);

    let mut session = h.session();
    session.set_engine_meta(
        COLL,
        EngineMeta {
            version: 2,
            sync_id: engine.sync_id(),
        },
    );
    session.finish().unwrap();

    engine.tracker_mut().add_changed_id("a", Some(START + 1));
    let err = h.sync(&mut engine).unwrap_err();
    assert_eq!(err.failure_code(), Some(FailureCode::VersionOutOfDate));
    assert!(matches!(err, Error::VersionOutOfDate { local: 1, remote: 2, .. }));
    assert!(engine.tracker().changed_ids().contains_key("a"));
}

#[test]
fn older_engine_version_on_server_wipes_and_reuploads() {
    let h = Harness::new();
    let mut engine = h.engine();
    h.bootstrap(&mut engine);
    let old_sync_id = engine.sync_id();
    drop(engine);

    let mut upgraded = h.engine_with(EngineConfig::default().with_version(2));
    upgraded.store().insert("x", json!({"v": 1}));
    let stats = h.sync(&mut upgraded).unwrap();

    assert_eq!(stats.uploaded, 1);
    let ids: Vec<_> = h.server.records(COLL).into_iter().map(|b| b.id).collect();
    assert_eq!(ids, vec!["x".to_string()]);

    let session = h.session();
    let meta = session.engine_meta(COLL).unwrap();
    assert_eq!(meta.version, 2);
    assert_ne!(meta.sync_id, old_sync_id);
    assert_eq!(meta.sync_id, upgraded.sync_id());
}

#[test]
fn changed_sync_id_resets_and_redownloads() {
    let h = Harness::new();
    let mut engine = h.engine();
    h.bootstrap(&mut engine);

    let mut session = h.session();
    session.set_engine_meta(
        COLL,
        EngineMeta {
            version: 1,
            sync_id: "AAAAAAAAAAAA".into(),
        },
    );
    session.finish().unwrap();

    h.clock.advance(1_000);
    let stats = h.sync(&mut engine).unwrap();
    assert_eq!(engine.sync_id(), "AAAAAAAAAAAA");
    // Everything is fetched again; the seed matches and is not re-uploaded.
    assert_eq!(stats.incoming.reconciled, 1);
    assert_eq!(stats.uploaded, 0);
}

// ============================================================================
// Decryption failures
// ============================================================================

#[test]
fn hmac_failure_recovers_with_new_keys() {
    let h = Harness::new();
    let mut engine = h.engine();
    h.bootstrap(&mut engine);

    // Open with the old keys, then another client replaces them.
    let mut session = h.session();
    let new_keys = CollectionKeys::generate();
    h.clock.advance(1_000);
    h.server
        .insert_record("crypto", new_keys.to_bso(&h.root).unwrap());
    let bso = Record::new("r", COLL, json!({"v": 1}))
        .encrypt(new_keys.key_for_collection(COLL))
        .unwrap();
    h.server.insert_record(COLL, bso);

    let stats = engine.sync(&mut session).unwrap().unwrap();
    assert_eq!(stats.incoming.applied, 1);
    assert_eq!(stats.incoming.failed, 0);
    assert_eq!(engine.store().get("r"), Some(&json!({"v": 1})));
}

#[test]
fn foreign_key_records_refetch_keys_once() {
    let h = Harness::new();
    let mut engine = h.engine();
    h.bootstrap(&mut engine);

    h.clock.advance(1_000);
    let foreign = KeyBundle::generate();
    for i in 0..200 {
        let bso = Record::new(format!("r{i}"), COLL, json!({ "n": i }))
            .encrypt(&foreign)
            .unwrap();
        h.server.insert_record(COLL, bso);
    }

    let mut session = h.session();
    engine.set_last_modified(session.last_modified(COLL));
    h.server.reset_request_counts();
    let stats = engine.sync(&mut session).unwrap().unwrap();

    assert_eq!(stats.incoming.failed, 200);
    assert_eq!(engine.previous_failed().len(), 200);
    // One collection fetch and a single crypto/keys refetch.
    assert!(h.server.request_counts().gets < 5, "{:?}", h.server.request_counts());
}

#[test]
fn undecryptable_record_is_retried_next_sync() {
    let h = Harness::new();
    let mut engine = h.engine();
    h.bootstrap(&mut engine);

    h.clock.advance(1_000);
    let bad = Record::new("r", COLL, json!({"v": 1}))
        .encrypt(&KeyBundle::generate())
        .unwrap();
    let modified = h.server.insert_record(COLL, bad);

    let stats = h.sync(&mut engine).unwrap();
    assert_eq!(stats.incoming.failed, 1);
    assert_eq!(stats.incoming.new_failed, 1);
    assert_eq!(engine.previous_failed(), ["r".to_string()]);

    // The record is fixed without changing its timestamp, so only the
    // retry of failed ids can pick it up.
    let good = Record::new("r", COLL, json!({"v": 1}))
        .encrypt(&h.key())
        .unwrap();
    h.server.insert_record_at(COLL, good, modified);

    let stats = h.sync(&mut engine).unwrap();
    assert_eq!(stats.incoming.applied, 1);
    assert_eq!(stats.incoming.failed, 0);
    assert_eq!(stats.incoming.new_failed, 0);
    assert!(engine.previous_failed().is_empty());
    assert!(engine.store().get("r").is_some());
}

#[test]
fn undecryptable_records_can_be_ignored() {
    let h = Harness::new();
    let config = EngineConfig {
        ignore_undecryptable: true,
        ..EngineConfig::default()
    };
    let mut engine = h.engine_with(config);
    h.bootstrap(&mut engine);

    h.clock.advance(1_000);
    let bad = Record::new("r", COLL, json!({}))
        .encrypt(&KeyBundle::generate())
        .unwrap();
    h.server.insert_record(COLL, bad);

    let stats = h.sync(&mut engine).unwrap();
    assert_eq!(stats.incoming.failed, 0);
    assert_eq!(stats.incoming.applied, 0);
    assert!(engine.previous_failed().is_empty());
}

#[test]
fn can_decrypt_reports_key_state() {
    let h = Harness::new();
    let mut engine = h.engine();
    let mut session = h.session();
    assert!(!engine.can_decrypt(&session));

    h.bootstrap(&mut engine);
    assert!(engine.can_decrypt(&h.session()));

    engine.wipe_server(&mut session).unwrap();
    assert!(!h.server.has_collection(COLL));
    assert_eq!(engine.last_sync(), 0);
}

// ============================================================================
// Mobile paging
// ============================================================================

#[test]
fn mobile_client_pages_through_backlog() {
    let h = Harness::new();
    h.prefs.set("client.type", json!("mobile"));
    let config = EngineConfig {
        mobile_batch_size: 2,
        mobile_guid_fetch_batch_size: 2,
        ..EngineConfig::default()
    };
    let mut engine = h.engine_with(config);
    h.bootstrap(&mut engine);

    for i in 1..=5 {
        h.clock.advance(100);
        h.put_remote(&format!("r{i}"), json!({ "n": i }));
    }

    let stats = h.sync(&mut engine).unwrap();
    assert_eq!(stats.incoming.applied, 5);
    assert!(engine.to_fetch().is_empty());
    for i in 1..=5 {
        assert_eq!(engine.store().get(&format!("r{i}")), Some(&json!({ "n": i })));
    }
}

#[test]
fn download_limit_does_not_cap_desktop_fetch() {
    let h = Harness::new();
    let config = EngineConfig {
        download_limit: Some(1),
        ..EngineConfig::default()
    };
    let mut engine = h.engine_with(config);
    h.bootstrap(&mut engine);

    for i in 1..=5 {
        h.clock.advance(100);
        h.put_remote(&format!("r{i}"), json!({ "n": i }));
    }

    let stats = h.sync(&mut engine).unwrap();
    assert_eq!(stats.incoming.applied, 5);
    assert!(engine.to_fetch().is_empty());
    assert_eq!(engine.store().get("r5"), Some(&json!({ "n": 5 })));
}

// ============================================================================
// Local edit tracking
// ============================================================================

#[test]
fn observed_edits_upload_only_while_tracking() {
    let h = Harness::new();
    let mut engine = h.engine();
    h.bootstrap(&mut engine);

    engine.store().insert("early", json!({"v": 1}));
    assert!(!engine.tracker_mut().observe_change("early", 10));

    engine.start_tracking();
    h.clock.advance(1_000);
    engine.store().insert("late", json!({"v": 2}));
    assert!(engine.tracker_mut().observe_change("late", 10));
    assert_eq!(engine.tracker().score(), 10);

    let stats = h.sync(&mut engine).unwrap();
    assert_eq!(stats.uploaded, 1);
    assert_eq!(h.remote_data("late"), Some(json!({"v": 2})));
    assert_eq!(h.remote_data("early"), None);

    engine.stop_tracking();
    assert!(!engine.tracker_mut().observe_change("late", 10));
    assert!(engine.tracker().changed_ids().is_empty());
}

// ============================================================================
// Aborting incoming processing
// ============================================================================

/// Refuses to store anything with an id starting with "stop".
#[derive(Default)]
struct FullDiskStore(MemoryStore);

impl Store for FullDiskStore {
    fn item_exists(&self, id: &str) -> Result<bool> {
        self.0.item_exists(id)
    }
    fn create_record(&self, id: &str, collection: &str) -> Result<Record> {
        self.0.create_record(id, collection)
    }
    fn create(&mut self, record: &Record) -> Result<()> {
        if record.id.starts_with("stop") {
            return Err(Error::abort(Error::Store("disk full".into())));
        }
        self.0.create(record)
    }
    fn update(&mut self, record: &Record) -> Result<()> {
        self.0.update(record)
    }
    fn remove(&mut self, record: &Record) -> Result<()> {
        self.0.remove(record)
    }
    fn change_item_id(&mut self, old_id: &str, new_id: &str) -> Result<()> {
        self.0.change_item_id(old_id, new_id)
    }
    fn get_all_ids(&self) -> Result<Vec<RecordId>> {
        self.0.get_all_ids()
    }
    fn wipe(&mut self) -> Result<()> {
        self.0.wipe()
    }
}

#[test]
fn abort_stops_incoming_processing() {
    let h = Harness::new();
    let mut engine = SyncEngine::new(
        COLL,
        EngineConfig::default(),
        h.prefs.clone(),
        Arc::new(h.clock.clone()),
        FullDiskStore::default,
    );
    engine.set_enabled(true);
    h.sync(&mut engine).unwrap();

    for id in ["a", "stop", "z"] {
        h.clock.advance(100);
        h.put_remote(id, json!({}));
    }

    let err = h.sync(&mut engine).unwrap_err();
    assert!(matches!(err, Error::Store(ref msg) if msg == "disk full"));
    assert!(engine.store().0.get("a").is_some());
    assert!(engine.store().0.get("z").is_none());
}

// ============================================================================
// Persistence and the engine manager
// ============================================================================

#[test]
fn unsynced_changes_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let h = Harness::new();
    let config = EngineConfig::default().with_profile_dir(dir.path());
    {
        let mut engine = h.engine_with(config.clone());
        h.bootstrap(&mut engine);
        engine.store().insert("a", json!({}));
        engine.tracker_mut().add_changed_id("a", Some(START + 5));

        h.server.set_fail_posts(true);
        assert!(h.sync(&mut engine).is_err());
        h.server.set_fail_posts(false);
    }

    let engine = h.engine_with(config);
    assert_eq!(engine.tracker().changed_ids().get("a"), Some(&(START + 5)));
}

#[test]
fn manager_syncs_in_priority_order_and_isolates_failures() {
    let h = Harness::new();
    let mut session = h.session();
    session.set_engine_meta(
        "forms",
        EngineMeta {
            version: 5,
            sync_id: "BBBBBBBBBBBB".into(),
        },
    );
    session.finish().unwrap();

    let mut manager = EngineManager::new(h.prefs.clone());
    let mut tabs = h.named_engine("tabs", EngineConfig::default().with_sync_priority(2));
    tabs.store().insert("t", json!({}));
    manager.register(Box::new(tabs));
    manager.register(Box::new(
        h.named_engine("forms", EngineConfig::default().with_sync_priority(1)),
    ));
    manager.decline(["passwords"]);

    let mut session = h.session();
    let outcomes = manager.sync_all(&mut session).unwrap();

    let order: Vec<_> = outcomes.iter().map(|o| o.engine.as_str()).collect();
    assert_eq!(order, vec!["forms", "tabs"]);
    assert_eq!(
        outcomes[0].result.as_ref().unwrap_err().failure_code(),
        Some(FailureCode::VersionOutOfDate)
    );
    assert_eq!(outcomes[1].result.as_ref().unwrap().unwrap().uploaded, 1);

    let session = h.session();
    assert_eq!(session.meta().declined, vec!["passwords".to_string()]);
    assert!(session.engine_meta("tabs").is_some());
}
