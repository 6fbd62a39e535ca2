//! The standard engine: tracker + store + the collection sync algorithm.
//!
//! A sync runs four phases in order, with cleanup always run afterwards:
//!
//! 1. **startup** checks the engine's entry in meta/global, adopting or
//!    replacing the server's sync id, and snapshots the tracker's changes.
//! 2. **incoming** downloads records newer than the last sync, decrypts and
//!    reconciles each one and applies the winners in batches. Records that
//!    fail are remembered and fetched again next time.
//! 3. **outgoing** uploads every locally changed record.
//! 4. **finish** resets the score and deletes records marked for removal
//!    on the server.
//!
//! Anything still unconfirmed by cleanup goes back into the tracker so a
//! failed sync never drops local changes.

use crate::client::{CollectionRequest, SortOrder};
use crate::config::EngineConfig;
use crate::engine::{Engine, IncomingCounts, Lazy, RecoveryStrategy, SyncStats};
use crate::meta::EngineMeta;
use crate::persist::JsonFile;
use crate::prefs::{PrefStore, SharedPrefs};
use crate::record::{make_guid, Bso};
use crate::session::SyncSession;
use crate::store::Store;
use crate::tracker::{ChangeSet, Tracker};
use crate::{Clock, Error, FailureCode, Record, RecordId, Result, Timestamp};
use std::sync::Arc;
use tracing::{debug, info, info_span, trace, warn};

pub struct SyncEngine<S: Store> {
    name: String,
    display_name: String,
    config: EngineConfig,
    prefs: SharedPrefs,
    clock: Arc<dyn Clock>,
    store: Lazy<S>,
    tracker: Tracker,
    last_modified: Option<Timestamp>,
    to_fetch: Vec<RecordId>,
    previous_failed: Vec<RecordId>,
    to_fetch_file: Option<JsonFile>,
    previous_failed_file: Option<JsonFile>,
    /// Outgoing changes for the sync in progress.
    pub(crate) modified: ChangeSet,
    /// Ids to delete from the server when the sync finishes.
    pub(crate) delete_ids: Vec<RecordId>,
    stats: SyncStats,
}

/// Per-call state of the incoming phase.
#[derive(Default)]
struct IncomingBatch {
    apply: Vec<Record>,
    failed: Vec<RecordId>,
    handled: Vec<RecordId>,
    aborting: Option<Error>,
    counts: IncomingCounts,
}

impl<S: Store> SyncEngine<S> {
    /// Create an engine. The store is built by `store` on first use.
    pub fn new(
        name: &str,
        config: EngineConfig,
        prefs: SharedPrefs,
        clock: Arc<dyn Clock>,
        store: impl Fn() -> S + Send + 'static,
    ) -> Self {
        let name = name.to_lowercase();
        let tracker = match &config.profile_dir {
            Some(dir) => Tracker::persisted(
                name.clone(),
                clock.clone(),
                dir,
                config.tracker_save_delay_ms,
            ),
            None => Tracker::new(name.clone(), clock.clone()),
        };
        let to_fetch_file = config
            .profile_dir
            .as_deref()
            .map(|dir| JsonFile::in_profile(dir, "toFetch", &name));
        let previous_failed_file = config
            .profile_dir
            .as_deref()
            .map(|dir| JsonFile::in_profile(dir, "failed", &name));
        let to_fetch = to_fetch_file
            .as_ref()
            .and_then(|f| f.load())
            .unwrap_or_default();
        let previous_failed = previous_failed_file
            .as_ref()
            .and_then(|f| f.load())
            .unwrap_or_default();

        let mut display_name = name.clone();
        if let Some(first) = display_name.get_mut(0..1) {
            first.make_ascii_uppercase();
        }

        Self {
            name,
            display_name,
            config,
            prefs,
            clock,
            store: Lazy::new(store),
            tracker,
            last_modified: None,
            to_fetch,
            previous_failed,
            to_fetch_file,
            previous_failed_file,
            modified: ChangeSet::new(),
            delete_ids: Vec::new(),
            stats: SyncStats::default(),
        }
    }

    pub fn with_display_name(mut self, display_name: impl Into<String>) -> Self {
        self.display_name = display_name.into();
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&mut self) -> &mut S {
        self.store.get_mut()
    }

    pub fn store_initialized(&self) -> bool {
        self.store.is_initialized()
    }

    pub fn tracker(&self) -> &Tracker {
        &self.tracker
    }

    pub fn tracker_mut(&mut self) -> &mut Tracker {
        &mut self.tracker
    }

    /// Outgoing changes of the sync in progress.
    pub fn modified_ids(&self) -> &ChangeSet {
        &self.modified
    }

    /// Ids queued for deletion from the server.
    pub fn pending_deletes(&self) -> &[RecordId] {
        &self.delete_ids
    }

    pub(crate) fn clock_now(&self) -> Timestamp {
        self.clock.now()
    }

    fn pref(&self, key: &str) -> String {
        format!("{}.{}", self.name, key)
    }

    /// The id of the current generation of this engine's data, generated on
    /// first use.
    pub fn sync_id(&self) -> String {
        let key = self.pref("syncID");
        match self.prefs.get_str(&key) {
            Some(id) if !id.is_empty() => id,
            _ => {
                let id = make_guid();
                self.prefs.set(&key, id.clone().into());
                id
            }
        }
    }

    /// Set the sync id. An empty id makes the next read generate one.
    pub fn set_sync_id(&self, sync_id: &str) {
        self.prefs.set(&self.pref("syncID"), sync_id.into());
    }

    /// Server time of the last successful download or upload.
    pub fn last_sync(&self) -> Timestamp {
        self.prefs.get_u64(&self.pref("lastSync"), 0)
    }

    pub fn set_last_sync(&self, timestamp: Timestamp) {
        self.prefs.set(&self.pref("lastSync"), timestamp.into());
    }

    /// Move `last_sync` forward to `timestamp`; never backwards.
    fn advance_last_sync(&self, timestamp: Timestamp) {
        if self.last_sync() < timestamp {
            trace!(engine = %self.name, timestamp, "advancing last sync");
            self.set_last_sync(timestamp);
        }
    }

    pub fn reset_last_sync(&self) {
        debug!(engine = %self.name, "resetting last sync time");
        self.prefs.reset(&self.pref("lastSync"));
        self.set_last_sync(0);
        self.set_last_sync_local(0);
    }

    /// Local time the last sync started.
    pub fn last_sync_local(&self) -> Timestamp {
        self.prefs.get_u64(&self.pref("lastSyncLocal"), 0)
    }

    pub fn set_last_sync_local(&self, timestamp: Timestamp) {
        self.prefs.set(&self.pref("lastSyncLocal"), timestamp.into());
    }

    pub fn last_modified(&self) -> Option<Timestamp> {
        self.last_modified
    }

    /// Ids known to be on the server but not yet downloaded.
    pub fn to_fetch(&self) -> &[RecordId] {
        &self.to_fetch
    }

    pub fn set_to_fetch(&mut self, ids: Vec<RecordId>) {
        self.to_fetch = ids;
        if let Some(file) = &self.to_fetch_file {
            file.save_or_warn(&self.to_fetch);
        }
    }

    /// Ids that failed to apply and will be fetched again.
    pub fn previous_failed(&self) -> &[RecordId] {
        &self.previous_failed
    }

    pub fn set_previous_failed(&mut self, ids: Vec<RecordId>) {
        self.previous_failed = ids;
        if let Some(file) = &self.previous_failed_file {
            file.save_or_warn(&self.previous_failed);
        }
    }

    fn is_mobile(&self) -> bool {
        self.prefs.get_str("client.type").as_deref() == Some("mobile")
    }

    fn reset_sync_state(&mut self) {
        self.reset_last_sync();
        self.set_previous_failed(Vec::new());
        self.set_to_fetch(Vec::new());
    }

    /// Reconcile the engine's meta/global entry and snapshot local changes.
    pub fn sync_startup(&mut self, session: &mut SyncSession<'_>) -> Result<()> {
        let remote = session.engine_meta(&self.name).cloned().unwrap_or_default();
        let local_version = self.config.version;
        let mut needs_wipe = false;

        if remote.version < local_version {
            debug!(engine = %self.name, remote = remote.version, local = local_version, "old engine data on server");
            needs_wipe = true;
            self.set_sync_id("");
            session.set_engine_meta(
                &self.name,
                EngineMeta {
                    version: local_version,
                    sync_id: self.sync_id(),
                },
            );
        } else if remote.version > local_version {
            return Err(Error::VersionOutOfDate {
                engine: self.name.clone(),
                local: local_version,
                remote: remote.version,
            });
        } else if remote.sync_id != self.sync_id() {
            info!(engine = %self.name, sync_id = %remote.sync_id, "adopting server sync id");
            self.set_sync_id(&remote.sync_id);
            self.reset_sync_state();
        }

        if needs_wipe {
            self.wipe_server(session)?;
        }

        self.set_last_sync_local(self.clock_now());

        if self.last_sync() != 0 {
            self.modified = self.tracker.changed_ids().clone();
        } else {
            debug!(engine = %self.name, "first sync, uploading all items");
            self.modified = self
                .store
                .get_mut()
                .get_all_ids()?
                .into_iter()
                .map(|id| (id, 0))
                .collect();
        }
        // Changes made from here on are picked up by the next sync.
        self.tracker.clear_changed_ids();
        self.delete_ids.clear();
        Ok(())
    }

    /// Download, reconcile and apply incoming records.
    pub fn process_incoming(&mut self, session: &mut SyncSession<'_>) -> Result<()> {
        let mobile = self.is_mobile();
        // Only mobile clients page; `download_limit` caps the GUID query.
        let batch_size = mobile.then_some(self.config.mobile_batch_size);
        let fetch_chunk = if mobile {
            self.config.mobile_guid_fetch_batch_size
        } else {
            self.config.guid_fetch_batch_size
        }
        .max(1);

        let mut batch = IncomingBatch::default();
        let mut fetch_batch = union(&self.to_fetch, &self.previous_failed);
        let failed_in_previous_sync = std::mem::take(&mut self.previous_failed);
        self.set_previous_failed(Vec::new());

        let mut request = CollectionRequest::new().newer_than(self.last_sync());
        if let Some(limit) = batch_size {
            request = request.limit(limit);
        }

        if self.last_modified.map_or(true, |modified| modified > self.last_sync()) {
            let fetched = self.fetch_incoming(session, &request, &mut batch);
            self.flush_incoming(&mut batch);
            fetched?;
            if let Some(cause) = batch.aborting.take() {
                return Err(cause);
            }
        }

        if let Some(limit) = batch_size {
            if batch.handled.len() == limit {
                let mut ids_request = CollectionRequest::new()
                    .newer_than(self.last_sync())
                    .sort_by(SortOrder::Index);
                if let Some(download_limit) = self.config.download_limit {
                    ids_request = ids_request.limit(download_limit);
                }
                let ids = session
                    .client()
                    .get_ids(&self.name, &ids_request)
                    .map_err(|e| e.with_code(FailureCode::EngineDownloadFail))?;
                session.note_server_time(ids.timestamp);
                let extra = subtract(&ids.value, &batch.handled);
                if !extra.is_empty() {
                    debug!(engine = %self.name, count = extra.len(), "deferring records to later fetches");
                    fetch_batch = union(&extra, &fetch_batch);
                    let to_fetch = union(&extra, &self.to_fetch);
                    self.set_to_fetch(to_fetch);
                }
            }
        }

        // Deferred ids are in toFetch, so it is safe to fast-forward.
        if let Some(modified) = self.last_modified {
            self.advance_last_sync(modified);
        }

        while !fetch_batch.is_empty() && batch.aborting.is_none() {
            let chunk: Vec<RecordId> =
                fetch_batch.drain(..fetch_chunk.min(fetch_batch.len())).collect();
            let request = CollectionRequest::new().ids(chunk.iter().cloned());
            self.fetch_incoming(session, &request, &mut batch)?;

            let to_fetch = subtract(&self.to_fetch, &chunk);
            self.set_to_fetch(to_fetch);
            if !batch.failed.is_empty() {
                batch.counts.failed += batch.failed.len();
                let failed = union(&self.previous_failed, &batch.failed);
                self.set_previous_failed(failed);
                batch.failed.clear();
            }
            if let Some(cause) = batch.aborting.take() {
                return Err(cause);
            }
            if let Some(modified) = self.last_modified {
                self.advance_last_sync(modified);
            }
        }

        self.flush_incoming(&mut batch);
        if let Some(cause) = batch.aborting.take() {
            return Err(cause);
        }

        let counts = &mut batch.counts;
        counts.new_failed = subtract(&self.previous_failed, &failed_in_previous_sync).len();
        counts.succeeded = counts.applied.saturating_sub(counts.failed);
        info!(
            engine = %self.name,
            applied = counts.applied,
            succeeded = counts.succeeded,
            failed = counts.failed,
            new_failed = counts.new_failed,
            reconciled = counts.reconciled,
            "records processed"
        );
        self.stats.incoming = batch.counts;
        Ok(())
    }

    fn fetch_incoming(
        &mut self,
        session: &mut SyncSession<'_>,
        request: &CollectionRequest,
        batch: &mut IncomingBatch,
    ) -> Result<()> {
        let response = session.client().get(&self.name, request).map_err(|e| {
            debug!(engine = %self.name, error = %e, "download failed");
            e.with_code(FailureCode::EngineDownloadFail)
        })?;
        session.note_server_time(response.timestamp);

        let apply_batch_size = self.config.apply_incoming_batch_size.max(1);
        for bso in response.value {
            if batch.aborting.is_some() {
                break;
            }
            self.handle_incoming(session, bso, batch);
            if batch.apply.len() >= apply_batch_size {
                self.apply_batch(batch);
            }
        }
        Ok(())
    }

    fn handle_incoming(&mut self, session: &mut SyncSession<'_>, bso: Bso, batch: &mut IncomingBatch) {
        if self.last_modified.map_or(true, |modified| bso.modified > modified) {
            self.last_modified = Some(bso.modified);
        }
        batch.handled.push(bso.id.clone());

        let record = match self.decrypt_incoming(session, &bso) {
            Ok(Some(record)) => record,
            Ok(None) => return,
            Err(e) => {
                warn!(engine = %self.name, id = %bso.id, error = %e, "error decrypting record");
                batch.failed.push(bso.id);
                return;
            }
        };

        match self.reconcile(&record, session.server_time()) {
            Ok(true) => {
                batch.counts.applied += 1;
                batch.apply.push(record);
            }
            Ok(false) => {
                batch.counts.reconciled += 1;
                trace!(engine = %self.name, id = %record.id, "skipping reconciled incoming item");
            }
            Err(Error::AbortApplyIncoming(cause)) => {
                warn!(engine = %self.name, id = %record.id, "reconciliation failed, aborting incoming processing");
                batch.failed.push(record.id);
                batch.aborting = Some(*cause);
            }
            Err(e) => {
                warn!(engine = %self.name, id = %record.id, error = %e, "failed to reconcile incoming record");
                batch.failed.push(record.id);
            }
        }
    }

    /// Decrypt with the collection key, recovering from HMAC failures.
    /// `Ok(None)` means the record is to be skipped.
    fn decrypt_incoming(&mut self, session: &mut SyncSession<'_>, bso: &Bso) -> Result<Option<Record>> {
        let err = match bso.decrypt(session.key_for_collection(&self.name), &self.name) {
            Ok(record) => return Ok(Some(record)),
            Err(e) if !e.is_hmac_mismatch() => return Err(e),
            Err(e) => e,
        };

        let mut strategy = self.handle_hmac_mismatch(session, bso, true);
        if strategy == RecoveryStrategy::Retry {
            match bso.decrypt(session.key_for_collection(&self.name), &self.name) {
                Ok(record) => return Ok(Some(record)),
                Err(e) if !e.is_hmac_mismatch() => return Err(e),
                Err(_) => strategy = self.handle_hmac_mismatch(session, bso, false),
            }
        }

        match strategy {
            RecoveryStrategy::Ignore => {
                debug!(engine = %self.name, id = %bso.id, "ignoring undecryptable record");
                Ok(None)
            }
            RecoveryStrategy::Retry | RecoveryStrategy::Error => Err(err),
        }
    }

    /// Decide what to do with a record that failed HMAC verification.
    pub fn handle_hmac_mismatch(
        &self,
        session: &mut SyncSession<'_>,
        bso: &Bso,
        may_retry: bool,
    ) -> RecoveryStrategy {
        if self.config.ignore_undecryptable {
            return RecoveryStrategy::Ignore;
        }
        if !may_retry {
            return RecoveryStrategy::Error;
        }
        match session.handle_hmac_event() {
            Ok(true) => RecoveryStrategy::Retry,
            Ok(false) => RecoveryStrategy::Error,
            Err(e) => {
                warn!(engine = %self.name, id = %bso.id, error = %e, "failed to refresh keys");
                RecoveryStrategy::Error
            }
        }
    }

    fn apply_batch(&mut self, batch: &mut IncomingBatch) {
        let records = std::mem::take(&mut batch.apply);
        self.tracker.ignore_all = true;
        match self.store.get_mut().apply_incoming_batch(&records) {
            Ok(failed) => batch.failed.extend(failed),
            Err(e) => {
                warn!(engine = %self.name, error = %e, "aborting incoming processing");
                batch.aborting = Some(e);
            }
        }
        self.tracker.ignore_all = false;
    }

    /// Apply what is pending and remember what failed for the next sync.
    fn flush_incoming(&mut self, batch: &mut IncomingBatch) {
        if !batch.apply.is_empty() {
            self.apply_batch(batch);
        }
        if !batch.failed.is_empty() {
            debug!(engine = %self.name, failed = ?batch.failed, "records that failed to apply");
            batch.counts.failed += batch.failed.len();
            let failed = union(&batch.failed, &self.previous_failed);
            self.set_previous_failed(failed);
            batch.failed.clear();
        }
    }

    /// Queue `id` for deletion on the server.
    pub(crate) fn delete_id(&mut self, id: &str) {
        self.tracker.remove_changed_id(id);
        self.delete_ids.push(id.to_string());
    }

    /// Upload every record in the outgoing change set.
    pub fn upload_outgoing(&mut self, session: &mut SyncSession<'_>) -> Result<()> {
        let ids: Vec<RecordId> = self.modified.keys().cloned().collect();
        if ids.is_empty() {
            return Ok(());
        }
        trace!(engine = %self.name, count = ids.len(), "preparing outgoing records");

        let max_records = self.config.max_upload_records.max(1);
        let mut outgoing = Vec::with_capacity(max_records.min(ids.len()));
        for (count, id) in ids.iter().enumerate() {
            match self.outgoing_record(session, id) {
                Ok(bso) => outgoing.push(bso),
                Err(e) => warn!(engine = %self.name, id = %id, error = %e, "error creating record"),
            }
            if (count + 1) % max_records == 0 || count + 1 == ids.len() {
                self.post_outgoing(session, &mut outgoing, ids.len())?;
            }
        }
        Ok(())
    }

    fn outgoing_record(&mut self, session: &SyncSession<'_>, id: &str) -> Result<Bso> {
        let mut record = self.store.get_mut().create_record(id, &self.name)?;
        record.set_id(id);
        record.collection = self.name.clone();
        record.encrypt(session.key_for_collection(&self.name))
    }

    fn post_outgoing(
        &mut self,
        session: &mut SyncSession<'_>,
        outgoing: &mut Vec<Bso>,
        total: usize,
    ) -> Result<()> {
        if outgoing.is_empty() {
            return Ok(());
        }
        info!(engine = %self.name, count = outgoing.len(), total, "uploading records");
        let response = session.client().post(&self.name, outgoing.as_slice()).map_err(|e| {
            debug!(engine = %self.name, error = %e, "uploading records failed");
            e.with_code(FailureCode::EngineUploadFail)
        })?;
        outgoing.clear();
        session.note_server_time(response.timestamp);
        self.advance_last_sync(response.timestamp);

        let result = response.value;
        if !result.failed.is_empty() {
            debug!(
                engine = %self.name,
                failed = ?result.failed.keys().collect::<Vec<_>>(),
                "records will be uploaded again because the server could not store them"
            );
        }
        for id in &result.success {
            self.modified.remove(id);
        }
        self.stats.uploaded += result.success.len();
        self.stats.upload_failed += result.failed.len();
        Ok(())
    }

    /// Reset the score and send queued deletes.
    pub fn sync_finish(&mut self, session: &mut SyncSession<'_>) -> Result<()> {
        trace!(engine = %self.name, "finishing up sync");
        self.tracker.reset_score();

        let ids = std::mem::take(&mut self.delete_ids);
        for chunk in ids.chunks(self.config.delete_batch_size.max(1)) {
            let ts = session
                .client()
                .delete(&self.name, &CollectionRequest::new().ids(chunk.iter().cloned()))?;
            session.note_server_time(ts);
            self.stats.deleted += chunk.len();
        }
        Ok(())
    }

    /// Hand unconfirmed outgoing changes back to the tracker.
    pub fn sync_cleanup(&mut self) {
        let modified = std::mem::take(&mut self.modified);
        if !modified.is_empty() {
            debug!(engine = %self.name, count = modified.len(), "re-tracking unsynced changes");
        }
        for (id, when) in modified {
            self.tracker.add_changed_id(&id, Some(when));
        }
        self.tracker.poll();
    }

    fn sync_phases(&mut self, session: &mut SyncSession<'_>) -> Result<()> {
        self.sync_startup(session)?;
        self.process_incoming(session)?;
        self.upload_outgoing(session)?;
        self.sync_finish(session)
    }
}

impl<S: Store> Engine for SyncEngine<S> {
    fn name(&self) -> &str {
        &self.name
    }

    fn display_name(&self) -> &str {
        &self.display_name
    }

    fn sync_priority(&self) -> i32 {
        self.config.sync_priority
    }

    fn enabled(&self) -> bool {
        self.prefs.get_bool(&format!("engine.{}", self.name), false)
    }

    fn set_enabled(&mut self, enabled: bool) {
        self.prefs.set(&format!("engine.{}", self.name), enabled.into());
    }

    fn score(&self) -> u32 {
        self.tracker.score()
    }

    fn sync(&mut self, session: &mut SyncSession<'_>) -> Result<Option<SyncStats>> {
        if !self.enabled() {
            return Ok(None);
        }
        let span = info_span!("engine", engine = %self.name);
        let _guard = span.enter();

        self.stats = SyncStats::default();
        let result = self.sync_phases(session);
        self.sync_cleanup();
        result?;
        Ok(Some(std::mem::take(&mut self.stats)))
    }

    fn reset_client(&mut self) -> Result<()> {
        self.reset_sync_state();
        Ok(())
    }

    fn wipe_client(&mut self) -> Result<()> {
        self.reset_client()?;
        debug!(engine = %self.name, "deleting all local data");
        self.tracker.ignore_all = true;
        let wiped = self.store.get_mut().wipe();
        self.tracker.ignore_all = false;
        wiped?;
        self.tracker.clear_changed_ids();
        Ok(())
    }

    fn wipe_server(&mut self, session: &mut SyncSession<'_>) -> Result<()> {
        info!(engine = %self.name, "wiping server collection");
        let ts = session.client().wipe_collection(&self.name)?;
        session.note_server_time(ts);
        self.reset_client()
    }

    fn set_last_modified(&mut self, last_modified: Option<Timestamp>) {
        self.last_modified = last_modified;
    }

    fn can_decrypt(&mut self, session: &SyncSession<'_>) -> bool {
        let request = CollectionRequest::new().limit(1).sort_by(SortOrder::Newest);
        let records = match session.client().get(&self.name, &request) {
            Ok(response) => response.value,
            Err(e) => {
                debug!(engine = %self.name, error = %e, "failed test decrypt");
                return false;
            }
        };
        records.iter().any(|bso| {
            match bso.decrypt(session.key_for_collection(&self.name), &self.name) {
                Ok(_) => true,
                Err(e) => {
                    debug!(engine = %self.name, error = %e, "failed test decrypt");
                    false
                }
            }
        })
    }

    fn start_tracking(&mut self) {
        self.tracker.start_tracking();
    }

    fn stop_tracking(&mut self) {
        self.tracker.stop_tracking();
    }
}

/// Items of `a`, then items of `b` not in `a`.
fn union(a: &[RecordId], b: &[RecordId]) -> Vec<RecordId> {
    let mut out = a.to_vec();
    for id in b {
        if !out.contains(id) {
            out.push(id.clone());
        }
    }
    out
}

/// Items of `a` not in `b`.
fn subtract(a: &[RecordId], b: &[RecordId]) -> Vec<RecordId> {
    a.iter().filter(|id| !b.contains(id)).cloned().collect()
}
