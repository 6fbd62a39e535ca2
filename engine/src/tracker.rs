//! Local change tracking.
//!
//! A [`Tracker`] accumulates the ids of locally modified items along with the
//! time of their latest change, and a score that tells the scheduler how
//! urgently the engine wants to sync. The change set is written to
//! `changes/<engine>.json` through a debounced saver.

use crate::persist::{Debounced, JsonFile};
use crate::{Clock, RecordId, Timestamp};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{trace, warn};

pub const SCORE_INCREMENT_SMALL: u32 = 1;
pub const SCORE_INCREMENT_MEDIUM: u32 = 10;
/// Enough to trigger an immediate sync.
pub const SCORE_INCREMENT_XLARGE: u32 = 300;

/// Change set: item id to last local modification time.
pub type ChangeSet = BTreeMap<RecordId, Timestamp>;

pub struct Tracker {
    name: String,
    clock: Arc<dyn Clock>,
    changed_ids: ChangeSet,
    score: u32,
    ignored: Vec<RecordId>,
    /// While set, adds and removes are dropped.
    pub ignore_all: bool,
    /// Gates [`observe_change`](Tracker::observe_change).
    tracking: bool,
    saver: Option<Debounced>,
}

impl Tracker {
    /// A tracker that keeps its change set in memory only.
    pub fn new(name: impl Into<String>, clock: Arc<dyn Clock>) -> Self {
        Self {
            name: name.into(),
            clock,
            changed_ids: ChangeSet::new(),
            score: 0,
            ignored: Vec::new(),
            ignore_all: false,
            tracking: false,
            saver: None,
        }
    }

    /// A tracker persisted under `profile_dir`, loading any saved changes.
    pub fn persisted(
        name: impl Into<String>,
        clock: Arc<dyn Clock>,
        profile_dir: &Path,
        save_delay: u64,
    ) -> Self {
        let mut tracker = Self::new(name, clock);
        let file = JsonFile::in_profile(profile_dir, "changes", &tracker.name);
        tracker.load_changed_ids(&file);
        tracker.saver = Some(Debounced::new(file, save_delay, tracker.clock.clone()));
        tracker
    }

    fn load_changed_ids(&mut self, file: &JsonFile) {
        match file.load::<serde_json::Value>() {
            None => {}
            Some(serde_json::Value::Object(_)) => match file.load::<ChangeSet>() {
                Some(changes) => self.changed_ids = changes,
                None => warn!(engine = %self.name, "changed IDs file has malformed entries"),
            },
            Some(_) => {
                warn!(engine = %self.name, "changed IDs file contains non-object value")
            }
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn changed_ids(&self) -> &ChangeSet {
        &self.changed_ids
    }

    pub fn score(&self) -> u32 {
        self.score
    }

    pub fn set_score(&mut self, score: u32) {
        self.score = score;
        trace!(engine = %self.name, score, "score updated");
    }

    pub fn add_score(&mut self, increment: u32) {
        self.set_score(self.score.saturating_add(increment));
    }

    pub fn reset_score(&mut self) {
        self.score = 0;
    }

    pub fn ignore_id(&mut self, id: &str) {
        self.unignore_id(id);
        self.ignored.push(id.to_string());
    }

    pub fn unignore_id(&mut self, id: &str) {
        self.ignored.retain(|ignored| ignored != id);
    }

    fn is_ignored(&self, id: &str) -> bool {
        self.ignore_all || self.ignored.iter().any(|ignored| ignored == id)
    }

    /// Record that `id` changed at `when` (now, if `None`).
    ///
    /// The stored time only ever moves forward: an older `when` than the one
    /// already recorded leaves the entry alone. Returns false if the id was
    /// rejected (empty or ignored).
    pub fn add_changed_id(&mut self, id: &str, when: Option<Timestamp>) -> bool {
        if id.is_empty() {
            warn!(engine = %self.name, "attempted to add empty ID to tracker");
            return false;
        }
        if self.is_ignored(id) {
            return false;
        }

        let when = when.unwrap_or_else(|| self.clock.now());
        let newer = self.changed_ids.get(id).map_or(true, |&prev| prev < when);
        if newer {
            trace!(engine = %self.name, id, when, "adding changed ID");
            self.changed_ids.insert(id.to_string(), when);
            self.save_changed_ids();
        }
        true
    }

    /// Forget a change. Returns false if the id was rejected.
    pub fn remove_changed_id(&mut self, id: &str) -> bool {
        if id.is_empty() {
            warn!(engine = %self.name, "attempted to remove empty ID from tracker");
            return false;
        }
        if self.is_ignored(id) {
            return false;
        }
        if self.changed_ids.remove(id).is_some() {
            trace!(engine = %self.name, id, "removing changed ID");
            self.save_changed_ids();
        }
        true
    }

    pub fn clear_changed_ids(&mut self) {
        trace!(engine = %self.name, "clearing changed ID list");
        self.changed_ids.clear();
        self.save_changed_ids();
    }

    fn save_changed_ids(&mut self) {
        if let Some(saver) = self.saver.as_mut() {
            saver.schedule(&self.changed_ids);
            saver.poll();
        }
    }

    /// Write pending changes to disk now.
    pub fn flush(&mut self) {
        if let Some(saver) = self.saver.as_mut() {
            saver.flush();
        }
    }

    /// Write pending changes if the save window has passed.
    pub fn poll(&mut self) {
        if let Some(saver) = self.saver.as_mut() {
            saver.poll();
        }
    }

    /// Observer entry point for local edits: record `id` as changed now and
    /// raise the score by `increment`. Dropped unless tracking is started.
    ///
    /// [`add_changed_id`](Tracker::add_changed_id) bypasses this gate, since
    /// the sync itself re-tracks records it failed to upload.
    pub fn observe_change(&mut self, id: &str, increment: u32) -> bool {
        if !self.tracking {
            trace!(engine = %self.name, id, "not tracking, dropping change");
            return false;
        }
        if !self.add_changed_id(id, None) {
            return false;
        }
        self.add_score(increment);
        true
    }

    pub fn start_tracking(&mut self) {
        self.tracking = true;
    }

    pub fn stop_tracking(&mut self) {
        self.tracking = false;
    }

    pub fn is_tracking(&self) -> bool {
        self.tracking
    }
}

impl std::fmt::Debug for Tracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tracker")
            .field("name", &self.name)
            .field("changed_ids", &self.changed_ids)
            .field("score", &self.score)
            .field("ignore_all", &self.ignore_all)
            .finish()
    }
}
