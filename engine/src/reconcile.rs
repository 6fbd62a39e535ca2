//! Conflict resolution between incoming records and local state.
//!
//! For every incoming record the engine decides whether the record should be
//! applied to the store or skipped. The decision uses the record's age on
//! the server (`server_time - record.modified`) and, when the item has a
//! pending local change, the local age (`now - changed_at`).
//!
//! # Algorithm
//!
//! 1. Deletions: skip if the item does not exist locally, apply if it is
//!    not locally modified, otherwise apply only if the remote is newer.
//! 2. Incoming item missing locally: ask the store for a duplicate under a
//!    different id. A duplicate is re-keyed to the incoming id, its old id is
//!    queued for deletion on the server and its pending change moves along.
//! 3. Still missing locally: apply unless it was deleted locally more
//!    recently than the remote changed.
//! 4. Identical cleartext: skip and drop the pending local change.
//! 5. Different, not locally modified: apply.
//! 6. Different and locally modified: the younger side wins.
//!
//! # Known limitation
//!
//! Step 6 is lossy. The losing side's changes are discarded with only a
//! warning; there is no field-level merge.

use crate::store::Store;
use crate::sync_engine::SyncEngine;
use crate::{Record, Result, Timestamp};
use tracing::{debug, trace, warn};

fn age(now: Timestamp, then: Timestamp) -> i64 {
    now as i64 - then as i64
}

impl<S: Store> SyncEngine<S> {
    /// Decide whether `item` should be applied locally. `server_time` is the
    /// server timestamp of the response that carried it.
    pub fn reconcile(&mut self, item: &Record, server_time: Timestamp) -> Result<bool> {
        let now = self.clock_now();
        let mut exists = self.store().item_exists(&item.id)?;
        let mut local_changed = self.modified.get(&item.id).copied();

        let remote_age = age(server_time, item.modified);
        let remote_is_newer =
            |changed: Option<Timestamp>| changed.map_or(false, |at| remote_age < age(now, at));

        if item.deleted() {
            if !exists {
                return Ok(false);
            }
            if local_changed.is_none() {
                return Ok(true);
            }
            return Ok(remote_is_newer(local_changed));
        }

        if !exists {
            if let Some(dupe_id) = self.store().find_dupe(item)? {
                trace!(local = %dupe_id, incoming = %item.id, "local item is a duplicate of incoming item");
                self.delete_id(&dupe_id);
                exists = self.store().item_exists(&dupe_id)?;
                debug!(from = %dupe_id, to = %item.id, "switching local id to incoming");
                self.store().change_item_id(&dupe_id, &item.id)?;

                local_changed = self.modified.remove(&dupe_id);
                if let Some(at) = local_changed {
                    self.modified.insert(item.id.clone(), at);
                }
                debug!(exists, modified = local_changed.is_some(), "local item after duplication");
            } else {
                trace!(id = %item.id, "no duplicate found for incoming item");
            }
        }

        if !exists {
            if local_changed.is_none() {
                trace!(id = %item.id, "applying incoming: local item does not exist and was not deleted");
                return Ok(true);
            }
            if remote_is_newer(local_changed) {
                trace!(id = %item.id, "applying incoming: local deletion is older");
                self.modified.remove(&item.id);
                return Ok(true);
            }
            trace!(id = %item.id, "ignoring incoming: local deletion is newer");
            return Ok(false);
        }

        let collection = item.collection.clone();
        let local = self.store().create_record(&item.id, &collection)?;
        if local.cleartext == item.cleartext {
            trace!(id = %item.id, "ignoring incoming: local item is identical");
            self.modified.remove(&item.id);
            return Ok(false);
        }

        if local_changed.is_none() {
            trace!(id = %item.id, "applying incoming: no local conflict");
            return Ok(true);
        }

        warn!(id = %item.id, "DATA LOSS: Both local and remote changes to record: {}", item.id);
        Ok(remote_is_newer(local_changed))
    }
}
