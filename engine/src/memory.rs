//! An in-memory storage server.
//!
//! Implements [`StorageClient`] over plain maps, with hooks for injecting
//! failures and inspecting the requests an engine made. Modification
//! timestamps come from the injected clock and are strictly increasing.

use crate::client::{
    CollectionRequest, InfoCollections, PostResult, Response, SortOrder, StorageClient,
};
use crate::record::Bso;
use crate::{Clock, Error, RecordId, Result, Timestamp};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::trace;

#[derive(Debug, Default, Clone)]
struct MemoryCollection {
    records: BTreeMap<RecordId, Bso>,
    modified: Timestamp,
}

/// Counts of requests served, by kind.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RequestCounts {
    pub gets: usize,
    pub posts: usize,
    pub deletes: usize,
}

#[derive(Debug, Default)]
struct Inner {
    collections: BTreeMap<String, MemoryCollection>,
    last_timestamp: Timestamp,
    fail_gets: bool,
    fail_posts: bool,
    reject_ids: BTreeSet<RecordId>,
    counts: RequestCounts,
    deleted_ids: Vec<(String, Vec<RecordId>)>,
}

pub struct MemoryServer {
    inner: Mutex<Inner>,
    clock: Arc<dyn Clock>,
}

impl MemoryServer {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            clock,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn next_timestamp(&self, inner: &mut Inner) -> Timestamp {
        let ts = self.clock.now().max(inner.last_timestamp + 1);
        inner.last_timestamp = ts;
        ts
    }

    fn current_timestamp(&self, inner: &Inner) -> Timestamp {
        self.clock.now().max(inner.last_timestamp)
    }

    /// Store a record directly, stamping it with the next timestamp.
    pub fn insert_record(&self, collection: &str, bso: Bso) -> Timestamp {
        let mut inner = self.lock();
        let ts = self.next_timestamp(&mut inner);
        Self::store(&mut inner, collection, bso, ts);
        ts
    }

    /// Store a record directly with an explicit modification time.
    pub fn insert_record_at(&self, collection: &str, bso: Bso, modified: Timestamp) {
        let mut inner = self.lock();
        inner.last_timestamp = inner.last_timestamp.max(modified);
        Self::store(&mut inner, collection, bso, modified);
    }

    fn store(inner: &mut Inner, collection: &str, mut bso: Bso, modified: Timestamp) {
        bso.modified = modified;
        let coll = inner.collections.entry(collection.to_string()).or_default();
        coll.modified = coll.modified.max(modified);
        coll.records.insert(bso.id.clone(), bso);
    }

    pub fn record(&self, collection: &str, id: &str) -> Option<Bso> {
        self.lock()
            .collections
            .get(collection)
            .and_then(|c| c.records.get(id).cloned())
    }

    pub fn records(&self, collection: &str) -> Vec<Bso> {
        self.lock()
            .collections
            .get(collection)
            .map(|c| c.records.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn has_collection(&self, collection: &str) -> bool {
        self.lock().collections.contains_key(collection)
    }

    pub fn set_fail_gets(&self, fail: bool) {
        self.lock().fail_gets = fail;
    }

    pub fn set_fail_posts(&self, fail: bool) {
        self.lock().fail_posts = fail;
    }

    /// Report these ids as failed on every upload.
    pub fn reject_ids<I, S>(&self, ids: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<RecordId>,
    {
        self.lock().reject_ids = ids.into_iter().map(Into::into).collect();
    }

    pub fn request_counts(&self) -> RequestCounts {
        self.lock().counts
    }

    pub fn reset_request_counts(&self) {
        self.lock().counts = RequestCounts::default();
    }

    /// Ids named in DELETE requests, per request.
    pub fn deleted_ids(&self) -> Vec<(String, Vec<RecordId>)> {
        self.lock().deleted_ids.clone()
    }

    fn matching<'a>(
        coll: &'a MemoryCollection,
        request: &CollectionRequest,
    ) -> Vec<&'a Bso> {
        let mut records: Vec<&Bso> = coll
            .records
            .values()
            .filter(|bso| match &request.ids {
                Some(ids) => ids.iter().any(|id| *id == bso.id),
                None => true,
            })
            .filter(|bso| request.newer.map_or(true, |newer| bso.modified > newer))
            .filter(|bso| request.older.map_or(true, |older| bso.modified < older))
            .collect();

        match request.sort.unwrap_or(SortOrder::Oldest) {
            SortOrder::Oldest => records.sort_by(|a, b| (a.modified, &a.id).cmp(&(b.modified, &b.id))),
            SortOrder::Newest => records.sort_by(|a, b| (b.modified, &b.id).cmp(&(a.modified, &a.id))),
            SortOrder::Index => records.sort_by(|a, b| {
                (b.sortindex.unwrap_or(0), &a.id).cmp(&(a.sortindex.unwrap_or(0), &b.id))
            }),
        }

        if let Some(limit) = request.limit {
            records.truncate(limit);
        }
        records
    }

    fn unavailable(collection: &str) -> Error {
        Error::Http {
            status: 503,
            url: format!("/storage/{collection}"),
        }
    }
}

impl StorageClient for MemoryServer {
    fn info_collections(&self) -> Result<Response<InfoCollections>> {
        let mut inner = self.lock();
        inner.counts.gets += 1;
        let info = inner
            .collections
            .iter()
            .map(|(name, coll)| (name.clone(), coll.modified))
            .collect();
        Ok(Response::new(info, self.current_timestamp(&inner)))
    }

    fn get_record(&self, collection: &str, id: &str) -> Result<Option<Response<Bso>>> {
        let mut inner = self.lock();
        inner.counts.gets += 1;
        if inner.fail_gets {
            return Err(Self::unavailable(collection));
        }
        let ts = self.current_timestamp(&inner);
        Ok(inner
            .collections
            .get(collection)
            .and_then(|c| c.records.get(id))
            .map(|bso| Response::new(bso.clone(), ts)))
    }

    fn put_record(&self, collection: &str, record: &Bso) -> Result<Timestamp> {
        let mut inner = self.lock();
        inner.counts.posts += 1;
        if inner.fail_posts {
            return Err(Self::unavailable(collection));
        }
        let ts = self.next_timestamp(&mut inner);
        Self::store(&mut inner, collection, record.clone(), ts);
        Ok(ts)
    }

    fn get(&self, collection: &str, request: &CollectionRequest) -> Result<Response<Vec<Bso>>> {
        let mut inner = self.lock();
        inner.counts.gets += 1;
        if inner.fail_gets {
            return Err(Self::unavailable(collection));
        }
        let records = inner
            .collections
            .get(collection)
            .map(|coll| Self::matching(coll, request).into_iter().cloned().collect())
            .unwrap_or_default();
        trace!(collection, ?request, "memory server GET");
        Ok(Response::new(records, self.current_timestamp(&inner)))
    }

    fn get_ids(
        &self,
        collection: &str,
        request: &CollectionRequest,
    ) -> Result<Response<Vec<RecordId>>> {
        let mut inner = self.lock();
        inner.counts.gets += 1;
        if inner.fail_gets {
            return Err(Self::unavailable(collection));
        }
        let ids = inner
            .collections
            .get(collection)
            .map(|coll| {
                Self::matching(coll, request)
                    .into_iter()
                    .map(|bso| bso.id.clone())
                    .collect()
            })
            .unwrap_or_default();
        Ok(Response::new(ids, self.current_timestamp(&inner)))
    }

    fn post(&self, collection: &str, records: &[Bso]) -> Result<Response<PostResult>> {
        let mut inner = self.lock();
        inner.counts.posts += 1;
        if inner.fail_posts {
            return Err(Self::unavailable(collection));
        }

        let ts = self.next_timestamp(&mut inner);
        let mut result = PostResult {
            modified: ts,
            ..PostResult::default()
        };
        for bso in records {
            if inner.reject_ids.contains(&bso.id) {
                result
                    .failed
                    .insert(bso.id.clone(), vec!["rejected".to_string()]);
                continue;
            }
            Self::store(&mut inner, collection, bso.clone(), ts);
            result.success.push(bso.id.clone());
        }
        Ok(Response::new(result, ts))
    }

    fn delete(&self, collection: &str, request: &CollectionRequest) -> Result<Timestamp> {
        let mut inner = self.lock();
        inner.counts.deletes += 1;
        if let Some(ids) = &request.ids {
            inner
                .deleted_ids
                .push((collection.to_string(), ids.clone()));
        }
        let ts = self.next_timestamp(&mut inner);
        if let Some(coll) = inner.collections.get_mut(collection) {
            let doomed: Vec<RecordId> = Self::matching(coll, request)
                .into_iter()
                .map(|bso| bso.id.clone())
                .collect();
            for id in doomed {
                coll.records.remove(&id);
            }
            coll.modified = ts;
        }
        Ok(ts)
    }

    fn wipe_collection(&self, collection: &str) -> Result<Timestamp> {
        let mut inner = self.lock();
        inner.counts.deletes += 1;
        let ts = self.next_timestamp(&mut inner);
        inner.collections.remove(collection);
        Ok(ts)
    }

    fn wipe_all(&self) -> Result<Timestamp> {
        let mut inner = self.lock();
        inner.counts.deletes += 1;
        let ts = self.next_timestamp(&mut inner);
        inner.collections.clear();
        Ok(ts)
    }
}
