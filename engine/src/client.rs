//! Storage server access.
//!
//! The engine talks to the server only through [`StorageClient`]. Calls are
//! blocking; every successful call reports the server's timestamp so record
//! ages can be computed against server time.

use crate::record::Bso;
use crate::{CollectionName, RecordId, Result, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Order of records returned by a collection query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    /// Oldest modification first.
    Oldest,
    /// Newest modification first.
    Newest,
    /// Highest `sortindex` first.
    Index,
}

impl SortOrder {
    pub fn as_str(&self) -> &'static str {
        match self {
            SortOrder::Oldest => "oldest",
            SortOrder::Newest => "newest",
            SortOrder::Index => "index",
        }
    }
}

/// Filters for a collection GET or DELETE.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CollectionRequest {
    pub ids: Option<Vec<RecordId>>,
    /// Only records modified strictly after this time.
    pub newer: Option<Timestamp>,
    /// Only records modified strictly before this time.
    pub older: Option<Timestamp>,
    pub limit: Option<usize>,
    pub sort: Option<SortOrder>,
}

impl CollectionRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ids<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<RecordId>,
    {
        self.ids = Some(ids.into_iter().map(Into::into).collect());
        self
    }

    pub fn newer_than(mut self, ts: Timestamp) -> Self {
        self.newer = Some(ts);
        self
    }

    pub fn older_than(mut self, ts: Timestamp) -> Self {
        self.older = Some(ts);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn sort_by(mut self, sort: SortOrder) -> Self {
        self.sort = Some(sort);
        self
    }

    /// Query string pairs, in a stable order.
    pub fn to_query_pairs(&self, full: bool) -> Vec<(&'static str, String)> {
        let mut pairs = Vec::new();
        if let Some(ids) = &self.ids {
            pairs.push(("ids", ids.join(",")));
        }
        if let Some(newer) = self.newer {
            pairs.push(("newer", newer.to_string()));
        }
        if let Some(older) = self.older {
            pairs.push(("older", older.to_string()));
        }
        if let Some(limit) = self.limit {
            pairs.push(("limit", limit.to_string()));
        }
        if let Some(sort) = self.sort {
            pairs.push(("sort", sort.as_str().to_string()));
        }
        if full {
            pairs.push(("full", "1".to_string()));
        }
        pairs
    }
}

/// A value returned by the server with the server's timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct Response<T> {
    pub value: T,
    pub timestamp: Timestamp,
}

impl<T> Response<T> {
    pub fn new(value: T, timestamp: Timestamp) -> Self {
        Self { value, timestamp }
    }
}

/// Outcome of a batch upload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostResult {
    /// Timestamp assigned to the stored records.
    pub modified: Timestamp,
    pub success: Vec<RecordId>,
    /// Rejected ids with the server's reasons.
    pub failed: BTreeMap<RecordId, Vec<String>>,
}

/// Last-modified time of every collection on the server.
pub type InfoCollections = BTreeMap<CollectionName, Timestamp>;

/// Blocking access to a storage server.
pub trait StorageClient {
    fn info_collections(&self) -> Result<Response<InfoCollections>>;

    /// Fetch one record, `None` if it does not exist.
    fn get_record(&self, collection: &str, id: &str) -> Result<Option<Response<Bso>>>;

    /// Store one record, returning its new modification time.
    fn put_record(&self, collection: &str, record: &Bso) -> Result<Timestamp>;

    /// Fetch full records matching `request`.
    fn get(&self, collection: &str, request: &CollectionRequest) -> Result<Response<Vec<Bso>>>;

    /// Fetch only the ids of records matching `request`.
    fn get_ids(
        &self,
        collection: &str,
        request: &CollectionRequest,
    ) -> Result<Response<Vec<RecordId>>>;

    fn post(&self, collection: &str, records: &[Bso]) -> Result<Response<PostResult>>;

    /// Delete the records matching `request`.
    fn delete(&self, collection: &str, request: &CollectionRequest) -> Result<Timestamp>;

    /// Delete a whole collection. A collection that does not exist is not
    /// an error.
    fn wipe_collection(&self, collection: &str) -> Result<Timestamp>;

    /// Delete everything stored for this account.
    fn wipe_all(&self) -> Result<Timestamp>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_pairs() {
        let request = CollectionRequest::new()
            .ids(["a", "b"])
            .newer_than(1500)
            .limit(10)
            .sort_by(SortOrder::Index);

        assert_eq!(
            request.to_query_pairs(true),
            vec![
                ("ids", "a,b".to_string()),
                ("newer", "1500".to_string()),
                ("limit", "10".to_string()),
                ("sort", "index".to_string()),
                ("full", "1".to_string()),
            ]
        );
        assert!(CollectionRequest::new().to_query_pairs(false).is_empty());
    }

    #[test]
    fn post_result_wire_format() {
        let json = r#"{"modified": 2000, "success": ["a"], "failed": {"b": ["invalid id"]}}"#;
        let result: PostResult = serde_json::from_str(json).unwrap();
        assert_eq!(result.success, vec!["a".to_string()]);
        assert_eq!(result.failed["b"], vec!["invalid id".to_string()]);
    }
}
