//! Storage handlers - request validation and collection access.

use crate::config::Config;
use crate::db::{self, NewBso};
use crate::error::{AppError, Result};
use recsync_engine::{Bso, CollectionRequest, PostResult, SortOrder, Timestamp};
use serde::Deserialize;
use sqlx::PgPool;
use std::collections::BTreeMap;

const MAX_ID_LENGTH: usize = 64;
const MAX_COLLECTION_LENGTH: usize = 32;

/// Query parameters accepted by collection GET and DELETE.
#[derive(Debug, Default, Deserialize)]
pub struct CollectionQuery {
    /// Comma separated record ids.
    pub ids: Option<String>,
    pub newer: Option<Timestamp>,
    pub older: Option<Timestamp>,
    pub limit: Option<usize>,
    pub sort: Option<SortOrder>,
    /// Any value asks for full records instead of ids.
    pub full: Option<String>,
}

impl CollectionQuery {
    pub fn is_full(&self) -> bool {
        self.full.is_some()
    }

    /// Validate the query. A limit above `max_limit` is rejected, never
    /// shortened.
    pub fn to_request(&self, max_limit: usize) -> Result<CollectionRequest> {
        let mut request = CollectionRequest::new();
        if let Some(ids) = &self.ids {
            let ids: Vec<&str> = ids.split(',').filter(|id| !id.is_empty()).collect();
            if let Some(bad) = ids.iter().find(|id| !is_valid_id(id)) {
                return Err(AppError::BadRequest(format!("invalid id: {bad}")));
            }
            request = request.ids(ids);
        }
        request.newer = self.newer;
        request.older = self.older;
        request.sort = self.sort;
        if let Some(limit) = self.limit {
            if limit > max_limit {
                return Err(AppError::BadRequest(format!(
                    "limit too large: {limit} > {max_limit}"
                )));
            }
            request.limit = Some(limit);
        }
        Ok(request)
    }
}

/// One record of a POST body or a PUT body.
#[derive(Debug, Clone, Deserialize)]
pub struct IncomingBso {
    /// Taken from the path on PUT.
    #[serde(default)]
    pub id: Option<String>,
    pub payload: Option<String>,
    pub sortindex: Option<i32>,
    pub ttl: Option<u32>,
}

/// Record ids are 1 to 64 printable ASCII characters.
pub fn is_valid_id(id: &str) -> bool {
    !id.is_empty() && id.len() <= MAX_ID_LENGTH && id.bytes().all(|b| (b' '..=b'~').contains(&b))
}

/// Collection names are 1 to 32 characters of `[A-Za-z0-9._-]`.
pub fn is_valid_collection(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_COLLECTION_LENGTH
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-'))
}

pub fn check_collection(name: &str) -> Result<()> {
    if is_valid_collection(name) {
        Ok(())
    } else {
        Err(AppError::BadRequest(format!("invalid collection: {name}")))
    }
}

/// Why an incoming record was not stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    InvalidId,
    MissingPayload,
    PayloadTooLarge,
}

impl Rejection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Rejection::InvalidId => "invalid id",
            Rejection::MissingPayload => "missing payload",
            Rejection::PayloadTooLarge => "payload too large",
        }
    }
}

/// Validate one incoming record.
fn validate(incoming: IncomingBso, config: &Config) -> std::result::Result<NewBso, Rejection> {
    let id = incoming.id.unwrap_or_default();
    if !is_valid_id(&id) {
        return Err(Rejection::InvalidId);
    }
    let Some(payload) = incoming.payload else {
        return Err(Rejection::MissingPayload);
    };
    if payload.len() > config.max_payload_bytes {
        return Err(Rejection::PayloadTooLarge);
    }
    Ok(NewBso {
        id,
        payload,
        sortindex: incoming.sortindex,
        ttl: incoming.ttl,
    })
}

/// Split a POST body into storable records and per-id failures.
pub fn validate_batch(
    records: Vec<IncomingBso>,
    config: &Config,
) -> Result<(Vec<NewBso>, BTreeMap<String, Vec<String>>)> {
    if records.len() > config.max_post_records {
        return Err(AppError::BadRequest(format!(
            "too many records: {} > {}",
            records.len(),
            config.max_post_records
        )));
    }

    let mut valid = Vec::with_capacity(records.len());
    let mut failed: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for record in records {
        let id = record.id.clone().unwrap_or_default();
        match validate(record, config) {
            Ok(bso) => valid.push(bso),
            Err(reason) => failed.entry(id).or_default().push(reason.as_str().to_string()),
        }
    }
    Ok((valid, failed))
}

/// Validate a PUT body for `id`.
pub fn validate_put(id: &str, mut incoming: IncomingBso, config: &Config) -> Result<NewBso> {
    incoming.id = Some(id.to_string());
    validate(incoming, config).map_err(|reason| match reason {
        Rejection::PayloadTooLarge => AppError::PayloadTooLarge(id.to_string()),
        reason => AppError::BadRequest(format!("{}: {id}", reason.as_str())),
    })
}

/// Store the valid part of a POST body under one timestamp.
pub async fn handle_post(
    pool: &PgPool,
    config: &Config,
    collection: &str,
    records: Vec<IncomingBso>,
    now: Timestamp,
) -> Result<PostResult> {
    let (valid, failed) = validate_batch(records, config)?;

    let modified = if valid.is_empty() {
        now
    } else {
        db::put_bsos(pool, collection, &valid, now).await?
    };

    tracing::debug!(
        collection,
        stored = valid.len(),
        failed = failed.len(),
        "post batch"
    );

    Ok(PostResult {
        modified,
        success: valid.into_iter().map(|bso| bso.id).collect(),
        failed,
    })
}

/// Records or ids of `collection` matching `query`.
pub enum Listing {
    Full(Vec<Bso>),
    Ids(Vec<String>),
}

pub async fn handle_get(
    pool: &PgPool,
    config: &Config,
    collection: &str,
    query: &CollectionQuery,
    now: Timestamp,
) -> Result<Listing> {
    let request = query.to_request(config.max_get_limit)?;
    if query.is_full() {
        Ok(Listing::Full(db::get_bsos(pool, collection, &request, now).await?))
    } else {
        Ok(Listing::Ids(db::get_ids(pool, collection, &request, now).await?))
    }
}

/// Delete the listed ids, or the whole collection when no ids are given.
pub async fn handle_delete(
    pool: &PgPool,
    collection: &str,
    query: &CollectionQuery,
    now: Timestamp,
) -> Result<Timestamp> {
    let request = query.to_request(usize::MAX)?;
    let deleted = match request.ids {
        Some(ids) => db::delete_bsos(pool, collection, &ids, now).await?,
        None => db::delete_collection(pool, collection, now).await?,
    };
    deleted.ok_or_else(|| AppError::NotFound(collection.to_string()))
}
