//! Database operations for the collections and bsos tables.
//!
//! Every write to a collection takes a new timestamp from the collections
//! row, so modification times within a collection strictly increase even
//! when the wall clock does not.

use recsync_engine::{Bso, CollectionRequest, InfoCollections, SortOrder, Timestamp};
use sqlx::{PgPool, Postgres, QueryBuilder, Row, Transaction};

/// A stored record row from the database.
#[derive(Debug)]
pub struct StoredBso {
    pub id: String,
    pub modified: i64,
    pub sortindex: Option<i32>,
    pub payload: String,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for StoredBso {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(StoredBso {
            id: row.try_get("id")?,
            modified: row.try_get("modified")?,
            sortindex: row.try_get("sortindex")?,
            payload: row.try_get("payload")?,
        })
    }
}

impl StoredBso {
    /// Convert a database row to the wire record.
    pub fn into_bso(self) -> Bso {
        Bso {
            id: self.id,
            modified: to_timestamp(self.modified),
            sortindex: self.sortindex,
            ttl: None,
            payload: self.payload,
        }
    }
}

/// A validated record ready to be written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewBso {
    pub id: String,
    pub payload: String,
    pub sortindex: Option<i32>,
    /// Seconds until the record expires.
    pub ttl: Option<u32>,
}

/// Current server time in milliseconds.
pub fn now_millis() -> Timestamp {
    to_timestamp(chrono::Utc::now().timestamp_millis())
}

fn to_timestamp(value: i64) -> Timestamp {
    value.max(0) as Timestamp
}

fn to_db(value: Timestamp) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

/// Last-modified time of every collection.
pub async fn info_collections(pool: &PgPool) -> Result<InfoCollections, sqlx::Error> {
    let rows = sqlx::query("SELECT name, modified FROM collections")
        .fetch_all(pool)
        .await?;

    rows.iter()
        .map(|row| {
            let name: String = row.try_get("name")?;
            let modified: i64 = row.try_get("modified")?;
            Ok((name, to_timestamp(modified)))
        })
        .collect()
}

/// Start a query over live records of `collection` that match `request`.
fn select(
    columns: &str,
    collection: &str,
    request: &CollectionRequest,
    now: Timestamp,
) -> QueryBuilder<'static, Postgres> {
    let mut query = QueryBuilder::new(format!("SELECT {columns} FROM bsos WHERE collection = "));
    query.push_bind(collection.to_string());
    query
        .push(" AND (expires IS NULL OR expires > ")
        .push_bind(to_db(now))
        .push(")");

    if let Some(ids) = &request.ids {
        query.push(" AND id = ANY(").push_bind(ids.clone()).push(")");
    }
    if let Some(newer) = request.newer {
        query.push(" AND modified > ").push_bind(to_db(newer));
    }
    if let Some(older) = request.older {
        query.push(" AND modified < ").push_bind(to_db(older));
    }

    query.push(match request.sort.unwrap_or(SortOrder::Oldest) {
        SortOrder::Oldest => " ORDER BY modified ASC, id ASC",
        SortOrder::Newest => " ORDER BY modified DESC, id ASC",
        SortOrder::Index => " ORDER BY COALESCE(sortindex, 0) DESC, id ASC",
    });

    if let Some(limit) = request.limit {
        query
            .push(" LIMIT ")
            .push_bind(i64::try_from(limit).unwrap_or(i64::MAX));
    }
    query
}

/// Full records of `collection` matching `request`.
pub async fn get_bsos(
    pool: &PgPool,
    collection: &str,
    request: &CollectionRequest,
    now: Timestamp,
) -> Result<Vec<Bso>, sqlx::Error> {
    let rows = select("id, modified, sortindex, payload", collection, request, now)
        .build_query_as::<StoredBso>()
        .fetch_all(pool)
        .await?;
    Ok(rows.into_iter().map(StoredBso::into_bso).collect())
}

/// Ids of records in `collection` matching `request`.
pub async fn get_ids(
    pool: &PgPool,
    collection: &str,
    request: &CollectionRequest,
    now: Timestamp,
) -> Result<Vec<String>, sqlx::Error> {
    select("id", collection, request, now)
        .build_query_scalar::<String>()
        .fetch_all(pool)
        .await
}

/// Get a live record by collection and id.
pub async fn get_bso(
    pool: &PgPool,
    collection: &str,
    id: &str,
    now: Timestamp,
) -> Result<Option<Bso>, sqlx::Error> {
    let row = sqlx::query_as::<_, StoredBso>(
        r#"
        SELECT id, modified, sortindex, payload
        FROM bsos
        WHERE collection = $1 AND id = $2 AND (expires IS NULL OR expires > $3)
        "#,
    )
    .bind(collection)
    .bind(id)
    .bind(to_db(now))
    .fetch_optional(pool)
    .await?;
    Ok(row.map(StoredBso::into_bso))
}

/// Assign the next modification time of `collection`, creating it if needed.
async fn touch_collection(
    tx: &mut Transaction<'_, Postgres>,
    collection: &str,
    now: Timestamp,
) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar(
        r#"
        INSERT INTO collections (name, modified)
        VALUES ($1, $2)
        ON CONFLICT (name) DO UPDATE SET
            modified = GREATEST(EXCLUDED.modified, collections.modified + 1)
        RETURNING modified
        "#,
    )
    .bind(collection)
    .bind(to_db(now))
    .fetch_one(&mut **tx)
    .await
}

async fn upsert(
    tx: &mut Transaction<'_, Postgres>,
    collection: &str,
    bso: &NewBso,
    modified: i64,
) -> Result<(), sqlx::Error> {
    let expires = bso.ttl.map(|ttl| modified.saturating_add(i64::from(ttl) * 1000));
    sqlx::query(
        r#"
        INSERT INTO bsos (collection, id, modified, sortindex, payload, expires)
        VALUES ($1, $2, $3, $4, $5, $6)
        ON CONFLICT (collection, id) DO UPDATE SET
            modified = EXCLUDED.modified,
            sortindex = EXCLUDED.sortindex,
            payload = EXCLUDED.payload,
            expires = EXCLUDED.expires
        "#,
    )
    .bind(collection)
    .bind(&bso.id)
    .bind(modified)
    .bind(bso.sortindex)
    .bind(&bso.payload)
    .bind(expires)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Store a batch of records under one timestamp, returning it.
pub async fn put_bsos(
    pool: &PgPool,
    collection: &str,
    bsos: &[NewBso],
    now: Timestamp,
) -> Result<Timestamp, sqlx::Error> {
    let mut tx = pool.begin().await?;
    let modified = touch_collection(&mut tx, collection, now).await?;
    for bso in bsos {
        upsert(&mut tx, collection, bso, modified).await?;
    }
    tx.commit().await?;
    Ok(to_timestamp(modified))
}

/// Delete the records `ids` from `collection`. `None` if the collection
/// does not exist.
pub async fn delete_bsos(
    pool: &PgPool,
    collection: &str,
    ids: &[String],
    now: Timestamp,
) -> Result<Option<Timestamp>, sqlx::Error> {
    let mut tx = pool.begin().await?;
    let exists: Option<i64> =
        sqlx::query_scalar("SELECT modified FROM collections WHERE name = $1 FOR UPDATE")
            .bind(collection)
            .fetch_optional(&mut *tx)
            .await?;
    if exists.is_none() {
        return Ok(None);
    }

    sqlx::query("DELETE FROM bsos WHERE collection = $1 AND id = ANY($2)")
        .bind(collection)
        .bind(ids)
        .execute(&mut *tx)
        .await?;
    let modified = touch_collection(&mut tx, collection, now).await?;
    tx.commit().await?;
    Ok(Some(to_timestamp(modified)))
}

/// Delete one record. `None` if it does not exist.
pub async fn delete_bso(
    pool: &PgPool,
    collection: &str,
    id: &str,
    now: Timestamp,
) -> Result<Option<Timestamp>, sqlx::Error> {
    let mut tx = pool.begin().await?;
    let deleted = sqlx::query("DELETE FROM bsos WHERE collection = $1 AND id = $2")
        .bind(collection)
        .bind(id)
        .execute(&mut *tx)
        .await?
        .rows_affected();
    if deleted == 0 {
        return Ok(None);
    }

    let modified = touch_collection(&mut tx, collection, now).await?;
    tx.commit().await?;
    Ok(Some(to_timestamp(modified)))
}

/// Drop a collection and all its records. `None` if it does not exist.
pub async fn delete_collection(
    pool: &PgPool,
    collection: &str,
    now: Timestamp,
) -> Result<Option<Timestamp>, sqlx::Error> {
    let deleted = sqlx::query("DELETE FROM collections WHERE name = $1")
        .bind(collection)
        .execute(pool)
        .await?
        .rows_affected();
    Ok((deleted > 0).then_some(now))
}

/// Drop every collection.
pub async fn delete_all(pool: &PgPool, now: Timestamp) -> Result<Timestamp, sqlx::Error> {
    let collections = sqlx::query("DELETE FROM collections")
        .execute(pool)
        .await?
        .rows_affected();
    tracing::info!(collections, "wiped all storage");
    Ok(now)
}
