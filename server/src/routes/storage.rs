//! Storage endpoint routes.

use axum::{
    extract::{Path, Query, State},
    response::{IntoResponse, Response},
    routing::{delete, get},
    Json, Router,
};
use recsync_engine::Timestamp;
use serde::Serialize;

use crate::auth::AuthUser;
use crate::db;
use crate::error::{AppError, Result};
use crate::handlers::{
    check_collection, handle_delete, handle_get, handle_post, is_valid_id, validate_put,
    CollectionQuery, IncomingBso, Listing,
};
use crate::routes::timestamped;
use crate::AppState;

/// Body of PUT and DELETE responses.
#[derive(Serialize)]
struct Modified {
    modified: Timestamp,
}

/// Create storage routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/info/collections", get(info_collections))
        .route("/storage", delete(delete_all))
        .route(
            "/storage/{collection}",
            get(get_collection)
                .post(post_collection)
                .delete(delete_collection),
        )
        .route(
            "/storage/{collection}/{id}",
            get(get_record).put(put_record).delete(delete_record),
        )
}

fn modified(ts: Timestamp) -> Response {
    timestamped(ts, Json(Modified { modified: ts }))
}

fn check_record_path(collection: &str, id: &str) -> Result<()> {
    check_collection(collection)?;
    if !is_valid_id(id) {
        return Err(AppError::BadRequest(format!("invalid id: {id}")));
    }
    Ok(())
}

/// GET /info/collections - Last-modified time of every collection.
async fn info_collections(State(state): State<AppState>, _auth: AuthUser) -> Result<Response> {
    let now = db::now_millis();
    let info = db::info_collections(&state.pool).await?;
    Ok(timestamped(now, Json(info)))
}

/// GET /storage/{collection} - Ids, or full records with `full`.
async fn get_collection(
    State(state): State<AppState>,
    _auth: AuthUser,
    Path(collection): Path<String>,
    Query(query): Query<CollectionQuery>,
) -> Result<Response> {
    check_collection(&collection)?;
    let now = db::now_millis();
    let listing = handle_get(&state.pool, &state.config, &collection, &query, now).await?;
    Ok(match listing {
        Listing::Full(bsos) => timestamped(now, Json(bsos)),
        Listing::Ids(ids) => timestamped(now, Json(ids)),
    })
}

/// POST /storage/{collection} - Store a batch of records.
async fn post_collection(
    State(state): State<AppState>,
    _auth: AuthUser,
    Path(collection): Path<String>,
    Json(records): Json<Vec<IncomingBso>>,
) -> Result<Response> {
    check_collection(&collection)?;
    let now = db::now_millis();
    let result = handle_post(&state.pool, &state.config, &collection, records, now).await?;
    Ok(timestamped(result.modified, Json(result)))
}

/// DELETE /storage/{collection} - Delete listed ids or the whole collection.
async fn delete_collection(
    State(state): State<AppState>,
    _auth: AuthUser,
    Path(collection): Path<String>,
    Query(query): Query<CollectionQuery>,
) -> Result<Response> {
    check_collection(&collection)?;
    let ts = handle_delete(&state.pool, &collection, &query, db::now_millis()).await?;
    Ok(modified(ts))
}

/// GET /storage/{collection}/{id} - One record.
async fn get_record(
    State(state): State<AppState>,
    _auth: AuthUser,
    Path((collection, id)): Path<(String, String)>,
) -> Result<Response> {
    check_record_path(&collection, &id)?;
    let now = db::now_millis();
    let bso = db::get_bso(&state.pool, &collection, &id, now)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("{collection}/{id}")))?;
    Ok(timestamped(now, Json(bso)))
}

/// PUT /storage/{collection}/{id} - Create or replace one record.
async fn put_record(
    State(state): State<AppState>,
    _auth: AuthUser,
    Path((collection, id)): Path<(String, String)>,
    Json(body): Json<IncomingBso>,
) -> Result<Response> {
    check_record_path(&collection, &id)?;
    let bso = validate_put(&id, body, &state.config)?;
    let ts = db::put_bsos(&state.pool, &collection, &[bso], db::now_millis()).await?;
    Ok(modified(ts))
}

/// DELETE /storage/{collection}/{id} - Delete one record.
async fn delete_record(
    State(state): State<AppState>,
    _auth: AuthUser,
    Path((collection, id)): Path<(String, String)>,
) -> Result<Response> {
    check_record_path(&collection, &id)?;
    let ts = db::delete_bso(&state.pool, &collection, &id, db::now_millis())
        .await?
        .ok_or_else(|| AppError::NotFound(format!("{collection}/{id}")))?;
    Ok(modified(ts))
}

/// DELETE /storage - Delete everything.
async fn delete_all(State(state): State<AppState>, _auth: AuthUser) -> Result<impl IntoResponse> {
    let ts = db::delete_all(&state.pool, db::now_millis()).await?;
    Ok(modified(ts))
}
