//! HTTP route definitions.

mod health;
mod storage;

use crate::db;
use crate::AppState;
use axum::{
    http::HeaderValue,
    middleware,
    response::{IntoResponse, Response},
    Router,
};
use recsync_engine::Timestamp;

/// Header carrying the server clock in milliseconds.
pub const TIMESTAMP_HEADER: &str = "x-weave-timestamp";

/// Create all application routes.
pub fn create_routes() -> Router<AppState> {
    Router::new()
        .merge(health::routes())
        .merge(storage::routes())
        .layer(middleware::map_response(stamp_response))
}

/// Respond with `body`, reporting `ts` as the server time.
pub fn timestamped(ts: Timestamp, body: impl IntoResponse) -> Response {
    let mut response = body.into_response();
    response
        .headers_mut()
        .insert(TIMESTAMP_HEADER, HeaderValue::from(ts));
    response
}

/// Stamp responses that did not set a timestamp, such as errors.
async fn stamp_response(mut response: Response) -> Response {
    if !response.headers().contains_key(TIMESTAMP_HEADER) {
        response
            .headers_mut()
            .insert(TIMESTAMP_HEADER, HeaderValue::from(db::now_millis()));
    }
    response
}
