use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use pkg_cache::encoding::{Encoding, Format, Payload};
use serde::Deserialize;
use tracing::warn;

use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct DeltaQuery {
    #[serde(default)]
    pub version: u64,
}

fn negotiate(headers: &HeaderMap) -> (Format, Encoding) {
    let accept = headers.get(header::ACCEPT).and_then(|v| v.to_str().ok());
    let accept_encoding = headers
        .get(header::ACCEPT_ENCODING)
        .and_then(|v| v.to_str().ok());
    (
        Format::from_accept(accept),
        Encoding::from_accept_encoding(accept_encoding),
    )
}

fn payload_response(result: anyhow::Result<Payload>) -> Response {
    let payload = match result {
        Ok(p) => p,
        Err(e) => {
            warn!("Failed to encode registry payload: {}", e);
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };
    let mut response = (StatusCode::OK, payload.body).into_response();
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(payload.format.content_type()),
    );
    if let Some(encoding) = payload.encoding.header_value() {
        headers.insert(header::CONTENT_ENCODING, HeaderValue::from_static(encoding));
    }
    headers.insert(
        header::VARY,
        HeaderValue::from_static("accept, accept-encoding"),
    );
    headers.insert("x-registry-version", HeaderValue::from(payload.version));
    response
}

/// GET /api/v1/apps: full registry from the response cache.
pub async fn list_apps(State(state): State<AppState>, headers: HeaderMap) -> impl IntoResponse {
    let (format, encoding) = negotiate(&headers);
    payload_response(state.cache.applications(format, encoding))
}

/// GET /api/v1/apps/{app}
pub async fn get_app(
    State(state): State<AppState>,
    Path(app): Path<String>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let (format, encoding) = negotiate(&headers);
    match state.cache.application(&app, format, encoding) {
        Ok(Some(payload)) => payload_response(Ok(payload)),
        Ok(None) => StatusCode::NOT_FOUND.into_response(),
        Err(e) => payload_response(Err(e)),
    }
}

/// GET /api/v1/apps/delta?version=: changes since `version`.
pub async fn get_delta(
    State(state): State<AppState>,
    Query(query): Query<DeltaQuery>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let (format, encoding) = negotiate(&headers);
    payload_response(state.cache.delta(query.version, format, encoding))
}
