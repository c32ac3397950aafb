use axum::{
    Json,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
};
use pkg_constants::network::REPLICATION_HEADER;
use pkg_state::registry::{InstanceRegistry, OpResult, RenewOutcome};
use pkg_types::instance::{InstanceRecord, InstanceStatus};
use serde::Deserialize;
use tracing::warn;

use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct RegisterQuery {
    #[serde(default)]
    pub lease_duration: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct RenewQuery {
    #[serde(default)]
    pub last_dirty_timestamp: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct StatusQuery {
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub last_dirty_timestamp: Option<i64>,
}

/// Writes forwarded by a peer carry the replication header.
pub fn is_replication(headers: &HeaderMap) -> bool {
    headers
        .get(REPLICATION_HEADER)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("true"))
}

fn bad_request(message: String) -> axum::response::Response {
    (
        StatusCode::BAD_REQUEST,
        Json(serde_json::json!({ "error": message })),
    )
        .into_response()
}

fn op_response(
    registry: &InstanceRegistry,
    app: &str,
    id: &str,
    result: OpResult,
) -> axum::response::Response {
    match result {
        OpResult::Success => StatusCode::OK.into_response(),
        OpResult::NotFound => StatusCode::NOT_FOUND.into_response(),
        OpResult::Conflict => match registry.get_instance(app, id) {
            Some(record) => (StatusCode::CONFLICT, Json(record)).into_response(),
            None => StatusCode::CONFLICT.into_response(),
        },
    }
}

/// POST /api/v1/apps/{app}: register an instance.
pub async fn register_instance(
    State(state): State<AppState>,
    Path(app): Path<String>,
    Query(query): Query<RegisterQuery>,
    headers: HeaderMap,
    Json(mut record): Json<InstanceRecord>,
) -> impl IntoResponse {
    if !record.app_name.is_empty() && !record.app_name.eq_ignore_ascii_case(&app) {
        return bad_request(format!(
            "record names application '{}' but was posted to '{}'",
            record.app_name, app
        ));
    }
    record.app_name = app;
    match state
        .registry
        .register(record, query.lease_duration, is_replication(&headers))
    {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => {
            warn!("Rejected registration: {}", e);
            bad_request(e.to_string())
        }
    }
}

/// PUT /api/v1/apps/{app}/{id}: heartbeat.
pub async fn renew_instance(
    State(state): State<AppState>,
    Path((app, id)): Path<(String, String)>,
    Query(query): Query<RenewQuery>,
    headers: HeaderMap,
) -> impl IntoResponse {
    match state.registry.renew_versioned(
        &app,
        &id,
        query.last_dirty_timestamp,
        is_replication(&headers),
    ) {
        RenewOutcome::Renewed => StatusCode::OK.into_response(),
        RenewOutcome::NotFound => StatusCode::NOT_FOUND.into_response(),
        RenewOutcome::Conflict(record) => (StatusCode::CONFLICT, Json(record)).into_response(),
    }
}

/// DELETE /api/v1/apps/{app}/{id}: cancel a lease.
pub async fn cancel_instance(
    State(state): State<AppState>,
    Path((app, id)): Path<(String, String)>,
    headers: HeaderMap,
) -> impl IntoResponse {
    if state.registry.cancel(&app, &id, is_replication(&headers)) {
        StatusCode::OK
    } else {
        StatusCode::NOT_FOUND
    }
}

/// PUT /api/v1/apps/{app}/{id}/status?value=: set a status override.
pub async fn update_status(
    State(state): State<AppState>,
    Path((app, id)): Path<(String, String)>,
    Query(query): Query<StatusQuery>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let Some(value) = query.value else {
        return bad_request("missing 'value' query parameter".to_string());
    };
    let status = InstanceStatus::parse(&value);
    if status == InstanceStatus::Unknown && !value.eq_ignore_ascii_case("unknown") {
        return bad_request(format!("unknown status '{}'", value));
    }
    let result = state.registry.update_status_versioned(
        &app,
        &id,
        status,
        query.last_dirty_timestamp,
        is_replication(&headers),
    );
    op_response(&state.registry, &app, &id, result)
}

/// DELETE /api/v1/apps/{app}/{id}/status?value=: remove a status override.
pub async fn delete_status_override(
    State(state): State<AppState>,
    Path((app, id)): Path<(String, String)>,
    Query(query): Query<StatusQuery>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let status = query
        .value
        .as_deref()
        .map(InstanceStatus::parse)
        .unwrap_or(InstanceStatus::Unknown);
    let result = state.registry.delete_status_override(
        &app,
        &id,
        status,
        query.last_dirty_timestamp,
        is_replication(&headers),
    );
    op_response(&state.registry, &app, &id, result)
}

/// POST /api/v1/apps/delta: the delta read route owns this path, so
/// registrations for an application named `delta` land here.
pub async fn register_delta_app(
    state: State<AppState>,
    query: Query<RegisterQuery>,
    headers: HeaderMap,
    record: Json<InstanceRecord>,
) -> impl IntoResponse {
    register_instance(state, Path("delta".to_string()), query, headers, record).await
}
