use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use pkg_replication::receiver::apply_batch;
use pkg_types::replication::ReplicationBatch;
use tracing::debug;

use crate::AppState;

/// POST /api/v1/peerreplication/batch: apply a peer's batch.
pub async fn replication_batch(
    State(state): State<AppState>,
    Json(batch): Json<ReplicationBatch>,
) -> impl IntoResponse {
    debug!("Received replication batch of {} items", batch.items.len());
    let response = apply_batch(&state.registry, &batch);
    (StatusCode::OK, Json(response))
}
