use axum::{
    Json,
    extract::State,
    http::{StatusCode, header},
    response::IntoResponse,
};
use pkg_controllers::preservation::PreservationStatus;
use pkg_metrics::recorder::{INSTANCES, RENEWS_LAST_MIN};
use pkg_replication::dispatcher::PeerStatus;
use pkg_state::registry::{PeerHealth, RecentActivity};
use pkg_types::application::status_counts;
use pkg_types::instance::InstanceStatus;
use serde::Serialize;
use std::collections::BTreeMap;

use crate::AppState;

const RECENT_ACTIVITY_SHOWN: usize = 20;

#[derive(Debug, Serialize)]
pub struct RegistryStatus {
    pub self_preservation: PreservationStatus,
    pub instances: usize,
    pub instances_by_status: BTreeMap<InstanceStatus, usize>,
    pub registry_version: u64,
    pub cache_version: u64,
    pub renews_last_min: u64,
    pub started_at: i64,
    pub isolated: bool,
    pub peers: Vec<PeerStatus>,
    pub recently_registered: Vec<RecentActivity>,
    pub recently_canceled: Vec<RecentActivity>,
}

fn latest(mut activity: Vec<RecentActivity>) -> Vec<RecentActivity> {
    activity.reverse();
    activity.truncate(RECENT_ACTIVITY_SHOWN);
    activity
}

/// GET /api/v1/status: node health summary.
pub async fn registry_status(State(state): State<AppState>) -> impl IntoResponse {
    let snapshot = state.cache.snapshot();
    let status = RegistryStatus {
        self_preservation: state.preservation.borrow().clone(),
        instances: state.registry.instance_count(),
        instances_by_status: status_counts(
            snapshot
                .applications
                .applications
                .iter()
                .flat_map(|a| a.instances.iter()),
        ),
        registry_version: state.registry.recent_changes().current_version(),
        cache_version: snapshot.version,
        renews_last_min: state.registry.renewal_rate().last_window(),
        started_at: state.registry.started_at(),
        isolated: state
            .dispatcher
            .as_ref()
            .is_some_and(|d| d.is_isolated()),
        peers: state
            .dispatcher
            .as_ref()
            .map(|d| d.peer_statuses())
            .unwrap_or_default(),
        recently_registered: latest(state.registry.recently_registered()),
        recently_canceled: latest(state.registry.recently_canceled()),
    };
    (StatusCode::OK, Json(status))
}

/// GET /metrics: Prometheus text exposition.
pub async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    state
        .metrics
        .gauge_set(INSTANCES, state.registry.instance_count() as i64);
    state.metrics.gauge_set(
        RENEWS_LAST_MIN,
        state.registry.renewal_rate().last_window() as i64,
    );
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
}
