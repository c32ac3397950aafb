pub mod handlers;
pub mod request_id;
pub mod server;

use std::sync::Arc;

use pkg_cache::response::ResponseCache;
use pkg_controllers::preservation::PreservationStatus;
use pkg_metrics::MetricsRegistry;
use pkg_replication::dispatcher::ReplicationDispatcher;
use pkg_state::registry::InstanceRegistry;
use tokio::sync::watch;

/// Shared application state injected into all Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<InstanceRegistry>,
    pub cache: Arc<ResponseCache>,
    pub metrics: Arc<MetricsRegistry>,
    /// Absent when the node runs without peers.
    pub dispatcher: Option<ReplicationDispatcher>,
    pub preservation: watch::Receiver<PreservationStatus>,
}
