use axum::{
    Router, middleware,
    routing::{get, post, put},
};
use pkg_cache::response::{CacheConfig, ResponseCache};
use pkg_constants::lease::RENEWAL_RATE_WINDOW_SECS;
use pkg_constants::network::{PEER_CONNECT_TIMEOUT_MS, PEER_REQUEST_TIMEOUT_MS};
use pkg_constants::registry::EVENT_CHANNEL_CAPACITY;
use pkg_controllers::eviction::{EvictionConfig, EvictionController};
use pkg_metrics::MetricsRegistry;
use pkg_replication::client::HttpPeerClient;
use pkg_replication::discovery::StaticPeers;
use pkg_replication::dispatcher::{DispatcherConfig, ReplicationDispatcher};
use pkg_state::clock::SystemClock;
use pkg_state::events::EventBus;
use pkg_state::registry::{InstanceRegistry, PeerHealth, RegistryConfig};
use pkg_types::replication::PeerEndpoint;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::info;

use crate::AppState;
use crate::handlers::{apps, peer, query, status, watch};
use crate::request_id::request_id_middleware;

/// Server configuration assembled by the binary from flags and config file.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub addr: SocketAddr,
    /// Peer nodes as `host:port`.
    pub peers: Vec<String>,
    /// This node as peers know it; dropped from `peers` if listed.
    pub advertise: Option<PeerEndpoint>,
    pub registry: RegistryConfig,
    pub eviction: EvictionConfig,
    pub cache: CacheConfig,
    pub replication: DispatcherConfig,
    pub peer_request_timeout: Duration,
    pub peer_connect_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from((
                [0, 0, 0, 0],
                pkg_constants::network::DEFAULT_API_PORT,
            )),
            peers: Vec::new(),
            advertise: None,
            registry: RegistryConfig::default(),
            eviction: EvictionConfig::default(),
            cache: CacheConfig::default(),
            replication: DispatcherConfig::default(),
            peer_request_timeout: Duration::from_millis(PEER_REQUEST_TIMEOUT_MS),
            peer_connect_timeout: Duration::from_millis(PEER_CONNECT_TIMEOUT_MS),
        }
    }
}

/// A running set of registry subsystems and the state handlers share.
pub struct RegistryNode {
    pub state: AppState,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl RegistryNode {
    /// Wire the registry, replication, eviction, cache and metrics tasks.
    /// Must be called inside a Tokio runtime.
    pub fn start(config: &ServerConfig) -> anyhow::Result<Self> {
        let events = EventBus::new(EVENT_CHANNEL_CAPACITY);
        let registry = Arc::new(InstanceRegistry::new(
            config.registry.clone(),
            Arc::new(SystemClock),
            events.clone(),
        ));
        let metrics = Arc::new(MetricsRegistry::new());

        let mut tasks = vec![
            pkg_metrics::recorder::start(metrics.clone(), &events),
            registry
                .renewal_rate()
                .clone()
                .start(Duration::from_secs(RENEWAL_RATE_WINDOW_SECS)),
        ];

        let dispatcher = if config.peers.is_empty() {
            info!("No peers configured, running standalone");
            None
        } else {
            let client =
                HttpPeerClient::new(config.peer_request_timeout, config.peer_connect_timeout)?;
            let discovery = StaticPeers::parse(&config.peers, config.advertise.as_ref())?;
            let dispatcher = ReplicationDispatcher::new(
                config.replication.clone(),
                Arc::new(client),
                Arc::new(discovery),
                events.clone(),
            );
            dispatcher.attach(&registry);
            tasks.push(dispatcher.start());
            Some(dispatcher)
        };

        let peer_health = dispatcher
            .clone()
            .map(|d| Arc::new(d) as Arc<dyn PeerHealth>);
        let eviction = EvictionController::new(registry.clone(), config.eviction.clone(), peer_health);
        let preservation = eviction.subscribe();
        tasks.push(eviction.start());

        let cache = Arc::new(ResponseCache::new(registry.clone(), config.cache.clone()));
        tasks.push(cache.clone().start());

        Ok(Self {
            state: AppState {
                registry,
                cache,
                metrics,
                dispatcher,
                preservation,
            },
            tasks,
        })
    }

    /// Stop background tasks and peer workers.
    pub fn shutdown(self) {
        if let Some(dispatcher) = &self.state.dispatcher {
            dispatcher.shutdown();
        }
        for task in self.tasks {
            task.abort();
        }
    }
}

/// All registry routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/apps", get(query::list_apps))
        .route(
            "/api/v1/apps/delta",
            get(query::get_delta).post(apps::register_delta_app),
        )
        .route(
            "/api/v1/apps/{app}",
            post(apps::register_instance).get(query::get_app),
        )
        .route(
            "/api/v1/apps/{app}/{id}",
            put(apps::renew_instance).delete(apps::cancel_instance),
        )
        .route(
            "/api/v1/apps/{app}/{id}/status",
            put(apps::update_status).delete(apps::delete_status_override),
        )
        .route(
            pkg_constants::network::PEER_BATCH_PATH,
            post(peer::replication_batch),
        )
        .route("/api/v1/status", get(status::registry_status))
        .route("/api/v1/watch", get(watch::watch_changes))
        .route("/metrics", get(status::metrics))
        .layer(middleware::from_fn(request_id_middleware))
        .with_state(state)
}

/// Serve `router` on `listener` until ctrl-c.
pub async fn serve(listener: TcpListener, router: Router) -> anyhow::Result<()> {
    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
        })
        .await?;
    Ok(())
}

pub async fn start_server(config: ServerConfig) -> anyhow::Result<()> {
    let node = RegistryNode::start(&config)?;
    let router = build_router(node.state.clone());

    info!("Starting registry API server on {}", config.addr);
    let listener = TcpListener::bind(config.addr).await?;
    let result = serve(listener, router).await;

    node.shutdown();
    info!("Registry server stopped");
    result
}
