use parking_lot::{Mutex, RwLock};
use pkg_constants::cache::{CACHE_DIRTY_DEBOUNCE_MS, CACHE_REFRESH_INTERVAL_SECS};
use pkg_state::events::RegistryEvent;
use pkg_state::recent::RecentChange;
use pkg_state::registry::InstanceRegistry;
use pkg_types::application::{Applications, ApplicationsDelta, InstanceChange};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::encoding::{Encoding, Format, Payload, encode};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshMode {
    /// Rebuild on the timer only.
    Interval,
    /// Also rebuild shortly after registry changes.
    OnDirty,
}

impl RefreshMode {
    pub fn parse(value: &str) -> anyhow::Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "interval" => Ok(RefreshMode::Interval),
            "on-dirty" | "on_dirty" => Ok(RefreshMode::OnDirty),
            other => anyhow::bail!("unknown cache refresh mode '{}'", other),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub refresh_interval: Duration,
    pub mode: RefreshMode,
    /// Quiet time after a change before an on-dirty rebuild.
    pub debounce: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            refresh_interval: Duration::from_secs(CACHE_REFRESH_INTERVAL_SECS),
            mode: RefreshMode::OnDirty,
            debounce: Duration::from_millis(CACHE_DIRTY_DEBOUNCE_MS),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Entity {
    AllApps,
    App(String),
    Delta(u64),
    DeltaFallback,
}

type PayloadKey = (Entity, Format, Encoding);

/// Registry view captured by one rebuild.
pub struct Snapshot {
    pub version: u64,
    /// Log floor at capture time; deltas from below it cannot be served.
    pub floor: u64,
    pub applications: Applications,
    changes: Vec<Arc<RecentChange>>,
    pub built_at: i64,
    payloads: Mutex<HashMap<PayloadKey, Payload>>,
}

impl Snapshot {
    fn capture(registry: &InstanceRegistry) -> Self {
        let applications = registry.get_applications();
        let version = applications.version;
        let window = registry.recent_changes().changes_since(0);
        let changes = window
            .changes
            .into_iter()
            .filter(|c| c.version <= version)
            .collect();
        Self {
            version,
            floor: window.floor,
            applications,
            changes,
            built_at: registry.now_millis(),
            payloads: Mutex::new(HashMap::new()),
        }
    }

    /// Changes in `(since, version]`, or a fallback when `since` is outside
    /// the retained window.
    pub fn delta(&self, since: u64) -> ApplicationsDelta {
        if since < self.floor || since > self.version {
            return ApplicationsDelta::FullSnapshotRequired {
                current_version: self.version,
            };
        }
        ApplicationsDelta::Changes {
            from_version: since,
            to_version: self.version,
            apps_hash_code: self.applications.apps_hash_code.clone(),
            changes: self
                .changes
                .iter()
                .filter(|c| c.version > since)
                .map(|c| InstanceChange::from(c.as_ref()))
                .collect(),
        }
    }
}

/// Read-side cache of encoded registry views.
///
/// Readers never touch the registry maps: they get an `Arc` of the current
/// snapshot and a memoized payload for their `(entity, format, encoding)`.
pub struct ResponseCache {
    registry: Arc<InstanceRegistry>,
    config: CacheConfig,
    current: RwLock<Arc<Snapshot>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ResponseCache {
    pub fn new(registry: Arc<InstanceRegistry>, config: CacheConfig) -> Self {
        let snapshot = Arc::new(Snapshot::capture(&registry));
        Self {
            registry,
            config,
            current: RwLock::new(snapshot),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.current.read().clone()
    }

    pub fn version(&self) -> u64 {
        self.current.read().version
    }

    /// `(hits, misses)` of payload lookups.
    pub fn stats(&self) -> (u64, u64) {
        (
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
        )
    }

    /// Purge expired log entries and capture a new snapshot.
    pub fn rebuild(&self) -> u64 {
        let purged = self.registry.purge_recent_changes();
        let snapshot = Arc::new(Snapshot::capture(&self.registry));
        let version = snapshot.version;
        *self.current.write() = snapshot;
        debug!("Response cache rebuilt at version {} (purged {})", version, purged);
        self.registry
            .events()
            .emit(RegistryEvent::CacheRebuilt { version });
        version
    }

    /// Rebuild only if the registry changed or the log window moved.
    pub fn refresh(&self) -> bool {
        let dirty = self.registry.take_dirty();
        let floor_moved = self.registry.recent_changes().floor() != self.snapshot().floor;
        if !dirty && !floor_moved {
            let purged = self.registry.purge_recent_changes();
            if purged == 0 {
                return false;
            }
        }
        self.rebuild();
        true
    }

    fn memoized(
        &self,
        snapshot: &Snapshot,
        key: PayloadKey,
        render: impl FnOnce() -> anyhow::Result<Payload>,
    ) -> anyhow::Result<Payload> {
        if let Some(payload) = snapshot.payloads.lock().get(&key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(payload.clone());
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        let payload = render()?;
        snapshot.payloads.lock().insert(key, payload.clone());
        Ok(payload)
    }

    pub fn applications(&self, format: Format, encoding: Encoding) -> anyhow::Result<Payload> {
        let snapshot = self.snapshot();
        self.memoized(&snapshot, (Entity::AllApps, format, encoding), || {
            encode(&snapshot.applications, format, encoding, snapshot.version)
        })
    }

    pub fn application(
        &self,
        app: &str,
        format: Format,
        encoding: Encoding,
    ) -> anyhow::Result<Option<Payload>> {
        let snapshot = self.snapshot();
        let Some(application) = snapshot.applications.application(app) else {
            return Ok(None);
        };
        let key = (Entity::App(application.name.clone()), format, encoding);
        self.memoized(&snapshot, key, || {
            encode(application, format, encoding, snapshot.version)
        })
        .map(Some)
    }

    pub fn delta(&self, since: u64, format: Format, encoding: Encoding) -> anyhow::Result<Payload> {
        let snapshot = self.snapshot();
        let entity = if since < snapshot.floor || since > snapshot.version {
            Entity::DeltaFallback
        } else {
            Entity::Delta(since)
        };
        self.memoized(&snapshot, (entity, format, encoding), || {
            encode(&snapshot.delta(since), format, encoding, snapshot.version)
        })
    }

    /// Start the refresh loop as a background task.
    pub fn start(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                "ResponseCache started (interval={}s, mode={:?})",
                self.config.refresh_interval.as_secs(),
                self.config.mode
            );
            let on_dirty = self.config.mode == RefreshMode::OnDirty;
            let mut event_rx = self.registry.events().subscribe();
            let mut interval = tokio::time::interval(self.config.refresh_interval);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        self.refresh();
                    }
                    result = event_rx.recv(), if on_dirty => {
                        match result {
                            Ok(ref event) if event.is_change() => {
                                tokio::time::sleep(self.config.debounce).await;
                                while event_rx.try_recv().is_ok() {}
                                self.refresh();
                            }
                            Ok(_) => {}
                            Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                                warn!("ResponseCache lagged {} events, rebuilding", n);
                                self.rebuild();
                            }
                            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pkg_constants::registry::DELTA_RETENTION_SECS;
    use pkg_state::clock::ManualClock;
    use pkg_state::events::EventBus;
    use pkg_state::registry::RegistryConfig;
    use pkg_types::instance::{ActionType, InstanceRecord};

    fn setup() -> (Arc<ManualClock>, Arc<InstanceRegistry>) {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let registry = Arc::new(InstanceRegistry::new(
            RegistryConfig::default(),
            clock.clone(),
            EventBus::new(256),
        ));
        (clock, registry)
    }

    fn register(registry: &InstanceRegistry, id: &str) {
        registry
            .register(InstanceRecord::new("billing", id, "10.0.0.1", 8080), None, false)
            .unwrap();
    }

    fn changes(delta: ApplicationsDelta) -> Vec<(u64, ActionType)> {
        match delta {
            ApplicationsDelta::Changes { changes, .. } => {
                changes.into_iter().map(|c| (c.version, c.action)).collect()
            }
            other => panic!("expected changes, got {:?}", other),
        }
    }

    #[test]
    fn delta_returns_exactly_the_window() {
        let (_clock, registry) = setup();
        register(&registry, "i-1");
        register(&registry, "i-2");
        registry.cancel("billing", "i-1", false);
        let cache = ResponseCache::new(registry.clone(), CacheConfig::default());
        let snapshot = cache.snapshot();
        assert_eq!(snapshot.version, 3);

        assert_eq!(
            changes(snapshot.delta(1)),
            vec![(2, ActionType::Added), (3, ActionType::Deleted)]
        );
        assert!(changes(snapshot.delta(3)).is_empty());
        assert_eq!(changes(snapshot.delta(0)).len(), 3);
    }

    #[test]
    fn delta_outside_window_requires_full_snapshot() {
        let (clock, registry) = setup();
        register(&registry, "i-1");
        clock.advance_secs(DELTA_RETENTION_SECS + 1);
        register(&registry, "i-2");
        let cache = ResponseCache::new(registry.clone(), CacheConfig::default());
        cache.rebuild();
        let snapshot = cache.snapshot();
        assert_eq!(snapshot.floor, 1);

        assert!(matches!(
            snapshot.delta(0),
            ApplicationsDelta::FullSnapshotRequired { current_version: 2 }
        ));
        assert!(matches!(
            snapshot.delta(7),
            ApplicationsDelta::FullSnapshotRequired { .. }
        ));
        assert_eq!(changes(snapshot.delta(1)).len(), 1);
    }

    #[test]
    fn snapshot_is_stale_until_rebuilt() {
        let (_clock, registry) = setup();
        let cache = ResponseCache::new(registry.clone(), CacheConfig::default());
        register(&registry, "i-1");
        assert_eq!(cache.version(), 0);
        assert!(cache.refresh());
        assert_eq!(cache.version(), 1);
        assert!(!cache.refresh());
    }

    #[test]
    fn payloads_are_memoized_per_key() {
        let (_clock, registry) = setup();
        register(&registry, "i-1");
        let cache = ResponseCache::new(registry.clone(), CacheConfig::default());

        let first = cache.applications(Format::Json, Encoding::Identity).unwrap();
        let second = cache.applications(Format::Json, Encoding::Identity).unwrap();
        assert_eq!(first.body.as_ptr(), second.body.as_ptr());
        assert_eq!(cache.stats(), (1, 1));

        let gz = cache.applications(Format::Json, Encoding::Gzip).unwrap();
        assert_ne!(gz.body, first.body);
        assert_eq!(cache.stats(), (1, 2));

        let parsed: Applications = serde_json::from_slice(&first.body).unwrap();
        assert_eq!(parsed.instance_count(), 1);
        assert_eq!(parsed.version, 1);
    }

    #[test]
    fn application_lookup_is_case_insensitive() {
        let (_clock, registry) = setup();
        register(&registry, "i-1");
        let cache = ResponseCache::new(registry.clone(), CacheConfig::default());
        assert!(cache
            .application("Billing", Format::Yaml, Encoding::Identity)
            .unwrap()
            .is_some());
        assert!(cache
            .application("search", Format::Json, Encoding::Identity)
            .unwrap()
            .is_none());
    }

    #[test]
    fn delta_payload_carries_fallback_kind() {
        let (_clock, registry) = setup();
        let cache = ResponseCache::new(registry.clone(), CacheConfig::default());
        let payload = cache.delta(42, Format::Json, Encoding::Identity).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&payload.body).unwrap();
        assert_eq!(value["kind"], "full_snapshot_required");
    }

    #[test]
    fn refresh_mode_parse() {
        assert_eq!(RefreshMode::parse("on-dirty").unwrap(), RefreshMode::OnDirty);
        assert_eq!(RefreshMode::parse("Interval").unwrap(), RefreshMode::Interval);
        assert!(RefreshMode::parse("never").is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn on_dirty_mode_rebuilds_after_changes() {
        let (_clock, registry) = setup();
        let cache = Arc::new(ResponseCache::new(
            registry.clone(),
            CacheConfig {
                refresh_interval: Duration::from_secs(3600),
                mode: RefreshMode::OnDirty,
                debounce: Duration::from_millis(50),
            },
        ));
        let handle = cache.clone().start();
        tokio::time::sleep(Duration::from_millis(10)).await;

        register(&registry, "i-1");
        register(&registry, "i-2");
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(cache.version(), 2);
        handle.abort();
    }
}
