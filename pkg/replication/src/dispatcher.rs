use parking_lot::RwLock;
use pkg_constants::replication::{
    BATCHING_DELAY_MS, MAX_BATCH_SIZE, MAX_RETRIES, PEER_QUEUE_CAPACITY,
    PEER_REFRESH_INTERVAL_SECS, RETRY_BACKOFF_MS,
};
use pkg_state::events::{EventBus, RegistryEvent};
use pkg_state::registry::{InstanceRegistry, PeerHealth, ReplicationSink};
use pkg_types::replication::{
    ItemOutcome, PeerEndpoint, ReplicationAction, ReplicationBatch, ReplicationBatchResponse,
    ReplicationItem,
};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::client::{PeerClient, ReplicationError};
use crate::discovery::PeerDiscovery;
use crate::queue::BatchingQueue;

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub queue_capacity: usize,
    pub max_batch_size: usize,
    pub batching_delay: Duration,
    /// Retries after the first failed send of a batch.
    pub max_retries: u32,
    /// First retry delay; doubled on every further attempt.
    pub retry_backoff: Duration,
    pub refresh_interval: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            queue_capacity: PEER_QUEUE_CAPACITY,
            max_batch_size: MAX_BATCH_SIZE,
            batching_delay: Duration::from_millis(BATCHING_DELAY_MS),
            max_retries: MAX_RETRIES,
            retry_backoff: Duration::from_millis(RETRY_BACKOFF_MS),
            refresh_interval: Duration::from_secs(PEER_REFRESH_INTERVAL_SECS),
        }
    }
}

#[derive(Debug)]
struct PeerStats {
    healthy: AtomicBool,
    sent_batches: AtomicU64,
    sent_items: AtomicU64,
    failed_batches: AtomicU64,
    dropped_items: AtomicU64,
}

impl Default for PeerStats {
    fn default() -> Self {
        Self {
            healthy: AtomicBool::new(true),
            sent_batches: AtomicU64::new(0),
            sent_items: AtomicU64::new(0),
            failed_batches: AtomicU64::new(0),
            dropped_items: AtomicU64::new(0),
        }
    }
}

/// Replication state of one peer, for the status endpoint.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PeerStatus {
    pub peer: String,
    pub healthy: bool,
    pub queued: usize,
    pub sent_batches: u64,
    pub sent_items: u64,
    pub failed_batches: u64,
    pub dropped_items: u64,
}

struct PeerWorker {
    queue: Arc<BatchingQueue>,
    stats: Arc<PeerStats>,
    handle: tokio::task::JoinHandle<()>,
}

struct DispatcherInner {
    config: DispatcherConfig,
    client: Arc<dyn PeerClient>,
    discovery: Arc<dyn PeerDiscovery>,
    events: EventBus,
    registry: OnceLock<Weak<InstanceRegistry>>,
    /// Read-locked on every fan-out; write-locked only when the peer set changes.
    workers: RwLock<HashMap<PeerEndpoint, PeerWorker>>,
}

/// Fans local mutations out to every peer.
///
/// Each peer has its own bounded queue and worker task, so a slow or dead
/// peer only ever backs up its own queue.
#[derive(Clone)]
pub struct ReplicationDispatcher {
    inner: Arc<DispatcherInner>,
}

impl ReplicationDispatcher {
    pub fn new(
        config: DispatcherConfig,
        client: Arc<dyn PeerClient>,
        discovery: Arc<dyn PeerDiscovery>,
        events: EventBus,
    ) -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                config,
                client,
                discovery,
                events,
                registry: OnceLock::new(),
                workers: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Become `registry`'s replication sink. Conflicting records reported by
    /// peers are written back into it.
    pub fn attach(&self, registry: &Arc<InstanceRegistry>) {
        let _ = self.inner.registry.set(Arc::downgrade(registry));
        if !registry.set_replication_sink(Arc::new(self.clone())) {
            warn!("Registry already has a replication sink; dispatcher not attached");
        }
    }

    /// Start the peer refresh loop. Workers for the initial peer set are
    /// spawned immediately.
    pub fn start(&self) -> tokio::task::JoinHandle<()> {
        let dispatcher = self.clone();
        tokio::spawn(async move {
            info!(
                "ReplicationDispatcher started (refresh={}s, batch={}, retries={})",
                dispatcher.inner.config.refresh_interval.as_secs(),
                dispatcher.inner.config.max_batch_size,
                dispatcher.inner.config.max_retries
            );
            let mut interval = tokio::time::interval(dispatcher.inner.config.refresh_interval);
            loop {
                interval.tick().await;
                dispatcher.sync_peers();
            }
        })
    }

    /// Reconcile workers with the discovered peer set. Workers of departed
    /// peers are aborted and their queues discarded.
    pub fn sync_peers(&self) {
        let desired: HashSet<PeerEndpoint> = self.inner.discovery.peers().into_iter().collect();
        {
            let workers = self.inner.workers.read();
            if workers.len() == desired.len() && desired.iter().all(|p| workers.contains_key(p)) {
                return;
            }
        }
        let mut workers = self.inner.workers.write();

        workers.retain(|peer, worker| {
            if desired.contains(peer) {
                return true;
            }
            worker.handle.abort();
            info!(
                "Peer {} removed; discarding {} queued items",
                peer,
                worker.queue.len()
            );
            false
        });

        for peer in desired {
            if workers.contains_key(&peer) {
                continue;
            }
            let queue = Arc::new(BatchingQueue::new(self.inner.config.queue_capacity));
            let stats = Arc::new(PeerStats::default());
            let handle = tokio::spawn(run_worker(
                self.inner.clone(),
                peer.clone(),
                queue.clone(),
                stats.clone(),
            ));
            info!("Replicating to peer {}", peer);
            workers.insert(
                peer,
                PeerWorker {
                    queue,
                    stats,
                    handle,
                },
            );
        }
    }

    pub fn peer_statuses(&self) -> Vec<PeerStatus> {
        let workers = self.inner.workers.read();
        let mut statuses: Vec<PeerStatus> = workers
            .iter()
            .map(|(peer, worker)| PeerStatus {
                peer: peer.to_string(),
                healthy: worker.stats.healthy.load(Ordering::Relaxed),
                queued: worker.queue.len(),
                sent_batches: worker.stats.sent_batches.load(Ordering::Relaxed),
                sent_items: worker.stats.sent_items.load(Ordering::Relaxed),
                failed_batches: worker.stats.failed_batches.load(Ordering::Relaxed),
                dropped_items: worker.stats.dropped_items.load(Ordering::Relaxed),
            })
            .collect();
        statuses.sort_by(|a, b| a.peer.cmp(&b.peer));
        statuses
    }

    /// Stop every worker and the queues with them.
    pub fn shutdown(&self) {
        for (_, worker) in self.inner.workers.write().drain() {
            worker.handle.abort();
        }
    }
}

impl DispatcherInner {
    fn enqueue(&self, peer: &PeerEndpoint, item: ReplicationItem) {
        let workers = self.workers.read();
        if let Some(worker) = workers.get(peer) {
            push_item(&self.events, peer, worker, item);
        }
    }

    fn adopt(&self, record: pkg_types::instance::InstanceRecord, lease_duration_secs: Option<u64>) {
        let Some(registry) = self.registry.get().and_then(Weak::upgrade) else {
            return;
        };
        let key = format!("{}/{}", record.app_name, record.instance_id);
        // Adopting the peer's record must not change our lease's TTL.
        let duration = registry
            .get_lease(&record.app_name, &record.instance_id)
            .map(|lease| lease.duration_secs)
            .or(lease_duration_secs);
        if let Err(e) = registry.register(record, duration, true) {
            warn!("Failed to adopt newer record of {} from peer: {}", key, e);
        }
    }
}

fn push_item(events: &EventBus, peer: &PeerEndpoint, worker: &PeerWorker, item: ReplicationItem) {
    let dropped = worker.queue.push(item);
    if dropped > 0 {
        worker
            .stats
            .dropped_items
            .fetch_add(dropped as u64, Ordering::Relaxed);
        warn!("Replication queue for {} is full; dropped {} items", peer, dropped);
        events.emit(RegistryEvent::ReplicationDropped {
            peer: peer.to_string(),
            items: dropped,
        });
    }
}

impl ReplicationSink for ReplicationDispatcher {
    fn replicate(&self, item: ReplicationItem) {
        let workers = self.inner.workers.read();
        for (peer, worker) in workers.iter() {
            push_item(&self.inner.events, peer, worker, item.clone());
        }
    }
}

impl PeerHealth for ReplicationDispatcher {
    /// Isolated when peers are configured and none of them is reachable.
    fn is_isolated(&self) -> bool {
        let workers = self.inner.workers.read();
        !workers.is_empty()
            && workers
                .values()
                .all(|w| !w.stats.healthy.load(Ordering::Relaxed))
    }
}

async fn run_worker(
    inner: Arc<DispatcherInner>,
    peer: PeerEndpoint,
    queue: Arc<BatchingQueue>,
    stats: Arc<PeerStats>,
) {
    loop {
        queue.wait_for_items().await;
        if !inner.config.batching_delay.is_zero() {
            tokio::time::sleep(inner.config.batching_delay).await;
        }
        let items = queue.drain(inner.config.max_batch_size);
        if items.is_empty() {
            continue;
        }
        if !inner.discovery.peers().contains(&peer) {
            debug!("Peer {} left the peer set; discarding {} items", peer, items.len());
            continue;
        }
        let batch = ReplicationBatch { items };
        if let Some(response) = send_with_retry(&inner, &peer, &stats, &batch).await {
            handle_results(&inner, &peer, batch.items, response);
        }
    }
}

fn set_health(peer: &PeerEndpoint, stats: &PeerStats, healthy: bool) {
    let was = stats.healthy.swap(healthy, Ordering::Relaxed);
    if was != healthy {
        if healthy {
            info!("Peer {} is reachable again", peer);
        } else {
            warn!("Peer {} marked unhealthy", peer);
        }
    }
}

async fn send_with_retry(
    inner: &DispatcherInner,
    peer: &PeerEndpoint,
    stats: &PeerStats,
    batch: &ReplicationBatch,
) -> Option<ReplicationBatchResponse> {
    let mut attempt: u32 = 0;
    loop {
        match inner.client.send_batch(peer, batch).await {
            Ok(response) => {
                stats.sent_batches.fetch_add(1, Ordering::Relaxed);
                stats
                    .sent_items
                    .fetch_add(batch.items.len() as u64, Ordering::Relaxed);
                set_health(peer, stats, true);
                inner.events.emit(RegistryEvent::ReplicationSent {
                    peer: peer.to_string(),
                    items: batch.items.len(),
                });
                return Some(response);
            }
            Err(e) if e.is_transient() && attempt < inner.config.max_retries => {
                let backoff = inner.config.retry_backoff * 2u32.saturating_pow(attempt);
                attempt += 1;
                debug!(
                    "Replication to {} failed (attempt {}/{}), retrying in {}ms: {}",
                    peer,
                    attempt,
                    inner.config.max_retries,
                    backoff.as_millis(),
                    e
                );
                tokio::time::sleep(backoff).await;
            }
            Err(e) => {
                stats.failed_batches.fetch_add(1, Ordering::Relaxed);
                if matches!(e, ReplicationError::Transient { .. }) {
                    set_health(peer, stats, false);
                }
                warn!(
                    "Dropping batch of {} items for {} after {} attempts: {}",
                    batch.items.len(),
                    peer,
                    attempt + 1,
                    e
                );
                let action = batch
                    .items
                    .first()
                    .map(|i| i.action)
                    .unwrap_or(ReplicationAction::Heartbeat);
                inner.events.emit(RegistryEvent::ReplicationFailed {
                    peer: peer.to_string(),
                    action,
                    reason: e.to_string(),
                });
                return None;
            }
        }
    }
}

fn handle_results(
    inner: &DispatcherInner,
    peer: &PeerEndpoint,
    items: Vec<ReplicationItem>,
    response: ReplicationBatchResponse,
) {
    if response.results.len() != items.len() {
        warn!(
            "Peer {} answered {} results for {} items",
            peer,
            response.results.len(),
            items.len()
        );
    }
    for (item, outcome) in items.into_iter().zip(response.results) {
        match outcome {
            ItemOutcome::Success => {}
            ItemOutcome::NotFound => {
                if item.action == ReplicationAction::Heartbeat && item.record.is_some() {
                    debug!(
                        "Peer {} does not know {}/{}; re-sending registration",
                        peer, item.app_name, item.instance_id
                    );
                    inner.enqueue(
                        peer,
                        ReplicationItem {
                            action: ReplicationAction::Register,
                            ..item
                        },
                    );
                }
            }
            ItemOutcome::Conflict { record } => {
                if let Some(record) = record {
                    info!(
                        "Peer {} holds a newer record of {}/{}; adopting it",
                        peer, item.app_name, item.instance_id
                    );
                    inner.adopt(record, item.lease_duration_secs);
                }
            }
            ItemOutcome::Rejected { reason } => {
                warn!(
                    "Peer {} rejected {} for {}/{}: {}",
                    peer, item.action, item.app_name, item.instance_id, reason
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::StaticPeers;
    use crate::receiver::apply_batch;
    use async_trait::async_trait;
    use pkg_state::clock::ManualClock;
    use pkg_state::registry::RegistryConfig;
    use parking_lot::Mutex;
    use pkg_types::instance::InstanceRecord;
    use std::sync::atomic::AtomicUsize;

    /// Delivers batches straight into in-process registries.
    #[derive(Default)]
    struct LocalClient {
        nodes: Mutex<HashMap<PeerEndpoint, Arc<InstanceRegistry>>>,
        items_sent: AtomicUsize,
    }

    #[async_trait]
    impl PeerClient for LocalClient {
        async fn send_batch(
            &self,
            peer: &PeerEndpoint,
            batch: &ReplicationBatch,
        ) -> Result<ReplicationBatchResponse, ReplicationError> {
            self.items_sent.fetch_add(batch.items.len(), Ordering::SeqCst);
            let node = self.nodes.lock().get(peer).cloned();
            match node {
                Some(registry) => Ok(apply_batch(&registry, batch)),
                None => Err(ReplicationError::Transient {
                    peer: peer.to_string(),
                    reason: "unknown node".to_string(),
                }),
            }
        }
    }

    struct FailingClient {
        attempts: AtomicUsize,
        transient: bool,
    }

    #[async_trait]
    impl PeerClient for FailingClient {
        async fn send_batch(
            &self,
            peer: &PeerEndpoint,
            _batch: &ReplicationBatch,
        ) -> Result<ReplicationBatchResponse, ReplicationError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            let reason = "boom".to_string();
            if self.transient {
                Err(ReplicationError::Transient {
                    peer: peer.to_string(),
                    reason,
                })
            } else {
                Err(ReplicationError::Permanent {
                    peer: peer.to_string(),
                    reason,
                })
            }
        }
    }

    fn fast_config() -> DispatcherConfig {
        DispatcherConfig {
            batching_delay: Duration::from_millis(10),
            retry_backoff: Duration::from_millis(10),
            ..DispatcherConfig::default()
        }
    }

    fn new_registry() -> Arc<InstanceRegistry> {
        Arc::new(InstanceRegistry::new(
            RegistryConfig::default(),
            Arc::new(ManualClock::new(1_000_000)),
            EventBus::new(256),
        ))
    }

    fn record(id: &str) -> InstanceRecord {
        InstanceRecord::new("billing", id, "10.0.0.1", 8080)
    }

    struct Ring {
        client: Arc<LocalClient>,
        nodes: Vec<(Arc<InstanceRegistry>, ReplicationDispatcher)>,
    }

    fn ring(n: usize) -> Ring {
        let client = Arc::new(LocalClient::default());
        let endpoints: Vec<PeerEndpoint> =
            (0..n).map(|i| PeerEndpoint::new("node", 9000 + i as u16)).collect();
        let mut nodes = Vec::new();
        for (i, endpoint) in endpoints.iter().enumerate() {
            let registry = new_registry();
            client.nodes.lock().insert(endpoint.clone(), registry.clone());
            let others = endpoints
                .iter()
                .enumerate()
                .filter(|(j, _)| *j != i)
                .map(|(_, e)| e.clone())
                .collect();
            let dispatcher = ReplicationDispatcher::new(
                fast_config(),
                client.clone(),
                Arc::new(StaticPeers::new(others)),
                registry.events().clone(),
            );
            dispatcher.attach(&registry);
            dispatcher.sync_peers();
            nodes.push((registry, dispatcher));
        }
        Ring { client, nodes }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_secs(2)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn fan_out_shares_the_worker_map() {
        let registry = new_registry();
        let peer = PeerEndpoint::new("node", 9100);
        let dispatcher = ReplicationDispatcher::new(
            fast_config(),
            Arc::new(LocalClient::default()),
            Arc::new(StaticPeers::new(vec![peer])),
            registry.events().clone(),
        );
        dispatcher.sync_peers();

        {
            let _reader = dispatcher.inner.workers.read();
            dispatcher.replicate(ReplicationItem::new(
                ReplicationAction::Register,
                &record("i-1"),
                1,
            ));
            assert_eq!(dispatcher.peer_statuses()[0].queued, 1);
        }

        // An unchanged peer set keeps the worker and its queue.
        dispatcher.sync_peers();
        let statuses = dispatcher.peer_statuses();
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].queued, 1);
        dispatcher.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn three_node_ring_does_not_loop() {
        let ring = ring(3);
        let (origin, _) = &ring.nodes[0];

        origin.register(record("i-1"), None, false).unwrap();
        settle().await;
        assert_eq!(ring.client.items_sent.load(Ordering::SeqCst), 2);
        for (registry, _) in &ring.nodes {
            assert!(registry.get_instance("billing", "i-1").is_some());
        }

        origin.renew("billing", "i-1", false);
        origin.cancel("billing", "i-1", false);
        settle().await;
        // Heartbeat and cancel coalesce into one item per peer.
        assert_eq!(ring.client.items_sent.load(Ordering::SeqCst), 4);
        for (registry, _) in &ring.nodes {
            assert!(registry.get_instance("billing", "i-1").is_none());
        }
        settle().await;
        assert_eq!(ring.client.items_sent.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_unknown_to_peer_is_re_registered() {
        let ring = ring(2);
        let (local, _) = &ring.nodes[0];
        let (remote, _) = &ring.nodes[1];

        // Known locally only, as after a lost registration.
        local.register(record("i-1"), Some(30), true).unwrap();
        assert!(remote.get_instance("billing", "i-1").is_none());

        assert!(local.renew("billing", "i-1", false));
        settle().await;
        let lease = remote.get_lease("billing", "i-1").unwrap();
        assert_eq!(lease.duration_secs, 30);
    }

    #[tokio::test(start_paused = true)]
    async fn conflict_adopts_the_peers_newer_record() {
        let ring = ring(2);
        let (local, _) = &ring.nodes[0];
        let (remote, _) = &ring.nodes[1];

        let mut older = record("i-1");
        older.last_dirty_timestamp = 5_000;
        local.register(older, Some(30), true).unwrap();
        let mut newer = record("i-1");
        newer.last_dirty_timestamp = 9_000;
        newer.host_name = "moved".to_string();
        remote.register(newer, None, true).unwrap();

        assert!(local.renew("billing", "i-1", false));
        settle().await;
        let adopted = local.get_instance("billing", "i-1").unwrap();
        assert_eq!(adopted.host_name, "moved");
        assert_eq!(adopted.last_dirty_timestamp, 9_000);
        assert_eq!(local.get_lease("billing", "i-1").unwrap().duration_secs, 30);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_retry_then_drop() {
        let registry = new_registry();
        let client = Arc::new(FailingClient {
            attempts: AtomicUsize::new(0),
            transient: true,
        });
        let dispatcher = ReplicationDispatcher::new(
            fast_config(),
            client.clone(),
            Arc::new(StaticPeers::new(vec![PeerEndpoint::new("peer", 1)])),
            registry.events().clone(),
        );
        dispatcher.attach(&registry);
        dispatcher.sync_peers();
        let mut events = registry.events().subscribe();
        assert!(!dispatcher.is_isolated());

        registry.register(record("i-1"), None, false).unwrap();
        settle().await;

        assert_eq!(client.attempts.load(Ordering::SeqCst), 1 + MAX_RETRIES as usize);
        let status = &dispatcher.peer_statuses()[0];
        assert_eq!(status.failed_batches, 1);
        assert!(!status.healthy);
        assert!(dispatcher.is_isolated());

        let mut failed = false;
        while let Ok(event) = events.try_recv() {
            if matches!(event, RegistryEvent::ReplicationFailed { .. }) {
                failed = true;
            }
        }
        assert!(failed);
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_failure_is_not_retried() {
        let registry = new_registry();
        let client = Arc::new(FailingClient {
            attempts: AtomicUsize::new(0),
            transient: false,
        });
        let dispatcher = ReplicationDispatcher::new(
            fast_config(),
            client.clone(),
            Arc::new(StaticPeers::new(vec![PeerEndpoint::new("peer", 1)])),
            registry.events().clone(),
        );
        dispatcher.attach(&registry);
        dispatcher.sync_peers();

        registry.register(record("i-1"), None, false).unwrap();
        settle().await;
        assert_eq!(client.attempts.load(Ordering::SeqCst), 1);
        assert!(dispatcher.peer_statuses()[0].healthy);
    }

    #[tokio::test(start_paused = true)]
    async fn removed_peer_loses_its_worker() {
        let registry = new_registry();
        let discovery = Arc::new(StaticPeers::new(vec![
            PeerEndpoint::new("a", 1),
            PeerEndpoint::new("b", 2),
        ]));
        let dispatcher = ReplicationDispatcher::new(
            fast_config(),
            Arc::new(LocalClient::default()),
            discovery.clone(),
            registry.events().clone(),
        );
        dispatcher.sync_peers();
        assert_eq!(dispatcher.peer_statuses().len(), 2);

        discovery.set(vec![PeerEndpoint::new("b", 2)]);
        dispatcher.sync_peers();
        let statuses = dispatcher.peer_statuses();
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].peer, "b:2");
    }

    #[test]
    fn no_peers_is_not_isolation() {
        let dispatcher = ReplicationDispatcher::new(
            DispatcherConfig::default(),
            Arc::new(LocalClient::default()),
            Arc::new(StaticPeers::default()),
            EventBus::new(4),
        );
        assert!(!dispatcher.is_isolated());
    }
}
