use pkg_constants::lease::{DEFAULT_LEASE_DURATION_SECS, DEFAULT_RENEWAL_INTERVAL_SECS};
use pkg_constants::registry::{
    EVICTION_CAP_PERCENT, EVICTION_INTERVAL_SECS, RENEWAL_PERCENT_THRESHOLD,
};
use pkg_state::events::RegistryEvent;
use pkg_state::registry::{InstanceRegistry, PeerHealth};
use rand::seq::SliceRandom;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::preservation::{EvictionMode, PreservationStatus, SelfPreservation};

#[derive(Debug, Clone)]
pub struct EvictionConfig {
    pub interval: Duration,
    pub renewal_percent_threshold: f64,
    /// Fraction of the registry one cycle may evict.
    pub cap_percent: f64,
    pub self_preservation: bool,
    /// Eviction is suspended for this long after start.
    pub warmup: Duration,
    /// Renewal interval clients are expected to use, for the renewal threshold.
    pub expected_renewal_interval_secs: u64,
}

impl Default for EvictionConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(EVICTION_INTERVAL_SECS),
            renewal_percent_threshold: RENEWAL_PERCENT_THRESHOLD,
            cap_percent: EVICTION_CAP_PERCENT,
            self_preservation: true,
            warmup: Duration::from_secs(DEFAULT_LEASE_DURATION_SECS),
            expected_renewal_interval_secs: DEFAULT_RENEWAL_INTERVAL_SECS,
        }
    }
}

/// Outcome of one eviction cycle.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EvictionReport {
    pub mode: EvictionMode,
    pub expired: usize,
    pub cap: usize,
    pub evicted: usize,
    pub compensation_ms: i64,
}

/// Upper bound of evictions for one cycle over a registry of `size` leases.
pub fn eviction_cap(size: usize, cap_percent: f64) -> usize {
    ((size as f64 * cap_percent).round() as usize).max(1)
}

/// Controller that removes expired leases.
///
/// Every cycle first re-evaluates self-preservation; expired leases are only
/// evicted in `Normal` mode, and at most `eviction_cap` of them per cycle.
pub struct EvictionController {
    registry: Arc<InstanceRegistry>,
    config: EvictionConfig,
    peer_health: Option<Arc<dyn PeerHealth>>,
    state: SelfPreservation,
    status_tx: watch::Sender<PreservationStatus>,
    last_cycle_at: Option<i64>,
}

impl EvictionController {
    pub fn new(
        registry: Arc<InstanceRegistry>,
        config: EvictionConfig,
        peer_health: Option<Arc<dyn PeerHealth>>,
    ) -> Self {
        let warmup_until = registry.started_at() + config.warmup.as_millis() as i64;
        let state = SelfPreservation::new(
            config.self_preservation,
            config.renewal_percent_threshold,
            config.expected_renewal_interval_secs,
            warmup_until,
        );
        let (status_tx, _) = watch::channel(state.status().clone());
        Self {
            registry,
            config,
            peer_health,
            state,
            status_tx,
            last_cycle_at: None,
        }
    }

    /// Observe self-preservation status changes.
    pub fn subscribe(&self) -> watch::Receiver<PreservationStatus> {
        self.status_tx.subscribe()
    }

    /// Start the controller loop as a background task.
    pub fn start(mut self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                "EvictionController started (interval={}s, cap={}, self-preservation={})",
                self.config.interval.as_secs(),
                self.config.cap_percent,
                self.config.self_preservation
            );
            let mut interval = tokio::time::interval_at(
                tokio::time::Instant::now() + self.config.interval,
                self.config.interval,
            );
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                self.run_cycle();
            }
        })
    }

    /// How late this cycle runs relative to the configured interval.
    fn compensation_ms(&self, now: i64) -> i64 {
        match self.last_cycle_at {
            Some(last) => (now - last - self.config.interval.as_millis() as i64).max(0),
            None => 0,
        }
    }

    /// One pass: evaluate self-preservation, then evict up to the cap.
    pub fn run_cycle(&mut self) -> EvictionReport {
        let now = self.registry.now_millis();
        let compensation_ms = self.compensation_ms(now);
        self.last_cycle_at = Some(now);

        let active = self.registry.instance_count();
        let renews = self.registry.renewal_rate().last_window();
        let isolated = self
            .peer_health
            .as_ref()
            .is_some_and(|health| health.is_isolated());

        let previous = self.state.status().mode;
        let status = self.state.evaluate(now, active, renews, isolated).clone();
        if status.mode != previous {
            if status.is_active() {
                warn!(
                    "Self-preservation engaged (renews={}, threshold={}, expected={}, isolated={}); eviction suspended",
                    status.renews_last_min,
                    status.renews_threshold,
                    status.expected_renews_per_min,
                    status.isolated
                );
            } else {
                info!("Eviction mode {} -> {}", previous, status.mode);
            }
            if (previous == EvictionMode::SelfPreservation) != status.is_active() {
                self.registry
                    .events()
                    .emit(RegistryEvent::SelfPreservationChanged {
                        active: status.is_active(),
                    });
            }
        }
        self.status_tx.send_replace(status.clone());

        let mut expired = self.registry.expired_leases(now, compensation_ms);
        let cap = eviction_cap(active, self.config.cap_percent);

        if !status.eviction_allowed() {
            if !expired.is_empty() {
                debug!(
                    "Eviction suspended ({}): keeping {} expired leases",
                    status.mode,
                    expired.len()
                );
            }
            return self.finish(EvictionReport {
                mode: status.mode,
                expired: expired.len(),
                cap,
                evicted: 0,
                compensation_ms,
            });
        }

        let candidates = expired.len();
        if candidates > cap {
            warn!(
                "{} leases expired, evicting a random {} of them this cycle",
                candidates, cap
            );
            expired.shuffle(&mut rand::rng());
            expired.truncate(cap);
        }

        let evicted = expired
            .iter()
            .filter(|(app, id)| self.registry.evict(app, id, compensation_ms))
            .count();
        if evicted > 0 {
            info!(
                "Eviction cycle removed {}/{} expired leases (compensation={}ms)",
                evicted, candidates, compensation_ms
            );
        }

        self.finish(EvictionReport {
            mode: status.mode,
            expired: candidates,
            cap,
            evicted,
            compensation_ms,
        })
    }

    fn finish(&self, report: EvictionReport) -> EvictionReport {
        self.registry.prune_empty_apps();
        self.registry.events().emit(RegistryEvent::EvictionCycle {
            expired: report.expired,
            evicted: report.evicted,
            suspended: report.mode != EvictionMode::Normal,
        });
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pkg_state::clock::ManualClock;
    use pkg_state::events::EventBus;
    use pkg_state::registry::RegistryConfig;
    use pkg_types::instance::InstanceRecord;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn setup() -> (Arc<ManualClock>, Arc<InstanceRegistry>) {
        let clock = Arc::new(ManualClock::new(10_000_000));
        let registry = Arc::new(InstanceRegistry::new(
            RegistryConfig::default(),
            clock.clone(),
            EventBus::new(4096),
        ));
        (clock, registry)
    }

    fn config(self_preservation: bool) -> EvictionConfig {
        EvictionConfig {
            self_preservation,
            warmup: Duration::ZERO,
            ..EvictionConfig::default()
        }
    }

    fn register(registry: &InstanceRegistry, n: usize) {
        for i in 0..n {
            let record = InstanceRecord::new("billing", &format!("i-{}", i), "10.0.0.1", 8080);
            registry.register(record, None, false).unwrap();
        }
    }

    struct FixedHealth(AtomicBool);

    impl PeerHealth for FixedHealth {
        fn is_isolated(&self) -> bool {
            self.0.load(Ordering::SeqCst)
        }
    }

    #[test]
    fn cap_is_rounded_and_at_least_one() {
        assert_eq!(eviction_cap(1000, 0.15), 150);
        assert_eq!(eviction_cap(850, 0.15), 128);
        assert_eq!(eviction_cap(3, 0.15), 1);
        assert_eq!(eviction_cap(0, 0.15), 1);
    }

    #[test]
    fn expired_lease_is_evicted_in_one_cycle() {
        let (clock, registry) = setup();
        register(&registry, 1);
        let mut controller = EvictionController::new(registry.clone(), config(false), None);

        assert_eq!(controller.run_cycle().evicted, 0);
        clock.advance_secs(EVICTION_INTERVAL_SECS);
        assert!(registry.renew("billing", "i-0", false));
        assert_eq!(controller.run_cycle().evicted, 0);
        clock.advance_secs(EVICTION_INTERVAL_SECS);
        assert_eq!(controller.run_cycle().evicted, 0);

        clock.advance_secs(EVICTION_INTERVAL_SECS);
        let report = controller.run_cycle();
        assert_eq!(report.compensation_ms, 0);
        assert_eq!(report.evicted, 1);
        assert!(registry.get_instance("billing", "i-0").is_none());
    }

    #[test]
    fn cycle_prunes_applications_left_empty() {
        let (_clock, registry) = setup();
        register(&registry, 1);
        assert!(registry.cancel("billing", "i-0", false));
        assert_eq!(registry.app_count(), 1);

        let mut controller = EvictionController::new(registry.clone(), config(false), None);
        controller.run_cycle();
        assert_eq!(registry.app_count(), 0);

        register(&registry, 1);
        assert_eq!(registry.app_count(), 1);
        assert!(registry.get_instance("billing", "i-0").is_some());
    }

    #[test]
    fn self_preservation_blocks_eviction_until_renewals_return() {
        let (clock, registry) = setup();
        register(&registry, 10);
        let mut controller = EvictionController::new(registry.clone(), config(true), None);
        let status_rx = controller.subscribe();

        clock.advance_secs(DEFAULT_LEASE_DURATION_SECS + 1);
        let report = controller.run_cycle();
        assert_eq!(report.mode, EvictionMode::SelfPreservation);
        assert_eq!(report.expired, 10);
        assert_eq!(report.evicted, 0);
        assert_eq!(registry.instance_count(), 10);
        assert!(status_rx.borrow().is_active());
        assert_eq!(status_rx.borrow().renews_threshold, 17);

        let rate = registry.renewal_rate();
        for _ in 0..17 {
            rate.increment();
        }
        rate.rotate();
        let report = controller.run_cycle();
        assert_eq!(report.mode, EvictionMode::Normal);
        assert!(report.evicted > 0);
        assert!(!status_rx.borrow().is_active());
    }

    #[test]
    fn mass_expiry_is_capped_per_cycle() {
        let (clock, registry) = setup();
        register(&registry, 1000);
        let mut controller = EvictionController::new(registry.clone(), config(false), None);

        clock.advance_secs(DEFAULT_LEASE_DURATION_SECS + 10);
        for i in 900..1000 {
            assert!(registry.renew("billing", &format!("i-{}", i), false));
        }

        let mut cycles = 0;
        while registry.instance_count() > 100 {
            let size = registry.instance_count();
            let report = controller.run_cycle();
            assert!(report.evicted <= eviction_cap(size, 0.15));
            assert!(report.evicted > 0);
            cycles += 1;
            assert!(cycles < 50, "eviction did not converge");
        }
        assert!(cycles > 1);
        assert_eq!(registry.instance_count(), 100);
        for i in 900..1000 {
            assert!(registry.get_instance("billing", &format!("i-{}", i)).is_some());
        }
    }

    #[test]
    fn first_capped_cycle_evicts_exactly_cap() {
        let (clock, registry) = setup();
        register(&registry, 1000);
        let mut controller = EvictionController::new(registry.clone(), config(false), None);
        clock.advance_secs(DEFAULT_LEASE_DURATION_SECS);
        let report = controller.run_cycle();
        assert_eq!(report.expired, 1000);
        assert_eq!(report.cap, 150);
        assert_eq!(report.evicted, 150);
    }

    #[test]
    fn warm_up_suspends_eviction() {
        let (clock, registry) = setup();
        register(&registry, 1);
        let cfg = EvictionConfig {
            self_preservation: false,
            warmup: Duration::from_secs(300),
            ..EvictionConfig::default()
        };
        let mut controller = EvictionController::new(registry.clone(), cfg, None);
        let status_rx = controller.subscribe();

        clock.advance_secs(DEFAULT_LEASE_DURATION_SECS + 1);
        let report = controller.run_cycle();
        assert_eq!(report.mode, EvictionMode::WarmingUp);
        assert_eq!(report.evicted, 0);
        assert!(!status_rx.borrow().is_active());

        clock.advance_secs(300);
        assert_eq!(controller.run_cycle().evicted, 1);
    }

    #[test]
    fn isolation_from_all_peers_suspends_eviction() {
        let (clock, registry) = setup();
        register(&registry, 1);
        let health = Arc::new(FixedHealth(AtomicBool::new(true)));
        let mut controller =
            EvictionController::new(registry.clone(), config(true), Some(health.clone()));

        // Enough renewals to stay above the threshold on their own.
        let rate = registry.renewal_rate();
        for _ in 0..5 {
            rate.increment();
        }
        rate.rotate();

        clock.advance_secs(DEFAULT_LEASE_DURATION_SECS + 1);
        let report = controller.run_cycle();
        assert_eq!(report.mode, EvictionMode::SelfPreservation);
        assert_eq!(report.evicted, 0);

        health.0.store(false, Ordering::SeqCst);
        assert_eq!(controller.run_cycle().evicted, 1);
    }

    #[test]
    fn late_cycle_compensates_leases() {
        let (clock, registry) = setup();
        register(&registry, 1);
        let mut controller = EvictionController::new(registry.clone(), config(false), None);
        controller.run_cycle();

        // The evictor itself stalled for 40s past its interval.
        clock.advance_secs(EVICTION_INTERVAL_SECS + 40);
        let report = controller.run_cycle();
        assert_eq!(report.compensation_ms, 40_000);
        assert_eq!(report.evicted, 0);
    }

    #[tokio::test]
    async fn cycle_publishes_events() {
        let (clock, registry) = setup();
        register(&registry, 1);
        let mut events = registry.events().subscribe();
        let mut controller = EvictionController::new(registry.clone(), config(false), None);
        clock.advance_secs(DEFAULT_LEASE_DURATION_SECS + 1);
        controller.run_cycle();

        let mut saw_cycle = false;
        while let Ok(event) = events.try_recv() {
            if let RegistryEvent::EvictionCycle { evicted, .. } = event {
                assert_eq!(evicted, 1);
                saw_cycle = true;
            }
        }
        assert!(saw_cycle);
    }
}
