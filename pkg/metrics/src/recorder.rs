use pkg_state::events::{EventBus, RegistryEvent};
use pkg_types::instance::ActionType;
use pkg_types::replication::ReplicationAction;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use crate::MetricsRegistry;

pub const REGISTRATIONS: &str = "regis_registrations_total";
pub const RENEWALS: &str = "regis_renewals_total";
pub const STATUS_UPDATES: &str = "regis_status_updates_total";
pub const CANCELLATIONS: &str = "regis_cancellations_total";
pub const EVICTIONS: &str = "regis_evictions_total";
pub const EVICTION_CYCLES: &str = "regis_eviction_cycles_total";
pub const EVICTION_CYCLES_SUSPENDED: &str = "regis_eviction_cycles_suspended_total";
pub const REPLICATED_ITEMS: &str = "regis_replication_items_sent_total";
pub const REPLICATION_FAILURES: &str = "regis_replication_failures_total";
pub const REPLICATION_DROPS: &str = "regis_replication_dropped_total";
pub const CACHE_REBUILDS: &str = "regis_cache_rebuilds_total";
pub const EVENTS_LAGGED: &str = "regis_metrics_events_lagged_total";
pub const SELF_PRESERVATION: &str = "regis_self_preservation_active";
pub const REGISTRY_VERSION: &str = "regis_registry_version";
pub const INSTANCES: &str = "regis_instances";
pub const RENEWS_LAST_MIN: &str = "regis_renews_last_minute";

/// Register every metric the recorder updates.
pub fn register_metrics(metrics: &MetricsRegistry) {
    metrics.register_counter(REGISTRATIONS, "Instance registrations applied, local and replicated");
    metrics.register_counter(RENEWALS, "Lease renewals applied, local and replicated");
    metrics.register_counter(
        STATUS_UPDATES,
        "Status changes and override removals applied, local and replicated",
    );
    metrics.register_counter(CANCELLATIONS, "Leases removed by cancel or eviction");
    metrics.register_counter(EVICTIONS, "Leases removed because they expired");
    metrics.register_counter(EVICTION_CYCLES, "Eviction cycles run");
    metrics.register_counter(
        EVICTION_CYCLES_SUSPENDED,
        "Eviction cycles skipped by warm-up or self-preservation",
    );
    metrics.register_counter(REPLICATED_ITEMS, "Items delivered to peers");
    metrics.register_counter(REPLICATION_FAILURES, "Replication batches dropped after failing");
    metrics.register_counter(REPLICATION_DROPS, "Replication items dropped on queue overflow");
    metrics.register_counter(CACHE_REBUILDS, "Response cache rebuilds");
    metrics.register_counter(EVENTS_LAGGED, "Registry events missed by the metrics recorder");
    metrics.register_gauge(SELF_PRESERVATION, "1 while self-preservation suspends eviction");
    metrics.register_gauge(REGISTRY_VERSION, "Latest registry version seen");
    metrics.register_gauge(INSTANCES, "Registered instances");
    metrics.register_gauge(RENEWS_LAST_MIN, "Renewals counted in the last completed minute");
}

/// Apply one registry event to the metrics.
pub fn record(metrics: &MetricsRegistry, event: &RegistryEvent) {
    match event {
        RegistryEvent::Changed {
            version,
            action,
            operation,
            ..
        } => {
            match (action, operation) {
                (ActionType::Deleted, _) => metrics.counter_inc(CANCELLATIONS),
                (_, ReplicationAction::StatusUpdate | ReplicationAction::DeleteStatusOverride) => {
                    metrics.counter_inc(STATUS_UPDATES)
                }
                _ => metrics.counter_inc(REGISTRATIONS),
            }
            metrics.gauge_set(REGISTRY_VERSION, *version as i64);
        }
        RegistryEvent::Renewed { .. } => metrics.counter_inc(RENEWALS),
        RegistryEvent::Evicted { .. } => metrics.counter_inc(EVICTIONS),
        RegistryEvent::EvictionCycle { suspended, .. } => {
            metrics.counter_inc(EVICTION_CYCLES);
            if *suspended {
                metrics.counter_inc(EVICTION_CYCLES_SUSPENDED);
            }
        }
        RegistryEvent::SelfPreservationChanged { active } => {
            metrics.gauge_set(SELF_PRESERVATION, i64::from(*active));
        }
        RegistryEvent::ReplicationSent { items, .. } => {
            metrics.counter_add(REPLICATED_ITEMS, *items as u64);
        }
        RegistryEvent::ReplicationFailed { .. } => metrics.counter_inc(REPLICATION_FAILURES),
        RegistryEvent::ReplicationDropped { items, .. } => {
            metrics.counter_add(REPLICATION_DROPS, *items as u64);
        }
        RegistryEvent::CacheRebuilt { .. } => metrics.counter_inc(CACHE_REBUILDS),
    }
}

/// Start the recorder loop as a background task.
pub fn start(metrics: Arc<MetricsRegistry>, events: &EventBus) -> tokio::task::JoinHandle<()> {
    register_metrics(&metrics);
    let mut event_rx = events.subscribe();
    tokio::spawn(async move {
        info!("MetricsRecorder started");
        loop {
            match event_rx.recv().await {
                Ok(event) => record(&metrics, &event),
                Err(RecvError::Lagged(n)) => {
                    warn!("MetricsRecorder lagged, missed {} events", n);
                    metrics.counter_add(EVENTS_LAGGED, n);
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn records_lifecycle_events() {
        let metrics = MetricsRegistry::new();
        register_metrics(&metrics);
        record(
            &metrics,
            &RegistryEvent::Changed {
                version: 4,
                action: ActionType::Added,
                operation: ReplicationAction::Register,
                app_name: "BILLING".into(),
                instance_id: "i-1".into(),
                replicated: false,
            },
        );
        record(
            &metrics,
            &RegistryEvent::Evicted {
                app_name: "BILLING".into(),
                instance_id: "i-1".into(),
            },
        );
        record(&metrics, &RegistryEvent::SelfPreservationChanged { active: true });
        record(
            &metrics,
            &RegistryEvent::EvictionCycle {
                expired: 3,
                evicted: 0,
                suspended: true,
            },
        );

        assert_eq!(metrics.counter_get(REGISTRATIONS), Some(1));
        assert_eq!(metrics.counter_get(EVICTIONS), Some(1));
        assert_eq!(metrics.counter_get(EVICTION_CYCLES_SUSPENDED), Some(1));
        assert_eq!(metrics.gauge_get(SELF_PRESERVATION), Some(1));
        assert_eq!(metrics.gauge_get(REGISTRY_VERSION), Some(4));
    }

    #[test]
    fn status_changes_are_not_registrations() {
        let metrics = MetricsRegistry::new();
        register_metrics(&metrics);
        let changed = |version, operation| RegistryEvent::Changed {
            version,
            action: ActionType::Modified,
            operation,
            app_name: "BILLING".into(),
            instance_id: "i-1".into(),
            replicated: false,
        };
        record(&metrics, &changed(1, ReplicationAction::Register));
        record(&metrics, &changed(2, ReplicationAction::StatusUpdate));
        record(&metrics, &changed(3, ReplicationAction::DeleteStatusOverride));

        assert_eq!(metrics.counter_get(REGISTRATIONS), Some(1));
        assert_eq!(metrics.counter_get(STATUS_UPDATES), Some(2));
        assert_eq!(metrics.counter_get(CANCELLATIONS), Some(0));
    }

    #[tokio::test]
    async fn recorder_task_consumes_the_bus() {
        let bus = EventBus::new(16);
        let metrics = Arc::new(MetricsRegistry::new());
        let handle = start(metrics.clone(), &bus);

        bus.emit(RegistryEvent::ReplicationSent {
            peer: "a:1".into(),
            items: 5,
        });
        for _ in 0..50 {
            if metrics.counter_get(REPLICATED_ITEMS) == Some(5) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(metrics.counter_get(REPLICATED_ITEMS), Some(5));
        handle.abort();
    }
}
