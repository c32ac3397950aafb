//! The registry store: `app -> instance -> Lease<InstanceRecord>`.
//!
//! Both levels are `DashMap`s, so the outer map is sharded by application
//! name and every application has its own sharded instance map. A mutation
//! holds a shared guard on the application's outer shard and the write lock
//! of the instance's inner shard; unrelated applications and instances never
//! wait on each other. Recent-changes log appends happen while the instance
//! entry is still locked, so per-instance log order equals apply order.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use dashmap::mapref::one::Ref;
use parking_lot::Mutex;
use pkg_constants::lease::DEFAULT_LEASE_DURATION_SECS;
use pkg_constants::registry::{
    DELTA_RETENTION_SECS, RECENT_ACTIVITY_QUEUE_SIZE, RECENT_CHANGES_MAX_ENTRIES,
};
use pkg_types::application::{Application, Applications};
use pkg_types::instance::{ActionType, InstanceRecord, InstanceStatus};
use pkg_types::replication::{ReplicationAction, ReplicationItem};
use pkg_types::validate::{
    validate_app_name, validate_instance_id, validate_lease_duration, validate_record,
};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::events::{EventBus, RegistryEvent};
use crate::lease::Lease;
use crate::rate::MeasuredRate;
use crate::recent::RecentChangesLog;

type AppLeases = DashMap<String, Lease<InstanceRecord>>;

/// Tunables of the registry store.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Lease duration used when neither the call nor the record names one.
    pub default_lease_duration_secs: u64,
    /// How long recent-changes entries are retained for delta readers.
    pub delta_retention_secs: u64,
    pub recent_changes_max_entries: usize,
    pub recent_activity_queue_size: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            default_lease_duration_secs: DEFAULT_LEASE_DURATION_SECS,
            delta_retention_secs: DELTA_RETENTION_SECS,
            recent_changes_max_entries: RECENT_CHANGES_MAX_ENTRIES,
            recent_activity_queue_size: RECENT_ACTIVITY_QUEUE_SIZE,
        }
    }
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("invalid request: {0}")]
    Invalid(String),
}

/// Result code of a registry operation, mapped by the transport to its own
/// status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OpResult {
    Success,
    NotFound,
    Conflict,
}

/// Result of a heartbeat that carries the caller's record version.
#[derive(Debug, Clone, PartialEq)]
pub enum RenewOutcome {
    Renewed,
    /// Unknown instance, or the caller holds a newer record: re-register.
    NotFound,
    /// The caller's record is older than ours; ours is returned to adopt.
    Conflict(InstanceRecord),
}

/// Receives every local mutation for propagation to peers.
pub trait ReplicationSink: Send + Sync {
    fn replicate(&self, item: ReplicationItem);
}

/// Answers whether this node can currently reach any of its peers.
pub trait PeerHealth: Send + Sync {
    fn is_isolated(&self) -> bool;
}

/// A registration or cancellation shown on the status view.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RecentActivity {
    pub timestamp: i64,
    pub app_name: String,
    pub instance_id: String,
}

/// Concurrent in-memory registry of leased instances.
pub struct InstanceRegistry {
    config: RegistryConfig,
    apps: DashMap<String, AppLeases>,
    overridden_statuses: DashMap<(String, String), InstanceStatus>,
    recent: RecentChangesLog,
    renewals: Arc<MeasuredRate>,
    recently_registered: Mutex<VecDeque<RecentActivity>>,
    recently_canceled: Mutex<VecDeque<RecentActivity>>,
    dirty: AtomicBool,
    clock: Arc<dyn Clock>,
    events: EventBus,
    sink: OnceLock<Arc<dyn ReplicationSink>>,
    started_at: i64,
}

fn normalize_app(app: &str) -> String {
    app.to_ascii_uppercase()
}

fn push_bounded(queue: &Mutex<VecDeque<RecentActivity>>, item: RecentActivity, cap: usize) {
    let mut queue = queue.lock();
    queue.push_back(item);
    while queue.len() > cap {
        queue.pop_front();
    }
}

impl InstanceRegistry {
    pub fn new(config: RegistryConfig, clock: Arc<dyn Clock>, events: EventBus) -> Self {
        let started_at = clock.now_millis();
        Self {
            recent: RecentChangesLog::new(config.recent_changes_max_entries),
            config,
            apps: DashMap::new(),
            overridden_statuses: DashMap::new(),
            renewals: Arc::new(MeasuredRate::new()),
            recently_registered: Mutex::new(VecDeque::new()),
            recently_canceled: Mutex::new(VecDeque::new()),
            dirty: AtomicBool::new(false),
            clock,
            events,
            sink: OnceLock::new(),
            started_at,
        }
    }

    /// Attach the outbound replication sink. Only the first call wins.
    pub fn set_replication_sink(&self, sink: Arc<dyn ReplicationSink>) -> bool {
        self.sink.set(sink).is_ok()
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn now_millis(&self) -> i64 {
        self.clock.now_millis()
    }

    pub fn started_at(&self) -> i64 {
        self.started_at
    }

    pub fn renewal_rate(&self) -> &Arc<MeasuredRate> {
        &self.renewals
    }

    pub fn recent_changes(&self) -> &RecentChangesLog {
        &self.recent
    }

    /// Returns true, and clears the flag, if anything changed since the last call.
    pub fn take_dirty(&self) -> bool {
        self.dirty.swap(false, Ordering::AcqRel)
    }

    fn replicate(&self, is_replication: bool, item: impl FnOnce() -> ReplicationItem) {
        if is_replication {
            return;
        }
        if let Some(sink) = self.sink.get() {
            sink.replicate(item());
        }
    }

    fn app_leases(&self, app: &str) -> Ref<'_, String, AppLeases> {
        if let Some(leases) = self.apps.get(app) {
            return leases;
        }
        self.apps.entry(app.to_string()).or_default().downgrade()
    }

    fn override_key(app: &str, id: &str) -> (String, String) {
        (app.to_string(), id.to_string())
    }

    /// Apply the stored status override (or adopt the registrant's) and stamp
    /// the record for `action`.
    ///
    /// A replicated registrant carries the origin's override state, so its
    /// `overridden_status` replaces whatever is stored here, including a
    /// cleared one.
    fn prepare_registrant(
        &self,
        mut record: InstanceRecord,
        action: ActionType,
        now: i64,
        is_replication: bool,
    ) -> InstanceRecord {
        let key = Self::override_key(&record.app_name, &record.instance_id);
        let carried = record
            .overridden_status
            .filter(|s| *s != InstanceStatus::Unknown);
        if is_replication {
            match carried {
                Some(status) => {
                    self.overridden_statuses.insert(key, status);
                    record.status = status;
                }
                None => {
                    self.overridden_statuses.remove(&key);
                    record.overridden_status = None;
                }
            }
        } else {
            match self.overridden_statuses.get(&key).map(|s| *s) {
                Some(status) => {
                    record.overridden_status = Some(status);
                    record.status = status;
                }
                None => {
                    if let Some(status) = carried {
                        self.overridden_statuses.insert(key, status);
                        record.status = status;
                    }
                }
            }
        }
        record.action_type = Some(action);
        record.last_updated_timestamp = now;
        record
    }

    // ============================================================
    // Mutations
    // ============================================================

    /// Insert or replace the lease for `record`.
    ///
    /// A stored record with a newer dirty timestamp than the registrant wins:
    /// an older write, typically a delayed replication, cannot clobber it.
    pub fn register(
        &self,
        mut record: InstanceRecord,
        lease_duration_secs: Option<u64>,
        is_replication: bool,
    ) -> Result<(), RegistryError> {
        record.app_name = normalize_app(&record.app_name);
        validate_record(&record).map_err(|e| RegistryError::Invalid(e.to_string()))?;
        let duration = lease_duration_secs
            .filter(|d| *d > 0)
            .unwrap_or(record.lease_info.duration_secs);
        validate_lease_duration(&record.instance_id, duration)
            .map_err(|e| RegistryError::Invalid(e.to_string()))?;

        let now = self.clock.now_millis();
        if record.last_dirty_timestamp == 0 {
            record.mark_dirty(now);
        }
        let app_name = record.app_name.clone();
        let instance_id = record.instance_id.clone();

        let (action, version, snapshot) = {
            let leases = self.app_leases(&app_name);
            match leases.entry(instance_id.clone()) {
                Entry::Occupied(mut entry) => {
                    let existing = entry.get();
                    let mut registrant = record;
                    let mut service_up = 0;
                    let action = if existing.is_evicted() {
                        ActionType::Added
                    } else {
                        service_up = existing.service_up_timestamp;
                        if existing.holder.last_dirty_timestamp > registrant.last_dirty_timestamp {
                            warn!(
                                "Registration of {}/{} is older than the stored record ({} < {}); keeping the stored one",
                                app_name,
                                instance_id,
                                registrant.last_dirty_timestamp,
                                existing.holder.last_dirty_timestamp
                            );
                            registrant = existing.holder.clone();
                        }
                        ActionType::Modified
                    };
                    let registrant = self.prepare_registrant(registrant, action, now, is_replication);
                    let mut lease = Lease::new(registrant, duration, now);
                    lease.service_up_timestamp = service_up;
                    if lease.holder.status == InstanceStatus::Up {
                        lease.service_up(now);
                    }
                    let snapshot = lease.holder.clone();
                    let version = self.recent.append(action, snapshot.clone(), now);
                    entry.insert(lease);
                    (action, version, snapshot)
                }
                Entry::Vacant(entry) => {
                    let registrant =
                        self.prepare_registrant(record, ActionType::Added, now, is_replication);
                    let mut lease = Lease::new(registrant, duration, now);
                    if lease.holder.status == InstanceStatus::Up {
                        lease.service_up(now);
                    }
                    let snapshot = lease.holder.clone();
                    let version = self.recent.append(ActionType::Added, snapshot.clone(), now);
                    entry.insert(lease);
                    (ActionType::Added, version, snapshot)
                }
            }
        };

        self.dirty.store(true, Ordering::Release);
        push_bounded(
            &self.recently_registered,
            RecentActivity {
                timestamp: now,
                app_name: app_name.clone(),
                instance_id: instance_id.clone(),
            },
            self.config.recent_activity_queue_size,
        );
        info!(
            "Registered {}/{} (status={}, lease={}s, action={}, replication={})",
            app_name, instance_id, snapshot.status, duration, action, is_replication
        );
        self.events.emit(RegistryEvent::Changed {
            version,
            action,
            operation: ReplicationAction::Register,
            app_name,
            instance_id,
            replicated: is_replication,
        });
        self.replicate(is_replication, || {
            let mut item = ReplicationItem::new(ReplicationAction::Register, &snapshot, now);
            item.lease_duration_secs = Some(duration);
            item
        });
        Ok(())
    }

    /// Renew the lease of an instance. False means the caller must re-register.
    pub fn renew(&self, app: &str, instance_id: &str, is_replication: bool) -> bool {
        matches!(
            self.renew_versioned(app, instance_id, None, is_replication),
            RenewOutcome::Renewed
        )
    }

    /// Renew, comparing the caller's record version (`last_dirty_timestamp`)
    /// against the stored one.
    pub fn renew_versioned(
        &self,
        app: &str,
        instance_id: &str,
        caller_dirty_timestamp: Option<i64>,
        is_replication: bool,
    ) -> RenewOutcome {
        let app_name = normalize_app(app);
        let now = self.clock.now_millis();

        let snapshot = {
            let Some(leases) = self.apps.get(&app_name) else {
                debug!("Renew of unknown application {}/{}", app_name, instance_id);
                return RenewOutcome::NotFound;
            };
            let Some(mut lease) = leases.get_mut(instance_id) else {
                debug!("Renew of unknown instance {}/{}", app_name, instance_id);
                return RenewOutcome::NotFound;
            };
            if lease.is_evicted() {
                return RenewOutcome::NotFound;
            }
            lease.renew(now);
            self.renewals.increment();

            if let Some(caller) = caller_dirty_timestamp {
                let local = lease.holder.last_dirty_timestamp;
                if caller > local {
                    debug!(
                        "Renew of {}/{} carries a newer record ({} > {}); asking for re-registration",
                        app_name, instance_id, caller, local
                    );
                    return RenewOutcome::NotFound;
                }
                if caller < local && is_replication {
                    debug!(
                        "Replicated renew of {}/{} carries an older record ({} < {})",
                        app_name, instance_id, caller, local
                    );
                    return RenewOutcome::Conflict(lease.holder.clone());
                }
            }
            (!is_replication).then(|| (lease.holder.clone(), lease.duration_secs))
        };

        self.events.emit(RegistryEvent::Renewed {
            app_name,
            instance_id: instance_id.to_string(),
            replicated: is_replication,
        });
        if let Some((snapshot, duration)) = snapshot {
            self.replicate(is_replication, || {
                let mut item = ReplicationItem::new(ReplicationAction::Heartbeat, &snapshot, now);
                item.lease_duration_secs = Some(duration);
                item
            });
        }
        RenewOutcome::Renewed
    }

    /// Cancel an instance's lease. Returns false if it was not registered.
    pub fn cancel(&self, app: &str, instance_id: &str, is_replication: bool) -> bool {
        let app_name = normalize_app(app);
        self.remove_lease(&app_name, instance_id, is_replication, false, |_| true)
    }

    /// Evict an instance if its lease is still expired at this moment.
    ///
    /// Evictions are propagated to peers like explicit cancellations.
    pub fn evict(&self, app: &str, instance_id: &str, additional_lease_ms: i64) -> bool {
        let app_name = normalize_app(app);
        let now = self.clock.now_millis();
        self.remove_lease(&app_name, instance_id, false, true, |lease| {
            lease.is_expired(now, additional_lease_ms)
        })
    }

    fn remove_lease(
        &self,
        app_name: &str,
        instance_id: &str,
        is_replication: bool,
        evicted: bool,
        guard: impl Fn(&Lease<InstanceRecord>) -> bool,
    ) -> bool {
        let now = self.clock.now_millis();
        let removed = {
            let Some(leases) = self.apps.get(app_name) else {
                return false;
            };
            match leases.entry(instance_id.to_string()) {
                Entry::Occupied(entry) if guard(entry.get()) => {
                    let mut record = entry.get().holder.clone();
                    record.action_type = Some(ActionType::Deleted);
                    record.last_updated_timestamp = now;
                    let version = self.recent.append(ActionType::Deleted, record.clone(), now);
                    let mut lease = entry.remove();
                    lease.cancel(now);
                    Some((record, version))
                }
                _ => None,
            }
        };

        let Some((record, version)) = removed else {
            debug!("Cancel of unknown instance {}/{}", app_name, instance_id);
            return false;
        };

        self.overridden_statuses
            .remove(&Self::override_key(app_name, instance_id));
        self.dirty.store(true, Ordering::Release);
        push_bounded(
            &self.recently_canceled,
            RecentActivity {
                timestamp: now,
                app_name: app_name.to_string(),
                instance_id: instance_id.to_string(),
            },
            self.config.recent_activity_queue_size,
        );
        if evicted {
            warn!("Evicted {}/{} (lease expired)", app_name, instance_id);
            self.events.emit(RegistryEvent::Evicted {
                app_name: app_name.to_string(),
                instance_id: instance_id.to_string(),
            });
        } else {
            info!(
                "Cancelled {}/{} (replication={})",
                app_name, instance_id, is_replication
            );
        }
        self.events.emit(RegistryEvent::Changed {
            version,
            action: ActionType::Deleted,
            operation: ReplicationAction::Cancel,
            app_name: app_name.to_string(),
            instance_id: instance_id.to_string(),
            replicated: is_replication,
        });
        self.replicate(is_replication, || {
            ReplicationItem::new(ReplicationAction::Cancel, &record, now)
        });
        true
    }

    /// Set an instance's status (and status override).
    pub fn update_status(
        &self,
        app: &str,
        instance_id: &str,
        status: InstanceStatus,
        is_replication: bool,
    ) -> bool {
        self.update_status_versioned(app, instance_id, status, None, is_replication)
            == OpResult::Success
    }

    /// Set an instance's status. A `dirty_timestamp` older than the stored
    /// record marks a stale write: it is ignored and reported as `Conflict`.
    pub fn update_status_versioned(
        &self,
        app: &str,
        instance_id: &str,
        status: InstanceStatus,
        dirty_timestamp: Option<i64>,
        is_replication: bool,
    ) -> OpResult {
        let app_name = normalize_app(app);
        self.mutate_status(
            &app_name,
            instance_id,
            dirty_timestamp,
            is_replication,
            ReplicationAction::StatusUpdate,
            |registry, record| {
                if record.status == status && record.overridden_status == Some(status) {
                    return false;
                }
                registry
                    .overridden_statuses
                    .insert(Self::override_key(&record.app_name, &record.instance_id), status);
                record.overridden_status = Some(status);
                record.status = status;
                true
            },
        )
    }

    /// Remove a status override and set the instance's status to `status`.
    pub fn delete_status_override(
        &self,
        app: &str,
        instance_id: &str,
        status: InstanceStatus,
        dirty_timestamp: Option<i64>,
        is_replication: bool,
    ) -> OpResult {
        let app_name = normalize_app(app);
        self.mutate_status(
            &app_name,
            instance_id,
            dirty_timestamp,
            is_replication,
            ReplicationAction::DeleteStatusOverride,
            |registry, record| {
                let had_override = registry
                    .overridden_statuses
                    .remove(&Self::override_key(&record.app_name, &record.instance_id))
                    .is_some();
                if !had_override && record.overridden_status.is_none() && record.status == status {
                    return false;
                }
                record.overridden_status = None;
                record.status = status;
                true
            },
        )
    }

    fn mutate_status(
        &self,
        app_name: &str,
        instance_id: &str,
        dirty_timestamp: Option<i64>,
        is_replication: bool,
        action: ReplicationAction,
        apply: impl FnOnce(&Self, &mut InstanceRecord) -> bool,
    ) -> OpResult {
        let now = self.clock.now_millis();
        let changed = {
            let Some(leases) = self.apps.get(app_name) else {
                return OpResult::NotFound;
            };
            let Some(mut lease) = leases.get_mut(instance_id) else {
                return OpResult::NotFound;
            };
            if lease.is_evicted() {
                return OpResult::NotFound;
            }
            if let Some(ts) = dirty_timestamp
                && ts < lease.holder.last_dirty_timestamp
            {
                debug!(
                    "Stale {} for {}/{} ({} < {}); keeping stored record",
                    action, app_name, instance_id, ts, lease.holder.last_dirty_timestamp
                );
                return OpResult::Conflict;
            }
            if !apply(self, &mut lease.holder) {
                None
            } else {
                lease.holder.mark_dirty(dirty_timestamp.unwrap_or(now));
                lease.holder.action_type = Some(ActionType::Modified);
                lease.holder.last_updated_timestamp = now;
                if lease.holder.status == InstanceStatus::Up {
                    lease.service_up(now);
                }
                let snapshot = lease.holder.clone();
                let version = self.recent.append(ActionType::Modified, snapshot.clone(), now);
                Some((snapshot, version, lease.duration_secs))
            }
        };

        let Some((snapshot, version, duration)) = changed else {
            return OpResult::Success;
        };

        self.dirty.store(true, Ordering::Release);
        info!(
            "Status of {}/{} is now {} ({}, replication={})",
            app_name, instance_id, snapshot.status, action, is_replication
        );
        self.events.emit(RegistryEvent::Changed {
            version,
            action: ActionType::Modified,
            operation: action,
            app_name: app_name.to_string(),
            instance_id: instance_id.to_string(),
            replicated: is_replication,
        });
        self.replicate(is_replication, || {
            let mut item = ReplicationItem::new(action, &snapshot, now);
            item.lease_duration_secs = Some(duration);
            item
        });
        OpResult::Success
    }

    // ============================================================
    // Reads
    // ============================================================

    /// Every registered instance grouped by application, including expired
    /// leases that eviction has not removed yet.
    ///
    /// O(total instances); meant for cache rebuilds, not per-request reads.
    /// The version is read before the scan, so the view may also contain
    /// changes newer than it; delta entries are idempotent upserts/removals.
    pub fn get_applications(&self) -> Applications {
        let version = self.recent.current_version();
        let mut applications = Vec::with_capacity(self.apps.len());
        for entry in self.apps.iter() {
            let mut app = Application::new(entry.key());
            for lease in entry.value().iter() {
                if !lease.is_evicted() {
                    app.instances.push(lease.holder.clone());
                }
            }
            if !app.instances.is_empty() {
                applications.push(app);
            }
        }
        Applications::new(version, applications)
    }

    pub fn get_application(&self, app: &str) -> Option<Application> {
        let app_name = normalize_app(app);
        let leases = self.apps.get(&app_name)?;
        let mut application = Application::new(&app_name);
        application.instances = leases
            .iter()
            .filter(|l| !l.is_evicted())
            .map(|l| l.holder.clone())
            .collect();
        if application.instances.is_empty() {
            return None;
        }
        application
            .instances
            .sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
        Some(application)
    }

    pub fn get_instance(&self, app: &str, instance_id: &str) -> Option<InstanceRecord> {
        self.get_lease(app, instance_id).map(|l| l.holder)
    }

    pub fn get_lease(&self, app: &str, instance_id: &str) -> Option<Lease<InstanceRecord>> {
        let app_name = normalize_app(app);
        let leases = self.apps.get(&app_name)?;
        let lease = leases.get(instance_id)?;
        (!lease.is_evicted()).then(|| lease.clone())
    }

    /// Number of registered instances.
    pub fn instance_count(&self) -> usize {
        self.apps.iter().map(|e| e.value().len()).sum()
    }

    /// Applications with a lease map, including ones emptied since the last
    /// prune.
    pub fn app_count(&self) -> usize {
        self.apps.len()
    }

    /// Drop the lease maps of applications whose last instance is gone.
    /// Returns how many were dropped.
    pub fn prune_empty_apps(&self) -> usize {
        let before = self.apps.len();
        self.apps.retain(|_, leases| !leases.is_empty());
        let pruned = before.saturating_sub(self.apps.len());
        if pruned > 0 {
            debug!("Pruned {} empty applications", pruned);
        }
        pruned
    }

    /// `(app, instance)` of every lease expired at `now`.
    pub fn expired_leases(&self, now: i64, additional_lease_ms: i64) -> Vec<(String, String)> {
        let mut expired = Vec::new();
        for entry in self.apps.iter() {
            for lease in entry.value().iter() {
                if lease.is_expired(now, additional_lease_ms) {
                    expired.push((entry.key().clone(), lease.key().clone()));
                }
            }
        }
        expired
    }

    /// Purge recent-changes entries older than the retention window.
    pub fn purge_recent_changes(&self) -> usize {
        let cutoff = self.clock.now_millis() - self.config.delta_retention_secs as i64 * 1000;
        self.recent.purge_older_than(cutoff)
    }

    pub fn recently_registered(&self) -> Vec<RecentActivity> {
        self.recently_registered.lock().iter().cloned().collect()
    }

    pub fn recently_canceled(&self) -> Vec<RecentActivity> {
        self.recently_canceled.lock().iter().cloned().collect()
    }

    pub fn overridden_status(&self, app: &str, instance_id: &str) -> Option<InstanceStatus> {
        self.overridden_statuses
            .get(&Self::override_key(&normalize_app(app), instance_id))
            .map(|s| *s)
    }

    /// Validate a raw `(app, instance)` pair coming from a transport.
    pub fn validate_key(app: &str, instance_id: &str) -> Result<(), RegistryError> {
        validate_app_name(app).map_err(|e| RegistryError::Invalid(e.to_string()))?;
        validate_instance_id(instance_id).map_err(|e| RegistryError::Invalid(e.to_string()))
    }
}
