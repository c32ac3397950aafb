use serde::{Deserialize, Serialize};

/// Whether eviction may run, and why not.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictionMode {
    /// Right after start: renewal counts are not meaningful yet.
    WarmingUp,
    Normal,
    /// Renewals dropped below the threshold, or every peer is unreachable.
    SelfPreservation,
}

impl std::fmt::Display for EvictionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EvictionMode::WarmingUp => write!(f, "warming-up"),
            EvictionMode::Normal => write!(f, "normal"),
            EvictionMode::SelfPreservation => write!(f, "self-preservation"),
        }
    }
}

/// Read-only snapshot published after every evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreservationStatus {
    pub mode: EvictionMode,
    pub enabled: bool,
    pub isolated: bool,
    pub expected_renews_per_min: u64,
    pub renews_threshold: u64,
    pub renews_last_min: u64,
    pub active_leases: usize,
    pub evaluated_at: i64,
}

impl PreservationStatus {
    pub fn initial(enabled: bool) -> Self {
        Self {
            mode: EvictionMode::WarmingUp,
            enabled,
            isolated: false,
            expected_renews_per_min: 0,
            renews_threshold: 0,
            renews_last_min: 0,
            active_leases: 0,
            evaluated_at: 0,
        }
    }

    /// Self-preservation is engaged. Warm-up does not count.
    pub fn is_active(&self) -> bool {
        self.mode == EvictionMode::SelfPreservation
    }

    pub fn eviction_allowed(&self) -> bool {
        self.mode == EvictionMode::Normal
    }
}

/// Renewals per minute expected from `active_leases` well-behaved holders.
pub fn expected_renews_per_min(active_leases: usize, renewal_interval_secs: u64) -> u64 {
    if renewal_interval_secs == 0 {
        return 0;
    }
    active_leases as u64 * 60 / renewal_interval_secs
}

pub fn renews_threshold(expected_per_min: u64, percent: f64) -> u64 {
    (expected_per_min as f64 * percent).floor() as u64
}

/// Self-preservation state, owned by the eviction controller.
#[derive(Debug)]
pub struct SelfPreservation {
    enabled: bool,
    renewal_percent_threshold: f64,
    expected_renewal_interval_secs: u64,
    warmup_until: i64,
    status: PreservationStatus,
}

impl SelfPreservation {
    pub fn new(
        enabled: bool,
        renewal_percent_threshold: f64,
        expected_renewal_interval_secs: u64,
        warmup_until: i64,
    ) -> Self {
        Self {
            enabled,
            renewal_percent_threshold,
            expected_renewal_interval_secs,
            warmup_until,
            status: PreservationStatus::initial(enabled),
        }
    }

    pub fn status(&self) -> &PreservationStatus {
        &self.status
    }

    /// Recompute the mode from the latest counts. Called once per cycle so
    /// the state corrects itself as soon as renewals come back.
    pub fn evaluate(
        &mut self,
        now_ms: i64,
        active_leases: usize,
        renews_last_min: u64,
        isolated: bool,
    ) -> &PreservationStatus {
        let expected = expected_renews_per_min(active_leases, self.expected_renewal_interval_secs);
        let threshold = renews_threshold(expected, self.renewal_percent_threshold);

        let mode = if now_ms < self.warmup_until {
            EvictionMode::WarmingUp
        } else if self.enabled && (isolated || renews_last_min < threshold) {
            EvictionMode::SelfPreservation
        } else {
            EvictionMode::Normal
        };

        self.status = PreservationStatus {
            mode,
            enabled: self.enabled,
            isolated,
            expected_renews_per_min: expected,
            renews_threshold: threshold,
            renews_last_min,
            active_leases,
            evaluated_at: now_ms,
        };
        &self.status
    }
}
