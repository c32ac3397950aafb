//! Registry store, eviction and self-preservation constants.

/// How long entries stay in the recent-changes log, in seconds.
pub const DELTA_RETENTION_SECS: u64 = 180;

/// Hard cap on the number of entries kept in the recent-changes log.
pub const RECENT_CHANGES_MAX_ENTRIES: usize = 100_000;

/// Size of the recently-registered / recently-cancelled status queues.
pub const RECENT_ACTIVITY_QUEUE_SIZE: usize = 1_000;

/// Interval between eviction cycles, in seconds.
pub const EVICTION_INTERVAL_SECS: u64 = 60;

/// Fraction of expected renewals below which self-preservation engages.
pub const RENEWAL_PERCENT_THRESHOLD: f64 = 0.85;

/// Fraction of the registry that one eviction cycle may remove.
pub const EVICTION_CAP_PERCENT: f64 = 0.15;

/// Capacity of the registry event broadcast channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;
