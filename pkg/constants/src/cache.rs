//! Response cache constants.

/// Interval between scheduled response cache rebuilds, in seconds.
pub const CACHE_REFRESH_INTERVAL_SECS: u64 = 30;

/// Minimum spacing between change-driven rebuilds, in milliseconds.
pub const CACHE_DIRTY_DEBOUNCE_MS: u64 = 500;
