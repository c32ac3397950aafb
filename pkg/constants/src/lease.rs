//! Lease lifetime constants.

/// How long a lease stays valid without a renewal, in seconds.
pub const DEFAULT_LEASE_DURATION_SECS: u64 = 90;

/// How often a well-behaved instance is expected to renew, in seconds.
pub const DEFAULT_RENEWAL_INTERVAL_SECS: u64 = 30;

/// Width of the renewal-rate measurement window, in seconds.
pub const RENEWAL_RATE_WINDOW_SECS: u64 = 60;

/// Longest lease a registrant may request, in seconds.
pub const MAX_LEASE_DURATION_SECS: u64 = 86_400;
