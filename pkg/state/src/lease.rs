use serde::{Deserialize, Serialize};

/// A time-bounded claim of liveness wrapping one registered holder.
///
/// All timestamps are epoch milliseconds; `0` means "never".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lease<T> {
    pub holder: T,
    pub registration_timestamp: i64,
    /// Last time the lease itself was touched (registration or renewal).
    pub last_update_timestamp: i64,
    pub last_renewal_timestamp: i64,
    /// Set once when the lease is cancelled or evicted.
    pub eviction_timestamp: i64,
    /// First time the holder was seen UP under this lease.
    pub service_up_timestamp: i64,
    pub duration_secs: u64,
}

impl<T> Lease<T> {
    pub fn new(holder: T, duration_secs: u64, now_ms: i64) -> Self {
        Self {
            holder,
            registration_timestamp: now_ms,
            last_update_timestamp: now_ms,
            last_renewal_timestamp: now_ms,
            eviction_timestamp: 0,
            service_up_timestamp: 0,
            duration_secs,
        }
    }

    /// Record a heartbeat.
    pub fn renew(&mut self, now_ms: i64) {
        self.last_renewal_timestamp = now_ms;
        self.last_update_timestamp = now_ms;
    }

    /// Mark the lease cancelled. Returns false if it already was.
    pub fn cancel(&mut self, now_ms: i64) -> bool {
        if self.eviction_timestamp > 0 {
            return false;
        }
        self.eviction_timestamp = now_ms;
        true
    }

    /// Record the first transition of the holder to UP.
    pub fn service_up(&mut self, now_ms: i64) {
        if self.service_up_timestamp == 0 {
            self.service_up_timestamp = now_ms;
        }
    }

    pub fn is_evicted(&self) -> bool {
        self.eviction_timestamp > 0
    }

    pub fn duration_millis(&self) -> i64 {
        i64::try_from(self.duration_secs)
            .unwrap_or(i64::MAX)
            .saturating_mul(1000)
    }

    /// Check if this lease has expired at `now_ms`.
    ///
    /// `additional_lease_ms` extends the lease by the time the evictor itself
    /// ran late, so holders are not punished for the evictor's delays.
    pub fn is_expired(&self, now_ms: i64, additional_lease_ms: i64) -> bool {
        if self.is_evicted() {
            return true;
        }
        now_ms.saturating_sub(self.last_renewal_timestamp)
            >= self
                .duration_millis()
                .saturating_add(additional_lease_ms.max(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_lease_is_active() {
        let lease = Lease::new("h", 90, 1_000);
        assert!(!lease.is_evicted());
        assert!(!lease.is_expired(1_000, 0));
        assert!(!lease.is_expired(1_000 + 89_999, 0));
        assert!(lease.is_expired(1_000 + 90_000, 0));
    }

    #[test]
    fn renew_extends_expiry() {
        let mut lease = Lease::new("h", 90, 0);
        lease.renew(60_000);
        assert!(!lease.is_expired(120_000, 0));
        assert!(lease.is_expired(150_000, 0));
    }

    #[test]
    fn compensation_extends_expiry() {
        let lease = Lease::new("h", 90, 0);
        assert!(lease.is_expired(95_000, 0));
        assert!(!lease.is_expired(95_000, 10_000));
        // Negative compensation is ignored.
        assert!(!lease.is_expired(89_000, -5_000));
    }

    #[test]
    fn cancel_is_set_once() {
        let mut lease = Lease::new("h", 90, 0);
        assert!(lease.cancel(5));
        assert!(!lease.cancel(9));
        assert_eq!(lease.eviction_timestamp, 5);
        assert!(lease.is_expired(6, 0));
    }

    #[test]
    fn huge_durations_saturate_instead_of_wrapping() {
        let lease = Lease::new("h", u64::MAX, 1_000);
        assert_eq!(lease.duration_millis(), i64::MAX);
        assert!(!lease.is_expired(1_000, 0));
        assert!(!lease.is_expired(i64::MAX, i64::MAX));

        let lease = Lease::new("h", i64::MAX as u64, 0);
        assert!(!lease.is_expired(10_000_000, 60_000));
    }

    #[test]
    fn service_up_is_sticky() {
        let mut lease = Lease::new("h", 90, 0);
        lease.service_up(10);
        lease.service_up(20);
        assert_eq!(lease.service_up_timestamp, 10);
    }
}
