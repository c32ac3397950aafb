use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::debug;

/// Counts events in fixed windows; readers see the count of the last
/// completed window.
#[derive(Debug, Default)]
pub struct MeasuredRate {
    current: AtomicU64,
    last: AtomicU64,
}

impl MeasuredRate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment(&self) {
        self.current.fetch_add(1, Ordering::Relaxed);
    }

    /// Count observed during the last completed window.
    pub fn last_window(&self) -> u64 {
        self.last.load(Ordering::Relaxed)
    }

    /// Count accumulated so far in the open window.
    pub fn current_window(&self) -> u64 {
        self.current.load(Ordering::Relaxed)
    }

    /// Close the open window and start a new one.
    pub fn rotate(&self) {
        let closed = self.current.swap(0, Ordering::Relaxed);
        self.last.store(closed, Ordering::Relaxed);
    }

    /// Start rotating every `window` as a background task.
    pub fn start(self: Arc<Self>, window: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval_at(tokio::time::Instant::now() + window, window);
            loop {
                interval.tick().await;
                self.rotate();
                debug!("Renewal window closed: {} renewals", self.last_window());
            }
        })
    }
}
