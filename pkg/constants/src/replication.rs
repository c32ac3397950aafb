//! Peer replication constants.

/// Maximum number of pending items per peer queue.
pub const PEER_QUEUE_CAPACITY: usize = 10_000;

/// Maximum number of items sent to a peer in one batch.
pub const MAX_BATCH_SIZE: usize = 250;

/// How long a worker waits for more items before flushing, in milliseconds.
pub const BATCHING_DELAY_MS: u64 = 500;

/// Number of retries after the first failed send of a batch.
pub const MAX_RETRIES: u32 = 3;

/// Initial retry backoff, doubled on every attempt, in milliseconds.
pub const RETRY_BACKOFF_MS: u64 = 500;

/// Interval between peer-set refreshes, in seconds.
pub const PEER_REFRESH_INTERVAL_SECS: u64 = 30;
