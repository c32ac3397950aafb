//! Network-related constants.

/// Default port for the registry HTTP API.
pub const DEFAULT_API_PORT: u16 = 8761;

/// Path prefix of every registry API route.
pub const API_PREFIX: &str = "/api/v1";

/// Route that receives replication batches from peer nodes.
pub const PEER_BATCH_PATH: &str = "/api/v1/peerreplication/batch";

/// Header marking a single operation as already replicated by a peer.
pub const REPLICATION_HEADER: &str = "x-registry-replication";

/// Default timeout for one HTTP call to a peer, in milliseconds.
pub const PEER_REQUEST_TIMEOUT_MS: u64 = 5_000;

/// Default connect timeout for peer connections, in milliseconds.
pub const PEER_CONNECT_TIMEOUT_MS: u64 = 2_000;
