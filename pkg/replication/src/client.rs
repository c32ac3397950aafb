use async_trait::async_trait;
use pkg_constants::network::{PEER_BATCH_PATH, REPLICATION_HEADER};
use pkg_types::replication::{PeerEndpoint, ReplicationBatch, ReplicationBatchResponse};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReplicationError {
    /// Timeouts, connection failures and 5xx answers: worth retrying.
    #[error("transient failure replicating to {peer}: {reason}")]
    Transient { peer: String, reason: String },
    /// The peer refused the batch (4xx) or answered garbage.
    #[error("peer {peer} rejected replication batch: {reason}")]
    Permanent { peer: String, reason: String },
}

impl ReplicationError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ReplicationError::Transient { .. })
    }
}

/// Transport used by the dispatcher to ship batches to a peer.
#[async_trait]
pub trait PeerClient: Send + Sync {
    async fn send_batch(
        &self,
        peer: &PeerEndpoint,
        batch: &ReplicationBatch,
    ) -> Result<ReplicationBatchResponse, ReplicationError>;
}

/// `PeerClient` speaking the registry's HTTP batch endpoint.
pub struct HttpPeerClient {
    client: reqwest::Client,
}

impl HttpPeerClient {
    pub fn new(request_timeout: Duration, connect_timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .connect_timeout(connect_timeout)
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl PeerClient for HttpPeerClient {
    async fn send_batch(
        &self,
        peer: &PeerEndpoint,
        batch: &ReplicationBatch,
    ) -> Result<ReplicationBatchResponse, ReplicationError> {
        let url = format!("{}{}", peer.base_url(), PEER_BATCH_PATH);
        let resp = self
            .client
            .post(&url)
            .header(REPLICATION_HEADER, "true")
            .json(batch)
            .send()
            .await
            .map_err(|e| ReplicationError::Transient {
                peer: peer.to_string(),
                reason: e.to_string(),
            })?;

        let status = resp.status();
        if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(ReplicationError::Transient {
                peer: peer.to_string(),
                reason: format!("server returned {}", status),
            });
        }
        if !status.is_success() {
            return Err(ReplicationError::Permanent {
                peer: peer.to_string(),
                reason: format!("server returned {}", status),
            });
        }

        resp.json::<ReplicationBatchResponse>()
            .await
            .map_err(|e| ReplicationError::Permanent {
                peer: peer.to_string(),
                reason: format!("invalid response body: {}", e),
            })
    }
}
