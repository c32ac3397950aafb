use serde::{Deserialize, Serialize};

use crate::instance::{InstanceRecord, InstanceStatus};

// --- Peers ---

/// Network location of another registry node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerEndpoint {
    pub host: String,
    pub port: u16,
}

impl PeerEndpoint {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            host: host.to_string(),
            port,
        }
    }

    /// Parse `host:port`, optionally prefixed with `http://`.
    pub fn parse(value: &str) -> anyhow::Result<Self> {
        let trimmed = value
            .trim()
            .trim_start_matches("http://")
            .trim_end_matches('/');
        let (host, port) = trimmed
            .rsplit_once(':')
            .ok_or_else(|| anyhow::anyhow!("peer '{}' must be in host:port form", value))?;
        if host.is_empty() {
            anyhow::bail!("peer '{}' has an empty host", value);
        }
        let port: u16 = port
            .parse()
            .map_err(|e| anyhow::anyhow!("peer '{}' has an invalid port: {}", value, e))?;
        Ok(Self::new(host, port))
    }

    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

impl std::fmt::Display for PeerEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

// --- Replicated operations ---

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ReplicationAction {
    Register,
    Heartbeat,
    Cancel,
    StatusUpdate,
    DeleteStatusOverride,
}

impl std::fmt::Display for ReplicationAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReplicationAction::Register => write!(f, "register"),
            ReplicationAction::Heartbeat => write!(f, "heartbeat"),
            ReplicationAction::Cancel => write!(f, "cancel"),
            ReplicationAction::StatusUpdate => write!(f, "status_update"),
            ReplicationAction::DeleteStatusOverride => write!(f, "delete_status_override"),
        }
    }
}

/// One local mutation to be mirrored on a peer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReplicationItem {
    pub action: ReplicationAction,
    pub app_name: String,
    pub instance_id: String,
    /// Record snapshot at the time of the mutation. Heartbeats carry it so a
    /// peer that lost the instance can be re-registered.
    #[serde(default)]
    pub record: Option<InstanceRecord>,
    #[serde(default)]
    pub status: Option<InstanceStatus>,
    #[serde(default)]
    pub lease_duration_secs: Option<u64>,
    #[serde(default)]
    pub last_dirty_timestamp: i64,
    /// Epoch millis at which the mutation was applied on the origin node.
    pub timestamp: i64,
}

impl ReplicationItem {
    pub fn new(action: ReplicationAction, record: &InstanceRecord, timestamp: i64) -> Self {
        Self {
            action,
            app_name: record.app_name.clone(),
            instance_id: record.instance_id.clone(),
            record: Some(record.clone()),
            status: Some(record.status),
            lease_duration_secs: Some(record.lease_info.duration_secs),
            last_dirty_timestamp: record.last_dirty_timestamp,
            timestamp,
        }
    }

    /// Key used to coalesce pending items for the same instance.
    pub fn instance_key(&self) -> (String, String) {
        (self.app_name.clone(), self.instance_id.clone())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ReplicationBatch {
    pub items: Vec<ReplicationItem>,
}

/// Result of applying one replicated item on the receiving peer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ItemOutcome {
    Success,
    NotFound,
    /// The receiver holds a newer record; it is returned for the sender to adopt.
    Conflict {
        #[serde(default)]
        record: Option<InstanceRecord>,
    },
    Rejected { reason: String },
}

/// Per-item outcomes, in the same order as the batch items.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ReplicationBatchResponse {
    pub results: Vec<ItemOutcome>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_peer_endpoint() {
        let peer = PeerEndpoint::parse("http://registry-2:8761/").unwrap();
        assert_eq!(peer, PeerEndpoint::new("registry-2", 8761));
        assert_eq!(peer.base_url(), "http://registry-2:8761");
        assert_eq!(peer.to_string(), "registry-2:8761");
    }

    #[test]
    fn parse_peer_endpoint_rejects_garbage() {
        assert!(PeerEndpoint::parse("registry-2").is_err());
        assert!(PeerEndpoint::parse(":8761").is_err());
        assert!(PeerEndpoint::parse("host:notaport").is_err());
    }

    #[test]
    fn item_carries_record_version() {
        let mut record = InstanceRecord::new("billing", "i-1", "h1", 80);
        record.last_dirty_timestamp = 42;
        let item = ReplicationItem::new(ReplicationAction::Heartbeat, &record, 100);
        assert_eq!(item.last_dirty_timestamp, 42);
        assert_eq!(item.timestamp, 100);
        assert_eq!(item.instance_key(), ("billing".to_string(), "i-1".to_string()));
    }

    #[test]
    fn outcome_wire_format() {
        let json = serde_json::to_value(ItemOutcome::Conflict { record: None }).unwrap();
        assert_eq!(json["outcome"], "conflict");
    }
}
