use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use pkg_constants::lease::{DEFAULT_LEASE_DURATION_SECS, DEFAULT_RENEWAL_INTERVAL_SECS};

// --- Instance status ---

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceStatus {
    Up,
    Down,
    Starting,
    OutOfService,
    Unknown,
}

impl InstanceStatus {
    /// Parse a status name, case-insensitively. Unrecognized names map to `Unknown`.
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_uppercase().as_str() {
            "UP" => InstanceStatus::Up,
            "DOWN" => InstanceStatus::Down,
            "STARTING" => InstanceStatus::Starting,
            "OUT_OF_SERVICE" => InstanceStatus::OutOfService,
            _ => InstanceStatus::Unknown,
        }
    }
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InstanceStatus::Up => write!(f, "UP"),
            InstanceStatus::Down => write!(f, "DOWN"),
            InstanceStatus::Starting => write!(f, "STARTING"),
            InstanceStatus::OutOfService => write!(f, "OUT_OF_SERVICE"),
            InstanceStatus::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

// --- Change actions ---

/// Kind of change recorded against an instance.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionType {
    Added,
    Modified,
    Deleted,
}

impl std::fmt::Display for ActionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActionType::Added => write!(f, "ADDED"),
            ActionType::Modified => write!(f, "MODIFIED"),
            ActionType::Deleted => write!(f, "DELETED"),
        }
    }
}

// --- Lease request ---

/// Lease parameters requested by the registering instance.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct LeaseInfo {
    #[serde(default = "default_duration_secs")]
    pub duration_secs: u64,
    #[serde(default = "default_renewal_interval_secs")]
    pub renewal_interval_secs: u64,
}

fn default_duration_secs() -> u64 {
    DEFAULT_LEASE_DURATION_SECS
}

fn default_renewal_interval_secs() -> u64 {
    DEFAULT_RENEWAL_INTERVAL_SECS
}

impl Default for LeaseInfo {
    fn default() -> Self {
        Self {
            duration_secs: DEFAULT_LEASE_DURATION_SECS,
            renewal_interval_secs: DEFAULT_RENEWAL_INTERVAL_SECS,
        }
    }
}

// --- Instance record ---

/// Everything a registered instance tells the registry about itself.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InstanceRecord {
    pub app_name: String,
    pub instance_id: String,
    pub host_name: String,
    pub ip_addr: String,
    pub port: u16,
    #[serde(default)]
    pub secure_port: Option<u16>,
    /// Virtual address clients use to look this application up.
    #[serde(default)]
    pub vip_address: Option<String>,
    #[serde(default = "default_status")]
    pub status: InstanceStatus,
    /// Operator-imposed status that wins over what the instance reports.
    #[serde(default)]
    pub overridden_status: Option<InstanceStatus>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default)]
    pub lease_info: LeaseInfo,
    /// Epoch millis of the last change at the record's origin. Version marker
    /// for last-write-wins between local and replicated writes.
    #[serde(default)]
    pub last_dirty_timestamp: i64,
    /// Epoch millis of the last change applied by this registry.
    #[serde(default)]
    pub last_updated_timestamp: i64,
    #[serde(default)]
    pub action_type: Option<ActionType>,
}

fn default_status() -> InstanceStatus {
    InstanceStatus::Up
}

impl InstanceRecord {
    pub fn new(app_name: &str, instance_id: &str, host_name: &str, port: u16) -> Self {
        Self {
            app_name: app_name.to_string(),
            instance_id: instance_id.to_string(),
            host_name: host_name.to_string(),
            ip_addr: host_name.to_string(),
            port,
            secure_port: None,
            vip_address: None,
            status: InstanceStatus::Up,
            overridden_status: None,
            metadata: HashMap::new(),
            lease_info: LeaseInfo::default(),
            last_dirty_timestamp: 0,
            last_updated_timestamp: 0,
            action_type: None,
        }
    }

    /// Status readers should see: the override if one is set.
    pub fn effective_status(&self) -> InstanceStatus {
        self.overridden_status.unwrap_or(self.status)
    }

    /// Mark the record as changed at `now_ms`.
    pub fn mark_dirty(&mut self, now_ms: i64) {
        self.last_dirty_timestamp = now_ms;
    }

    /// `host:port` of the instance's plain port.
    pub fn address(&self) -> String {
        format!("{}:{}", self.ip_addr, self.port)
    }
}
