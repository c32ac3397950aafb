use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::instance::{ActionType, InstanceRecord, InstanceStatus};

/// All active instances of one application.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Application {
    pub name: String,
    pub instances: Vec<InstanceRecord>,
}

impl Application {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            instances: Vec::new(),
        }
    }

    pub fn instance(&self, instance_id: &str) -> Option<&InstanceRecord> {
        self.instances.iter().find(|i| i.instance_id == instance_id)
    }
}

/// Point-in-time view of the whole registry.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Applications {
    /// Registry version the view was taken at.
    pub version: u64,
    /// Status histogram, e.g. `DOWN_1_UP_3_`. Readers compare it after
    /// applying a delta to detect drift.
    pub apps_hash_code: String,
    pub applications: Vec<Application>,
}

impl Applications {
    pub fn new(version: u64, mut applications: Vec<Application>) -> Self {
        applications.sort_by(|a, b| a.name.cmp(&b.name));
        for app in &mut applications {
            app.instances.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
        }
        let apps_hash_code = apps_hash_code(applications.iter().flat_map(|a| a.instances.iter()));
        Self {
            version,
            apps_hash_code,
            applications,
        }
    }

    pub fn application(&self, name: &str) -> Option<&Application> {
        self.applications
            .iter()
            .find(|a| a.name.eq_ignore_ascii_case(name))
    }

    pub fn instance_count(&self) -> usize {
        self.applications.iter().map(|a| a.instances.len()).sum()
    }
}

/// Compute the status histogram hash over a set of instances.
///
/// Format: `<STATUS>_<count>_` per status, statuses in lexical order.
pub fn apps_hash_code<'a>(instances: impl Iterator<Item = &'a InstanceRecord>) -> String {
    let mut counts: BTreeMap<String, usize> = BTreeMap::new();
    for instance in instances {
        *counts.entry(instance.effective_status().to_string()).or_default() += 1;
    }
    counts
        .into_iter()
        .map(|(status, count)| format!("{}_{}_", status, count))
        .collect()
}

// --- Delta ---

/// One change in a delta response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InstanceChange {
    pub version: u64,
    pub action: ActionType,
    pub timestamp: i64,
    pub record: InstanceRecord,
}

/// Incremental view: changes in `(from_version, to_version]`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ApplicationsDelta {
    Changes {
        from_version: u64,
        to_version: u64,
        apps_hash_code: String,
        changes: Vec<InstanceChange>,
    },
    /// The reader's version is outside the retained window; fetch a full snapshot.
    FullSnapshotRequired { current_version: u64 },
}

// --- Status view ---

/// Counts of instances per status, used by the status endpoint.
pub fn status_counts<'a>(
    instances: impl Iterator<Item = &'a InstanceRecord>,
) -> BTreeMap<InstanceStatus, usize> {
    let mut counts = BTreeMap::new();
    for instance in instances {
        *counts.entry(instance.effective_status()).or_default() += 1;
    }
    counts
}
