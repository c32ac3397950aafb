use parking_lot::Mutex;
use pkg_types::application::InstanceChange;
use pkg_types::instance::{ActionType, InstanceRecord};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;

/// One entry of the recent-changes log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecentChange {
    pub version: u64,
    pub action: ActionType,
    pub timestamp: i64,
    pub record: InstanceRecord,
}

impl From<&RecentChange> for InstanceChange {
    fn from(change: &RecentChange) -> Self {
        InstanceChange {
            version: change.version,
            action: change.action,
            timestamp: change.timestamp,
            record: change.record.clone(),
        }
    }
}

/// Entries in `(from, to]` plus the log bounds at the time of the read.
#[derive(Debug, Clone)]
pub struct ChangeWindow {
    /// Highest version no longer retained. Readers older than this must
    /// fall back to a full snapshot.
    pub floor: u64,
    pub current: u64,
    pub changes: Vec<Arc<RecentChange>>,
}

/// Versioned log of registry mutations, retained for a time window and
/// capped in length. Versions are assigned under the log lock, so the log
/// order is the version order.
pub struct RecentChangesLog {
    inner: Mutex<RecentChangesInner>,
}

struct RecentChangesInner {
    version: u64,
    floor: u64,
    entries: VecDeque<Arc<RecentChange>>,
    max_entries: usize,
}

impl RecentChangesLog {
    pub fn new(max_entries: usize) -> Self {
        Self {
            inner: Mutex::new(RecentChangesInner {
                version: 0,
                floor: 0,
                entries: VecDeque::new(),
                max_entries: max_entries.max(1),
            }),
        }
    }

    /// Append a change and return the registry version it was assigned.
    pub fn append(&self, action: ActionType, record: InstanceRecord, now_ms: i64) -> u64 {
        let mut inner = self.inner.lock();
        inner.version += 1;
        let version = inner.version;
        inner.entries.push_back(Arc::new(RecentChange {
            version,
            action,
            timestamp: now_ms,
            record,
        }));
        while inner.entries.len() > inner.max_entries {
            if let Some(dropped) = inner.entries.pop_front() {
                inner.floor = dropped.version;
            }
        }
        version
    }

    /// Latest assigned version.
    pub fn current_version(&self) -> u64 {
        self.inner.lock().version
    }

    pub fn floor(&self) -> u64 {
        self.inner.lock().floor
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop entries recorded before `cutoff_ms`. Returns how many were purged.
    pub fn purge_older_than(&self, cutoff_ms: i64) -> usize {
        let mut inner = self.inner.lock();
        let mut purged = 0;
        while inner
            .entries
            .front()
            .is_some_and(|e| e.timestamp < cutoff_ms)
        {
            if let Some(dropped) = inner.entries.pop_front() {
                inner.floor = dropped.version;
                purged += 1;
            }
        }
        purged
    }

    /// All retained entries with a version in `(from_version, current]`.
    /// Entries are shared with the log, not copied.
    pub fn changes_since(&self, from_version: u64) -> ChangeWindow {
        let inner = self.inner.lock();
        ChangeWindow {
            floor: inner.floor,
            current: inner.version,
            changes: inner
                .entries
                .iter()
                .filter(|e| e.version > from_version)
                .cloned()
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str) -> InstanceRecord {
        InstanceRecord::new("APP", id, "host", 80)
    }

    #[test]
    fn versions_are_monotonic() {
        let log = RecentChangesLog::new(100);
        assert_eq!(log.append(ActionType::Added, record("a"), 10), 1);
        assert_eq!(log.append(ActionType::Modified, record("a"), 11), 2);
        assert_eq!(log.append(ActionType::Deleted, record("a"), 12), 3);
        assert_eq!(log.current_version(), 3);

        let window = log.changes_since(1);
        let versions: Vec<u64> = window.changes.iter().map(|c| c.version).collect();
        assert_eq!(versions, vec![2, 3]);
        assert_eq!(window.floor, 0);
    }

    #[test]
    fn purge_moves_floor() {
        let log = RecentChangesLog::new(100);
        log.append(ActionType::Added, record("a"), 10);
        log.append(ActionType::Added, record("b"), 20);
        log.append(ActionType::Added, record("c"), 30);

        assert_eq!(log.purge_older_than(25), 2);
        assert_eq!(log.floor(), 2);
        assert_eq!(log.len(), 1);
        assert_eq!(log.changes_since(0).changes.len(), 1);
    }

    #[test]
    fn windows_share_entries_with_the_log() {
        let log = RecentChangesLog::new(100);
        log.append(ActionType::Added, record("a"), 10);
        log.append(ActionType::Modified, record("a"), 11);

        let first = log.changes_since(0);
        let second = log.changes_since(1);
        assert!(Arc::ptr_eq(&first.changes[1], &second.changes[0]));
        // The log and both windows hold the entry.
        assert_eq!(Arc::strong_count(&first.changes[1]), 3);
    }

    #[test]
    fn length_cap_moves_floor() {
        let log = RecentChangesLog::new(2);
        log.append(ActionType::Added, record("a"), 1);
        log.append(ActionType::Added, record("b"), 2);
        log.append(ActionType::Added, record("c"), 3);
        assert_eq!(log.len(), 2);
        assert_eq!(log.floor(), 1);
    }
}
