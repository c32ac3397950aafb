use parking_lot::Mutex;
use pkg_types::replication::{ReplicationAction, ReplicationItem};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Notify;

/// Bounded per-peer queue that coalesces pending items by instance.
///
/// A newer item for an instance that already has one pending takes over that
/// slot, so the instance keeps its place in line. A pending `Register` is
/// never displaced by a heartbeat or a status change; it absorbs them and
/// carries the newest record instead. Removing an override is never folded
/// into a `Register`: it is queued right behind it.
pub struct BatchingQueue {
    inner: Mutex<QueueInner>,
    notify: Notify,
    capacity: usize,
    dropped: AtomicU64,
}

struct QueueInner {
    next_seq: u64,
    order: VecDeque<u64>,
    slots: HashMap<u64, ReplicationItem>,
    by_instance: HashMap<(String, String), u64>,
}

impl QueueInner {
    /// Unlink a removed slot, unless a later item of the instance is the
    /// one coalescing now.
    fn forget(&mut self, item: &ReplicationItem, seq: u64) {
        let key = item.instance_key();
        if self.by_instance.get(&key) == Some(&seq) {
            self.by_instance.remove(&key);
        }
    }
}

/// Merge `incoming` into the latest `pending` item for the same instance.
/// Returns the item back when it has to be queued on its own.
fn coalesce(pending: &mut ReplicationItem, incoming: ReplicationItem) -> Option<ReplicationItem> {
    use ReplicationAction::*;
    match (pending.action, incoming.action) {
        (Register, DeleteStatusOverride) => return Some(incoming),
        (Register, Heartbeat | StatusUpdate) => {
            if incoming.record.is_some() {
                pending.record = incoming.record;
            }
            pending.status = incoming.status.or(pending.status);
            pending.last_dirty_timestamp = pending
                .last_dirty_timestamp
                .max(incoming.last_dirty_timestamp);
            pending.timestamp = incoming.timestamp;
        }
        // Liveness is implied by the pending write; keep it.
        (StatusUpdate | DeleteStatusOverride, Heartbeat) => {
            pending.timestamp = incoming.timestamp;
        }
        _ => *pending = incoming,
    }
    None
}

impl BatchingQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                next_seq: 0,
                order: VecDeque::new(),
                slots: HashMap::new(),
                by_instance: HashMap::new(),
            }),
            notify: Notify::new(),
            capacity: capacity.max(1),
            dropped: AtomicU64::new(0),
        }
    }

    /// Enqueue an item. Returns how many old items were dropped to make room.
    pub fn push(&self, item: ReplicationItem) -> usize {
        let mut dropped = 0;
        {
            let mut inner = self.inner.lock();
            let key = item.instance_key();
            let QueueInner {
                next_seq,
                order,
                slots,
                by_instance,
            } = &mut *inner;
            let pending_seq = by_instance.get(&key).copied();
            let unmerged = match pending_seq.and_then(|seq| slots.get_mut(&seq)) {
                Some(pending) => coalesce(pending, item),
                None => Some(item),
            };
            if let Some(item) = unmerged {
                let seq = *next_seq;
                *next_seq += 1;
                order.push_back(seq);
                slots.insert(seq, item);
                by_instance.insert(key, seq);
            }

            while inner.slots.len() > self.capacity {
                let Some(seq) = inner.order.pop_front() else {
                    break;
                };
                if let Some(old) = inner.slots.remove(&seq) {
                    inner.forget(&old, seq);
                    dropped += 1;
                }
            }
        }
        if dropped > 0 {
            self.dropped.fetch_add(dropped as u64, Ordering::Relaxed);
        }
        self.notify.notify_one();
        dropped
    }

    /// Take up to `max` items, oldest first.
    pub fn drain(&self, max: usize) -> Vec<ReplicationItem> {
        let mut inner = self.inner.lock();
        let mut items = Vec::with_capacity(max.min(inner.slots.len()));
        while items.len() < max {
            let Some(seq) = inner.order.pop_front() else {
                break;
            };
            if let Some(item) = inner.slots.remove(&seq) {
                inner.forget(&item, seq);
                items.push(item);
            }
        }
        items
    }

    /// Wait until at least one item is queued.
    pub async fn wait_for_items(&self) {
        while self.is_empty() {
            self.notify.notified().await;
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total items dropped on overflow since creation.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pkg_types::instance::{InstanceRecord, InstanceStatus};
    use std::sync::Arc;
    use std::time::Duration;

    fn item(action: ReplicationAction, id: &str, ts: i64) -> ReplicationItem {
        let mut record = InstanceRecord::new("BILLING", id, "10.0.0.1", 8080);
        record.last_dirty_timestamp = ts;
        ReplicationItem::new(action, &record, ts)
    }

    #[test]
    fn newer_item_keeps_queue_position() {
        let queue = BatchingQueue::new(10);
        queue.push(item(ReplicationAction::Heartbeat, "a", 1));
        queue.push(item(ReplicationAction::Heartbeat, "b", 2));
        queue.push(item(ReplicationAction::Cancel, "a", 3));
        assert_eq!(queue.len(), 2);

        let items = queue.drain(10);
        assert_eq!(items[0].instance_id, "a");
        assert_eq!(items[0].action, ReplicationAction::Cancel);
        assert_eq!(items[1].instance_id, "b");
    }

    #[test]
    fn register_absorbs_heartbeat_and_status() {
        let queue = BatchingQueue::new(10);
        queue.push(item(ReplicationAction::Register, "a", 1));
        queue.push(item(ReplicationAction::Heartbeat, "a", 2));

        let mut status = item(ReplicationAction::StatusUpdate, "a", 3);
        status.status = Some(InstanceStatus::Down);
        if let Some(record) = status.record.as_mut() {
            record.status = InstanceStatus::Down;
        }
        queue.push(status);

        let items = queue.drain(10);
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].action, ReplicationAction::Register);
        assert_eq!(items[0].status, Some(InstanceStatus::Down));
        assert_eq!(items[0].last_dirty_timestamp, 3);
        assert_eq!(
            items[0].record.as_ref().map(|r| r.status),
            Some(InstanceStatus::Down)
        );
    }

    #[test]
    fn override_removal_queues_behind_register() {
        let queue = BatchingQueue::new(10);
        queue.push(item(ReplicationAction::Register, "a", 1));
        queue.push(item(ReplicationAction::DeleteStatusOverride, "a", 2));
        // Later heartbeats fold into the newest pending item.
        queue.push(item(ReplicationAction::Heartbeat, "a", 3));
        assert_eq!(queue.len(), 2);

        let actions: Vec<ReplicationAction> =
            queue.drain(1).into_iter().map(|i| i.action).collect();
        assert_eq!(actions, vec![ReplicationAction::Register]);
        queue.push(item(ReplicationAction::Heartbeat, "a", 4));
        let rest = queue.drain(10);
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].action, ReplicationAction::DeleteStatusOverride);
        assert_eq!(rest[0].timestamp, 4);
    }

    #[test]
    fn heartbeat_does_not_displace_status_update() {
        let queue = BatchingQueue::new(10);
        queue.push(item(ReplicationAction::StatusUpdate, "a", 1));
        queue.push(item(ReplicationAction::Heartbeat, "a", 2));
        let items = queue.drain(10);
        assert_eq!(items[0].action, ReplicationAction::StatusUpdate);
        assert_eq!(items[0].timestamp, 2);
    }

    #[test]
    fn overflow_drops_oldest() {
        let queue = BatchingQueue::new(3);
        for (i, id) in ["a", "b", "c", "d", "e"].iter().enumerate() {
            queue.push(item(ReplicationAction::Register, id, i as i64));
        }
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.dropped(), 2);
        let ids: Vec<String> = queue.drain(10).into_iter().map(|i| i.instance_id).collect();
        assert_eq!(ids, vec!["c", "d", "e"]);

        // A dropped instance starts a fresh slot.
        queue.push(item(ReplicationAction::Heartbeat, "a", 9));
        assert_eq!(queue.drain(10)[0].action, ReplicationAction::Heartbeat);
    }

    #[test]
    fn drain_respects_max() {
        let queue = BatchingQueue::new(100);
        for i in 0..10 {
            queue.push(item(ReplicationAction::Register, &format!("i-{}", i), i));
        }
        assert_eq!(queue.drain(4).len(), 4);
        assert_eq!(queue.len(), 6);
    }

    #[tokio::test]
    async fn wait_wakes_on_push() {
        let queue = Arc::new(BatchingQueue::new(10));
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move {
                queue.wait_for_items().await;
                queue.drain(10).len()
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.push(item(ReplicationAction::Register, "a", 1));
        assert_eq!(waiter.await.unwrap(), 1);
    }
}
