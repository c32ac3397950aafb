use pkg_state::registry::{InstanceRegistry, OpResult, RenewOutcome};
use pkg_types::instance::InstanceStatus;
use pkg_types::replication::{
    ItemOutcome, ReplicationAction, ReplicationBatch, ReplicationBatchResponse, ReplicationItem,
};
use tracing::debug;

/// Apply a batch received from a peer. Every item is applied as a replicated
/// write, so nothing here is forwarded again.
pub fn apply_batch(registry: &InstanceRegistry, batch: &ReplicationBatch) -> ReplicationBatchResponse {
    let results = batch
        .items
        .iter()
        .map(|item| apply_item(registry, item))
        .collect();
    ReplicationBatchResponse { results }
}

fn dirty_timestamp(item: &ReplicationItem) -> Option<i64> {
    (item.last_dirty_timestamp > 0).then_some(item.last_dirty_timestamp)
}

fn status_outcome(registry: &InstanceRegistry, item: &ReplicationItem, result: OpResult) -> ItemOutcome {
    match result {
        OpResult::Success => ItemOutcome::Success,
        OpResult::NotFound => ItemOutcome::NotFound,
        OpResult::Conflict => ItemOutcome::Conflict {
            record: registry.get_instance(&item.app_name, &item.instance_id),
        },
    }
}

pub fn apply_item(registry: &InstanceRegistry, item: &ReplicationItem) -> ItemOutcome {
    debug!(
        "Applying replicated {} for {}/{}",
        item.action, item.app_name, item.instance_id
    );
    match item.action {
        ReplicationAction::Register => {
            let Some(record) = item.record.clone() else {
                return ItemOutcome::Rejected {
                    reason: "register without a record".to_string(),
                };
            };
            match registry.register(record, item.lease_duration_secs, true) {
                Ok(()) => ItemOutcome::Success,
                Err(e) => ItemOutcome::Rejected {
                    reason: e.to_string(),
                },
            }
        }
        ReplicationAction::Heartbeat => {
            match registry.renew_versioned(
                &item.app_name,
                &item.instance_id,
                dirty_timestamp(item),
                true,
            ) {
                RenewOutcome::Renewed => ItemOutcome::Success,
                RenewOutcome::NotFound => ItemOutcome::NotFound,
                RenewOutcome::Conflict(record) => ItemOutcome::Conflict {
                    record: Some(record),
                },
            }
        }
        ReplicationAction::Cancel => {
            if registry.cancel(&item.app_name, &item.instance_id, true) {
                ItemOutcome::Success
            } else {
                ItemOutcome::NotFound
            }
        }
        ReplicationAction::StatusUpdate => {
            let Some(status) = item.status else {
                return ItemOutcome::Rejected {
                    reason: "status update without a status".to_string(),
                };
            };
            let result = registry.update_status_versioned(
                &item.app_name,
                &item.instance_id,
                status,
                dirty_timestamp(item),
                true,
            );
            status_outcome(registry, item, result)
        }
        ReplicationAction::DeleteStatusOverride => {
            let result = registry.delete_status_override(
                &item.app_name,
                &item.instance_id,
                item.status.unwrap_or(InstanceStatus::Unknown),
                dirty_timestamp(item),
                true,
            );
            status_outcome(registry, item, result)
        }
    }
}
