//! Pending Replication Actions
//!
//! Tracks in-flight replica actions per allocation ID so they can be
//! cancelled when their copy leaves the replication group or the primary
//! closes. Owned by the primary and shared by all of its operations.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::error::Error;
use crate::replication::{lock, RetryableAction};
use crate::shard::{AllocationId, ReplicationGroup, ShardId};

type ActionsByAllocation = HashMap<AllocationId, HashMap<u64, Arc<RetryableAction>>>;

#[derive(Debug, Default)]
struct Registry {
    actions: ActionsByAllocation,
    /// Version of the last accepted replication group
    version: Option<u64>,
}

/// Registry of in-flight replica actions
#[derive(Debug)]
pub struct PendingReplicationActions {
    shard_id: ShardId,
    registry: Mutex<Registry>,
}

impl PendingReplicationActions {
    pub fn new(shard_id: ShardId) -> Self {
        Self {
            shard_id,
            registry: Mutex::new(Registry::default()),
        }
    }

    /// Register an action for a copy. If the copy is not tracked the action
    /// is cancelled immediately.
    pub fn add(&self, allocation_id: &AllocationId, action: Arc<RetryableAction>) {
        let rejected = {
            let mut registry = lock(&self.registry);
            match registry.actions.get_mut(allocation_id) {
                Some(slot) => {
                    slot.insert(action.id(), Arc::clone(&action));
                    None
                }
                None => Some(action),
            }
        };

        if let Some(action) = rejected {
            tracing::debug!(
                "{} rejecting replication action for untracked copy [{}]",
                self.shard_id,
                allocation_id
            );
            action.cancel(self.closed_error(
                "Replica unavailable - replica could have left ReplicationGroup or IndexShard might have closed",
            ));
        }
    }

    /// Deregister a finished action
    pub fn remove(&self, allocation_id: &AllocationId, action: &RetryableAction) {
        let mut registry = lock(&self.registry);
        if let Some(slot) = registry.actions.get_mut(allocation_id) {
            slot.remove(&action.id());
        }
    }

    /// Apply a new replication group. Actions for copies that are no longer
    /// tracked are cancelled. Groups older than the last one seen are ignored.
    pub fn accept_replication_group(&self, group: &ReplicationGroup) {
        let removed: Vec<(AllocationId, HashMap<u64, Arc<RetryableAction>>)> = {
            let mut registry = lock(&self.registry);
            if registry.version.is_some_and(|v| group.version() <= v) {
                return;
            }
            registry.version = Some(group.version());

            let tracked = group.tracked_allocation_ids();
            for allocation_id in tracked {
                registry.actions.entry(allocation_id.clone()).or_default();
            }

            let stale: Vec<AllocationId> = registry
                .actions
                .keys()
                .filter(|id| !tracked.contains(*id))
                .cloned()
                .collect();
            stale
                .into_iter()
                .filter_map(|id| registry.actions.remove_entry(&id))
                .collect()
        };

        for (allocation_id, actions) in removed {
            if !actions.is_empty() {
                tracing::debug!(
                    "{} copy [{}] left the replication group, cancelling {} actions",
                    self.shard_id,
                    allocation_id,
                    actions.len()
                );
            }
            self.cancel_all(actions, "Replica left ReplicationGroup");
        }
    }

    /// Cancel every pending action. Later additions are rejected until a
    /// new replication group is accepted.
    pub fn close(&self) {
        let drained: Vec<_> = {
            let mut registry = lock(&self.registry);
            registry.actions.drain().map(|(_, actions)| actions).collect()
        };

        for actions in drained {
            self.cancel_all(actions, "Primary closed.");
        }
    }

    /// Number of in-flight actions for a copy
    pub fn pending_actions_for(&self, allocation_id: &AllocationId) -> usize {
        lock(&self.registry)
            .actions
            .get(allocation_id)
            .map(HashMap::len)
            .unwrap_or(0)
    }

    fn cancel_all(&self, actions: HashMap<u64, Arc<RetryableAction>>, reason: &str) {
        for action in actions.into_values() {
            action.cancel(self.closed_error(reason));
        }
    }

    fn closed_error(&self, reason: &str) -> Error {
        Error::IndexShardClosed {
            shard_id: self.shard_id.clone(),
            reason: reason.to_string(),
        }
    }
}
