//! Replication Group
//!
//! Read-only snapshot of which copies a write must reach, taken after the
//! primary has executed the write.

use std::collections::HashSet;

use crate::shard::{AllocationId, IndexShardRoutingTable, ShardRouting};

/// Copies that should receive a replicated write
#[derive(Debug, Clone)]
pub struct ReplicationGroup {
    routing_table: IndexShardRoutingTable,
    tracked_allocation_ids: HashSet<AllocationId>,
    version: u64,
    unavailable_in_sync_shards: HashSet<AllocationId>,
    replication_targets: Vec<ShardRouting>,
    skipped_shards: Vec<ShardRouting>,
}

impl ReplicationGroup {
    pub fn new(
        routing_table: IndexShardRoutingTable,
        in_sync_allocation_ids: HashSet<AllocationId>,
        tracked_allocation_ids: HashSet<AllocationId>,
        version: u64,
    ) -> Self {
        let unavailable_in_sync_shards = in_sync_allocation_ids
            .difference(&routing_table.all_allocation_ids())
            .cloned()
            .collect();

        let mut replication_targets = Vec::new();
        let mut skipped_shards = Vec::new();
        let is_tracked = |shard: &ShardRouting| {
            shard
                .allocation_id
                .as_ref()
                .map(|id| tracked_allocation_ids.contains(id))
                .unwrap_or(false)
        };

        for shard in routing_table.iter() {
            if shard.is_unassigned() {
                skipped_shards.push(shard.clone());
                continue;
            }

            if is_tracked(shard) {
                replication_targets.push(shard.clone());
            } else {
                skipped_shards.push(shard.clone());
            }

            if let Some(target) = shard.relocation_target() {
                if is_tracked(target) {
                    replication_targets.push(target.clone());
                } else {
                    skipped_shards.push(target.clone());
                }
            }
        }

        Self {
            routing_table,
            tracked_allocation_ids,
            version,
            unavailable_in_sync_shards,
            replication_targets,
            skipped_shards,
        }
    }

    pub fn routing_table(&self) -> &IndexShardRoutingTable {
        &self.routing_table
    }

    pub fn tracked_allocation_ids(&self) -> &HashSet<AllocationId> {
        &self.tracked_allocation_ids
    }

    /// Version of the replication tracker state this group was built from
    pub fn version(&self) -> u64 {
        self.version
    }

    /// In-sync IDs with no copy in the routing table
    pub fn unavailable_in_sync_shards(&self) -> &HashSet<AllocationId> {
        &self.unavailable_in_sync_shards
    }

    /// Assigned, tracked copies (the primary included)
    pub fn replication_targets(&self) -> &[ShardRouting] {
        &self.replication_targets
    }

    /// Copies that count toward the total but are never written to
    pub fn skipped_shards(&self) -> &[ShardRouting] {
        &self.skipped_shards
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shard::ShardId;

    #[test]
    fn test_group_partitions_copies() {
        let shard_id = ShardId::new("logs", 0);
        let primary = ShardRouting::started(shard_id.clone(), "node-1", true);
        let replica = ShardRouting::started(shard_id.clone(), "node-2", false).relocate("node-4");
        let recovering = ShardRouting::initializing(shard_id.clone(), "node-3", false);
        let unassigned = ShardRouting::unassigned(shard_id.clone(), false);
        let target = replica.relocation_target().unwrap().clone();

        let gone = AllocationId::new("gone");
        let id = |s: &ShardRouting| s.allocation_id.clone().unwrap();

        let in_sync: HashSet<_> = [id(&primary), id(&replica), gone.clone()].into_iter().collect();
        let tracked: HashSet<_> = [id(&primary), id(&replica), id(&target)].into_iter().collect();

        let table = IndexShardRoutingTable::new(
            shard_id,
            vec![primary.clone(), replica.clone(), recovering.clone(), unassigned],
        );
        let group = ReplicationGroup::new(table, in_sync, tracked, 7);

        assert_eq!(group.version(), 7);
        assert_eq!(group.unavailable_in_sync_shards().len(), 1);
        assert!(group.unavailable_in_sync_shards().contains(&gone));

        let targets: Vec<_> = group.replication_targets().iter().map(id).collect();
        assert_eq!(targets, vec![id(&primary), id(&replica), id(&target)]);

        // untracked recovering copy plus the unassigned one
        assert_eq!(group.skipped_shards().len(), 2);
        assert!(group.skipped_shards().iter().any(|s| s.is_same_allocation(&recovering)));
    }
}
