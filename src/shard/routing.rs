//! Shard Routing
//!
//! Describes where each copy of a shard lives and what state it is in.

use std::collections::HashSet;
use std::fmt;
use serde::{Deserialize, Serialize};

use crate::replication::ReplicationMode;

/// Identifies one shard of an index
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ShardId {
    /// Index name
    pub index: String,
    /// Shard number within the index
    pub id: u32,
}

impl ShardId {
    pub fn new(index: impl Into<String>, id: u32) -> Self {
        Self { index: index.into(), id }
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}][{}]", self.index, self.id)
    }
}

/// Opaque identifier of one physical shard copy
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AllocationId(String);

impl AllocationId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh random allocation ID
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }
}

impl fmt::Display for AllocationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle state of a shard copy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShardRoutingState {
    /// Not allocated to any node
    Unassigned,
    /// Allocated, recovering
    Initializing,
    /// Allocated and serving
    Started,
    /// Started and moving to another node
    Relocating,
}

impl fmt::Display for ShardRoutingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShardRoutingState::Unassigned => write!(f, "UNASSIGNED"),
            ShardRoutingState::Initializing => write!(f, "INITIALIZING"),
            ShardRoutingState::Started => write!(f, "STARTED"),
            ShardRoutingState::Relocating => write!(f, "RELOCATING"),
        }
    }
}

/// Routing entry for one copy of a shard
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardRouting {
    pub shard_id: ShardId,
    /// Absent while unassigned
    pub allocation_id: Option<AllocationId>,
    pub current_node_id: Option<String>,
    pub relocating_node_id: Option<String>,
    pub primary: bool,
    pub state: ShardRoutingState,
    /// Replication mode hint from the current topology view
    pub replication_mode: ReplicationMode,
    relocation_target: Option<Box<ShardRouting>>,
}

impl ShardRouting {
    /// A started copy on `node_id`
    pub fn started(shard_id: ShardId, node_id: impl Into<String>, primary: bool) -> Self {
        Self::assigned_with_state(shard_id, node_id, primary, ShardRoutingState::Started)
    }

    /// An initializing (recovering) copy on `node_id`
    pub fn initializing(shard_id: ShardId, node_id: impl Into<String>, primary: bool) -> Self {
        Self::assigned_with_state(shard_id, node_id, primary, ShardRoutingState::Initializing)
    }

    /// A copy that has not been allocated anywhere
    pub fn unassigned(shard_id: ShardId, primary: bool) -> Self {
        Self {
            shard_id,
            allocation_id: None,
            current_node_id: None,
            relocating_node_id: None,
            primary,
            state: ShardRoutingState::Unassigned,
            replication_mode: ReplicationMode::NoReplication,
            relocation_target: None,
        }
    }

    fn assigned_with_state(
        shard_id: ShardId,
        node_id: impl Into<String>,
        primary: bool,
        state: ShardRoutingState,
    ) -> Self {
        Self {
            shard_id,
            allocation_id: Some(AllocationId::generate()),
            current_node_id: Some(node_id.into()),
            relocating_node_id: None,
            primary,
            state,
            replication_mode: ReplicationMode::NoReplication,
            relocation_target: None,
        }
    }

    /// Replace the allocation ID
    pub fn with_allocation_id(mut self, allocation_id: AllocationId) -> Self {
        self.allocation_id = Some(allocation_id);
        self
    }

    /// Set the topology replication mode hint
    pub fn with_replication_mode(mut self, mode: ReplicationMode) -> Self {
        self.replication_mode = mode;
        self
    }

    /// Start relocating this copy to `target_node`. The target is an
    /// initializing copy with its own allocation ID.
    pub fn relocate(mut self, target_node: impl Into<String>) -> Self {
        let target_node = target_node.into();
        let target = ShardRouting {
            shard_id: self.shard_id.clone(),
            allocation_id: Some(AllocationId::generate()),
            current_node_id: Some(target_node.clone()),
            relocating_node_id: self.current_node_id.clone(),
            primary: self.primary,
            state: ShardRoutingState::Initializing,
            replication_mode: self.replication_mode,
            relocation_target: None,
        };
        self.state = ShardRoutingState::Relocating;
        self.relocating_node_id = Some(target_node);
        self.relocation_target = Some(Box::new(target));
        self
    }

    /// The copy this one is relocating to
    pub fn relocation_target(&self) -> Option<&ShardRouting> {
        self.relocation_target.as_deref()
    }

    pub fn is_unassigned(&self) -> bool {
        self.state == ShardRoutingState::Unassigned
    }

    pub fn assigned(&self) -> bool {
        self.current_node_id.is_some()
    }

    pub fn relocating(&self) -> bool {
        self.state == ShardRoutingState::Relocating
    }

    /// Started or relocating copies can serve operations
    pub fn active(&self) -> bool {
        matches!(self.state, ShardRoutingState::Started | ShardRoutingState::Relocating)
    }

    /// Whether both entries refer to the same physical copy
    pub fn is_same_allocation(&self, other: &ShardRouting) -> bool {
        match (&self.allocation_id, &other.allocation_id) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Display for ShardRouting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}, node[{}], {}, s[{}]",
            self.shard_id,
            self.current_node_id.as_deref().unwrap_or("null"),
            if self.primary { "[P]" } else { "[R]" },
            self.state
        )?;
        if let Some(relocating) = &self.relocating_node_id {
            write!(f, ", relocating [{}]", relocating)?;
        }
        if let Some(id) = &self.allocation_id {
            write!(f, ", a[id={}]", id)?;
        }
        Ok(())
    }
}

/// All copies of a single shard
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexShardRoutingTable {
    shard_id: ShardId,
    shards: Vec<ShardRouting>,
}

impl IndexShardRoutingTable {
    pub fn new(shard_id: ShardId, shards: Vec<ShardRouting>) -> Self {
        Self { shard_id, shards }
    }

    pub fn shard_id(&self) -> &ShardId {
        &self.shard_id
    }

    pub fn shards(&self) -> &[ShardRouting] {
        &self.shards
    }

    pub fn iter(&self) -> impl Iterator<Item = &ShardRouting> {
        self.shards.iter()
    }

    /// Number of copies, assigned or not
    pub fn size(&self) -> usize {
        self.shards.len()
    }

    pub fn active_shards(&self) -> Vec<&ShardRouting> {
        self.shards.iter().filter(|s| s.active()).collect()
    }

    pub fn primary(&self) -> Option<&ShardRouting> {
        self.shards.iter().find(|s| s.primary)
    }

    /// Allocation IDs of every assigned copy, including relocation targets
    pub fn all_allocation_ids(&self) -> HashSet<AllocationId> {
        let mut ids = HashSet::new();
        for shard in &self.shards {
            if let Some(id) = &shard.allocation_id {
                ids.insert(id.clone());
            }
            if let Some(target) = shard.relocation_target() {
                if let Some(id) = &target.allocation_id {
                    ids.insert(id.clone());
                }
            }
        }
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_allocation() {
        let shard_id = ShardId::new("logs", 0);
        let primary = ShardRouting::started(shard_id.clone(), "node-1", true);
        let replica = ShardRouting::started(shard_id.clone(), "node-2", false);
        let unassigned = ShardRouting::unassigned(shard_id, false);

        assert!(primary.is_same_allocation(&primary.clone()));
        assert!(!primary.is_same_allocation(&replica));
        assert!(!unassigned.is_same_allocation(&unassigned.clone()));
        assert!(unassigned.is_unassigned());
        assert!(!unassigned.assigned());
        assert!(!primary.is_unassigned());
    }

    #[test]
    fn test_relocation_target() {
        let shard_id = ShardId::new("logs", 1);
        let replica = ShardRouting::started(shard_id, "node-2", false).relocate("node-4");

        assert!(replica.relocating());
        assert!(replica.active());
        let target = replica.relocation_target().unwrap();
        assert_eq!(target.current_node_id.as_deref(), Some("node-4"));
        assert_eq!(target.relocating_node_id.as_deref(), Some("node-2"));
        assert!(!target.active());
        assert!(!replica.is_same_allocation(target));
    }

    #[test]
    fn test_routing_table_ids_include_relocation_targets() {
        let shard_id = ShardId::new("logs", 0);
        let table = IndexShardRoutingTable::new(
            shard_id.clone(),
            vec![
                ShardRouting::started(shard_id.clone(), "node-1", true),
                ShardRouting::started(shard_id.clone(), "node-2", false).relocate("node-3"),
                ShardRouting::unassigned(shard_id, false),
            ],
        );

        assert_eq!(table.size(), 3);
        assert_eq!(table.active_shards().len(), 2);
        assert_eq!(table.all_allocation_ids().len(), 3);
        assert!(table.primary().unwrap().primary);
    }
}
