//! Shard Module
//!
//! Routing model for the copies of a shard: identifiers, routing entries,
//! active-copy requirements and the per-write replication group.

mod routing;
mod active;
mod group;

pub use routing::{AllocationId, IndexShardRoutingTable, ShardId, ShardRouting, ShardRoutingState};
pub use active::ActiveShardCount;
pub use group::ReplicationGroup;

/// Sequence number of an operation on a shard
pub type SeqNo = i64;

/// Sequence number not yet assigned
pub const UNASSIGNED_SEQ_NO: SeqNo = -2;

/// No operations have been performed on the shard yet
pub const NO_OPS_PERFORMED: SeqNo = -1;
