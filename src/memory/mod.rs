//! In-Memory Shard Group
//!
//! A self-contained primary and replica set that implement the replication
//! collaborator traits in process. Used by the simulator and by tests, with
//! hooks to inject failures at every collaborator boundary.

mod tracker;
mod primary;
mod replicas;

pub use tracker::CheckpointTracker;
pub use primary::LocalPrimary;
pub use replicas::{LocalReplicas, ReplicaCall};

use std::sync::Arc;
use std::time::Duration;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::replication::{PrimaryResult, ReplicationRequest, ShardInfo};
use crate::shard::{ActiveShardCount, AllocationId, SeqNo, ShardId};

/// Produces a fresh error for each injected failure
pub type ErrorFactory = Arc<dyn Fn() -> Error + Send + Sync>;

/// Document-level write
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WriteOp {
    Index { id: String, source: String },
    Delete { id: String },
    /// Nothing to replicate
    Noop,
}

/// Write request addressed to a shard
#[derive(Debug, Clone)]
pub struct WriteRequest {
    pub shard_id: ShardId,
    pub op: WriteOp,
    pub wait_for_active_shards: ActiveShardCount,
    pub timeout: Duration,
}

impl WriteRequest {
    pub fn new(shard_id: ShardId, op: WriteOp) -> Self {
        Self {
            shard_id,
            op,
            wait_for_active_shards: ActiveShardCount::default(),
            timeout: Duration::from_secs(60),
        }
    }

    pub fn index(shard_id: ShardId, id: impl Into<String>, source: impl Into<String>) -> Self {
        Self::new(shard_id, WriteOp::Index { id: id.into(), source: source.into() })
    }

    pub fn delete(shard_id: ShardId, id: impl Into<String>) -> Self {
        Self::new(shard_id, WriteOp::Delete { id: id.into() })
    }

    pub fn wait_for_active_shards(mut self, count: ActiveShardCount) -> Self {
        self.wait_for_active_shards = count;
        self
    }
}

impl ReplicationRequest for WriteRequest {
    fn shard_id(&self) -> &ShardId {
        &self.shard_id
    }

    fn wait_for_active_shards(&self) -> ActiveShardCount {
        self.wait_for_active_shards
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }
}

/// Write as sent to replicas, carrying the primary-assigned sequence number
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaWrite {
    pub shard_id: ShardId,
    pub seq_no: SeqNo,
    pub primary_term: u64,
    pub op: WriteOp,
}

/// Result of a write on the local primary
#[derive(Debug)]
pub struct WriteResult {
    seq_no: Option<SeqNo>,
    replica_request: Option<Arc<ReplicaWrite>>,
    shard_info: Option<ShardInfo>,
    tracker: Arc<CheckpointTracker>,
    primary_allocation: AllocationId,
    post_replication_failure: Option<String>,
}

impl WriteResult {
    /// Sequence number assigned by the primary, `None` for no-ops
    pub fn seq_no(&self) -> Option<SeqNo> {
        self.seq_no
    }

    /// Per-copy report, set once replication completes
    pub fn shard_info(&self) -> Option<&ShardInfo> {
        self.shard_info.as_ref()
    }
}

#[async_trait::async_trait]
impl PrimaryResult for WriteResult {
    type ReplicaRequest = ReplicaWrite;

    fn replica_request(&self) -> Option<Arc<ReplicaWrite>> {
        self.replica_request.clone()
    }

    fn set_shard_info(&mut self, shard_info: ShardInfo) {
        self.shard_info = Some(shard_info);
    }

    /// Persist the current global checkpoint on the primary
    async fn run_post_replication_actions(&self) -> Result<()> {
        if let Some(reason) = &self.post_replication_failure {
            return Err(Error::Internal(format!("post replication failed: {}", reason)));
        }

        let global_checkpoint = self.tracker.global_checkpoint();
        match self
            .tracker
            .update_global_checkpoint_for_shard(&self.primary_allocation, global_checkpoint)
        {
            Err(e) if !e.is_already_closed() => Err(e),
            _ => Ok(()),
        }
    }
}
