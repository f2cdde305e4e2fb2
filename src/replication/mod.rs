//! Replication Module
//!
//! Propagates a write accepted by a shard's primary copy to its replica
//! copies. The primary and the replica transport are collaborators supplied
//! by the surrounding system through the [`Primary`] and [`Replicas`] traits.
//!
//! Shared state uses `std::sync` locks. A guard is never held across an
//! `.await`.

mod operation;
mod pending;
mod proxy;
mod retry;
mod shard_info;

pub use operation::ReplicationOperation;
pub use pending::PendingReplicationActions;
pub use proxy::{ReplicationMode, ReplicationProxy};
pub use retry::RetryableAction;
pub use shard_info::{ShardFailure, ShardInfo};

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::shard::{ActiveShardCount, AllocationId, ReplicationGroup, SeqNo, ShardId, ShardRouting};

/// Configuration for replication
#[derive(Debug, Clone)]
pub struct ReplicationConfig {
    /// Upper bound of the first randomized retry delay
    pub retry_initial_backoff: Duration,
    /// Time after which a replica call is no longer retried
    pub retry_timeout: Duration,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            retry_initial_backoff: Duration::from_millis(50),
            retry_timeout: Duration::from_secs(60),
        }
    }
}

/// A write request addressed to one shard
pub trait ReplicationRequest: Send + Sync + 'static {
    /// Target shard
    fn shard_id(&self) -> &ShardId;

    /// Active copies required before the write starts
    fn wait_for_active_shards(&self) -> ActiveShardCount {
        ActiveShardCount::default()
    }

    /// Request timeout, reported when the write is rejected up front
    fn timeout(&self) -> Duration {
        Duration::from_secs(60)
    }
}

/// Response of a replica after applying a write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplicaResponse {
    pub local_checkpoint: SeqNo,
    pub global_checkpoint: SeqNo,
}

/// Outcome of running a write on the primary
#[async_trait::async_trait]
pub trait PrimaryResult: Send + Sync + 'static {
    type ReplicaRequest: Send + Sync + 'static;

    /// Request to send to replicas, `None` if there is nothing to replicate
    fn replica_request(&self) -> Option<Arc<Self::ReplicaRequest>>;

    /// Receives the final per-copy report
    fn set_shard_info(&mut self, shard_info: ShardInfo);

    /// Runs once replica fan-out has started. A failure here fails the
    /// whole operation.
    async fn run_post_replication_actions(&self) -> Result<()>;
}

/// The primary copy of the shard
#[async_trait::async_trait]
pub trait Primary: Send + Sync + 'static {
    type Request: ReplicationRequest;
    type ReplicaRequest: Send + Sync + 'static;
    type Result: PrimaryResult<ReplicaRequest = Self::ReplicaRequest>;

    /// Routing entry of the primary copy
    fn routing_entry(&self) -> ShardRouting;

    /// Execute the write on the primary
    async fn perform(&self, request: &Self::Request) -> Result<Self::Result>;

    /// Fail the primary shard
    fn fail_shard(&self, message: &str, cause: &Error);

    fn update_local_checkpoint_for_shard(
        &self,
        allocation_id: &AllocationId,
        checkpoint: SeqNo,
    ) -> Result<()>;

    fn update_global_checkpoint_for_shard(
        &self,
        allocation_id: &AllocationId,
        global_checkpoint: SeqNo,
    ) -> Result<()>;

    fn local_checkpoint(&self) -> SeqNo;

    /// Global checkpoint as last persisted on the primary
    fn global_checkpoint(&self) -> SeqNo;

    /// Global checkpoint computed from the in-sync copies
    fn computed_global_checkpoint(&self) -> SeqNo;

    fn max_seq_no_of_updates_or_deletes(&self) -> SeqNo;

    fn replication_group(&self) -> ReplicationGroup;

    fn pending_replication_actions(&self) -> Arc<PendingReplicationActions>;
}

/// Transport to the replica copies
#[async_trait::async_trait]
pub trait Replicas<R: Send + Sync + 'static>: Send + Sync + 'static {
    /// Apply the write on a replica
    async fn perform_on(
        &self,
        replica: &ShardRouting,
        request: &R,
        primary_term: u64,
        global_checkpoint: SeqNo,
        max_seq_no_of_updates_or_deletes: SeqNo,
    ) -> Result<ReplicaResponse>;

    /// Send the write only so the replica validates the primary term
    async fn perform_primary_term_validation(
        &self,
        replica: &ShardRouting,
        request: &R,
        primary_term: u64,
        global_checkpoint: SeqNo,
        max_seq_no_of_updates_or_deletes: SeqNo,
    ) -> Result<ReplicaResponse> {
        self.perform_on(
            replica,
            request,
            primary_term,
            global_checkpoint,
            max_seq_no_of_updates_or_deletes,
        )
        .await
    }

    /// Fail the replica if it is still part of the replication group.
    /// An error means the local copy is no longer the primary.
    async fn fail_shard_if_needed(
        &self,
        replica: &ShardRouting,
        primary_term: u64,
        message: &str,
        cause: &Error,
    ) -> Result<()>;

    /// Remove an unreachable copy from the in-sync set.
    /// An error means the local copy is no longer the primary.
    async fn mark_shard_copy_as_stale_if_needed(
        &self,
        shard_id: &ShardId,
        allocation_id: &AllocationId,
        primary_term: u64,
    ) -> Result<()>;
}

/// Lock a mutex, recovering the data if a holder panicked
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
