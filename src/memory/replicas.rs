//! Local Replicas
//!
//! Replica copies held in process, reached without a network hop.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use rand::Rng;

use crate::error::{Error, Result};
use crate::memory::{ErrorFactory, ReplicaWrite, WriteOp};
use crate::replication::{lock, ReplicaResponse, Replicas, ReplicationMode};
use crate::shard::{AllocationId, SeqNo, ShardId, ShardRouting, NO_OPS_PERFORMED};

/// A call received by a replica
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicaCall {
    pub allocation_id: AllocationId,
    pub seq_no: SeqNo,
    pub primary_term: u64,
    pub global_checkpoint: SeqNo,
    pub max_seq_no_of_updates_or_deletes: SeqNo,
    pub mode: ReplicationMode,
}

#[derive(Debug)]
struct ReplicaCopy {
    docs: BTreeMap<String, SeqNo>,
    /// Processed sequence numbers above the local checkpoint
    processed: BTreeSet<SeqNo>,
    local_checkpoint: SeqNo,
    global_checkpoint: SeqNo,
    primary_term: u64,
}

impl Default for ReplicaCopy {
    fn default() -> Self {
        Self {
            docs: BTreeMap::new(),
            processed: BTreeSet::new(),
            local_checkpoint: NO_OPS_PERFORMED,
            global_checkpoint: NO_OPS_PERFORMED,
            primary_term: 0,
        }
    }
}

impl ReplicaCopy {
    fn apply(&mut self, write: &ReplicaWrite) {
        if write.seq_no <= self.local_checkpoint || !self.processed.insert(write.seq_no) {
            return;
        }
        match &write.op {
            WriteOp::Index { id, .. } => {
                self.docs.insert(id.clone(), write.seq_no);
            }
            WriteOp::Delete { id } => {
                self.docs.remove(id);
            }
            WriteOp::Noop => {}
        }
        while self.processed.remove(&(self.local_checkpoint + 1)) {
            self.local_checkpoint += 1;
        }
    }

    fn response(&self) -> ReplicaResponse {
        ReplicaResponse {
            local_checkpoint: self.local_checkpoint,
            global_checkpoint: self.global_checkpoint,
        }
    }
}

struct Fault {
    remaining: Option<usize>,
    error: ErrorFactory,
}

/// In-process replica transport
#[derive(Default)]
pub struct LocalReplicas {
    copies: Mutex<HashMap<AllocationId, ReplicaCopy>>,
    faults: Mutex<HashMap<AllocationId, Fault>>,
    calls: Mutex<Vec<ReplicaCall>>,
    failed_shards: Mutex<Vec<(AllocationId, String)>>,
    stale_marked: Mutex<Vec<AllocationId>>,
    fail_shard_error: Mutex<Option<ErrorFactory>>,
    mark_stale_error: Mutex<Option<ErrorFactory>>,
    max_latency: Duration,
}

impl LocalReplicas {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every call by a random duration up to `max_latency`
    pub fn with_max_latency(mut self, max_latency: Duration) -> Self {
        self.max_latency = max_latency;
        self
    }

    /// Fail the next `times` calls to `allocation_id`
    pub fn fail_next<F>(&self, allocation_id: &AllocationId, times: usize, error: F)
    where
        F: Fn() -> Error + Send + Sync + 'static,
    {
        lock(&self.faults).insert(
            allocation_id.clone(),
            Fault { remaining: Some(times), error: Arc::new(error) },
        );
    }

    /// Fail every call to `allocation_id`
    pub fn fail_always<F>(&self, allocation_id: &AllocationId, error: F)
    where
        F: Fn() -> Error + Send + Sync + 'static,
    {
        lock(&self.faults).insert(
            allocation_id.clone(),
            Fault { remaining: None, error: Arc::new(error) },
        );
    }

    /// Make `fail_shard_if_needed` report that the primary was demoted
    pub fn fail_shard_with<F>(&self, error: F)
    where
        F: Fn() -> Error + Send + Sync + 'static,
    {
        *lock(&self.fail_shard_error) = Some(Arc::new(error));
    }

    /// Make `mark_shard_copy_as_stale_if_needed` report that the primary was demoted
    pub fn mark_stale_with<F>(&self, error: F)
    where
        F: Fn() -> Error + Send + Sync + 'static,
    {
        *lock(&self.mark_stale_error) = Some(Arc::new(error));
    }

    pub fn calls(&self) -> Vec<ReplicaCall> {
        lock(&self.calls).clone()
    }

    pub fn calls_to(&self, allocation_id: &AllocationId) -> Vec<ReplicaCall> {
        lock(&self.calls)
            .iter()
            .filter(|c| &c.allocation_id == allocation_id)
            .cloned()
            .collect()
    }

    /// Copies failed through `fail_shard_if_needed`, with the failure message
    pub fn failed_shards(&self) -> Vec<(AllocationId, String)> {
        lock(&self.failed_shards).clone()
    }

    pub fn stale_marked(&self) -> Vec<AllocationId> {
        lock(&self.stale_marked).clone()
    }

    pub fn local_checkpoint(&self, allocation_id: &AllocationId) -> Option<SeqNo> {
        lock(&self.copies).get(allocation_id).map(|c| c.local_checkpoint)
    }

    pub fn global_checkpoint(&self, allocation_id: &AllocationId) -> Option<SeqNo> {
        lock(&self.copies).get(allocation_id).map(|c| c.global_checkpoint)
    }

    pub fn doc_count(&self, allocation_id: &AllocationId) -> usize {
        lock(&self.copies)
            .get(allocation_id)
            .map(|c| c.docs.len())
            .unwrap_or(0)
    }

    async fn receive(
        &self,
        replica: &ShardRouting,
        request: &ReplicaWrite,
        primary_term: u64,
        global_checkpoint: SeqNo,
        max_seq_no_of_updates_or_deletes: SeqNo,
        mode: ReplicationMode,
    ) -> Result<ReplicaResponse> {
        let allocation_id = replica.allocation_id.clone().ok_or_else(|| Error::IllegalShardState {
            shard_id: replica.shard_id.clone(),
            state: replica.state.to_string(),
            reason: "replica has no allocation id".to_string(),
        })?;

        lock(&self.calls).push(ReplicaCall {
            allocation_id: allocation_id.clone(),
            seq_no: request.seq_no,
            primary_term,
            global_checkpoint,
            max_seq_no_of_updates_or_deletes,
            mode,
        });

        if !self.max_latency.is_zero() {
            let millis = rand::thread_rng().gen_range(0..=self.max_latency.as_millis() as u64);
            tokio::time::sleep(Duration::from_millis(millis)).await;
        }

        if let Some(error) = self.injected_fault(&allocation_id) {
            return Err(Error::Remote {
                node: replica.current_node_id.clone().unwrap_or_default(),
                action: "indices:data/write[r]".to_string(),
                source: Box::new(error),
            });
        }

        let mut copies = lock(&self.copies);
        let copy = copies.entry(allocation_id).or_default();
        if primary_term < copy.primary_term {
            return Err(Error::InvalidRequest(format!(
                "{} operation primary term [{}] is too old (current [{}])",
                replica.shard_id, primary_term, copy.primary_term
            )));
        }
        copy.primary_term = primary_term;
        if mode == ReplicationMode::FullReplication {
            copy.apply(request);
        }
        copy.global_checkpoint = copy.global_checkpoint.max(global_checkpoint);
        Ok(copy.response())
    }

    fn injected_fault(&self, allocation_id: &AllocationId) -> Option<Error> {
        let mut faults = lock(&self.faults);
        let fault = faults.get_mut(allocation_id)?;
        match fault.remaining {
            Some(0) => {}
            Some(n) => {
                fault.remaining = Some(n - 1);
                return Some((fault.error)());
            }
            None => return Some((fault.error)()),
        }
        faults.remove(allocation_id);
        None
    }
}

#[async_trait::async_trait]
impl Replicas<ReplicaWrite> for LocalReplicas {
    async fn perform_on(
        &self,
        replica: &ShardRouting,
        request: &ReplicaWrite,
        primary_term: u64,
        global_checkpoint: SeqNo,
        max_seq_no_of_updates_or_deletes: SeqNo,
    ) -> Result<ReplicaResponse> {
        self.receive(
            replica,
            request,
            primary_term,
            global_checkpoint,
            max_seq_no_of_updates_or_deletes,
            ReplicationMode::FullReplication,
        )
        .await
    }

    async fn perform_primary_term_validation(
        &self,
        replica: &ShardRouting,
        request: &ReplicaWrite,
        primary_term: u64,
        global_checkpoint: SeqNo,
        max_seq_no_of_updates_or_deletes: SeqNo,
    ) -> Result<ReplicaResponse> {
        self.receive(
            replica,
            request,
            primary_term,
            global_checkpoint,
            max_seq_no_of_updates_or_deletes,
            ReplicationMode::PrimaryTermValidation,
        )
        .await
    }

    async fn fail_shard_if_needed(
        &self,
        replica: &ShardRouting,
        _primary_term: u64,
        message: &str,
        cause: &Error,
    ) -> Result<()> {
        if let Some(make) = lock(&self.fail_shard_error).as_ref() {
            return Err(make());
        }
        if let Some(allocation_id) = &replica.allocation_id {
            tracing::debug!("{} failing replica {}: {}: {}", replica.shard_id, allocation_id, message, cause);
            lock(&self.failed_shards).push((allocation_id.clone(), message.to_string()));
        }
        Ok(())
    }

    async fn mark_shard_copy_as_stale_if_needed(
        &self,
        shard_id: &ShardId,
        allocation_id: &AllocationId,
        _primary_term: u64,
    ) -> Result<()> {
        if let Some(make) = lock(&self.mark_stale_error).as_ref() {
            return Err(make());
        }
        tracing::debug!("{} marking copy [{}] as stale", shard_id, allocation_id);
        lock(&self.stale_marked).push(allocation_id.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(seq_no: SeqNo, id: &str) -> ReplicaWrite {
        ReplicaWrite {
            shard_id: ShardId::new("logs", 0),
            seq_no,
            primary_term: 1,
            op: WriteOp::Index { id: id.to_string(), source: "{}".to_string() },
        }
    }

    #[test]
    fn test_local_checkpoint_advances_only_over_contiguous_ops() {
        let mut copy = ReplicaCopy::default();
        copy.apply(&write(1, "b"));
        assert_eq!(copy.local_checkpoint, NO_OPS_PERFORMED);

        copy.apply(&write(0, "a"));
        assert_eq!(copy.local_checkpoint, 1);

        copy.apply(&write(3, "d"));
        assert_eq!(copy.local_checkpoint, 1);
        assert_eq!(copy.docs.len(), 3);

        // replays are ignored
        copy.apply(&write(0, "a"));
        assert_eq!(copy.local_checkpoint, 1);
    }

    #[tokio::test]
    async fn test_stale_primary_term_is_rejected() {
        let replicas = LocalReplicas::new();
        let routing = ShardRouting::started(ShardId::new("logs", 0), "node-2", false)
            .with_allocation_id(AllocationId::new("r1"));

        replicas.perform_on(&routing, &write(0, "a"), 2, 0, 0).await.unwrap();
        let err = replicas.perform_on(&routing, &write(1, "b"), 1, 0, 0).await.unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));
        assert_eq!(replicas.local_checkpoint(&AllocationId::new("r1")), Some(0));
    }

    #[tokio::test]
    async fn test_injected_fault_runs_out() {
        let replicas = LocalReplicas::new();
        let id = AllocationId::new("r1");
        let routing = ShardRouting::started(ShardId::new("logs", 0), "node-2", false)
            .with_allocation_id(id.clone());
        replicas.fail_next(&id, 1, || Error::Rejected("queue full".into()));

        let err = replicas.perform_on(&routing, &write(0, "a"), 1, -1, -1).await.unwrap_err();
        assert!(err.is_retryable());
        replicas.perform_on(&routing, &write(0, "a"), 1, -1, -1).await.unwrap();
        assert_eq!(replicas.calls_to(&id).len(), 2);
    }
}
