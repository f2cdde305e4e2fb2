//! Local Primary
//!
//! Primary copy that stores documents in memory and assigns sequence numbers.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, RwLock};

use crate::error::{Error, Result};
use crate::memory::{CheckpointTracker, ErrorFactory, ReplicaWrite, WriteOp, WriteRequest, WriteResult};
use crate::replication::{lock, PendingReplicationActions, Primary};
use crate::shard::{
    AllocationId, IndexShardRoutingTable, ReplicationGroup, SeqNo, ShardRouting, NO_OPS_PERFORMED,
};

#[derive(Debug)]
struct Store {
    docs: BTreeMap<String, SeqNo>,
    next_seq_no: SeqNo,
    max_seq_no_of_updates_or_deletes: SeqNo,
}

#[derive(Default)]
struct Faults {
    perform: Option<ErrorFactory>,
    post_replication: Option<String>,
    checkpoint: Option<ErrorFactory>,
}

/// In-memory primary copy of a shard
pub struct LocalPrimary {
    routing: ShardRouting,
    allocation_id: AllocationId,
    primary_term: u64,
    routing_table: RwLock<IndexShardRoutingTable>,
    tracker: Arc<CheckpointTracker>,
    pending: Arc<PendingReplicationActions>,
    store: Mutex<Store>,
    shard_failures: Mutex<Vec<String>>,
    faults: Mutex<Faults>,
}

impl LocalPrimary {
    /// Build a primary from a routing table. Active copies start in sync,
    /// initializing copies and relocation targets are tracked only.
    pub fn new(routing_table: IndexShardRoutingTable, primary_term: u64) -> Result<Self> {
        let shard_id = routing_table.shard_id().clone();
        let routing = routing_table
            .primary()
            .cloned()
            .ok_or_else(|| Error::Config(format!("{} routing table has no primary", shard_id)))?;
        let allocation_id = routing.allocation_id.clone().ok_or_else(|| {
            Error::Config(format!("{} primary is not assigned", shard_id))
        })?;

        let tracker = Arc::new(CheckpointTracker::new(shard_id.clone()));
        for shard in routing_table.iter() {
            let mut copies = vec![shard];
            copies.extend(shard.relocation_target());
            for copy in copies {
                if let Some(id) = &copy.allocation_id {
                    tracker.track(id.clone(), copy.active());
                    if copy.active() {
                        tracker.update_local_checkpoint(id, NO_OPS_PERFORMED)?;
                    }
                }
            }
        }
        tracker.update_global_checkpoint_for_shard(&allocation_id, NO_OPS_PERFORMED)?;

        let primary = Self {
            routing,
            allocation_id,
            primary_term,
            routing_table: RwLock::new(routing_table),
            tracker,
            pending: Arc::new(PendingReplicationActions::new(shard_id)),
            store: Mutex::new(Store {
                docs: BTreeMap::new(),
                next_seq_no: 0,
                max_seq_no_of_updates_or_deletes: NO_OPS_PERFORMED,
            }),
            shard_failures: Mutex::new(Vec::new()),
            faults: Mutex::new(Faults::default()),
        };
        primary.publish_replication_group();
        Ok(primary)
    }

    pub fn tracker(&self) -> &CheckpointTracker {
        &self.tracker
    }

    /// Add an in-sync allocation that has no copy in the routing table
    pub fn add_unavailable_in_sync(&self, allocation_id: AllocationId) {
        self.tracker.track(allocation_id, true);
        self.publish_replication_group();
    }

    /// Drop a copy from the routing table and the tracked set
    pub fn remove_copy(&self, allocation_id: &AllocationId) {
        {
            let mut table = self.routing_table.write().unwrap_or_else(|p| p.into_inner());
            let shards = table
                .shards()
                .iter()
                .filter(|s| s.allocation_id.as_ref() != Some(allocation_id))
                .cloned()
                .collect();
            *table = IndexShardRoutingTable::new(table.shard_id().clone(), shards);
        }
        self.tracker.remove(allocation_id);
        self.publish_replication_group();
    }

    /// Close the primary, cancelling every in-flight replica action
    pub fn close(&self) {
        self.tracker.close();
        self.pending.close();
    }

    /// Messages passed to `fail_shard`
    pub fn shard_failures(&self) -> Vec<String> {
        lock(&self.shard_failures).clone()
    }

    pub fn doc_count(&self) -> usize {
        lock(&self.store).docs.len()
    }

    pub fn fail_perform_with<F>(&self, error: F)
    where
        F: Fn() -> Error + Send + Sync + 'static,
    {
        lock(&self.faults).perform = Some(Arc::new(error));
    }

    pub fn fail_post_replication(&self, reason: impl Into<String>) {
        lock(&self.faults).post_replication = Some(reason.into());
    }

    pub fn fail_checkpoint_updates_with<F>(&self, error: F)
    where
        F: Fn() -> Error + Send + Sync + 'static,
    {
        lock(&self.faults).checkpoint = Some(Arc::new(error));
    }

    fn publish_replication_group(&self) {
        self.pending.accept_replication_group(&self.replication_group());
    }

    fn checkpoint_fault(&self) -> Result<()> {
        match &lock(&self.faults).checkpoint {
            Some(make) => Err(make()),
            None => Ok(()),
        }
    }
}

#[async_trait::async_trait]
impl Primary for LocalPrimary {
    type Request = WriteRequest;
    type ReplicaRequest = ReplicaWrite;
    type Result = WriteResult;

    fn routing_entry(&self) -> ShardRouting {
        self.routing.clone()
    }

    async fn perform(&self, request: &WriteRequest) -> Result<WriteResult> {
        let (perform_fault, post_replication_failure) = {
            let faults = lock(&self.faults);
            (faults.perform.clone(), faults.post_replication.clone())
        };
        if let Some(make) = perform_fault {
            return Err(make());
        }

        let seq_no = match &request.op {
            WriteOp::Noop => None,
            op => {
                let mut store = lock(&self.store);
                let seq_no = store.next_seq_no;
                store.next_seq_no += 1;
                match op {
                    WriteOp::Index { id, .. } => {
                        if store.docs.insert(id.clone(), seq_no).is_some() {
                            store.max_seq_no_of_updates_or_deletes = seq_no;
                        }
                    }
                    WriteOp::Delete { id } => {
                        store.docs.remove(id);
                        store.max_seq_no_of_updates_or_deletes = seq_no;
                    }
                    WriteOp::Noop => {}
                }
                // applied in order under the store lock, so no gaps below
                self.tracker.update_local_checkpoint(&self.allocation_id, seq_no)?;
                Some(seq_no)
            }
        };

        let replica_request = seq_no.map(|seq_no| {
            Arc::new(ReplicaWrite {
                shard_id: request.shard_id.clone(),
                seq_no,
                primary_term: self.primary_term,
                op: request.op.clone(),
            })
        });

        Ok(WriteResult {
            seq_no,
            replica_request,
            shard_info: None,
            tracker: Arc::clone(&self.tracker),
            primary_allocation: self.allocation_id.clone(),
            post_replication_failure,
        })
    }

    fn fail_shard(&self, message: &str, cause: &Error) {
        tracing::warn!("{} failing primary shard: {}: {}", self.routing.shard_id, message, cause);
        lock(&self.shard_failures).push(message.to_string());
    }

    fn update_local_checkpoint_for_shard(&self, allocation_id: &AllocationId, checkpoint: SeqNo) -> Result<()> {
        self.checkpoint_fault()?;
        self.tracker.update_local_checkpoint(allocation_id, checkpoint)
    }

    fn update_global_checkpoint_for_shard(&self, allocation_id: &AllocationId, global_checkpoint: SeqNo) -> Result<()> {
        self.checkpoint_fault()?;
        self.tracker
            .update_global_checkpoint_for_shard(allocation_id, global_checkpoint)
    }

    fn local_checkpoint(&self) -> SeqNo {
        self.tracker
            .local_checkpoint(&self.allocation_id)
            .unwrap_or(NO_OPS_PERFORMED)
    }

    fn global_checkpoint(&self) -> SeqNo {
        self.tracker
            .global_checkpoint_of(&self.allocation_id)
            .unwrap_or(NO_OPS_PERFORMED)
    }

    fn computed_global_checkpoint(&self) -> SeqNo {
        self.tracker.global_checkpoint()
    }

    fn max_seq_no_of_updates_or_deletes(&self) -> SeqNo {
        lock(&self.store).max_seq_no_of_updates_or_deletes
    }

    fn replication_group(&self) -> ReplicationGroup {
        let table = self
            .routing_table
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone();
        ReplicationGroup::new(
            table,
            self.tracker.in_sync_ids(),
            self.tracker.tracked_ids(),
            self.tracker.version(),
        )
    }

    fn pending_replication_actions(&self) -> Arc<PendingReplicationActions> {
        Arc::clone(&self.pending)
    }
}
