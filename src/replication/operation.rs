//! Replication Operation
//!
//! Executes a write on the primary, fans it out to the replication group
//! and reports a single outcome once every started unit of work settles.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;

use crate::error::{Error, Result};
use crate::replication::{
    lock, PendingReplicationActions, Primary, PrimaryResult, ReplicaResponse, Replicas,
    ReplicationConfig, ReplicationMode, ReplicationProxy, ReplicationRequest, RetryableAction,
    ShardFailure, ShardInfo,
};
use crate::shard::{ActiveShardCount, ReplicationGroup, SeqNo, ShardRouting, UNASSIGNED_SEQ_NO};

type Listener<T> = oneshot::Sender<Result<T>>;

/// One replicated write
pub struct ReplicationOperation<P, R>
where
    P: Primary,
    R: Replicas<P::ReplicaRequest>,
{
    request: P::Request,
    primary: Arc<P>,
    replicas: Arc<R>,
    proxy: ReplicationProxy,
    config: ReplicationConfig,
    primary_term: u64,
    op_type: String,
}

struct Inner<P, R>
where
    P: Primary,
    R: Replicas<P::ReplicaRequest>,
{
    primary: Arc<P>,
    replicas: Arc<R>,
    proxy: ReplicationProxy,
    config: ReplicationConfig,
    primary_term: u64,
    op_type: String,
    total_shards: AtomicUsize,
    successful_shards: AtomicUsize,
    pending_actions: AtomicUsize,
    finished: AtomicBool,
    shard_failures: Mutex<Vec<ShardFailure>>,
    primary_result: Mutex<Option<P::Result>>,
    listener: Mutex<Option<Listener<P::Result>>>,
}

impl<P, R> ReplicationOperation<P, R>
where
    P: Primary,
    R: Replicas<P::ReplicaRequest>,
{
    /// Create an operation for `request` under `primary_term`
    pub fn new(request: P::Request, primary: Arc<P>, replicas: Arc<R>, primary_term: u64) -> Self {
        Self {
            request,
            primary,
            replicas,
            proxy: ReplicationProxy::default(),
            config: ReplicationConfig::default(),
            primary_term,
            op_type: "write".to_string(),
        }
    }

    /// Use a different replication mode policy
    pub fn with_proxy(mut self, proxy: ReplicationProxy) -> Self {
        self.proxy = proxy;
        self
    }

    /// Use different retry settings
    pub fn with_config(mut self, config: ReplicationConfig) -> Self {
        self.config = config;
        self
    }

    /// Label used in logs and failure messages
    pub fn with_op_type(mut self, op_type: impl Into<String>) -> Self {
        self.op_type = op_type.into();
        self
    }

    /// Run the operation. Resolves exactly once, with the primary result
    /// carrying the shard report or with the error that failed the write.
    /// Must be called within a Tokio runtime.
    pub async fn execute(self) -> Result<P::Result> {
        let (tx, rx) = oneshot::channel();
        let inner = Arc::new(Inner {
            primary: self.primary,
            replicas: self.replicas,
            proxy: self.proxy,
            config: self.config,
            primary_term: self.primary_term,
            op_type: self.op_type,
            total_shards: AtomicUsize::new(0),
            successful_shards: AtomicUsize::new(0),
            pending_actions: AtomicUsize::new(0),
            finished: AtomicBool::new(false),
            shard_failures: Mutex::new(Vec::new()),
            primary_result: Mutex::new(None),
            listener: Mutex::new(Some(tx)),
        });
        inner.start(self.request);
        // spawned tasks hold the only remaining references, so a task that
        // dies without finishing drops the sender
        drop(inner);

        rx.await.map_err(|_| {
            Error::Internal("replication operation ended without a result".to_string())
        })?
    }
}

impl<P, R> Inner<P, R>
where
    P: Primary,
    R: Replicas<P::ReplicaRequest>,
{
    fn start(self: &Arc<Self>, request: P::Request) {
        let primary_routing = self.primary.routing_entry();

        if let Some(failure) = self.check_active_shard_count(&request) {
            self.finish_as_failed(Error::UnavailableShards {
                shard_id: primary_routing.shard_id.clone(),
                message: format!("{} Timeout: [{:?}]", failure, request.timeout()),
            });
            return;
        }

        self.total_shards.fetch_add(1, Ordering::SeqCst);
        // held until primary coordination is done
        self.pending_actions.fetch_add(1, Ordering::SeqCst);

        let inner = Arc::clone(self);
        tokio::spawn(async move {
            match inner.primary.perform(&request).await {
                Ok(result) => inner.handle_primary_result(result).await,
                Err(e) => {
                    tracing::trace!("[{}] op [{}] failed on primary: {}", request.shard_id(), inner.op_type, e);
                    inner.finish_as_failed(e);
                }
            }
        });
    }

    /// Reason the write must not start, if any
    fn check_active_shard_count(&self, request: &P::Request) -> Option<String> {
        let wait_for = request.wait_for_active_shards();
        if wait_for == ActiveShardCount::None {
            return None;
        }

        let group = self.primary.replication_group();
        let table = group.routing_table();
        if wait_for.enough_shards_active(table) {
            return None;
        }

        let needed = wait_for.resolve(table);
        let active = table.active_shards().len();
        tracing::trace!(
            "[{}] not enough active copies to meet shard count of [{}] (have {}, needed {})",
            table.shard_id(),
            wait_for,
            active,
            needed
        );
        Some(format!(
            "Not enough active copies to meet shard count of [{}] (have {}, needed {}).",
            wait_for, active, needed
        ))
    }

    async fn handle_primary_result(self: &Arc<Self>, result: P::Result) {
        if let Some(replica_request) = result.replica_request() {
            // read only now that the primary has executed the write
            let global_checkpoint = self.primary.computed_global_checkpoint();
            let max_seq_no_of_updates_or_deletes = self.primary.max_seq_no_of_updates_or_deletes();
            debug_assert!(
                max_seq_no_of_updates_or_deletes != UNASSIGNED_SEQ_NO,
                "max_seq_no_of_updates_or_deletes still uninitialized"
            );

            let group = self.primary.replication_group();
            let pending = self.primary.pending_replication_actions();
            tracing::trace!(
                "[{}] op [{}] completed on primary, replicating with global checkpoint [{}]",
                group.routing_table().shard_id(),
                self.op_type,
                global_checkpoint
            );

            self.mark_unavailable_shards_as_stale(&group);
            self.perform_on_replicas(
                replica_request,
                global_checkpoint,
                max_seq_no_of_updates_or_deletes,
                &group,
                pending,
            );
        }

        let post_replication = result.run_post_replication_actions().await;
        match post_replication {
            Ok(()) => {
                self.successful_shards.fetch_add(1, Ordering::SeqCst);
                *lock(&self.primary_result) = Some(result);
                let routing = self.primary.routing_entry();
                self.update_checkpoints(
                    &routing,
                    self.primary.local_checkpoint(),
                    self.primary.global_checkpoint(),
                );
                self.dec_pending_and_finish_if_needed();
            }
            Err(e) => {
                tracing::trace!("op [{}] post replication actions failed: {}", self.op_type, e);
                self.finish_as_failed(e);
            }
        }
    }

    fn mark_unavailable_shards_as_stale(self: &Arc<Self>, group: &ReplicationGroup) {
        let shard_id = group.routing_table().shard_id().clone();

        for allocation_id in group.unavailable_in_sync_shards() {
            self.pending_actions.fetch_add(1, Ordering::SeqCst);
            tracing::debug!("{} marking unavailable in-sync copy [{}] as stale", shard_id, allocation_id);

            let inner = Arc::clone(self);
            let shard_id = shard_id.clone();
            let allocation_id = allocation_id.clone();
            tokio::spawn(async move {
                match inner
                    .replicas
                    .mark_shard_copy_as_stale_if_needed(&shard_id, &allocation_id, inner.primary_term)
                    .await
                {
                    Ok(()) => inner.dec_pending_and_finish_if_needed(),
                    Err(e) => inner.on_no_longer_primary(e),
                }
            });
        }
    }

    fn perform_on_replicas(
        self: &Arc<Self>,
        replica_request: Arc<P::ReplicaRequest>,
        global_checkpoint: SeqNo,
        max_seq_no_of_updates_or_deletes: SeqNo,
        group: &ReplicationGroup,
        pending: Arc<PendingReplicationActions>,
    ) {
        // skipped copies count toward the total but can never succeed
        self.total_shards.fetch_add(group.skipped_shards().len(), Ordering::SeqCst);

        let primary_routing = self.primary.routing_entry();
        for shard in group.replication_targets() {
            let mode = self.proxy.determine_mode(shard, &primary_routing);
            if !mode.dispatches() {
                continue;
            }
            self.perform_on_replica(
                shard.clone(),
                mode,
                Arc::clone(&replica_request),
                global_checkpoint,
                max_seq_no_of_updates_or_deletes,
                Arc::clone(&pending),
            );
        }
    }

    fn perform_on_replica(
        self: &Arc<Self>,
        shard: ShardRouting,
        mode: ReplicationMode,
        replica_request: Arc<P::ReplicaRequest>,
        global_checkpoint: SeqNo,
        max_seq_no_of_updates_or_deletes: SeqNo,
        pending: Arc<PendingReplicationActions>,
    ) {
        tracing::trace!("[{}] sending op [{}] to replica {} ({})", shard.shard_id, self.op_type, shard, mode);
        self.total_shards.fetch_add(1, Ordering::SeqCst);
        self.pending_actions.fetch_add(1, Ordering::SeqCst);

        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let Some(allocation_id) = shard.allocation_id.clone() else {
                let e = Error::IllegalShardState {
                    shard_id: shard.shard_id.clone(),
                    state: shard.state.to_string(),
                    reason: "replication target has no allocation id".to_string(),
                };
                inner.on_replica_failure(&shard, e).await;
                return;
            };
            let action = match RetryableAction::new(
                inner.config.retry_initial_backoff,
                inner.config.retry_timeout,
            ) {
                Ok(action) => Arc::new(action),
                Err(e) => {
                    inner.on_replica_failure(&shard, e).await;
                    return;
                }
            };
            pending.add(&allocation_id, Arc::clone(&action));

            let outcome = {
                let replicas = &*inner.replicas;
                let target = &shard;
                let request = &*replica_request;
                let primary_term = inner.primary_term;
                action
                    .run(
                        move || async move {
                            match mode {
                                ReplicationMode::PrimaryTermValidation => {
                                    replicas
                                        .perform_primary_term_validation(
                                            target,
                                            request,
                                            primary_term,
                                            global_checkpoint,
                                            max_seq_no_of_updates_or_deletes,
                                        )
                                        .await
                                }
                                _ => {
                                    replicas
                                        .perform_on(
                                            target,
                                            request,
                                            primary_term,
                                            global_checkpoint,
                                            max_seq_no_of_updates_or_deletes,
                                        )
                                        .await
                                }
                            }
                        },
                        Error::is_retryable,
                    )
                    .await
            };
            pending.remove(&allocation_id, &action);

            match outcome {
                Ok(response) => inner.on_replica_response(&shard, response),
                Err(e) => inner.on_replica_failure(&shard, e).await,
            }
        });
    }

    fn on_replica_response(&self, shard: &ShardRouting, response: ReplicaResponse) {
        self.successful_shards.fetch_add(1, Ordering::SeqCst);
        self.update_checkpoints(shard, response.local_checkpoint, response.global_checkpoint);
        self.dec_pending_and_finish_if_needed();
    }

    async fn on_replica_failure(&self, shard: &ShardRouting, error: Error) {
        tracing::trace!(
            "[{}] failure while performing [{}] on replica {}: {}",
            shard.shard_id,
            self.op_type,
            shard,
            error
        );

        let error = Arc::new(error);
        if !error.is_shard_not_available() {
            lock(&self.shard_failures).push(ShardFailure {
                shard_id: shard.shard_id.clone(),
                node_id: shard.current_node_id.clone(),
                cause: Arc::clone(&error),
                status: error.status(),
                primary: false,
            });
        }

        let message = format!("failed to perform {} on replica {}", self.op_type, shard);
        match self
            .replicas
            .fail_shard_if_needed(shard, self.primary_term, &message, &error)
            .await
        {
            Ok(()) => self.dec_pending_and_finish_if_needed(),
            Err(e) => self.on_no_longer_primary(e),
        }
    }

    fn on_no_longer_primary(&self, failure: Error) {
        let routing = self.primary.routing_entry();
        let message = if failure.is_node_closed() {
            // no need to fail a primary that is shutting down anyway
            format!(
                "node with primary [{}] is shutting down while failing replica shard",
                routing
            )
        } else {
            let message = format!(
                "primary shard [{}] was demoted while failing replica shard",
                routing
            );
            tracing::warn!("{}: {}", message, failure);
            self.primary.fail_shard(&message, &failure);
            message
        };

        self.finish_as_failed(Error::RetryOnPrimary {
            shard_id: routing.shard_id,
            message,
            source: Box::new(failure),
        });
    }

    fn update_checkpoints(&self, shard: &ShardRouting, local_checkpoint: SeqNo, global_checkpoint: SeqNo) {
        let Some(allocation_id) = shard.allocation_id.as_ref() else {
            return;
        };

        let outcome = self
            .primary
            .update_local_checkpoint_for_shard(allocation_id, local_checkpoint)
            .and_then(|_| {
                self.primary
                    .update_global_checkpoint_for_shard(allocation_id, global_checkpoint)
            });

        match outcome {
            Ok(()) => {}
            // shard closed concurrently, nothing left to track
            Err(e) if e.is_already_closed() => {
                tracing::trace!("[{}] ignoring checkpoint update for closed shard: {}", shard.shard_id, e);
            }
            Err(e) => {
                let message = format!("primary failed updating local checkpoint for replica {}", shard);
                tracing::warn!("{}: {}", message, e);
                self.primary.fail_shard(&message, &e);
            }
        }
    }

    fn dec_pending_and_finish_if_needed(&self) {
        let previous = self.pending_actions.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(previous > 0, "pending actions went below zero");
        if previous == 1 {
            self.finish();
        }
    }

    fn finish(&self) {
        if self
            .finished
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        let failures = std::mem::take(&mut *lock(&self.shard_failures));
        let shard_info = ShardInfo::new(
            self.total_shards.load(Ordering::SeqCst),
            self.successful_shards.load(Ordering::SeqCst),
            failures,
        );

        let response = match lock(&self.primary_result).take() {
            Some(mut result) => {
                result.set_shard_info(shard_info);
                Ok(result)
            }
            None => Err(Error::Internal("primary result missing at completion".to_string())),
        };
        self.respond(response);
    }

    fn finish_as_failed(&self, error: Error) {
        if self
            .finished
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.respond(Err(error));
        }
    }

    fn respond(&self, response: Result<P::Result>) {
        if let Some(listener) = lock(&self.listener).take() {
            // the caller may have stopped waiting
            let _ = listener.send(response);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use crate::error::Status;
    use crate::memory::{LocalPrimary, LocalReplicas, ReplicaWrite, WriteOp, WriteRequest, WriteResult};
    use crate::shard::{AllocationId, IndexShardRoutingTable, ShardId, NO_OPS_PERFORMED};

    struct Group {
        primary: Arc<LocalPrimary>,
        replicas: Arc<LocalReplicas>,
    }

    fn shard_id() -> ShardId {
        ShardId::new("logs", 0)
    }

    fn primary_routing() -> ShardRouting {
        ShardRouting::started(shard_id(), "node-0", true).with_allocation_id(AllocationId::new("p"))
    }

    fn replica(n: usize) -> ShardRouting {
        ShardRouting::started(shard_id(), format!("node-{}", n), false)
            .with_allocation_id(replica_id(n))
    }

    fn replica_id(n: usize) -> AllocationId {
        AllocationId::new(format!("r{}", n))
    }

    fn group_of(shards: Vec<ShardRouting>) -> Group {
        let table = IndexShardRoutingTable::new(shard_id(), shards);
        Group {
            primary: Arc::new(LocalPrimary::new(table, 1).unwrap()),
            replicas: Arc::new(LocalReplicas::new()),
        }
    }

    fn group(replica_count: usize) -> Group {
        let mut shards = vec![primary_routing()];
        shards.extend((1..=replica_count).map(replica));
        group_of(shards)
    }

    fn index(id: &str) -> WriteRequest {
        WriteRequest::index(shard_id(), id, r#"{"message":"hello"}"#)
    }

    fn operation(group: &Group, request: WriteRequest) -> ReplicationOperation<LocalPrimary, LocalReplicas> {
        ReplicationOperation::new(request, Arc::clone(&group.primary), Arc::clone(&group.replicas), 1)
            .with_config(ReplicationConfig {
                retry_initial_backoff: Duration::from_millis(10),
                retry_timeout: Duration::from_secs(5),
            })
    }

    fn shard_info(result: &WriteResult) -> &ShardInfo {
        result.shard_info().expect("shard info set on completion")
    }

    #[tokio::test]
    async fn test_all_copies_succeed() {
        let group = group(2);

        let result = operation(&group, index("1")).execute().await.unwrap();

        let info = shard_info(&result);
        assert_eq!(info.total, 3);
        assert_eq!(info.successful, 3);
        assert!(info.failures.is_empty());
        assert_eq!(result.seq_no(), Some(0));
        for n in 1..=2 {
            assert_eq!(group.replicas.local_checkpoint(&replica_id(n)), Some(0));
            assert_eq!(group.replicas.doc_count(&replica_id(n)), 1);
        }
        // every in-sync copy reported seq_no 0 back to the primary
        assert_eq!(group.primary.tracker().global_checkpoint(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_replica_failure_is_retried() {
        let group = group(2);
        group
            .replicas
            .fail_next(&replica_id(1), 1, || Error::CircuitBreaking("parent".into()));

        let result = operation(&group, index("1")).execute().await.unwrap();

        let info = shard_info(&result);
        assert_eq!(info.successful, 3);
        assert!(info.failures.is_empty());
        assert_eq!(group.replicas.calls_to(&replica_id(1)).len(), 2);
        assert_eq!(group.replicas.calls_to(&replica_id(2)).len(), 1);
    }

    #[tokio::test]
    async fn test_permanent_replica_failure_is_recorded() {
        let group = group(2);
        group
            .replicas
            .fail_always(&replica_id(1), || Error::InvalidRequest("malformed source".into()));

        let result = operation(&group, index("1")).execute().await.unwrap();

        let info = shard_info(&result);
        assert_eq!(info.total, 3);
        assert_eq!(info.successful, info.total - 1);
        assert_eq!(info.failed(), 1);
        assert_eq!(info.failures[0].status, Status::BadRequest);
        assert_eq!(info.failures[0].node_id.as_deref(), Some("node-1"));
        assert!(!info.failures[0].primary);

        // not retried, and the copy is failed through the replica transport
        assert_eq!(group.replicas.calls_to(&replica_id(1)).len(), 1);
        let failed = group.replicas.failed_shards();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].0, replica_id(1));
        assert!(failed[0].1.starts_with("failed to perform write on replica"));
        assert!(group.primary.shard_failures().is_empty());
    }

    #[tokio::test]
    async fn test_not_enough_active_copies() {
        let group = group_of(vec![
            primary_routing(),
            replica(1),
            ShardRouting::unassigned(shard_id(), false),
        ]);
        let request = index("1").wait_for_active_shards(ActiveShardCount::All);

        let err = operation(&group, request).execute().await.unwrap_err();

        match err {
            Error::UnavailableShards { message, .. } => {
                assert!(message.contains("(have 2, needed 3)"), "{}", message);
                assert!(message.contains("Timeout: ["), "{}", message);
            }
            other => panic!("unexpected error: {}", other),
        }
        assert_eq!(group.primary.doc_count(), 0);
        assert!(group.replicas.calls().is_empty());
    }

    #[tokio::test]
    async fn test_primary_failure_fails_operation() {
        let group = group(2);
        group.primary.fail_perform_with(|| Error::Internal("disk full".into()));

        let err = operation(&group, index("1")).execute().await.unwrap_err();

        assert!(matches!(err, Error::Internal(ref m) if m == "disk full"));
        assert!(group.replicas.calls().is_empty());
    }

    #[tokio::test]
    async fn test_node_shutdown_while_failing_replica() {
        let group = group(2);
        group
            .replicas
            .fail_always(&replica_id(2), || Error::InvalidRequest("mapping conflict".into()));
        group
            .replicas
            .fail_shard_with(|| Error::NodeClosed("node-0 is shutting down".into()));

        let err = operation(&group, index("1")).execute().await.unwrap_err();

        match &err {
            Error::RetryOnPrimary { source, .. } => assert!(source.is_node_closed()),
            other => panic!("unexpected error: {}", other),
        }
        assert!(group.primary.shard_failures().is_empty());
    }

    #[tokio::test]
    async fn test_demoted_primary_fails_itself() {
        let group = group(1);
        group
            .replicas
            .fail_always(&replica_id(1), || Error::InvalidRequest("mapping conflict".into()));
        group.replicas.fail_shard_with(|| Error::NoLongerPrimary {
            shard_id: ShardId::new("logs", 0),
            reason: "primary term [2] is newer".into(),
        });

        let err = operation(&group, index("1")).execute().await.unwrap_err();

        assert!(matches!(err, Error::RetryOnPrimary { .. }));
        let failures = group.primary.shard_failures();
        assert_eq!(failures.len(), 1);
        assert!(failures[0].contains("was demoted"));
    }

    #[tokio::test]
    async fn test_post_replication_failure_fails_operation() {
        let group = group(2);
        group.primary.fail_post_replication("translog sync");

        let err = operation(&group, index("1")).execute().await.unwrap_err();

        assert!(matches!(err, Error::Internal(_)));
        // replicas were already sent the write
        assert_eq!(group.replicas.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_skipped_copies_count_toward_total() {
        let group = group_of(vec![
            primary_routing(),
            replica(1),
            ShardRouting::initializing(shard_id(), "node-2", false).with_allocation_id(replica_id(2)),
            ShardRouting::unassigned(shard_id(), false),
        ]);

        let result = operation(&group, index("1")).execute().await.unwrap();

        // primary + two dispatched copies + one unassigned copy
        let info = shard_info(&result);
        assert_eq!(info.total, 4);
        assert_eq!(info.successful, 3);
        assert!(info.successful + info.failed() <= info.total);
    }

    #[tokio::test]
    async fn test_checkpoints_are_read_after_primary_write() {
        let group = group_of(vec![
            primary_routing(),
            ShardRouting::initializing(shard_id(), "node-1", false).with_allocation_id(replica_id(1)),
        ]);

        operation(&group, index("a")).execute().await.unwrap();
        operation(&group, index("a")).execute().await.unwrap();

        // only the primary is in sync, so the global checkpoint tracks its own writes
        let calls = group.replicas.calls_to(&replica_id(1));
        let checkpoints: Vec<_> = calls.iter().map(|c| c.global_checkpoint).collect();
        assert_eq!(checkpoints, vec![0, 1]);
        let max_seq_nos: Vec<_> = calls.iter().map(|c| c.max_seq_no_of_updates_or_deletes).collect();
        assert_eq!(max_seq_nos, vec![NO_OPS_PERFORMED, 1]);
    }

    #[tokio::test]
    async fn test_unavailable_in_sync_copy_is_marked_stale() {
        let group = group(1);
        group.primary.add_unavailable_in_sync(AllocationId::new("gone"));

        let result = operation(&group, index("1")).execute().await.unwrap();

        assert_eq!(group.replicas.stale_marked(), vec![AllocationId::new("gone")]);
        assert_eq!(shard_info(&result).total, 2);
    }

    #[tokio::test]
    async fn test_stale_marking_rejected_by_newer_primary() {
        let group = group(1);
        group.primary.add_unavailable_in_sync(AllocationId::new("gone"));
        group.replicas.mark_stale_with(|| Error::NoLongerPrimary {
            shard_id: ShardId::new("logs", 0),
            reason: "primary term [2] is newer".into(),
        });

        let err = operation(&group, index("1")).execute().await.unwrap_err();

        assert!(matches!(err, Error::RetryOnPrimary { .. }));
        assert_eq!(group.primary.shard_failures().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_copy_leaving_group_cancels_its_action() {
        let group = group(1);
        group
            .replicas
            .fail_always(&replica_id(1), || Error::Rejected("write queue full".into()));

        let pending = group.primary.pending_replication_actions();
        let handle = tokio::spawn(operation(&group, index("1")).execute());
        while pending.pending_actions_for(&replica_id(1)) == 0 {
            tokio::task::yield_now().await;
        }
        group.primary.remove_copy(&replica_id(1));

        let result = handle.await.unwrap().unwrap();

        // cancellation means the copy is gone, not that it failed
        let info = shard_info(&result);
        assert_eq!(info.total, 2);
        assert_eq!(info.successful, 1);
        assert!(info.failures.is_empty());
        assert_eq!(pending.pending_actions_for(&replica_id(1)), 0);
    }

    #[tokio::test]
    async fn test_checkpoint_bookkeeping_failure_fails_shard_but_not_write() {
        let group = group(1);
        group
            .primary
            .fail_checkpoint_updates_with(|| Error::Internal("tracker corrupted".into()));

        let result = operation(&group, index("1")).execute().await.unwrap();

        assert_eq!(shard_info(&result).successful, 2);
        let failures = group.primary.shard_failures();
        assert_eq!(failures.len(), 2);
        assert!(failures
            .iter()
            .all(|m| m.starts_with("primary failed updating local checkpoint for replica")));
    }

    #[test]
    fn test_checkpoint_update_after_close_is_ignored() {
        let group = group(1);
        let routing = replica(1);
        let (tx, _rx) = oneshot::channel();
        let inner = Inner {
            primary: Arc::clone(&group.primary),
            replicas: Arc::clone(&group.replicas),
            proxy: ReplicationProxy::default(),
            config: ReplicationConfig::default(),
            primary_term: 1,
            op_type: "write".to_string(),
            total_shards: AtomicUsize::new(0),
            successful_shards: AtomicUsize::new(0),
            pending_actions: AtomicUsize::new(0),
            finished: AtomicBool::new(false),
            shard_failures: Mutex::new(Vec::new()),
            primary_result: Mutex::new(None),
            listener: Mutex::new(Some(tx)),
        };
        group.primary.close();

        inner.update_checkpoints(&routing, 0, 0);

        assert!(group.primary.shard_failures().is_empty());
    }

    #[tokio::test]
    async fn test_mode_aware_proxy() {
        let group = group_of(vec![
            primary_routing(),
            replica(1).with_replication_mode(ReplicationMode::PrimaryTermValidation),
            replica(2),
        ]);

        let result = operation(&group, index("1"))
            .with_proxy(ReplicationProxy::mode_aware(None))
            .execute()
            .await
            .unwrap();

        // the copy without a hint is neither sent to nor counted
        let info = shard_info(&result);
        assert_eq!(info.total, 2);
        assert_eq!(info.successful, 2);
        let calls = group.replicas.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].allocation_id, replica_id(1));
        assert_eq!(calls[0].mode, ReplicationMode::PrimaryTermValidation);
        assert_eq!(group.replicas.doc_count(&replica_id(1)), 0);
    }

    #[tokio::test]
    async fn test_delete_is_replicated() {
        let group = group(1);

        operation(&group, index("a")).execute().await.unwrap();
        let result = operation(&group, WriteRequest::delete(shard_id(), "a"))
            .execute()
            .await
            .unwrap();

        assert_eq!(result.seq_no(), Some(1));
        assert_eq!(shard_info(&result).successful, 2);
        assert_eq!(group.primary.doc_count(), 0);
        assert_eq!(group.replicas.doc_count(&replica_id(1)), 0);
        let calls = group.replicas.calls_to(&replica_id(1));
        assert_eq!(calls[1].max_seq_no_of_updates_or_deletes, 1);
    }

    struct PanickingReplicas;

    #[async_trait::async_trait]
    impl Replicas<ReplicaWrite> for PanickingReplicas {
        async fn perform_on(
            &self,
            _replica: &ShardRouting,
            _request: &ReplicaWrite,
            _primary_term: u64,
            _global_checkpoint: SeqNo,
            _max_seq_no_of_updates_or_deletes: SeqNo,
        ) -> Result<ReplicaResponse> {
            panic!("replica transport crashed");
        }

        async fn fail_shard_if_needed(
            &self,
            _replica: &ShardRouting,
            _primary_term: u64,
            _message: &str,
            _cause: &Error,
        ) -> Result<()> {
            Ok(())
        }

        async fn mark_shard_copy_as_stale_if_needed(
            &self,
            _shard_id: &ShardId,
            _allocation_id: &AllocationId,
            _primary_term: u64,
        ) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_panicking_replica_call_does_not_hang() {
        let group = group(1);
        let operation =
            ReplicationOperation::new(index("1"), Arc::clone(&group.primary), Arc::new(PanickingReplicas), 1);

        let result = tokio::time::timeout(Duration::from_secs(5), operation.execute())
            .await
            .expect("operation resolves after a task panics");

        assert!(matches!(result, Err(Error::Internal(_))));
    }

    #[tokio::test]
    async fn test_noop_is_not_replicated() {
        let group = group(2);

        let result = operation(&group, WriteRequest::new(shard_id(), WriteOp::Noop))
            .execute()
            .await
            .unwrap();

        let info = shard_info(&result);
        assert_eq!(info.total, 1);
        assert_eq!(info.successful, 1);
        assert!(group.replicas.calls().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_operations_complete_once() {
        let mut shards = vec![primary_routing()];
        shards.extend((1..=16).map(replica));
        let table = IndexShardRoutingTable::new(shard_id(), shards);
        let group = Group {
            primary: Arc::new(LocalPrimary::new(table, 1).unwrap()),
            replicas: Arc::new(LocalReplicas::new().with_max_latency(Duration::from_millis(5))),
        };
        for n in 1..=8 {
            group
                .replicas
                .fail_always(&replica_id(n), || Error::InvalidRequest("rejected by replica".into()));
        }

        let operations = (0..20).map(|i| operation(&group, index(&i.to_string())).execute());
        let results = futures::future::join_all(operations).await;

        for result in results {
            let result = result.unwrap();
            let info = shard_info(&result);
            assert_eq!(info.total, 17);
            assert_eq!(info.successful, 9);
            assert_eq!(info.failed(), 8);
        }
        assert_eq!(group.replicas.failed_shards().len(), 8 * 20);
    }
}
