//! Checkpoint Tracker
//!
//! Tracks the local checkpoint of every copy of a shard on the primary and
//! derives the global checkpoint from the in-sync copies.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use crate::error::{Error, Result};
use crate::shard::{AllocationId, SeqNo, ShardId, NO_OPS_PERFORMED, UNASSIGNED_SEQ_NO};

#[derive(Debug, Clone, Copy)]
struct CopyState {
    local_checkpoint: SeqNo,
    global_checkpoint: SeqNo,
    in_sync: bool,
}

#[derive(Debug, Default)]
struct TrackerState {
    copies: HashMap<AllocationId, CopyState>,
    global_checkpoint: SeqNo,
    version: u64,
    closed: bool,
}

/// Checkpoint bookkeeping for the copies of one shard
#[derive(Debug)]
pub struct CheckpointTracker {
    shard_id: ShardId,
    state: RwLock<TrackerState>,
}

impl CheckpointTracker {
    pub fn new(shard_id: ShardId) -> Self {
        Self {
            shard_id,
            state: RwLock::new(TrackerState {
                global_checkpoint: NO_OPS_PERFORMED,
                ..Default::default()
            }),
        }
    }

    /// Start tracking a copy
    pub fn track(&self, allocation_id: AllocationId, in_sync: bool) {
        let mut state = self.write();
        state.copies.entry(allocation_id).or_insert(CopyState {
            local_checkpoint: UNASSIGNED_SEQ_NO,
            global_checkpoint: UNASSIGNED_SEQ_NO,
            in_sync,
        });
        state.version += 1;
    }

    /// Stop tracking a copy, removing it from the in-sync set
    pub fn remove(&self, allocation_id: &AllocationId) -> bool {
        let mut state = self.write();
        let removed = state.copies.remove(allocation_id).is_some();
        if removed {
            state.version += 1;
            Self::advance_global_checkpoint(&mut state);
        }
        removed
    }

    pub fn update_local_checkpoint(&self, allocation_id: &AllocationId, checkpoint: SeqNo) -> Result<()> {
        let mut state = self.write();
        self.ensure_open(&state)?;
        let copy = state
            .copies
            .get_mut(allocation_id)
            .ok_or_else(|| self.unknown(allocation_id))?;
        if checkpoint > copy.local_checkpoint {
            copy.local_checkpoint = checkpoint;
            Self::advance_global_checkpoint(&mut state);
        }
        Ok(())
    }

    /// Record the global checkpoint a copy reported back
    pub fn update_global_checkpoint_for_shard(
        &self,
        allocation_id: &AllocationId,
        global_checkpoint: SeqNo,
    ) -> Result<()> {
        let mut state = self.write();
        self.ensure_open(&state)?;
        let copy = state
            .copies
            .get_mut(allocation_id)
            .ok_or_else(|| self.unknown(allocation_id))?;
        copy.global_checkpoint = copy.global_checkpoint.max(global_checkpoint);
        Ok(())
    }

    pub fn local_checkpoint(&self, allocation_id: &AllocationId) -> Option<SeqNo> {
        self.read().copies.get(allocation_id).map(|c| c.local_checkpoint)
    }

    /// Last global checkpoint reported by a copy
    pub fn global_checkpoint_of(&self, allocation_id: &AllocationId) -> Option<SeqNo> {
        self.read().copies.get(allocation_id).map(|c| c.global_checkpoint)
    }

    /// Highest sequence number every in-sync copy has processed
    pub fn global_checkpoint(&self) -> SeqNo {
        self.read().global_checkpoint
    }

    pub fn in_sync_ids(&self) -> HashSet<AllocationId> {
        self.read()
            .copies
            .iter()
            .filter(|(_, c)| c.in_sync)
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn tracked_ids(&self) -> HashSet<AllocationId> {
        self.read().copies.keys().cloned().collect()
    }

    /// Incremented on every change to the tracked or in-sync sets
    pub fn version(&self) -> u64 {
        self.read().version
    }

    /// Reject further updates
    pub fn close(&self) {
        self.write().closed = true;
    }

    fn advance_global_checkpoint(state: &mut TrackerState) {
        let computed = state
            .copies
            .values()
            .filter(|c| c.in_sync)
            .map(|c| c.local_checkpoint)
            .min();
        if let Some(computed) = computed {
            if computed > state.global_checkpoint {
                state.global_checkpoint = computed;
            }
        }
    }

    fn ensure_open(&self, state: &TrackerState) -> Result<()> {
        if state.closed {
            return Err(Error::AlreadyClosed(format!("{} checkpoint tracker is closed", self.shard_id)));
        }
        Ok(())
    }

    fn unknown(&self, allocation_id: &AllocationId) -> Error {
        Error::IllegalShardState {
            shard_id: self.shard_id.clone(),
            state: "UNTRACKED".to_string(),
            reason: format!("allocation [{}] is not tracked", allocation_id),
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, TrackerState> {
        self.state.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, TrackerState> {
        self.state.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_global_checkpoint_follows_slowest_in_sync_copy() {
        let tracker = CheckpointTracker::new(ShardId::new("logs", 0));
        let primary = AllocationId::new("p");
        let replica = AllocationId::new("r");
        let recovering = AllocationId::new("x");
        tracker.track(primary.clone(), true);
        tracker.track(replica.clone(), true);
        tracker.track(recovering.clone(), false);

        assert_eq!(tracker.global_checkpoint(), NO_OPS_PERFORMED);

        tracker.update_local_checkpoint(&primary, 5).unwrap();
        tracker.update_local_checkpoint(&replica, 3).unwrap();
        assert_eq!(tracker.global_checkpoint(), 3);

        // copies outside the in-sync set do not hold it back
        tracker.update_local_checkpoint(&recovering, 0).unwrap();
        assert_eq!(tracker.global_checkpoint(), 3);

        // local checkpoints never go backwards
        tracker.update_local_checkpoint(&replica, 1).unwrap();
        assert_eq!(tracker.local_checkpoint(&replica), Some(3));
    }

    #[test]
    fn test_removing_lagging_copy_advances_global_checkpoint() {
        let tracker = CheckpointTracker::new(ShardId::new("logs", 0));
        let primary = AllocationId::new("p");
        let replica = AllocationId::new("r");
        tracker.track(primary.clone(), true);
        tracker.track(replica.clone(), true);
        tracker.update_local_checkpoint(&primary, 9).unwrap();
        let version = tracker.version();

        assert!(tracker.remove(&replica));
        assert!(tracker.version() > version);
        assert_eq!(tracker.global_checkpoint(), 9);
        assert!(!tracker.in_sync_ids().contains(&replica));
    }

    #[test]
    fn test_closed_tracker_rejects_updates() {
        let tracker = CheckpointTracker::new(ShardId::new("logs", 0));
        let primary = AllocationId::new("p");
        tracker.track(primary.clone(), true);
        tracker.close();

        let err = tracker.update_local_checkpoint(&primary, 1).unwrap_err();
        assert!(err.is_already_closed());
        assert!(tracker.update_local_checkpoint(&AllocationId::new("?"), 1).is_err());
    }
}
