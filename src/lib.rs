//! ShardSync - Write Replication for Shard-Partitioned Storage
//!
//! The write-replication core of a shard-partitioned storage engine: a write
//! accepted by a shard's primary copy is propagated to every replica copy
//! in the replication group, with per-copy retries, stale-copy marking and
//! checkpoint bookkeeping, and a single outcome reported to the caller.
//!
//! # Architecture
//!
//! The primary copy and the replica transport are supplied by the
//! surrounding system through the `Primary` and `Replicas` traits.
//! `ReplicationOperation` drives one write through them. The `memory`
//! module provides an in-process shard group used by the simulator.
//!
//! # Features
//!
//! - Fan-out to every tracked copy, or mode-aware replication per copy
//! - Randomized exponential backoff for transient replica failures
//! - Cancellation of in-flight replica calls when a copy leaves the group
//! - Stale marking of in-sync copies that are no longer assigned
//! - Global and local checkpoint propagation

pub mod config;
pub mod error;
pub mod shard;
pub mod replication;
pub mod memory;

pub use config::ShardSyncConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::ShardSyncConfig;
    pub use crate::error::{Error, Result};
    pub use crate::shard::{ActiveShardCount, AllocationId, ShardId, ShardRouting};
    pub use crate::replication::{
        Primary, PrimaryResult, Replicas, ReplicationOperation, ReplicationProxy, ShardInfo,
    };
}
