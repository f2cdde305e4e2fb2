//! Replication Proxy
//!
//! Decides per shard copy whether and how a write is sent to it.

use serde::{Deserialize, Serialize};

use crate::shard::ShardRouting;

/// How a copy takes part in replication
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplicationMode {
    /// The write is sent and must be acknowledged
    FullReplication,
    /// The write is sent only to validate the primary term
    PrimaryTermValidation,
    /// The copy is skipped
    NoReplication,
}

impl ReplicationMode {
    /// Whether a call is dispatched for this mode
    pub fn dispatches(&self) -> bool {
        !matches!(self, ReplicationMode::NoReplication)
    }
}

impl std::fmt::Display for ReplicationMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReplicationMode::FullReplication => write!(f, "FULL_REPLICATION"),
            ReplicationMode::PrimaryTermValidation => write!(f, "PRIMARY_TERM_VALIDATION"),
            ReplicationMode::NoReplication => write!(f, "NO_REPLICATION"),
        }
    }
}

/// Replication mode policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReplicationProxy {
    /// Full replication to every copy other than the primary
    #[default]
    Fanout,
    /// Respect the topology mode hint, falling back to an override
    ModeAware {
        override_mode: Option<ReplicationMode>,
    },
}

impl ReplicationProxy {
    pub fn mode_aware(override_mode: Option<ReplicationMode>) -> Self {
        ReplicationProxy::ModeAware { override_mode }
    }

    /// Replication mode for `shard` given the current primary routing
    pub fn determine_mode(&self, shard: &ShardRouting, primary: &ShardRouting) -> ReplicationMode {
        if shard.is_same_allocation(primary) {
            return ReplicationMode::NoReplication;
        }

        match self {
            ReplicationProxy::Fanout => ReplicationMode::FullReplication,
            ReplicationProxy::ModeAware { override_mode } => {
                // the relocation target of the primary must receive everything
                let is_primary_target = primary.relocating()
                    && primary
                        .relocation_target()
                        .map(|target| shard.is_same_allocation(target))
                        .unwrap_or(false);
                if is_primary_target {
                    return ReplicationMode::FullReplication;
                }

                if shard.replication_mode != ReplicationMode::NoReplication {
                    return shard.replication_mode;
                }

                override_mode.unwrap_or(ReplicationMode::NoReplication)
            }
        }
    }
}
