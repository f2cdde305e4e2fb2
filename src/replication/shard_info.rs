//! Per-operation shard report

use std::sync::Arc;
use serde::{Serialize, Serializer};

use crate::error::{Error, Status};
use crate::shard::ShardId;

/// How many copies a write reached
#[derive(Debug, Clone, Default, Serialize)]
pub struct ShardInfo {
    pub total: usize,
    pub successful: usize,
    pub failures: Vec<ShardFailure>,
}

impl ShardInfo {
    pub fn new(total: usize, successful: usize, failures: Vec<ShardFailure>) -> Self {
        Self { total, successful, failures }
    }

    pub fn failed(&self) -> usize {
        self.failures.len()
    }
}

/// A copy that failed to apply a write
#[derive(Debug, Clone, Serialize)]
pub struct ShardFailure {
    pub shard_id: ShardId,
    pub node_id: Option<String>,
    #[serde(rename = "reason", serialize_with = "serialize_cause")]
    pub cause: Arc<Error>,
    pub status: Status,
    pub primary: bool,
}

fn serialize_cause<S: Serializer>(cause: &Arc<Error>, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&cause.to_string())
}
