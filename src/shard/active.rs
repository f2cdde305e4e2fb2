//! Active Shard Count
//!
//! Minimum number of active copies a write requires before it starts.

use std::fmt;
use std::str::FromStr;
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::shard::IndexShardRoutingTable;

/// Minimum active-copy requirement for a write
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawActiveShardCount", into = "String")]
pub enum ActiveShardCount {
    /// Do not wait for any copy
    None,
    /// Every copy of the shard must be active
    All,
    /// At least this many copies must be active
    Count(u32),
}

impl Default for ActiveShardCount {
    fn default() -> Self {
        ActiveShardCount::Count(1)
    }
}

impl ActiveShardCount {
    /// Whether the routing table has enough active copies
    pub fn enough_shards_active(&self, table: &IndexShardRoutingTable) -> bool {
        let active = table.active_shards().len();
        match self {
            ActiveShardCount::None => true,
            ActiveShardCount::All => active == table.size(),
            ActiveShardCount::Count(n) => active >= *n as usize,
        }
    }

    /// The number of copies required against this routing table
    pub fn resolve(&self, table: &IndexShardRoutingTable) -> usize {
        match self {
            ActiveShardCount::None => 0,
            ActiveShardCount::All => table.size(),
            ActiveShardCount::Count(n) => *n as usize,
        }
    }
}

impl fmt::Display for ActiveShardCount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActiveShardCount::None => write!(f, "none"),
            ActiveShardCount::All => write!(f, "all"),
            ActiveShardCount::Count(n) => write!(f, "{}", n),
        }
    }
}

impl FromStr for ActiveShardCount {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" => Ok(ActiveShardCount::None),
            "all" => Ok(ActiveShardCount::All),
            other => other.parse::<u32>().map(ActiveShardCount::Count).map_err(|_| {
                Error::Config(format!(
                    "wait_for_active_shards must be 'none', 'all' or a non-negative integer, got [{}]",
                    s
                ))
            }),
        }
    }
}

/// Serialized form, either a bare integer or a string
#[derive(Deserialize)]
#[serde(untagged)]
enum RawActiveShardCount {
    Count(u32),
    Name(String),
}

impl TryFrom<RawActiveShardCount> for ActiveShardCount {
    type Error = Error;

    fn try_from(value: RawActiveShardCount) -> Result<Self, Self::Error> {
        match value {
            RawActiveShardCount::Count(n) => Ok(ActiveShardCount::Count(n)),
            RawActiveShardCount::Name(name) => name.parse(),
        }
    }
}

impl From<ActiveShardCount> for String {
    fn from(value: ActiveShardCount) -> Self {
        value.to_string()
    }
}
