use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// How client identifiers reach a node.
///
/// `LiveSync` pushes a freshly minted id into the node's config (one restart per
/// subscription). `PooledDraw` claims an id that was bulk-provisioned ahead of time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    LiveSync,
    PooledDraw,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::LiveSync => "live_sync",
            Strategy::PooledDraw => "pooled_draw",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Strategy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "live_sync" | "live" => Ok(Strategy::LiveSync),
            "pooled_draw" | "pool" | "pooled" => Ok(Strategy::PooledDraw),
            other => anyhow::bail!("unknown provisioning strategy: {}", other),
        }
    }
}

/// A proxy node under fleet management.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub id: i64,
    pub name: String,
    pub address: String,
    pub port: u16,
    pub public_key: String,
    pub ssh_user: String,
    pub ssh_port: u16,
    /// Soft capacity target, compared against live grant count.
    pub capacity: i64,
    pub is_active: bool,
    /// Per-node override; `None` falls back to the deployment default.
    pub strategy: Option<Strategy>,
    pub created_at: DateTime<Utc>,
}

impl Node {
    pub fn effective_strategy(&self, default: Strategy) -> Strategy {
        self.strategy.unwrap_or(default)
    }
}

#[derive(Debug, Clone)]
pub struct NewNode {
    pub name: String,
    pub address: String,
    pub port: u16,
    pub public_key: String,
    pub ssh_user: String,
    pub ssh_port: u16,
    pub capacity: i64,
    pub strategy: Option<Strategy>,
}

/// A node together with its current load: grants held by active subscriptions.
#[derive(Debug, Clone, Serialize)]
pub struct NodeLoad {
    pub node: Node,
    pub load: i64,
}

impl NodeLoad {
    pub fn has_room(&self) -> bool {
        self.node.is_active && self.load < self.node.capacity
    }
}
