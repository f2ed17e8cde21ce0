//! Capacity allocator: which nodes can take one more subscription, best first.

use crate::models::{Node, NodeLoad};
use crate::store::Ledger;

/// Keep nodes that are active and under capacity, least loaded first, ties by id.
///
/// Advisory only. Two concurrent creates can both pick the same node.
pub fn rank_available(mut loads: Vec<NodeLoad>) -> Vec<Node> {
    loads.retain(NodeLoad::has_room);
    loads.sort_by_key(|l| (l.load, l.node.id));
    loads.into_iter().map(|l| l.node).collect()
}

pub async fn list_available_nodes(ledger: &dyn Ledger) -> anyhow::Result<Vec<Node>> {
    Ok(rank_available(ledger.node_loads().await?))
}
