use std::collections::HashSet;

use serde::Serialize;
use tracing::info;

use crate::models::{Node, Strategy};
use crate::store::Ledger;
use crate::sync::{ConfigSynchronizer, SyncOutcome};

use super::ProvisionError;

/// Differences between one node's live client list and what the ledger expects.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub node_id: i64,
    pub node_name: String,
    pub live_clients: usize,
    /// Pool entries whose id is not in the node config.
    pub pool_missing_on_node: Vec<String>,
    /// Grants of active subscriptions whose id is not in the node config.
    pub grants_missing_on_node: Vec<String>,
    /// Ids of revoked subscriptions still in the node config, whether or not the
    /// node ever held a grant for them.
    pub stale_on_node: Vec<String>,
    /// Ids in the node config the ledger has never seen.
    pub unknown_on_node: Vec<String>,
}

impl ReconcileReport {
    pub fn is_consistent(&self) -> bool {
        self.pool_missing_on_node.is_empty()
            && self.grants_missing_on_node.is_empty()
            && self.stale_on_node.is_empty()
            && self.unknown_on_node.is_empty()
    }
}

/// Read the node config and compare it against pool entries and grants.
pub async fn reconcile_node(
    ledger: &dyn Ledger,
    sync: &ConfigSynchronizer,
    node: &Node,
) -> Result<ReconcileReport, ProvisionError> {
    let doc = sync.read_document(node).await?;
    let live_ids = doc.client_ids();
    let live: HashSet<&str> = live_ids.iter().map(String::as_str).collect();

    let pool = ledger.pool_entries(node.id).await?;
    let active = ledger.grants_for_node(node.id, true).await?;
    let revoked = ledger.grants_for_node(node.id, false).await?;

    let pooled: HashSet<&str> = pool.iter().map(|e| e.client_id.as_str()).collect();
    let granted: HashSet<&str> = active.iter().map(|g| g.client_id.as_str()).collect();

    let pool_missing_on_node = pool
        .iter()
        .filter(|e| !live.contains(e.client_id.as_str()))
        .map(|e| e.client_id.clone())
        .collect();

    let grants_missing_on_node = active
        .iter()
        .filter(|g| !live.contains(g.client_id.as_str()))
        .map(|g| g.client_id.clone())
        .collect();

    // A partial sync can leave a subscription's id on a node that never got a
    // grant for it, so revoked subscriptions are matched by client id as well.
    let ungranted: Vec<String> = live_ids
        .iter()
        .filter(|id| !pooled.contains(id.as_str()) && !granted.contains(id.as_str()))
        .cloned()
        .collect();
    let orphaned = if ungranted.is_empty() {
        Vec::new()
    } else {
        ledger.revoked_client_ids(&ungranted).await?
    };

    let mut stale_on_node: Vec<String> = revoked
        .iter()
        .filter(|g| g.strategy == Strategy::LiveSync)
        .map(|g| g.client_id.as_str())
        .chain(orphaned.iter().map(String::as_str))
        .filter(|id| live.contains(id) && !pooled.contains(id) && !granted.contains(id))
        .map(str::to_string)
        .collect();
    stale_on_node.sort();
    stale_on_node.dedup();

    let known: HashSet<&str> = pooled
        .iter()
        .chain(granted.iter())
        .copied()
        .chain(revoked.iter().map(|g| g.client_id.as_str()))
        .chain(orphaned.iter().map(String::as_str))
        .collect();
    let unknown_on_node = live_ids
        .iter()
        .filter(|id| !known.contains(id.as_str()))
        .cloned()
        .collect();

    Ok(ReconcileReport {
        node_id: node.id,
        node_name: node.name.clone(),
        live_clients: live_ids.len(),
        pool_missing_on_node,
        grants_missing_on_node,
        stale_on_node,
        unknown_on_node,
    })
}

/// Remove the report's stale ids from the node in one mutation.
pub async fn prune_stale(
    sync: &ConfigSynchronizer,
    node: &Node,
    report: &ReconcileReport,
) -> Result<SyncOutcome, ProvisionError> {
    if report.stale_on_node.is_empty() {
        return Ok(SyncOutcome::Unchanged);
    }
    let outcome = sync.remove_clients(node, &report.stale_on_node).await?;
    info!(node = %node.name, removed = report.stale_on_node.len(), "pruned stale clients");
    Ok(outcome)
}
