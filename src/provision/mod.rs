//! How a client id gets onto a node, behind one capability.
//!
//! `LiveSync` edits the node's config for every subscription. `PooledDraw` hands
//! out ids that were bulk-added ahead of time and only touches the ledger.

pub mod reconcile;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, info};

use crate::models::{Node, Strategy};
use crate::store::Ledger;
use crate::sync::{ConfigSynchronizer, SyncError, SyncOutcome};

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error(transparent)]
    Sync(#[from] SyncError),
    #[error("credential pool for node {node} is exhausted")]
    PoolExhausted { node: String },
    #[error("ledger error: {0}")]
    Ledger(#[from] anyhow::Error),
}

impl ProvisionError {
    pub fn kind(&self) -> &'static str {
        match self {
            ProvisionError::Sync(e) => e.kind(),
            ProvisionError::PoolExhausted { .. } => "pool_exhausted",
            ProvisionError::Ledger(_) => "ledger",
        }
    }
}

/// What the caller wants on the node.
#[derive(Debug, Clone)]
pub struct ClientRequest {
    /// Preferred id. Pooled provisioning ignores it and returns its own.
    pub client_id: String,
    pub label: String,
}

#[async_trait]
pub trait NodeProvisioner: Send + Sync {
    fn strategy(&self) -> Strategy;

    /// Make a client live on the node. Returns the id actually provisioned.
    async fn provision(&self, node: &Node, request: &ClientRequest) -> Result<String, ProvisionError>;

    /// Undo `provision` for that id.
    async fn release(&self, node: &Node, client_id: &str) -> Result<(), ProvisionError>;
}

pub struct LiveSync {
    sync: Arc<ConfigSynchronizer>,
}

impl LiveSync {
    pub fn new(sync: Arc<ConfigSynchronizer>) -> Self {
        Self { sync }
    }
}

#[async_trait]
impl NodeProvisioner for LiveSync {
    fn strategy(&self) -> Strategy {
        Strategy::LiveSync
    }

    async fn provision(&self, node: &Node, request: &ClientRequest) -> Result<String, ProvisionError> {
        let entry = self.sync.client_entry(&request.client_id, &request.label);
        if self.sync.add_client(node, &entry).await? == SyncOutcome::Unchanged {
            debug!(node = %node.name, client_id = %request.client_id, "client already present");
        }
        Ok(request.client_id.clone())
    }

    async fn release(&self, node: &Node, client_id: &str) -> Result<(), ProvisionError> {
        self.sync.remove_client(node, client_id).await?;
        Ok(())
    }
}

pub struct PooledDraw {
    ledger: Arc<dyn Ledger>,
}

impl PooledDraw {
    pub fn new(ledger: Arc<dyn Ledger>) -> Self {
        Self { ledger }
    }
}

#[async_trait]
impl NodeProvisioner for PooledDraw {
    fn strategy(&self) -> Strategy {
        Strategy::PooledDraw
    }

    async fn provision(&self, node: &Node, _request: &ClientRequest) -> Result<String, ProvisionError> {
        let entry = self
            .ledger
            .claim_pool_entry(node.id)
            .await?
            .ok_or_else(|| ProvisionError::PoolExhausted {
                node: node.name.clone(),
            })?;
        info!(node = %node.name, pool_entry = entry.id, "claimed pooled client id");
        Ok(entry.client_id)
    }

    async fn release(&self, node: &Node, client_id: &str) -> Result<(), ProvisionError> {
        if !self.ledger.release_pool_entry(node.id, client_id).await? {
            debug!(node = %node.name, client_id, "pool entry was not in use");
        }
        Ok(())
    }
}

/// Both provisioners plus the deployment default; resolves the one a node uses.
#[derive(Clone)]
pub struct Provisioners {
    live_sync: Arc<dyn NodeProvisioner>,
    pooled_draw: Arc<dyn NodeProvisioner>,
    default: Strategy,
}

impl Provisioners {
    pub fn new(sync: Arc<ConfigSynchronizer>, ledger: Arc<dyn Ledger>, default: Strategy) -> Self {
        Self::from_parts(
            Arc::new(LiveSync::new(sync)),
            Arc::new(PooledDraw::new(ledger)),
            default,
        )
    }

    pub fn from_parts(
        live_sync: Arc<dyn NodeProvisioner>,
        pooled_draw: Arc<dyn NodeProvisioner>,
        default: Strategy,
    ) -> Self {
        Self {
            live_sync,
            pooled_draw,
            default,
        }
    }

    pub fn default_strategy(&self) -> Strategy {
        self.default
    }

    pub fn for_strategy(&self, strategy: Strategy) -> &Arc<dyn NodeProvisioner> {
        match strategy {
            Strategy::LiveSync => &self.live_sync,
            Strategy::PooledDraw => &self.pooled_draw,
        }
    }

    pub fn for_node(&self, node: &Node) -> &Arc<dyn NodeProvisioner> {
        self.for_strategy(node.effective_strategy(self.default))
    }
}
