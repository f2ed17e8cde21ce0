pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::models::{
    Grant, NewGrant, NewNode, NewPoolEntry, NewSubscription, Node, NodeLoad, PoolEntry, Strategy,
    Subscription,
};

/// Result of flipping a subscription to inactive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Deactivation {
    NotFound,
    AlreadyInactive,
    /// Flipped by this call. Carries every grant the subscription held.
    Deactivated(Vec<Grant>),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FleetStats {
    pub total_accounts: i64,
    pub active_subscriptions: i64,
    pub active_nodes: i64,
}

/// The central ledger: accounts, nodes, subscriptions, grants and pool entries.
///
/// Every method is one unit of work. Methods that touch more than one row run
/// inside a single transaction and leave nothing behind when they fail.
/// Implementations: `PgStore` (Postgres), `MemoryLedger` (tests, dry runs).
#[async_trait]
pub trait Ledger: Send + Sync {
    // -- Node registry --

    async fn insert_node(&self, node: &NewNode) -> anyhow::Result<Node>;

    async fn get_node(&self, id: i64) -> anyhow::Result<Option<Node>>;

    /// All nodes, active or not, with their live load. Ordered by node id.
    async fn node_loads(&self) -> anyhow::Result<Vec<NodeLoad>>;

    async fn set_node_active(&self, id: i64, active: bool) -> anyhow::Result<bool>;

    async fn set_node_strategy(&self, id: i64, strategy: Option<Strategy>) -> anyhow::Result<bool>;

    // -- Subscriptions --

    /// Resolve-or-create the account, insert the subscription and all of its grants
    /// atomically.
    async fn record_subscription(
        &self,
        subscription: &NewSubscription,
        grants: &[NewGrant],
    ) -> anyhow::Result<(Subscription, Vec<Grant>)>;

    async fn get_subscription(&self, id: i64) -> anyhow::Result<Option<Subscription>>;

    async fn subscription_by_token(&self, token: &str) -> anyhow::Result<Option<Subscription>>;

    /// The latest-expiring active subscription owned by an external account id.
    async fn active_subscription_for_account(
        &self,
        external_id: i64,
    ) -> anyhow::Result<Option<Subscription>>;

    async fn grants_for_subscription(&self, subscription_id: i64) -> anyhow::Result<Vec<Grant>>;

    /// Grants on a node whose subscription activity matches `active`.
    async fn grants_for_node(&self, node_id: i64, active: bool) -> anyhow::Result<Vec<Grant>>;

    /// Mark inactive and return pooled ids to the pool, in one transaction.
    /// Only the call that performs the flip gets `Deactivated`.
    async fn deactivate_subscription(&self, id: i64) -> anyhow::Result<Deactivation>;

    async fn expired_subscription_ids(&self, now: DateTime<Utc>) -> anyhow::Result<Vec<i64>>;

    /// The subset of `client_ids` owned by inactive subscriptions.
    async fn revoked_client_ids(&self, client_ids: &[String]) -> anyhow::Result<Vec<String>>;

    // -- Credential pool --

    /// Atomically claim one unused entry for the node.
    async fn claim_pool_entry(&self, node_id: i64) -> anyhow::Result<Option<PoolEntry>>;

    async fn release_pool_entry(&self, node_id: i64, client_id: &str) -> anyhow::Result<bool>;

    /// Insert unused entries, skipping duplicates. Returns the number of new rows.
    async fn import_pool_entries(
        &self,
        node_id: i64,
        entries: &[NewPoolEntry],
    ) -> anyhow::Result<u64>;

    async fn pool_entries(&self, node_id: i64) -> anyhow::Result<Vec<PoolEntry>>;

    async fn stats(&self) -> anyhow::Result<FleetStats>;
}
