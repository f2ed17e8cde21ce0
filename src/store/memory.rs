//! In-process ledger with the same constraints as the Postgres schema.
//!
//! Every method holds the state lock for its whole duration, which gives the same
//! all-or-nothing behaviour the Postgres store gets from transactions.

use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{Deactivation, FleetStats, Ledger};
use crate::models::{
    Account, Grant, NewGrant, NewNode, NewPoolEntry, NewSubscription, Node, NodeLoad, PoolEntry,
    Strategy, Subscription,
};

#[derive(Default)]
struct State {
    next_id: i64,
    accounts: Vec<Account>,
    nodes: Vec<Node>,
    subscriptions: Vec<Subscription>,
    grants: Vec<Grant>,
    pool: Vec<PoolEntry>,
    fail_writes: bool,
}

impl State {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn load_of(&self, node_id: i64) -> i64 {
        self.grants
            .iter()
            .filter(|g| g.node_id == node_id && self.is_active(g.subscription_id))
            .count() as i64
    }

    fn is_active(&self, subscription_id: i64) -> bool {
        self.subscriptions
            .iter()
            .any(|s| s.id == subscription_id && s.is_active)
    }

    fn grants_of(&self, subscription_id: i64) -> Vec<Grant> {
        let mut grants: Vec<Grant> = self
            .grants
            .iter()
            .filter(|g| g.subscription_id == subscription_id)
            .cloned()
            .collect();
        grants.sort_by(|a, b| a.node_name.cmp(&b.node_name).then(a.node_id.cmp(&b.node_id)));
        grants
    }
}

#[derive(Default)]
pub struct MemoryLedger {
    state: Mutex<State>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `record_subscription` fail, as a lost connection would.
    pub fn set_fail_writes(&self, fail: bool) {
        if let Ok(mut state) = self.state.lock() {
            state.fail_writes = fail;
        }
    }

    fn lock(&self) -> anyhow::Result<MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| anyhow::anyhow!("memory ledger lock poisoned"))
    }
}

#[async_trait]
impl Ledger for MemoryLedger {
    async fn insert_node(&self, new: &NewNode) -> anyhow::Result<Node> {
        let mut state = self.lock()?;
        let node = Node {
            id: state.next_id(),
            name: new.name.clone(),
            address: new.address.clone(),
            port: new.port,
            public_key: new.public_key.clone(),
            ssh_user: new.ssh_user.clone(),
            ssh_port: new.ssh_port,
            capacity: new.capacity,
            is_active: true,
            strategy: new.strategy,
            created_at: Utc::now(),
        };
        state.nodes.push(node.clone());
        Ok(node)
    }

    async fn get_node(&self, id: i64) -> anyhow::Result<Option<Node>> {
        let state = self.lock()?;
        Ok(state.nodes.iter().find(|n| n.id == id).cloned())
    }

    async fn node_loads(&self) -> anyhow::Result<Vec<NodeLoad>> {
        let state = self.lock()?;
        let mut loads: Vec<NodeLoad> = state
            .nodes
            .iter()
            .map(|n| NodeLoad {
                node: n.clone(),
                load: state.load_of(n.id),
            })
            .collect();
        loads.sort_by_key(|l| l.node.id);
        Ok(loads)
    }

    async fn set_node_active(&self, id: i64, active: bool) -> anyhow::Result<bool> {
        let mut state = self.lock()?;
        Ok(match state.nodes.iter_mut().find(|n| n.id == id) {
            Some(node) => {
                node.is_active = active;
                true
            }
            None => false,
        })
    }

    async fn set_node_strategy(&self, id: i64, strategy: Option<Strategy>) -> anyhow::Result<bool> {
        let mut state = self.lock()?;
        Ok(match state.nodes.iter_mut().find(|n| n.id == id) {
            Some(node) => {
                node.strategy = strategy;
                true
            }
            None => false,
        })
    }

    async fn record_subscription(
        &self,
        sub: &NewSubscription,
        grants: &[NewGrant],
    ) -> anyhow::Result<(Subscription, Vec<Grant>)> {
        let mut state = self.lock()?;

        if state.fail_writes {
            anyhow::bail!("ledger write rejected: connection lost");
        }
        if state
            .subscriptions
            .iter()
            .any(|s| s.access_token == sub.access_token || s.client_id == sub.client_id)
        {
            anyhow::bail!("unique constraint violated: subscriptions");
        }
        for (i, grant) in grants.iter().enumerate() {
            if !state.nodes.iter().any(|n| n.id == grant.node_id) {
                anyhow::bail!("foreign key violated: node {} does not exist", grant.node_id);
            }
            if grants[..i].iter().any(|g| g.node_id == grant.node_id) {
                anyhow::bail!("unique constraint violated: grants (subscription_id, node_id)");
            }
            if grant.strategy == Strategy::LiveSync
                && state.grants.iter().any(|g| {
                    g.strategy == Strategy::LiveSync
                        && g.node_id == grant.node_id
                        && g.client_id == grant.client_id
                })
            {
                anyhow::bail!("unique constraint violated: grants (node_id, client_id)");
            }
        }

        // All checks passed; nothing below can fail.
        let existing = state
            .accounts
            .iter()
            .position(|a| a.external_id == sub.external_id);
        let account_id = match existing {
            Some(index) => {
                let account = &mut state.accounts[index];
                if sub.display_name.is_some() {
                    account.display_name = sub.display_name.clone();
                }
                account.id
            }
            None => {
                let id = state.next_id();
                state.accounts.push(Account {
                    id,
                    external_id: sub.external_id,
                    display_name: sub.display_name.clone(),
                    created_at: sub.created_at,
                });
                id
            }
        };

        let subscription = Subscription {
            id: state.next_id(),
            account_id,
            client_id: sub.client_id.clone(),
            access_token: sub.access_token.clone(),
            is_active: true,
            created_at: sub.created_at,
            expires_at: sub.expires_at,
        };
        state.subscriptions.push(subscription.clone());

        for grant in grants {
            let node_name = state
                .nodes
                .iter()
                .find(|n| n.id == grant.node_id)
                .map(|n| n.name.clone())
                .unwrap_or_default();
            let id = state.next_id();
            state.grants.push(Grant {
                id,
                subscription_id: subscription.id,
                node_id: grant.node_id,
                node_name,
                client_id: grant.client_id.clone(),
                strategy: grant.strategy,
                access_url: grant.access_url.clone(),
                created_at: sub.created_at,
            });
        }

        let grants = state.grants_of(subscription.id);
        Ok((subscription, grants))
    }

    async fn get_subscription(&self, id: i64) -> anyhow::Result<Option<Subscription>> {
        let state = self.lock()?;
        Ok(state.subscriptions.iter().find(|s| s.id == id).cloned())
    }

    async fn subscription_by_token(&self, token: &str) -> anyhow::Result<Option<Subscription>> {
        let state = self.lock()?;
        Ok(state
            .subscriptions
            .iter()
            .find(|s| s.access_token == token)
            .cloned())
    }

    async fn active_subscription_for_account(
        &self,
        external_id: i64,
    ) -> anyhow::Result<Option<Subscription>> {
        let state = self.lock()?;
        let Some(account) = state.accounts.iter().find(|a| a.external_id == external_id) else {
            return Ok(None);
        };
        Ok(state
            .subscriptions
            .iter()
            .filter(|s| s.account_id == account.id && s.is_active)
            .max_by_key(|s| s.expires_at)
            .cloned())
    }

    async fn grants_for_subscription(&self, subscription_id: i64) -> anyhow::Result<Vec<Grant>> {
        let state = self.lock()?;
        Ok(state.grants_of(subscription_id))
    }

    async fn grants_for_node(&self, node_id: i64, active: bool) -> anyhow::Result<Vec<Grant>> {
        let state = self.lock()?;
        Ok(state
            .grants
            .iter()
            .filter(|g| g.node_id == node_id && state.is_active(g.subscription_id) == active)
            .cloned()
            .collect())
    }

    async fn deactivate_subscription(&self, id: i64) -> anyhow::Result<Deactivation> {
        let mut state = self.lock()?;

        match state.subscriptions.iter_mut().find(|s| s.id == id) {
            None => return Ok(Deactivation::NotFound),
            Some(sub) if !sub.is_active => return Ok(Deactivation::AlreadyInactive),
            Some(sub) => sub.is_active = false,
        }

        let grants = state.grants_of(id);
        for grant in grants.iter().filter(|g| g.strategy == Strategy::PooledDraw) {
            if let Some(entry) = state
                .pool
                .iter_mut()
                .find(|p| p.node_id == grant.node_id && p.client_id == grant.client_id)
            {
                entry.is_used = false;
            }
        }
        Ok(Deactivation::Deactivated(grants))
    }

    async fn expired_subscription_ids(&self, now: DateTime<Utc>) -> anyhow::Result<Vec<i64>> {
        let state = self.lock()?;
        let mut expired: Vec<&Subscription> = state
            .subscriptions
            .iter()
            .filter(|s| s.is_active && s.expires_at < now)
            .collect();
        expired.sort_by_key(|s| (s.expires_at, s.id));
        Ok(expired.into_iter().map(|s| s.id).collect())
    }

    async fn revoked_client_ids(&self, client_ids: &[String]) -> anyhow::Result<Vec<String>> {
        let state = self.lock()?;
        let mut ids: Vec<String> = state
            .subscriptions
            .iter()
            .filter(|s| !s.is_active && client_ids.contains(&s.client_id))
            .map(|s| s.client_id.clone())
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn claim_pool_entry(&self, node_id: i64) -> anyhow::Result<Option<PoolEntry>> {
        let mut state = self.lock()?;
        Ok(state
            .pool
            .iter_mut()
            .filter(|p| p.node_id == node_id && !p.is_used)
            .min_by_key(|p| p.id)
            .map(|entry| {
                entry.is_used = true;
                entry.clone()
            }))
    }

    async fn release_pool_entry(&self, node_id: i64, client_id: &str) -> anyhow::Result<bool> {
        let mut state = self.lock()?;
        Ok(
            match state
                .pool
                .iter_mut()
                .find(|p| p.node_id == node_id && p.client_id == client_id && p.is_used)
            {
                Some(entry) => {
                    entry.is_used = false;
                    true
                }
                None => false,
            },
        )
    }

    async fn import_pool_entries(
        &self,
        node_id: i64,
        entries: &[NewPoolEntry],
    ) -> anyhow::Result<u64> {
        let mut state = self.lock()?;
        if !state.nodes.iter().any(|n| n.id == node_id) {
            anyhow::bail!("foreign key violated: node {} does not exist", node_id);
        }

        let mut inserted = 0;
        for entry in entries {
            let duplicate = state
                .pool
                .iter()
                .any(|p| p.node_id == node_id && p.client_id == entry.client_id);
            if duplicate {
                continue;
            }
            let id = state.next_id();
            state.pool.push(PoolEntry {
                id,
                node_id,
                client_id: entry.client_id.clone(),
                label: entry.label.clone(),
                is_used: false,
            });
            inserted += 1;
        }
        Ok(inserted)
    }

    async fn pool_entries(&self, node_id: i64) -> anyhow::Result<Vec<PoolEntry>> {
        let state = self.lock()?;
        Ok(state
            .pool
            .iter()
            .filter(|p| p.node_id == node_id)
            .cloned()
            .collect())
    }

    async fn stats(&self) -> anyhow::Result<FleetStats> {
        let state = self.lock()?;
        Ok(FleetStats {
            total_accounts: state.accounts.len() as i64,
            active_subscriptions: state.subscriptions.iter().filter(|s| s.is_active).count()
                as i64,
            active_nodes: state.nodes.iter().filter(|n| n.is_active).count() as i64,
        })
    }
}
