//! Subscription lifecycle: create (fan-out), revoke, expiry sweep.
//!
//! Remote side effects happen before the ledger write on create and after it on
//! revoke. The ledger is therefore never ahead of the fleet for an active grant,
//! and a revoked subscription is dead locally even when every node is down.

use std::sync::Arc;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use rand::RngCore;
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::allocator;
use crate::credential::CredentialFabricator;
use crate::models::{Grant, NewGrant, NewSubscription, Node, Strategy, Subscription};
use crate::provision::{ClientRequest, Provisioners};
use crate::store::{Deactivation, Ledger};

const ACCESS_TOKEN_BYTES: usize = 24;

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("no node has free capacity")]
    NoCapacityAvailable,
    #[error("no node accepted the client ({} attempted)", .failures.len())]
    NoAcceptingNode { failures: Vec<NodeFailure> },
    #[error("subscription {0} not found")]
    SubscriptionNotFound(i64),
    #[error("ledger error: {0}")]
    Ledger(#[from] anyhow::Error),
}

/// A node left out of a fan-out, or one that could not be cleaned up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeFailure {
    pub node_id: i64,
    pub node_name: String,
    pub kind: &'static str,
    pub error: String,
}

#[derive(Debug, Clone)]
pub struct CreateRequest {
    /// External identity id of the account.
    pub account_id: i64,
    pub display_name: Option<String>,
    pub duration: Duration,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreateOutcome {
    pub subscription: Subscription,
    /// Authoritative: exactly the nodes that accepted the client.
    pub grants: Vec<Grant>,
    pub failures: Vec<NodeFailure>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RevokeOutcome {
    pub subscription_id: i64,
    /// False when the subscription was already inactive.
    pub deactivated: bool,
    pub released: usize,
    pub failures: Vec<NodeFailure>,
}

pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

pub struct SubscriptionManager {
    ledger: Arc<dyn Ledger>,
    provisioners: Provisioners,
    fabricator: CredentialFabricator,
    clock: Clock,
}

impl SubscriptionManager {
    pub fn new(
        ledger: Arc<dyn Ledger>,
        provisioners: Provisioners,
        fabricator: CredentialFabricator,
    ) -> Self {
        Self {
            ledger,
            provisioners,
            fabricator,
            clock: Arc::new(Utc::now),
        }
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn ledger(&self) -> &Arc<dyn Ledger> {
        &self.ledger
    }

    pub async fn create(&self, req: &CreateRequest) -> Result<CreateOutcome, LifecycleError> {
        if req.duration <= Duration::zero() {
            return Err(LifecycleError::InvalidRequest(
                "duration must be positive".to_string(),
            ));
        }
        let now = (self.clock)();
        let expires_at = now.checked_add_signed(req.duration).ok_or_else(|| {
            LifecycleError::InvalidRequest("duration is out of range".to_string())
        })?;

        let candidates = allocator::list_available_nodes(self.ledger.as_ref()).await?;
        if candidates.is_empty() {
            warn!(account_id = req.account_id, "no node with free capacity");
            return Err(LifecycleError::NoCapacityAvailable);
        }

        let request = ClientRequest {
            client_id: Uuid::new_v4().to_string(),
            label: format!("user_{}_{}", req.account_id, now.timestamp()),
        };
        let display = req
            .display_name
            .clone()
            .unwrap_or_else(|| req.account_id.to_string());

        let mut accepted: Vec<(Node, NewGrant)> = Vec::new();
        let mut failures = Vec::new();

        // Sequential on purpose: one node at a time, each bounded by the channel timeout.
        for node in candidates {
            let provisioner = self.provisioners.for_node(&node);
            match provisioner.provision(&node, &request).await {
                Ok(client_id) => {
                    let access_url = self.fabricator.fabricate(
                        &client_id,
                        &node,
                        &format!("{} {}", node.name, display),
                    );
                    let grant = NewGrant {
                        node_id: node.id,
                        client_id,
                        strategy: provisioner.strategy(),
                        access_url,
                    };
                    accepted.push((node, grant));
                }
                Err(e) => {
                    warn!(node = %node.name, kind = e.kind(), error = %e, "node rejected client");
                    failures.push(NodeFailure {
                        node_id: node.id,
                        node_name: node.name.clone(),
                        kind: e.kind(),
                        error: e.to_string(),
                    });
                }
            }
        }

        if accepted.is_empty() {
            return Err(LifecycleError::NoAcceptingNode { failures });
        }

        let new_sub = NewSubscription {
            external_id: req.account_id,
            display_name: req.display_name.clone(),
            client_id: request.client_id.clone(),
            access_token: mint_access_token(),
            created_at: now,
            expires_at,
        };
        let grants: Vec<NewGrant> = accepted.iter().map(|(_, g)| g.clone()).collect();

        match self.ledger.record_subscription(&new_sub, &grants).await {
            Ok((subscription, grants)) => {
                info!(
                    subscription_id = subscription.id,
                    account_id = req.account_id,
                    grants = grants.len(),
                    failed = failures.len(),
                    "subscription created"
                );
                Ok(CreateOutcome {
                    subscription,
                    grants,
                    failures,
                })
            }
            Err(e) => {
                warn!(error = %e, "ledger write failed, releasing provisioned clients");
                for (node, grant) in &accepted {
                    let provisioner = self.provisioners.for_strategy(grant.strategy);
                    if let Err(release_err) = provisioner.release(node, &grant.client_id).await {
                        warn!(node = %node.name, error = %release_err, "compensating release failed");
                    }
                }
                Err(LifecycleError::Ledger(e))
            }
        }
    }

    /// Deactivate, then remove live-sync clients from their nodes. Pooled ids go
    /// back to the pool inside the deactivation itself.
    pub async fn revoke(&self, subscription_id: i64) -> Result<RevokeOutcome, LifecycleError> {
        let grants = match self.ledger.deactivate_subscription(subscription_id).await? {
            Deactivation::NotFound => {
                return Err(LifecycleError::SubscriptionNotFound(subscription_id))
            }
            Deactivation::AlreadyInactive => {
                return Ok(RevokeOutcome {
                    subscription_id,
                    deactivated: false,
                    released: 0,
                    failures: Vec::new(),
                })
            }
            Deactivation::Deactivated(grants) => grants,
        };

        let mut released = 0;
        let mut failures = Vec::new();
        for grant in &grants {
            if grant.strategy == Strategy::PooledDraw {
                released += 1;
                continue;
            }
            match self.release_live(grant).await {
                Ok(()) => released += 1,
                Err(failure) => failures.push(failure),
            }
        }

        info!(
            subscription_id,
            released,
            failed = failures.len(),
            "subscription revoked"
        );
        Ok(RevokeOutcome {
            subscription_id,
            deactivated: true,
            released,
            failures,
        })
    }

    async fn release_live(&self, grant: &Grant) -> Result<(), NodeFailure> {
        let failure = |kind: &'static str, error: String| NodeFailure {
            node_id: grant.node_id,
            node_name: grant.node_name.clone(),
            kind,
            error,
        };

        let node = match self.ledger.get_node(grant.node_id).await {
            Ok(Some(node)) => node,
            Ok(None) => return Err(failure("ledger", "node no longer registered".to_string())),
            Err(e) => return Err(failure("ledger", e.to_string())),
        };

        self.provisioners
            .for_strategy(Strategy::LiveSync)
            .release(&node, &grant.client_id)
            .await
            .map_err(|e| {
                warn!(node = %node.name, kind = e.kind(), error = %e, "remote removal failed");
                failure(e.kind(), e.to_string())
            })
    }

    /// Revoke every active subscription past its expiry. Returns how many this call
    /// deactivated; a concurrent sweep that got there first is not counted twice.
    pub async fn sweep_expired(&self) -> Result<usize, LifecycleError> {
        let now = (self.clock)();
        let expired = self.ledger.expired_subscription_ids(now).await?;

        let mut revoked = 0;
        for id in expired {
            match self.revoke(id).await {
                Ok(outcome) if outcome.deactivated => revoked += 1,
                Ok(_) | Err(LifecycleError::SubscriptionNotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        if revoked > 0 {
            info!(revoked, "expired subscriptions swept");
        }
        Ok(revoked)
    }

    pub async fn active_subscription(
        &self,
        account_id: i64,
    ) -> Result<Option<(Subscription, Vec<Grant>)>, LifecycleError> {
        let Some(subscription) = self.ledger.active_subscription_for_account(account_id).await?
        else {
            return Ok(None);
        };
        let grants = self.ledger.grants_for_subscription(subscription.id).await?;
        Ok(Some((subscription, grants)))
    }
}

/// Opaque public token: 24 random bytes, URL-safe base64.
pub fn mint_access_token() -> String {
    let mut bytes = [0u8; ACCESS_TOKEN_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}
