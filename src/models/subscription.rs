use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::node::Strategy;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Account {
    pub id: i64,
    pub external_id: i64,
    pub display_name: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// One subscription, possibly fanned out over several nodes.
///
/// `client_id` is fleet-internal; `access_token` is the only value that may appear in
/// a public URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Subscription {
    pub id: i64,
    pub account_id: i64,
    pub client_id: String,
    pub access_token: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewSubscription {
    pub external_id: i64,
    pub display_name: Option<String>,
    pub client_id: String,
    pub access_token: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Grant {
    pub id: i64,
    pub subscription_id: i64,
    pub node_id: i64,
    pub node_name: String,
    /// The id actually present on the node. Equals the subscription's client id
    /// under live sync; a pool entry's id under pooled draw.
    pub client_id: String,
    pub strategy: Strategy,
    pub access_url: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewGrant {
    pub node_id: i64,
    pub client_id: String,
    pub strategy: Strategy,
    pub access_url: String,
}
