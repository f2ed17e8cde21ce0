use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

use super::{Deactivation, FleetStats, Ledger};
use crate::models::{
    Grant, NewGrant, NewNode, NewPoolEntry, NewSubscription, Node, NodeLoad, PoolEntry, Strategy,
    Subscription,
};

const NODE_COLUMNS: &str = "n.id, n.name, n.address, n.port, n.public_key, n.ssh_user, n.ssh_port, n.capacity, n.is_active, n.strategy, n.created_at";

const GRANT_SELECT: &str = r#"SELECT g.id, g.subscription_id, g.node_id, n.name AS node_name, g.client_id, g.strategy, g.access_url, g.created_at
    FROM grants g
    JOIN nodes n ON n.id = g.node_id"#;

const SUBSCRIPTION_COLUMNS: &str =
    "s.id, s.account_id, s.client_id, s.access_token, s.is_active, s.created_at, s.expires_at";

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Connections are pooled; every ledger call borrows one and hands it back on all
    /// exit paths. `acquire_timeout` bounds how long a call waits for one.
    pub async fn connect(database_url: &str, max_connections: u32) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await
            .context("failed to connect to the ledger database")?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run pending migrations from the migrations/ directory.
    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl Ledger for PgStore {
    // -- Node Operations --

    async fn insert_node(&self, node: &NewNode) -> anyhow::Result<Node> {
        let row = sqlx::query_as::<_, NodeRow>(
            r#"INSERT INTO nodes (name, address, port, public_key, ssh_user, ssh_port, capacity, strategy)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
               RETURNING id, name, address, port, public_key, ssh_user, ssh_port, capacity, is_active, strategy, created_at"#,
        )
        .bind(&node.name)
        .bind(&node.address)
        .bind(i32::from(node.port))
        .bind(&node.public_key)
        .bind(&node.ssh_user)
        .bind(i32::from(node.ssh_port))
        .bind(i32::try_from(node.capacity).context("capacity out of range")?)
        .bind(node.strategy.map(|s| s.as_str()))
        .fetch_one(&self.pool)
        .await?;

        row.try_into()
    }

    async fn get_node(&self, id: i64) -> anyhow::Result<Option<Node>> {
        let row = sqlx::query_as::<_, NodeRow>(&format!(
            "SELECT {NODE_COLUMNS} FROM nodes n WHERE n.id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Node::try_from).transpose()
    }

    async fn node_loads(&self) -> anyhow::Result<Vec<NodeLoad>> {
        // Load is derived on every read: grants held by active subscriptions.
        let rows = sqlx::query_as::<_, NodeLoadRow>(&format!(
            r#"SELECT {NODE_COLUMNS}, COALESCE(l.load, 0) AS load
               FROM nodes n
               LEFT JOIN (
                   SELECT g.node_id, COUNT(*) AS load
                   FROM grants g
                   JOIN subscriptions s ON s.id = g.subscription_id
                   WHERE s.is_active
                   GROUP BY g.node_id
               ) l ON l.node_id = n.id
               ORDER BY n.id ASC"#
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|r| {
                Ok(NodeLoad {
                    node: r.node.try_into()?,
                    load: r.load,
                })
            })
            .collect()
    }

    async fn set_node_active(&self, id: i64, active: bool) -> anyhow::Result<bool> {
        let result = sqlx::query("UPDATE nodes SET is_active = $1 WHERE id = $2")
            .bind(active)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn set_node_strategy(&self, id: i64, strategy: Option<Strategy>) -> anyhow::Result<bool> {
        let result = sqlx::query("UPDATE nodes SET strategy = $1 WHERE id = $2")
            .bind(strategy.map(|s| s.as_str()))
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    // -- Subscription Operations --

    async fn record_subscription(
        &self,
        sub: &NewSubscription,
        grants: &[NewGrant],
    ) -> anyhow::Result<(Subscription, Vec<Grant>)> {
        // Dropping `tx` without commit rolls everything back.
        let mut tx = self.pool.begin().await?;

        let account_id = sqlx::query_scalar::<_, i64>(
            r#"INSERT INTO accounts (external_id, display_name)
               VALUES ($1, $2)
               ON CONFLICT (external_id) DO UPDATE
                 SET display_name = COALESCE(EXCLUDED.display_name, accounts.display_name)
               RETURNING id"#,
        )
        .bind(sub.external_id)
        .bind(&sub.display_name)
        .fetch_one(&mut *tx)
        .await?;

        let subscription = sqlx::query_as::<_, Subscription>(
            r#"INSERT INTO subscriptions (account_id, client_id, access_token, is_active, created_at, expires_at)
               VALUES ($1, $2, $3, TRUE, $4, $5)
               RETURNING id, account_id, client_id, access_token, is_active, created_at, expires_at"#,
        )
        .bind(account_id)
        .bind(&sub.client_id)
        .bind(&sub.access_token)
        .bind(sub.created_at)
        .bind(sub.expires_at)
        .fetch_one(&mut *tx)
        .await?;

        for grant in grants {
            sqlx::query(
                r#"INSERT INTO grants (subscription_id, node_id, client_id, strategy, access_url, created_at)
                   VALUES ($1, $2, $3, $4, $5, $6)"#,
            )
            .bind(subscription.id)
            .bind(grant.node_id)
            .bind(&grant.client_id)
            .bind(grant.strategy.as_str())
            .bind(&grant.access_url)
            .bind(sub.created_at)
            .execute(&mut *tx)
            .await?;
        }

        let rows = sqlx::query_as::<_, GrantRow>(&format!(
            "{GRANT_SELECT} WHERE g.subscription_id = $1 ORDER BY n.name ASC, g.node_id ASC"
        ))
        .bind(subscription.id)
        .fetch_all(&mut *tx)
        .await?;

        tx.commit().await?;

        let grants = rows
            .into_iter()
            .map(Grant::try_from)
            .collect::<anyhow::Result<Vec<_>>>()?;
        Ok((subscription, grants))
    }

    async fn get_subscription(&self, id: i64) -> anyhow::Result<Option<Subscription>> {
        let row = sqlx::query_as::<_, Subscription>(&format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions s WHERE s.id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn subscription_by_token(&self, token: &str) -> anyhow::Result<Option<Subscription>> {
        let row = sqlx::query_as::<_, Subscription>(&format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions s WHERE s.access_token = $1"
        ))
        .bind(token)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn active_subscription_for_account(
        &self,
        external_id: i64,
    ) -> anyhow::Result<Option<Subscription>> {
        let row = sqlx::query_as::<_, Subscription>(&format!(
            r#"SELECT {SUBSCRIPTION_COLUMNS}
               FROM subscriptions s
               JOIN accounts a ON a.id = s.account_id
               WHERE a.external_id = $1 AND s.is_active
               ORDER BY s.expires_at DESC
               LIMIT 1"#
        ))
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn grants_for_subscription(&self, subscription_id: i64) -> anyhow::Result<Vec<Grant>> {
        let rows = sqlx::query_as::<_, GrantRow>(&format!(
            "{GRANT_SELECT} WHERE g.subscription_id = $1 ORDER BY n.name ASC, g.node_id ASC"
        ))
        .bind(subscription_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Grant::try_from).collect()
    }

    async fn grants_for_node(&self, node_id: i64, active: bool) -> anyhow::Result<Vec<Grant>> {
        let rows = sqlx::query_as::<_, GrantRow>(&format!(
            r#"{GRANT_SELECT}
               JOIN subscriptions s ON s.id = g.subscription_id
               WHERE g.node_id = $1 AND s.is_active = $2
               ORDER BY g.id ASC"#
        ))
        .bind(node_id)
        .bind(active)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Grant::try_from).collect()
    }

    async fn deactivate_subscription(&self, id: i64) -> anyhow::Result<Deactivation> {
        let mut tx = self.pool.begin().await?;

        // Concurrent callers serialize on the row lock; only one sees is_active = TRUE.
        let flipped = sqlx::query_scalar::<_, i64>(
            "UPDATE subscriptions SET is_active = FALSE WHERE id = $1 AND is_active RETURNING id",
        )
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?;

        if flipped.is_none() {
            let exists = sqlx::query_scalar::<_, bool>(
                "SELECT EXISTS(SELECT 1 FROM subscriptions WHERE id = $1)",
            )
            .bind(id)
            .fetch_one(&mut *tx)
            .await?;
            return Ok(if exists {
                Deactivation::AlreadyInactive
            } else {
                Deactivation::NotFound
            });
        }

        sqlx::query(
            r#"UPDATE pool_entries p
               SET is_used = FALSE, claimed_at = NULL
               FROM grants g
               WHERE g.subscription_id = $1
                 AND g.strategy = 'pooled_draw'
                 AND p.node_id = g.node_id
                 AND p.client_id = g.client_id"#,
        )
        .bind(id)
        .execute(&mut *tx)
        .await?;

        let rows = sqlx::query_as::<_, GrantRow>(&format!(
            "{GRANT_SELECT} WHERE g.subscription_id = $1 ORDER BY g.node_id ASC"
        ))
        .bind(id)
        .fetch_all(&mut *tx)
        .await?;

        tx.commit().await?;

        let grants = rows
            .into_iter()
            .map(Grant::try_from)
            .collect::<anyhow::Result<Vec<_>>>()?;
        Ok(Deactivation::Deactivated(grants))
    }

    async fn expired_subscription_ids(&self, now: DateTime<Utc>) -> anyhow::Result<Vec<i64>> {
        let ids = sqlx::query_scalar::<_, i64>(
            "SELECT id FROM subscriptions WHERE is_active AND expires_at < $1 ORDER BY expires_at ASC, id ASC",
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    async fn revoked_client_ids(&self, client_ids: &[String]) -> anyhow::Result<Vec<String>> {
        let ids = sqlx::query_scalar::<_, String>(
            "SELECT client_id FROM subscriptions WHERE NOT is_active AND client_id = ANY($1) ORDER BY client_id",
        )
        .bind(client_ids)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    // -- Pool Operations --

    async fn claim_pool_entry(&self, node_id: i64) -> anyhow::Result<Option<PoolEntry>> {
        let entry = sqlx::query_as::<_, PoolEntry>(
            r#"UPDATE pool_entries
               SET is_used = TRUE, claimed_at = NOW()
               WHERE id = (
                   SELECT id FROM pool_entries
                   WHERE node_id = $1 AND NOT is_used
                   ORDER BY id ASC
                   LIMIT 1
                   FOR UPDATE SKIP LOCKED
               )
               RETURNING id, node_id, client_id, label, is_used"#,
        )
        .bind(node_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(entry)
    }

    async fn release_pool_entry(&self, node_id: i64, client_id: &str) -> anyhow::Result<bool> {
        let result = sqlx::query(
            "UPDATE pool_entries SET is_used = FALSE, claimed_at = NULL WHERE node_id = $1 AND client_id = $2 AND is_used",
        )
        .bind(node_id)
        .bind(client_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn import_pool_entries(
        &self,
        node_id: i64,
        entries: &[NewPoolEntry],
    ) -> anyhow::Result<u64> {
        let mut tx = self.pool.begin().await?;
        let mut inserted = 0;

        for entry in entries {
            let result = sqlx::query(
                r#"INSERT INTO pool_entries (node_id, client_id, label)
                   VALUES ($1, $2, $3)
                   ON CONFLICT (node_id, client_id) DO NOTHING"#,
            )
            .bind(node_id)
            .bind(&entry.client_id)
            .bind(&entry.label)
            .execute(&mut *tx)
            .await?;
            inserted += result.rows_affected();
        }

        tx.commit().await?;
        Ok(inserted)
    }

    async fn pool_entries(&self, node_id: i64) -> anyhow::Result<Vec<PoolEntry>> {
        let rows = sqlx::query_as::<_, PoolEntry>(
            "SELECT id, node_id, client_id, label, is_used FROM pool_entries WHERE node_id = $1 ORDER BY id ASC",
        )
        .bind(node_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn stats(&self) -> anyhow::Result<FleetStats> {
        let (total_accounts, active_subscriptions, active_nodes) =
            sqlx::query_as::<_, (i64, i64, i64)>(
                r#"SELECT
                       (SELECT COUNT(*) FROM accounts),
                       (SELECT COUNT(*) FROM subscriptions WHERE is_active),
                       (SELECT COUNT(*) FROM nodes WHERE is_active)"#,
            )
            .fetch_one(&self.pool)
            .await?;

        Ok(FleetStats {
            total_accounts,
            active_subscriptions,
            active_nodes,
        })
    }
}

// -- Row types --

#[derive(Debug, sqlx::FromRow)]
struct NodeRow {
    id: i64,
    name: String,
    address: String,
    port: i32,
    public_key: String,
    ssh_user: String,
    ssh_port: i32,
    capacity: i32,
    is_active: bool,
    strategy: Option<String>,
    created_at: DateTime<Utc>,
}

impl TryFrom<NodeRow> for Node {
    type Error = anyhow::Error;

    fn try_from(row: NodeRow) -> anyhow::Result<Self> {
        Ok(Node {
            id: row.id,
            port: u16::try_from(row.port).context("node port out of range")?,
            ssh_port: u16::try_from(row.ssh_port).context("node ssh_port out of range")?,
            capacity: i64::from(row.capacity),
            strategy: row.strategy.as_deref().map(str::parse::<Strategy>).transpose()?,
            name: row.name,
            address: row.address,
            public_key: row.public_key,
            ssh_user: row.ssh_user,
            is_active: row.is_active,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct NodeLoadRow {
    #[sqlx(flatten)]
    node: NodeRow,
    load: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct GrantRow {
    id: i64,
    subscription_id: i64,
    node_id: i64,
    node_name: String,
    client_id: String,
    strategy: String,
    access_url: String,
    created_at: DateTime<Utc>,
}

impl TryFrom<GrantRow> for Grant {
    type Error = anyhow::Error;

    fn try_from(row: GrantRow) -> anyhow::Result<Self> {
        Ok(Grant {
            id: row.id,
            subscription_id: row.subscription_id,
            node_id: row.node_id,
            node_name: row.node_name,
            client_id: row.client_id,
            strategy: row.strategy.parse()?,
            access_url: row.access_url,
            created_at: row.created_at,
        })
    }
}
