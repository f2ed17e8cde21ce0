use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::config::MAX_DURATION_DAYS;
use crate::models::Strategy;

/// fleetctl: provision subscriptions across a fleet of proxy nodes
#[derive(Parser)]
#[command(name = "fleetctl", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Serve the subscription retrieval endpoint (and the sweep job, if enabled)
    Serve {
        /// Port to bind; overrides FLEET_HTTP_PORT
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Apply pending database migrations
    Migrate,

    /// Manage proxy nodes
    Node {
        #[command(subcommand)]
        command: NodeCommands,
    },

    /// Create, inspect and revoke subscriptions
    Subscription {
        #[command(subcommand)]
        command: SubscriptionCommands,
    },

    /// Revoke every subscription past its expiry
    Sweep,

    /// Manage pre-provisioned client ids
    Pool {
        #[command(subcommand)]
        command: PoolCommands,
    },

    /// Fleet-wide counters
    Stats,
}

#[derive(Subcommand)]
pub enum NodeCommands {
    /// Register a node
    Add {
        #[arg(long)]
        name: String,
        /// Public address clients connect to (also used for ssh)
        #[arg(long)]
        address: String,
        #[arg(long, default_value_t = 443)]
        port: u16,
        /// Reality public key
        #[arg(long)]
        public_key: String,
        #[arg(long, default_value = "root")]
        ssh_user: String,
        #[arg(long, default_value_t = 22)]
        ssh_port: u16,
        #[arg(long, default_value_t = 60)]
        capacity: i64,
        /// live_sync or pooled_draw; omit to follow FLEET_PROVISIONING
        #[arg(long)]
        strategy: Option<Strategy>,
    },
    /// List nodes with their current load
    List,
    /// Return a node to allocation
    Enable { id: i64 },
    /// Take a node out of allocation; existing grants stay live
    Disable { id: i64 },
    /// Compare a node's live client list with the ledger
    Reconcile {
        id: i64,
        /// Remove revoked live-sync clients still present on the node
        #[arg(long)]
        prune: bool,
    },
    /// Change how a node provisions clients
    SetStrategy {
        id: i64,
        /// live_sync, pooled_draw, or "default" to clear the override
        strategy: String,
        /// Switch even if the node does not reconcile cleanly
        #[arg(long)]
        force: bool,
    },
}

#[derive(Subcommand)]
pub enum SubscriptionCommands {
    /// Provision a subscription on every node with free capacity
    Create {
        /// External account id
        #[arg(long)]
        account: i64,
        #[arg(long)]
        name: Option<String>,
        /// Defaults to FLEET_DEFAULT_DURATION_DAYS
        #[arg(long, value_parser = clap::value_parser!(i64).range(1..=MAX_DURATION_DAYS as i64))]
        days: Option<i64>,
    },
    /// Show the active subscription of an account
    Show {
        #[arg(long)]
        account: i64,
    },
    /// Deactivate a subscription and remove it from its nodes
    Revoke { id: i64 },
}

#[derive(Subcommand)]
pub enum PoolCommands {
    /// Import client ids already live on a node (JSON array of {client_id, label})
    Import {
        file: PathBuf,
        #[arg(long)]
        node: i64,
    },
    /// Mint ids, add them to the node in one restart, and import them
    Generate {
        #[arg(long)]
        node: i64,
        #[arg(long)]
        count: usize,
    },
}
