use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use fleet::api::{self, AppState};
use fleet::cli::{Cli, Commands, NodeCommands, PoolCommands, SubscriptionCommands};
use fleet::config::{self, Config};
use fleet::credential::CredentialFabricator;
use fleet::jobs;
use fleet::lifecycle::{CreateRequest, LifecycleError, SubscriptionManager};
use fleet::models::{NewNode, NewPoolEntry, Node, Strategy};
use fleet::provision::{reconcile, Provisioners};
use fleet::remote::ssh::SshShell;
use fleet::store::postgres::PgStore;
use fleet::store::Ledger;
use fleet::sync::ConfigSynchronizer;

/// Everything a command needs, wired against Postgres and the ssh transport.
struct Fleet {
    cfg: Config,
    ledger: Arc<dyn Ledger>,
    sync: Arc<ConfigSynchronizer>,
    manager: Arc<SubscriptionManager>,
}

impl Fleet {
    async fn connect(cfg: Config) -> anyhow::Result<Self> {
        let db = PgStore::connect(&cfg.database_url, cfg.db_max_connections).await?;
        Ok(Self::wire(cfg, Arc::new(db)))
    }

    fn wire(cfg: Config, ledger: Arc<dyn Ledger>) -> Self {
        let shell = SshShell::new(cfg.ssh_timeout, cfg.ssh_connect_timeout)
            .with_identity(cfg.ssh_identity.clone());
        let sync = Arc::new(ConfigSynchronizer::new(Arc::new(shell), cfg.sync_settings()));
        let provisioners = Provisioners::new(sync.clone(), ledger.clone(), cfg.default_strategy);
        let manager = Arc::new(SubscriptionManager::new(
            ledger.clone(),
            provisioners,
            CredentialFabricator::new(cfg.descriptor_profile()),
        ));
        Self {
            cfg,
            ledger,
            sync,
            manager,
        }
    }

    async fn node(&self, id: i64) -> anyhow::Result<Node> {
        self.ledger
            .get_node(id)
            .await?
            .with_context(|| format!("node {} not found", id))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing()?;

    let cfg = config::load()?;
    let args = Cli::parse();

    let result = match args.command {
        Some(Commands::Serve { port }) => run_server(cfg, port).await,
        Some(Commands::Migrate) => {
            let db = PgStore::connect(&cfg.database_url, cfg.db_max_connections).await?;
            db.migrate().await?;
            println!("Migrations applied.");
            Ok(())
        }
        Some(Commands::Node { command }) => {
            let fleet = Fleet::connect(cfg).await?;
            handle_node_command(command, &fleet).await
        }
        Some(Commands::Subscription { command }) => {
            let fleet = Fleet::connect(cfg).await?;
            handle_subscription_command(command, &fleet).await
        }
        Some(Commands::Sweep) => {
            let fleet = Fleet::connect(cfg).await?;
            let revoked = fleet.manager.sweep_expired().await?;
            println!("Revoked {} expired subscription(s).", revoked);
            Ok(())
        }
        Some(Commands::Pool { command }) => {
            let fleet = Fleet::connect(cfg).await?;
            handle_pool_command(command, &fleet).await
        }
        Some(Commands::Stats) => {
            let fleet = Fleet::connect(cfg).await?;
            let stats = fleet.ledger.stats().await?;
            println!("Accounts:              {}", stats.total_accounts);
            println!("Active subscriptions:  {}", stats.active_subscriptions);
            println!("Active nodes:          {}", stats.active_nodes);
            Ok(())
        }
        None => run_server(cfg, None).await,
    };

    if let Err(ref e) = result {
        eprintln!("Error: {:?}", e);
    }
    result
}

fn init_tracing() -> anyhow::Result<()> {
    use opentelemetry::KeyValue;
    use opentelemetry_sdk::{trace as sdktrace, Resource};

    let telemetry_layer = if std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").is_ok() {
        let tracer = opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(opentelemetry_otlp::new_exporter().tonic())
            .with_trace_config(sdktrace::config().with_resource(Resource::new(vec![
                KeyValue::new("service.name", "fleet"),
            ])))
            .install_batch(opentelemetry_sdk::runtime::Tokio)
            .context("failed to install OpenTelemetry tracer")?;
        Some(tracing_opentelemetry::layer().with_tracer(tracer))
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "fleet=debug,tower_http=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .with(telemetry_layer)
        .init();
    Ok(())
}

async fn run_server(cfg: Config, port: Option<u16>) -> anyhow::Result<()> {
    tracing::info!("Connecting to database...");
    let db = PgStore::connect(&cfg.database_url, cfg.db_max_connections).await?;

    tracing::info!("Running migrations...");
    db.migrate().await?;

    let port = port.unwrap_or(cfg.port);
    let sweep_interval = cfg.sweep_interval;
    let fleet = Fleet::wire(cfg, Arc::new(db));

    let state = Arc::new(AppState {
        ledger: fleet.ledger.clone(),
    });
    let app = api::router(state);

    if sweep_interval.is_zero() {
        tracing::info!("In-process expiry sweep disabled; run `fleetctl sweep` externally");
    } else {
        jobs::sweep::spawn(fleet.manager.clone(), sweep_interval);
        tracing::info!("Expiry sweep started (every {:?})", sweep_interval);
    }

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("fleet retrieval endpoint listening on {}", addr);
    axum::serve(listener, app).await?;

    Ok(())
}

async fn handle_node_command(cmd: NodeCommands, fleet: &Fleet) -> anyhow::Result<()> {
    match cmd {
        NodeCommands::Add {
            name,
            address,
            port,
            public_key,
            ssh_user,
            ssh_port,
            capacity,
            strategy,
        } => {
            if capacity < 0 {
                anyhow::bail!("capacity must be zero or more");
            }
            let node = fleet
                .ledger
                .insert_node(&NewNode {
                    name,
                    address,
                    port,
                    public_key,
                    ssh_user,
                    ssh_port,
                    capacity,
                    strategy,
                })
                .await?;
            println!("Node registered:");
            println!("  ID:       {}", node.id);
            println!("  Name:     {}", node.name);
            println!("  Address:  {}:{}", node.address, node.port);
            println!("  Capacity: {}", node.capacity);
            println!(
                "  Strategy: {}",
                node.effective_strategy(fleet.cfg.default_strategy)
            );
        }
        NodeCommands::List => {
            let loads = fleet.ledger.node_loads().await?;
            if loads.is_empty() {
                println!("No nodes registered.");
            } else {
                println!(
                    "{:<6} {:<20} {:<24} {:<10} {:<12} {:<8}",
                    "ID", "NAME", "ADDRESS", "LOAD", "STRATEGY", "ACTIVE"
                );
                for l in loads {
                    let strategy = match l.node.strategy {
                        Some(s) => s.to_string(),
                        None => format!("({})", fleet.cfg.default_strategy),
                    };
                    println!(
                        "{:<6} {:<20} {:<24} {:<10} {:<12} {:<8}",
                        l.node.id,
                        l.node.name,
                        l.node.address,
                        format!("{}/{}", l.load, l.node.capacity),
                        strategy,
                        l.node.is_active
                    );
                }
            }
        }
        NodeCommands::Enable { id } => set_active(fleet, id, true).await?,
        NodeCommands::Disable { id } => set_active(fleet, id, false).await?,
        NodeCommands::Reconcile { id, prune } => {
            let node = fleet.node(id).await?;
            let report = reconcile::reconcile_node(fleet.ledger.as_ref(), &fleet.sync, &node).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if prune {
                reconcile::prune_stale(&fleet.sync, &node, &report).await?;
                println!("Pruned {} stale client(s).", report.stale_on_node.len());
            } else if report.is_consistent() {
                println!("Node {} is consistent with the ledger.", node.name);
            }
        }
        NodeCommands::SetStrategy {
            id,
            strategy,
            force,
        } => {
            let strategy = match strategy.as_str() {
                "default" => None,
                other => Some(other.parse::<Strategy>()?),
            };
            let node = fleet.node(id).await?;
            if !force {
                let report =
                    reconcile::reconcile_node(fleet.ledger.as_ref(), &fleet.sync, &node).await?;
                if !report.is_consistent() {
                    println!("{}", serde_json::to_string_pretty(&report)?);
                    anyhow::bail!(
                        "node {} does not reconcile cleanly; fix it first or pass --force",
                        node.name
                    );
                }
            }
            fleet.ledger.set_node_strategy(id, strategy).await?;
            println!(
                "Node {} now uses {}.",
                node.name,
                strategy.unwrap_or(fleet.cfg.default_strategy)
            );
        }
    }
    Ok(())
}

async fn set_active(fleet: &Fleet, id: i64, active: bool) -> anyhow::Result<()> {
    if fleet.ledger.set_node_active(id, active).await? {
        println!("Node {} {}.", id, if active { "enabled" } else { "disabled" });
    } else {
        println!("Node {} not found.", id);
    }
    Ok(())
}

async fn handle_subscription_command(
    cmd: SubscriptionCommands,
    fleet: &Fleet,
) -> anyhow::Result<()> {
    match cmd {
        SubscriptionCommands::Create {
            account,
            name,
            days,
        } => {
            let days = days.unwrap_or(fleet.cfg.default_duration_days);
            let duration = chrono::Duration::try_days(days)
                .with_context(|| format!("duration of {} days is out of range", days))?;
            let req = CreateRequest {
                account_id: account,
                display_name: name,
                duration,
            };
            let outcome = match fleet.manager.create(&req).await {
                Ok(outcome) => outcome,
                Err(LifecycleError::NoAcceptingNode { failures }) => {
                    for f in &failures {
                        println!("  {:<20} {:<22} {}", f.node_name, f.kind, f.error);
                    }
                    anyhow::bail!("no node accepted the subscription; nothing was recorded");
                }
                Err(LifecycleError::NoCapacityAvailable) => {
                    anyhow::bail!("all servers are at capacity")
                }
                Err(e) => return Err(e.into()),
            };

            let sub = &outcome.subscription;
            println!("Subscription created:");
            println!("  ID:       {}", sub.id);
            println!("  Expires:  {}", sub.expires_at);
            println!("  URL:      {}", fleet.cfg.subscription_url(&sub.access_token));
            println!("  Nodes:    {}", outcome.grants.len());
            for g in &outcome.grants {
                println!("    {:<20} {}", g.node_name, g.strategy);
            }
            if !outcome.failures.is_empty() {
                println!("  Skipped:");
                for f in &outcome.failures {
                    println!("    {:<20} {:<22} {}", f.node_name, f.kind, f.error);
                }
            }
        }
        SubscriptionCommands::Show { account } => {
            match fleet.manager.active_subscription(account).await? {
                None => println!("No active subscription for account {}.", account),
                Some((sub, grants)) => {
                    println!("  ID:       {}", sub.id);
                    println!("  Created:  {}", sub.created_at);
                    println!("  Expires:  {}", sub.expires_at);
                    println!("  URL:      {}", fleet.cfg.subscription_url(&sub.access_token));
                    for g in grants {
                        println!("    {:<20} {:<12} {}", g.node_name, g.strategy, g.client_id);
                    }
                }
            }
        }
        SubscriptionCommands::Revoke { id } => {
            let outcome = fleet.manager.revoke(id).await?;
            if !outcome.deactivated {
                println!("Subscription {} was already inactive.", id);
            } else {
                println!(
                    "Subscription {} revoked ({} node(s) released).",
                    id, outcome.released
                );
                for f in &outcome.failures {
                    println!("  not removed from {}: {}", f.node_name, f.error);
                }
            }
        }
    }
    Ok(())
}

async fn handle_pool_command(cmd: PoolCommands, fleet: &Fleet) -> anyhow::Result<()> {
    match cmd {
        PoolCommands::Import { file, node } => {
            let node = fleet.node(node).await?;
            let raw = tokio::fs::read(&file)
                .await
                .with_context(|| format!("failed to read {}", file.display()))?;
            let entries: Vec<NewPoolEntry> =
                serde_json::from_slice(&raw).context("pool file must be a JSON array")?;
            let inserted = fleet.ledger.import_pool_entries(node.id, &entries).await?;
            println!(
                "Imported {} new pool entr{} for {} ({} skipped as duplicates).",
                inserted,
                if inserted == 1 { "y" } else { "ies" },
                node.name,
                entries.len() as u64 - inserted
            );
        }
        PoolCommands::Generate { node, count } => {
            if count == 0 {
                anyhow::bail!("--count must be at least 1");
            }
            let node = fleet.node(node).await?;
            let existing = fleet.ledger.pool_entries(node.id).await?.len();
            let entries: Vec<NewPoolEntry> = (0..count)
                .map(|i| NewPoolEntry {
                    client_id: uuid::Uuid::new_v4().to_string(),
                    label: format!("pool_{}_{:04}", node.id, existing + i + 1),
                })
                .collect();
            let clients: Vec<_> = entries
                .iter()
                .map(|e| fleet.sync.client_entry(&e.client_id, &e.label))
                .collect();

            // Live on the node first; the ledger must never offer an id the node lacks.
            fleet.sync.add_clients(&node, &clients).await?;
            let inserted = fleet.ledger.import_pool_entries(node.id, &entries).await?;
            println!("Generated {} pool entries on {}.", inserted, node.name);
        }
    }
    Ok(())
}
