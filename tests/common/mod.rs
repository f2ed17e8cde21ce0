//! Shared harness: an in-memory ledger and a fake fleet of nodes reachable
//! through the `RemoteShell` seam.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};

use fleet::credential::CredentialFabricator;
use fleet::lifecycle::SubscriptionManager;
use fleet::models::{NewNode, Node, Strategy};
use fleet::provision::Provisioners;
use fleet::remote::{ChannelError, CommandOutput, RemoteCommand, RemoteShell, RemoteTarget};
use fleet::store::memory::MemoryLedger;
use fleet::store::Ledger;
use fleet::sync::{ConfigDocument, ConfigSynchronizer, SyncSettings};

pub const EMPTY_CONFIG: &str = r#"{
  "log": {"loglevel": "warning"},
  "inbounds": [
    {
      "port": 443,
      "protocol": "vless",
      "settings": {"clients": [], "decryption": "none"},
      "streamSettings": {"network": "tcp", "security": "reality"}
    }
  ],
  "outbounds": [{"protocol": "freedom"}]
}"#;

#[derive(Debug, Clone)]
pub struct FakeNode {
    pub document: Vec<u8>,
    pub unreachable: bool,
    pub restart_fails: bool,
    pub writes: usize,
    pub restarts: usize,
}

impl FakeNode {
    fn new() -> Self {
        Self {
            document: EMPTY_CONFIG.as_bytes().to_vec(),
            unreachable: false,
            restart_fails: false,
            writes: 0,
            restarts: 0,
        }
    }
}

/// Nodes keyed by host. Commands against an unknown host fail like a dead link.
#[derive(Default)]
pub struct FakeFleet {
    nodes: Mutex<HashMap<String, FakeNode>>,
}

impl FakeFleet {
    pub fn add_host(&self, host: &str) {
        self.nodes.lock().unwrap().insert(host.to_string(), FakeNode::new());
    }

    pub fn with_node<R>(&self, host: &str, f: impl FnOnce(&mut FakeNode) -> R) -> R {
        let mut nodes = self.nodes.lock().unwrap();
        f(nodes.get_mut(host).expect("unknown fake host"))
    }

    pub fn set_unreachable(&self, host: &str, unreachable: bool) {
        self.with_node(host, |n| n.unreachable = unreachable);
    }

    pub fn set_restart_fails(&self, host: &str, fails: bool) {
        self.with_node(host, |n| n.restart_fails = fails);
    }

    pub fn set_document(&self, host: &str, document: &[u8]) {
        self.with_node(host, |n| n.document = document.to_vec());
    }

    pub fn snapshot(&self, host: &str) -> FakeNode {
        self.with_node(host, |n| n.clone())
    }

    pub fn client_ids(&self, host: &str) -> Vec<String> {
        let doc = self.snapshot(host).document;
        ConfigDocument::parse(&doc, "vless")
            .expect("fake node holds a valid config")
            .client_ids()
    }
}

#[async_trait]
impl RemoteShell for FakeFleet {
    async fn exec(
        &self,
        target: &RemoteTarget,
        command: &RemoteCommand,
    ) -> Result<CommandOutput, ChannelError> {
        let mut nodes = self.nodes.lock().unwrap();
        let node = match nodes.get_mut(&target.host) {
            Some(node) if !node.unreachable => node,
            _ => {
                return Err(ChannelError::Connect(format!(
                    "ssh: connect to host {} port {}: Connection refused",
                    target.host, target.port
                )))
            }
        };

        let ok = |stdout: Vec<u8>| CommandOutput {
            stdout,
            stderr: String::new(),
            success: true,
        };
        Ok(match command {
            RemoteCommand::ReadFile { .. } => ok(node.document.clone()),
            RemoteCommand::WriteFileAtomic { contents, .. } => {
                node.document = contents.clone();
                node.writes += 1;
                ok(Vec::new())
            }
            RemoteCommand::RestartService { name } => {
                node.restarts += 1;
                if node.restart_fails {
                    CommandOutput {
                        stdout: Vec::new(),
                        stderr: format!("Job for {}.service failed", name),
                        success: false,
                    }
                } else {
                    ok(Vec::new())
                }
            }
        })
    }
}

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
}

pub struct Harness {
    pub ledger: Arc<MemoryLedger>,
    pub fleet: Arc<FakeFleet>,
    pub sync: Arc<ConfigSynchronizer>,
    pub manager: SubscriptionManager,
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_default_strategy(Strategy::LiveSync)
    }

    pub fn with_default_strategy(default: Strategy) -> Self {
        let ledger = Arc::new(MemoryLedger::new());
        let fleet = Arc::new(FakeFleet::default());
        let sync = Arc::new(ConfigSynchronizer::new(fleet.clone(), SyncSettings::default()));
        let provisioners = Provisioners::new(sync.clone(), ledger.clone(), default);

        let now = Arc::new(Mutex::new(t0()));
        let clock_now = now.clone();
        let manager = SubscriptionManager::new(
            ledger.clone(),
            provisioners,
            CredentialFabricator::default(),
        )
        .with_clock(Arc::new(move || *clock_now.lock().unwrap()));

        Self {
            ledger,
            fleet,
            sync,
            manager,
            now,
        }
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.now.lock().unwrap();
        *now = *now + by;
    }

    pub fn host(name: &str) -> String {
        format!("{}.fleet.test", name)
    }

    pub async fn add_node(&self, name: &str, capacity: i64) -> Node {
        self.add_node_with(name, capacity, None).await
    }

    pub async fn add_node_with(
        &self,
        name: &str,
        capacity: i64,
        strategy: Option<Strategy>,
    ) -> Node {
        let host = Self::host(name);
        self.fleet.add_host(&host);
        self.ledger
            .insert_node(&NewNode {
                name: name.to_string(),
                address: host,
                port: 443,
                public_key: format!("pbk-{}", name),
                ssh_user: "root".to_string(),
                ssh_port: 22,
                capacity,
                strategy,
            })
            .await
            .unwrap()
    }
}
