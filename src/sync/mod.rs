//! Remote config synchronizer: read-modify-write of a node's client list.
//!
//! One mutation is read, parse, edit, atomic overwrite, restart. A mutation that
//! changes nothing stops after the parse step, so it never restarts the service.

pub mod document;

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::models::Node;
use crate::remote::{ChannelError, RemoteCommand, RemoteShell, RemoteTarget};

pub use document::{ClientEntry, ConfigDocument, DocumentError};

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("node {node} unreachable: {source}")]
    ChannelUnreachable {
        node: String,
        #[source]
        source: ChannelError,
    },
    #[error("node {node}: {step} failed: {stderr}")]
    RemoteCommandFailed {
        node: String,
        step: &'static str,
        stderr: String,
    },
    #[error("node {node}: config unreadable: {source}")]
    DocumentParse {
        node: String,
        #[source]
        source: DocumentError,
    },
    /// The new config was written but the service did not come back. The node may
    /// or may not be serving the new client.
    #[error("node {node}: config written but restart failed: {detail}")]
    NodeSyncPartial { node: String, detail: String },
}

impl SyncError {
    pub fn kind(&self) -> &'static str {
        match self {
            SyncError::ChannelUnreachable { .. } => "channel_unreachable",
            SyncError::RemoteCommandFailed { .. } => "remote_command_failed",
            SyncError::DocumentParse { .. } => "document_parse",
            SyncError::NodeSyncPartial { .. } => "node_sync_partial",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    Applied,
    Unchanged,
}

#[derive(Debug, Clone)]
pub struct SyncSettings {
    pub config_path: String,
    pub service_name: String,
    /// Inbound protocol whose client list is managed.
    pub protocol: String,
    pub flow: String,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            config_path: "/usr/local/etc/xray/config.json".to_string(),
            service_name: "xray".to_string(),
            protocol: "vless".to_string(),
            flow: "xtls-rprx-vision".to_string(),
        }
    }
}

pub struct ConfigSynchronizer {
    shell: Arc<dyn RemoteShell>,
    settings: SyncSettings,
}

impl ConfigSynchronizer {
    pub fn new(shell: Arc<dyn RemoteShell>, settings: SyncSettings) -> Self {
        Self { shell, settings }
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    pub fn client_entry(&self, client_id: &str, label: &str) -> ClientEntry {
        ClientEntry {
            id: client_id.to_string(),
            flow: self.settings.flow.clone(),
            email: label.to_string(),
        }
    }

    /// Fetch and parse the node's current config without modifying it.
    pub async fn read_document(&self, node: &Node) -> Result<ConfigDocument, SyncError> {
        let target = RemoteTarget::for_node(node);
        let output = self
            .run(
                node,
                &target,
                RemoteCommand::ReadFile {
                    path: self.settings.config_path.clone(),
                },
            )
            .await?;

        ConfigDocument::parse(&output, &self.settings.protocol).map_err(|source| {
            SyncError::DocumentParse {
                node: node.name.clone(),
                source,
            }
        })
    }

    pub async fn add_client(
        &self,
        node: &Node,
        entry: &ClientEntry,
    ) -> Result<SyncOutcome, SyncError> {
        self.add_clients(node, std::slice::from_ref(entry)).await
    }

    /// Add many entries with a single write and a single restart.
    pub async fn add_clients(
        &self,
        node: &Node,
        entries: &[ClientEntry],
    ) -> Result<SyncOutcome, SyncError> {
        self.mutate(node, |doc| {
            let mut changed = false;
            for entry in entries {
                changed |= doc.add_client(entry)?;
            }
            Ok(changed)
        })
        .await
    }

    pub async fn remove_client(
        &self,
        node: &Node,
        client_id: &str,
    ) -> Result<SyncOutcome, SyncError> {
        self.remove_clients(node, &[client_id.to_string()]).await
    }

    pub async fn remove_clients(
        &self,
        node: &Node,
        client_ids: &[String],
    ) -> Result<SyncOutcome, SyncError> {
        self.mutate(node, |doc| {
            let mut changed = false;
            for id in client_ids {
                changed |= doc.remove_client(id)?;
            }
            Ok(changed)
        })
        .await
    }

    async fn mutate<F>(&self, node: &Node, apply: F) -> Result<SyncOutcome, SyncError>
    where
        F: FnOnce(&mut ConfigDocument) -> Result<bool, DocumentError>,
    {
        let mut doc = self.read_document(node).await?;
        let parse_err = |source: DocumentError| SyncError::DocumentParse {
            node: node.name.clone(),
            source,
        };

        if !apply(&mut doc).map_err(parse_err)? {
            debug!(node = %node.name, "config already in desired state");
            return Ok(SyncOutcome::Unchanged);
        }
        let contents = doc.to_bytes().map_err(parse_err)?;

        let target = RemoteTarget::for_node(node);
        self.run(
            node,
            &target,
            RemoteCommand::WriteFileAtomic {
                path: self.settings.config_path.clone(),
                contents,
            },
        )
        .await?;

        // Past this point the file on the node has changed; any failure is partial.
        let restart = RemoteCommand::RestartService {
            name: self.settings.service_name.clone(),
        };
        match self.shell.exec(&target, &restart).await {
            Ok(out) if out.success => {
                info!(node = %node.name, service = %self.settings.service_name, "config applied");
                Ok(SyncOutcome::Applied)
            }
            Ok(out) => Err(self.partial(node, out.stderr)),
            Err(e) => Err(self.partial(node, e.to_string())),
        }
    }

    fn partial(&self, node: &Node, detail: String) -> SyncError {
        warn!(node = %node.name, detail = %detail, "restart failed after config write");
        SyncError::NodeSyncPartial {
            node: node.name.clone(),
            detail,
        }
    }

    async fn run(
        &self,
        node: &Node,
        target: &RemoteTarget,
        command: RemoteCommand,
    ) -> Result<Vec<u8>, SyncError> {
        let step = command.describe();
        let output = self
            .shell
            .exec(target, &command)
            .await
            .map_err(|source| {
                warn!(node = %node.name, step, error = %source, "remote channel failed");
                SyncError::ChannelUnreachable {
                    node: node.name.clone(),
                    source,
                }
            })?;

        if !output.success {
            warn!(node = %node.name, step, stderr = %output.stderr, "remote command failed");
            return Err(SyncError::RemoteCommandFailed {
                node: node.name.clone(),
                step,
                stderr: output.stderr,
            });
        }
        Ok(output.stdout)
    }
}
