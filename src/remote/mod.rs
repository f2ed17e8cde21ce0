//! Remote command channel to fleet nodes.
//!
//! Commands are typed. A command renders to a shell script plus an optional stdin
//! payload; file contents only ever travel as base64 on stdin, so nothing in a
//! document can interact with the remote shell's quoting.

pub mod ssh;

use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use thiserror::Error;

use crate::models::Node;

/// Transport target: where a command runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTarget {
    pub host: String,
    pub user: String,
    pub port: u16,
}

impl RemoteTarget {
    pub fn for_node(node: &Node) -> Self {
        Self {
            host: node.address.clone(),
            user: node.ssh_user.clone(),
            port: node.ssh_port,
        }
    }

    pub fn destination(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }
}

/// Payload: what runs there.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteCommand {
    ReadFile { path: String },
    /// Replace `path` by writing a sibling temp file and renaming it over the target.
    WriteFileAtomic { path: String, contents: Vec<u8> },
    RestartService { name: String },
}

/// A command ready for a text-oriented shell channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedCommand {
    pub script: String,
    pub stdin: Option<Vec<u8>>,
}

impl RemoteCommand {
    pub fn describe(&self) -> &'static str {
        match self {
            RemoteCommand::ReadFile { .. } => "read",
            RemoteCommand::WriteFileAtomic { .. } => "write",
            RemoteCommand::RestartService { .. } => "restart",
        }
    }

    pub fn render(&self) -> RenderedCommand {
        match self {
            RemoteCommand::ReadFile { path } => RenderedCommand {
                script: format!("cat {}", shell_quote(path)),
                stdin: None,
            },
            RemoteCommand::WriteFileAtomic { path, contents } => {
                let target = shell_quote(path);
                let tmp = shell_quote(&format!("{}.fleet-tmp", path));
                let mut encoded = STANDARD.encode(contents).into_bytes();
                encoded.push(b'\n');
                RenderedCommand {
                    script: format!(
                        "umask 022 && base64 -d > {tmp} && mv -f {tmp} {target} || {{ rm -f {tmp}; exit 1; }}"
                    ),
                    stdin: Some(encoded),
                }
            }
            RemoteCommand::RestartService { name } => RenderedCommand {
                script: format!("systemctl restart {}", shell_quote(name)),
                stdin: None,
            },
        }
    }
}

/// Single-quote `value` for a POSIX shell.
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: Vec<u8>,
    pub stderr: String,
    pub success: bool,
}

/// The channel itself failed; says nothing about the remote command.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("failed to start remote shell: {0}")]
    Spawn(String),
}

/// Command execution against one node.
#[async_trait]
pub trait RemoteShell: Send + Sync {
    async fn exec(
        &self,
        target: &RemoteTarget,
        command: &RemoteCommand,
    ) -> Result<CommandOutput, ChannelError>;
}
