use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use super::{ChannelError, CommandOutput, RemoteCommand, RemoteShell, RemoteTarget, RenderedCommand};

/// ssh exits with 255 when the session itself failed.
const SSH_TRANSPORT_FAILURE: i32 = 255;

/// `RemoteShell` over the system OpenSSH client, non-interactive.
#[derive(Debug, Clone)]
pub struct SshShell {
    /// Upper bound for one whole command, connect included.
    timeout: Duration,
    connect_timeout: Duration,
    identity: Option<PathBuf>,
}

impl SshShell {
    pub fn new(timeout: Duration, connect_timeout: Duration) -> Self {
        Self {
            timeout,
            connect_timeout,
            identity: None,
        }
    }

    pub fn with_identity(mut self, identity: Option<PathBuf>) -> Self {
        self.identity = identity;
        self
    }

    fn build(&self, target: &RemoteTarget, rendered: &RenderedCommand) -> Command {
        let mut cmd = Command::new("ssh");
        cmd.arg("-o")
            .arg("BatchMode=yes")
            .arg("-o")
            .arg("StrictHostKeyChecking=accept-new")
            .arg("-o")
            .arg(format!("ConnectTimeout={}", self.connect_timeout.as_secs().max(1)))
            .arg("-p")
            .arg(target.port.to_string());
        if let Some(identity) = &self.identity {
            cmd.arg("-i").arg(identity);
        }
        cmd.arg(target.destination())
            .arg("--")
            .arg(&rendered.script);

        cmd.stdin(if rendered.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
        cmd
    }

    async fn run(
        &self,
        mut cmd: Command,
        stdin: Option<Vec<u8>>,
    ) -> Result<std::process::Output, ChannelError> {
        let mut child = cmd
            .spawn()
            .map_err(|e| ChannelError::Spawn(e.to_string()))?;

        if let Some(payload) = stdin {
            let mut pipe = child
                .stdin
                .take()
                .ok_or_else(|| ChannelError::Spawn("stdin not captured".to_string()))?;
            pipe.write_all(&payload)
                .await
                .map_err(|e| ChannelError::Connect(format!("stdin write failed: {}", e)))?;
            // EOF tells the remote `base64 -d` to finish.
            drop(pipe);
        }

        child
            .wait_with_output()
            .await
            .map_err(|e| ChannelError::Connect(e.to_string()))
    }
}

#[async_trait]
impl RemoteShell for SshShell {
    async fn exec(
        &self,
        target: &RemoteTarget,
        command: &RemoteCommand,
    ) -> Result<CommandOutput, ChannelError> {
        let rendered = command.render();
        let cmd = self.build(target, &rendered);
        debug!(host = %target.host, step = command.describe(), "ssh exec");

        // On timeout the future is dropped and kill_on_drop reaps the ssh process.
        let output = tokio::time::timeout(self.timeout, self.run(cmd, rendered.stdin))
            .await
            .map_err(|_| {
                warn!(host = %target.host, step = command.describe(), "ssh timed out after {:?}", self.timeout);
                ChannelError::Timeout(self.timeout)
            })??;

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if output.status.code() == Some(SSH_TRANSPORT_FAILURE) {
            return Err(ChannelError::Connect(stderr));
        }

        Ok(CommandOutput {
            stdout: output.stdout,
            stderr,
            success: output.status.success(),
        })
    }
}
