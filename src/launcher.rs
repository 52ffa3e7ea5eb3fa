// agentry/src/launcher.rs

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::{io::ErrorKind, process::Stdio, time::Duration};
use tokio::process::Command;
use tracing::info;

use crate::{
    mcp_client::StdioClient,
    provider::{ToolProviderDescriptor, Transport},
};

/// A started provider, ready to hand out.
pub enum ProviderConnection {
    /// A child process that completed the MCP handshake.
    Stdio { client: StdioClient, server_info: Value },
    /// Nothing to start; the endpoint is handed to whoever speaks its transport.
    Remote { url: String },
}

/// Starts providers. The runtime owns timeouts and single-flight; launchers just start things.
#[async_trait]
pub trait Launcher: Send + Sync {
    async fn launch(&self, descriptor: &ToolProviderDescriptor) -> Result<ProviderConnection>;
}

/// Spawns local providers as child processes and performs the MCP handshake.
pub struct ProcessLauncher {
    /// Handshake budget for descriptors without their own `timeout`.
    default_timeout: Duration,
}

impl ProcessLauncher {
    pub fn new(default_timeout: Duration) -> Self { Self { default_timeout } }

    fn handshake_timeout(&self, descriptor: &ToolProviderDescriptor) -> Duration {
        descriptor.timeout().unwrap_or(self.default_timeout)
    }
}

#[async_trait]
impl Launcher for ProcessLauncher {
    async fn launch(&self, descriptor: &ToolProviderDescriptor) -> Result<ProviderConnection> {
        let (command, environment, cwd) = match &descriptor.transport {
            Transport::Remote { url, .. } => return Ok(ProviderConnection::Remote { url: url.clone() }),
            Transport::Local { command, environment, cwd } => (command, environment, cwd),
        };
        let (exe, args) = command.split_first().context("empty launch command")?;

        let mut cmd = Command::new(exe);
        cmd.args(args)
            .envs(environment)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = cwd { cmd.current_dir(dir); }

        let child = cmd.spawn().map_err(|e| match e.kind() {
            ErrorKind::NotFound => anyhow!("`{exe}` was not found on PATH; is its runtime installed?"),
            ErrorKind::PermissionDenied => anyhow!("`{exe}` is not executable"),
            _ => anyhow!(e).context(format!("spawning `{exe}`")),
        })?;
        info!(provider = %descriptor.name, pid = child.id(), command = %command.join(" "), "provider process started");

        let client = StdioClient::start(&descriptor.name, child)?;
        let server_info = client.initialize(self.handshake_timeout(descriptor)).await.context("MCP handshake failed")?;
        Ok(ProviderConnection::Stdio { client, server_info })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local(timeout_ms: Option<u64>) -> ToolProviderDescriptor {
        ToolProviderDescriptor {
            name: "slow".into(),
            enabled: true,
            transport: Transport::Local { command: vec!["sh".into()], environment: Default::default(), cwd: None },
            timeout_ms,
            origin: "providers.json".into(),
        }
    }

    #[test]
    fn provider_timeout_overrides_the_default_in_both_directions() {
        let launcher = ProcessLauncher::new(Duration::from_millis(300));
        assert_eq!(launcher.handshake_timeout(&local(Some(5_000))), Duration::from_secs(5));
        assert_eq!(launcher.handshake_timeout(&local(Some(50))), Duration::from_millis(50));
        assert_eq!(launcher.handshake_timeout(&local(None)), Duration::from_millis(300));
    }
}
