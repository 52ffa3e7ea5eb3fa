// agentry/src/host.rs

//! The query surface an embedding host talks to: one command in, one reply out.

use anyhow::Result as AnyResult;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::fmt::Write as _;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;
use uuid::Uuid;

use crate::{
    agent::{AgentMode, AgentProfile},
    error::RegistryError,
    mcp_runtime::{McpRuntime, ProviderHandle, ProviderState},
    permission::{Capability, Decision, Reason},
};

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum HostCommand {
    ListAgents,
    DescribeAgent { name: String },
    CheckPermission { agent: String, capability: String, action: String },
    ListProviders,
    StartProvider { name: String },
    StopProvider { name: String },
    Status,
}

impl HostCommand {
    /// Parse one session line, e.g. `check-permission rust-dev bash git log --oneline`.
    /// The action is everything after the capability, inner spacing preserved.
    pub fn parse(line: &str) -> Result<Self, String> {
        let (verb, rest) = next_word(line.trim());
        let cmd = match verb {
            "list-agents" => Self::ListAgents,
            "list-providers" => Self::ListProviders,
            "status" => Self::Status,
            "describe-agent" => Self::DescribeAgent { name: arg(verb, rest, "agent")?.0 },
            "start-provider" => Self::StartProvider { name: arg(verb, rest, "provider")?.0 },
            "stop-provider" => Self::StopProvider { name: arg(verb, rest, "provider")?.0 },
            "check-permission" => {
                let usage = "usage: check-permission <agent> <capability> <action>";
                let (agent, rest) = arg(verb, rest, "agent").map_err(|_| usage.to_string())?;
                let (capability, action) = arg(verb, rest, "capability").map_err(|_| usage.to_string())?;
                Self::CheckPermission { agent, capability, action: action.to_string() }
            }
            "" => return Err("empty command".into()),
            other => return Err(format!("unknown command: {other}")),
        };
        Ok(cmd)
    }
}

/// Rebuild an action from command-line words. A single (quoted) word is taken
/// verbatim, which is the only way to express the spacing a session line keeps.
pub fn action_from_words(words: &[String]) -> String {
    match words {
        [one] => one.clone(),
        _ => words.join(" "),
    }
}

fn arg<'a>(verb: &str, rest: &'a str, what: &str) -> Result<(String, &'a str), String> {
    let (w, tail) = next_word(rest);
    if w.is_empty() { Err(format!("usage: {verb} <{what}>")) } else { Ok((w.to_string(), tail)) }
}

fn next_word(s: &str) -> (&str, &str) {
    let s = s.trim_start();
    match s.split_once(char::is_whitespace) {
        Some((w, rest)) => (w, rest.trim_start()),
        None => (s, ""),
    }
}

/// Result class of a command; maps onto process exit codes.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Outcome { Success, NotFound, ConfigError, LaunchError, PermissionDenied, Usage }

impl Outcome {
    pub fn exit_code(self) -> u8 {
        match self {
            Self::Success => 0,
            Self::NotFound => 2,
            Self::ConfigError => 3,
            Self::LaunchError => 4,
            Self::PermissionDenied => 5,
            Self::Usage => 64,
        }
    }
}

impl From<&RegistryError> for Outcome {
    fn from(e: &RegistryError) -> Self {
        match e {
            RegistryError::Configuration { .. } => Self::ConfigError,
            RegistryError::NotFound { .. } => Self::NotFound,
            RegistryError::ProviderLaunch { .. } | RegistryError::Request { .. } => Self::LaunchError,
            RegistryError::UnknownCapability(_) => Self::Usage,
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct AgentSummary {
    pub name: String,
    pub mode: AgentMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Clone, Debug, Serialize)]
pub struct ProviderSummary {
    pub name: String,
    pub transport: &'static str,
    pub enabled: bool,
    #[serde(flatten)]
    pub state: ProviderState,
}

#[derive(Clone, Debug, Serialize)]
pub struct ProviderInfo {
    pub name: String,
    pub instance: Uuid,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_info: Option<Value>,
}

impl From<&ProviderHandle> for ProviderInfo {
    fn from(h: &ProviderHandle) -> Self {
        Self {
            name: h.name().to_string(),
            instance: h.instance_id(),
            started_at: h.started_at(),
            pid: h.pid(),
            endpoint: h.endpoint().map(str::to_string),
            server_info: h.server_info().and_then(|v| v.get("serverInfo")).cloned(),
        }
    }
}

#[derive(Clone, Debug, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReplyBody {
    Agents { agents: Vec<AgentSummary> },
    Agent { agent: AgentProfile },
    Permission { agent: String, capability: Capability, action: String, decision: Decision, reason: Reason },
    Providers { session: Uuid, providers: Vec<ProviderSummary> },
    Started { provider: ProviderInfo },
    Stopped { provider: String, was_running: bool },
    Error { message: String },
}

#[derive(Clone, Debug, Serialize)]
pub struct HostReply {
    pub outcome: Outcome,
    #[serde(flatten)]
    pub body: ReplyBody,
}

impl HostReply {
    fn ok(body: ReplyBody) -> Self { Self { outcome: Outcome::Success, body } }

    fn error(outcome: Outcome, message: impl Into<String>) -> Self {
        Self { outcome, body: ReplyBody::Error { message: message.into() } }
    }

    pub fn from_error(e: &RegistryError) -> Self { Self::error(e.into(), e.to_string()) }

    /// Human-readable rendering for one-shot CLI use.
    pub fn render_text(&self) -> String {
        let mut out = String::new();
        match &self.body {
            ReplyBody::Agents { agents } => {
                for a in agents {
                    let _ = write!(out, "{:<24} {:<9}", a.name, a.mode.as_str());
                    if let Some(d) = &a.description { let _ = write!(out, " {d}"); }
                    out.push('\n');
                }
            }
            ReplyBody::Agent { agent } => render_agent(&mut out, agent),
            ReplyBody::Permission { decision, reason, .. } => {
                let _ = write!(out, "{decision}");
                match reason {
                    Reason::MatchedRule { pattern } => { let _ = write!(out, " (rule `{pattern}`)"); }
                    Reason::ToolDisabled => out.push_str(" (tool disabled)"),
                    Reason::NoRules => out.push_str(" (no rules)"),
                    Reason::Unconfigured => out.push_str(" (not configured)"),
                    Reason::Mode | Reason::NoMatch => {}
                }
                out.push('\n');
            }
            ReplyBody::Providers { providers, .. } => {
                for p in providers {
                    let state = match &p.state {
                        ProviderState::Unstarted => "unstarted".to_string(),
                        ProviderState::Launching => "launching".to_string(),
                        ProviderState::Ready => "ready".to_string(),
                        ProviderState::Failed { reason } => format!("failed: {reason}"),
                        ProviderState::Stopped => "stopped".to_string(),
                    };
                    let enabled = if p.enabled { "" } else { " (disabled)" };
                    let _ = writeln!(out, "{:<24} {:<7} {state}{enabled}", p.name, p.transport);
                }
            }
            ReplyBody::Started { provider } => {
                let _ = write!(out, "{} ready", provider.name);
                if let Some(pid) = provider.pid { let _ = write!(out, " (pid {pid})"); }
                if let Some(url) = &provider.endpoint { let _ = write!(out, " at {url}"); }
                out.push('\n');
            }
            ReplyBody::Stopped { provider, was_running } => {
                let _ = writeln!(out, "{provider} {}", if *was_running { "stopped" } else { "was not running" });
            }
            ReplyBody::Error { message } => { let _ = writeln!(out, "error: {message}"); }
        }
        out
    }
}

fn render_agent(out: &mut String, a: &AgentProfile) {
    let _ = writeln!(out, "name:        {}", a.name);
    let _ = writeln!(out, "mode:        {}", a.mode.as_str());
    if let Some(d) = &a.description { let _ = writeln!(out, "description: {d}"); }
    if let Some(m) = &a.model { let _ = writeln!(out, "model:       {m}"); }
    if let Some(t) = a.temperature { let _ = writeln!(out, "temperature: {t}"); }
    if let Some(s) = a.max_steps { let _ = writeln!(out, "maxSteps:    {s}"); }
    if !a.tools.is_empty() {
        let tools: Vec<_> = a.tools.iter().map(|(k, v)| format!("{k}={v}")).collect();
        let _ = writeln!(out, "tools:       {}", tools.join(" "));
    }
    if let Some(e) = a.permission.edit { let _ = writeln!(out, "edit:        {e}"); }
    if let Some(w) = a.permission.webfetch { let _ = writeln!(out, "webfetch:    {w}"); }
    if a.permission.bash.is_empty() {
        out.push_str("bash:        deny (no rules)\n");
    } else {
        out.push_str("bash:\n");
        for r in a.permission.bash.rules() {
            let _ = writeln!(out, "  {:<30} {}", r.pattern.as_str(), r.decision);
        }
    }
    if !a.prompt.is_empty() {
        out.push('\n');
        out.push_str(&a.prompt);
        out.push('\n');
    }
}

/// Executes host commands against one provider session.
pub struct Host {
    runtime: McpRuntime,
}

impl Host {
    pub fn new(runtime: McpRuntime) -> Self { Self { runtime } }
    pub fn runtime(&self) -> &McpRuntime { &self.runtime }

    pub async fn execute(&self, cmd: HostCommand) -> HostReply {
        let registry = self.runtime.registry();
        match cmd {
            HostCommand::ListAgents => HostReply::ok(ReplyBody::Agents {
                agents: registry
                    .agents()
                    .map(|a| AgentSummary { name: a.name.clone(), mode: a.mode, description: a.description.clone() })
                    .collect(),
            }),
            HostCommand::DescribeAgent { name } => match registry.resolve_agent(&name) {
                Ok(agent) => HostReply::ok(ReplyBody::Agent { agent: (*agent).clone() }),
                Err(e) => HostReply::from_error(&e),
            },
            HostCommand::CheckPermission { agent, capability, action } => {
                let capability = match capability.parse::<Capability>() {
                    Ok(c) => c,
                    Err(e) => return HostReply::from_error(&e),
                };
                match registry.explain_permission(&agent, capability, &action) {
                    Ok(check) => HostReply {
                        outcome: if check.decision == Decision::Deny { Outcome::PermissionDenied } else { Outcome::Success },
                        body: ReplyBody::Permission { agent, capability, action, decision: check.decision, reason: check.reason },
                    },
                    Err(e) => HostReply::from_error(&e),
                }
            }
            HostCommand::ListProviders | HostCommand::Status => {
                let snapshot = self.runtime.snapshot();
                let providers = registry
                    .providers()
                    .map(|p| ProviderSummary {
                        name: p.name.clone(),
                        transport: p.transport.kind(),
                        enabled: p.enabled,
                        state: snapshot.get(&p.name).cloned().unwrap_or(ProviderState::Unstarted),
                    })
                    .collect();
                HostReply::ok(ReplyBody::Providers { session: self.runtime.session_id(), providers })
            }
            HostCommand::StartProvider { name } => match self.runtime.acquire(&name).await {
                Ok(handle) => HostReply::ok(ReplyBody::Started { provider: ProviderInfo::from(&handle) }),
                Err(e) => HostReply::from_error(&e),
            },
            HostCommand::StopProvider { name } => match self.runtime.stop(&name).await {
                Ok(was_running) => HostReply::ok(ReplyBody::Stopped { provider: name, was_running }),
                Err(e) => HostReply::from_error(&e),
            },
        }
    }

    /// Line-oriented session: one command per input line, one JSON reply per output line.
    /// Providers started here live until input ends or `quit` is read.
    pub async fn run_session<R, W>(&self, input: R, mut output: W) -> AnyResult<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut lines = input.lines();
        while let Some(line) = lines.next_line().await? {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') { continue; }
            if matches!(line, "quit" | "exit") { break; }
            let reply = match HostCommand::parse(line) {
                Ok(cmd) => {
                    debug!(command = line, "session command");
                    self.execute(cmd).await
                }
                Err(msg) => HostReply::error(Outcome::Usage, msg),
            };
            let mut json = serde_json::to_string(&reply)?;
            json.push('\n');
            output.write_all(json.as_bytes()).await?;
            output.flush().await?;
        }
        self.runtime.shutdown().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_keeps_the_whole_action() {
        assert_eq!(
            HostCommand::parse("check-permission rust-dev bash git log  --oneline").unwrap(),
            HostCommand::CheckPermission {
                agent: "rust-dev".into(),
                capability: "bash".into(),
                action: "git log  --oneline".into(),
            }
        );
        assert_eq!(HostCommand::parse("  list-agents ").unwrap(), HostCommand::ListAgents);
        assert_eq!(
            HostCommand::parse("stop-provider docs-rs").unwrap(),
            HostCommand::StopProvider { name: "docs-rs".into() }
        );
    }

    #[test]
    fn parse_rejects_missing_arguments_and_unknown_verbs() {
        assert!(HostCommand::parse("describe-agent").unwrap_err().contains("usage"));
        assert!(HostCommand::parse("check-permission rust-dev").unwrap_err().contains("usage"));
        assert!(HostCommand::parse("launch-missiles").unwrap_err().contains("unknown command"));
    }

    #[test]
    fn quoted_actions_match_session_lines() {
        let quoted = action_from_words(&["git  status".to_string()]);
        let HostCommand::CheckPermission { action, .. } =
            HostCommand::parse("check-permission rust-dev bash git  status").unwrap()
        else {
            panic!("expected check-permission");
        };
        assert_eq!(quoted, action);
        let words: Vec<String> = ["git", "log", "--oneline"].map(String::from).into();
        assert_eq!(action_from_words(&words), "git log --oneline");
        assert_eq!(action_from_words(&[]), "");
    }

    #[test]
    fn exit_codes() {
        assert_eq!(Outcome::Success.exit_code(), 0);
        assert_eq!(Outcome::from(&RegistryError::agent_not_found("x")).exit_code(), 2);
        assert_eq!(Outcome::from(&RegistryError::config("a", "b")).exit_code(), 3);
        assert_eq!(Outcome::from(&RegistryError::launch("x", "y")).exit_code(), 4);
        assert_eq!(Outcome::PermissionDenied.exit_code(), 5);
    }
}
