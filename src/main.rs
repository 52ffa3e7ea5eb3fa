// agentry/src/main.rs

use clap::{Parser, Subcommand};
use std::{path::PathBuf, process::ExitCode, sync::Arc};
use tokio::io::{stdin, stdout, BufReader};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use agentry::{
    host::{action_from_words, Host, HostCommand, HostReply, Outcome},
    layered_config::{Config, ConfigManager},
    mcp_runtime::{McpRuntime, RuntimeSettings},
    registry::Registry,
    RegistryError,
};

#[derive(Parser)]
#[command(name = "agentry", version, about = "Agent profiles, permission checks and MCP tool providers")]
struct Args {
    /// Workspace root; `.agentry/` under it holds agents, providers and settings
    #[arg(long, short = 'C', default_value = ".")]
    workspace: PathBuf,
    /// Print replies as JSON
    #[arg(long, global = true)]
    json: bool,
    /// Extra agent directory (replaces configured directories)
    #[arg(long = "agents-dir", value_name = "DIR")]
    agent_dirs: Vec<PathBuf>,
    /// Provider document (replaces configured documents)
    #[arg(long = "providers", value_name = "FILE")]
    provider_files: Vec<PathBuf>,
    /// Override the provider launch timeout
    #[arg(long, value_name = "MS")]
    launch_timeout_ms: Option<u64>,
    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// List agent profiles
    ListAgents,
    /// Show one agent profile, including its prompt
    DescribeAgent { name: String },
    /// Decide whether an agent may perform an action (edit, write, bash, webfetch)
    CheckPermission {
        agent: String,
        capability: String,
        /// The action; words are joined with single spaces, so quote it to keep other spacing
        #[arg(trailing_var_arg = true, allow_hyphen_values = true, num_args = 0..)]
        action: Vec<String>,
    },
    /// List tool providers and their state
    ListProviders,
    /// Launch a provider and report its handle
    StartProvider {
        name: String,
        /// Keep the provider running until Ctrl-C
        #[arg(long)]
        hold: bool,
    },
    /// Stop a provider started in this process
    StopProvider { name: String },
    /// Read commands from stdin, one per line, and answer with JSON lines
    Session,
}

impl Args {
    fn overlay(&self) -> Config {
        let mut patch = Config::default();
        patch.agents.dirs = self.agent_dirs.clone();
        patch.providers.files = self.provider_files.clone();
        patch.runtime.launch_timeout_ms = self.launch_timeout_ms;
        patch
    }
}

fn init_tracing(configured: Option<&str>) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(configured.unwrap_or("info")));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}

fn print(reply: &HostReply, json: bool) {
    if json {
        match serde_json::to_string(reply) {
            Ok(s) => println!("{s}"),
            Err(e) => error!(error = %e, "could not encode reply"),
        }
    } else if reply.outcome == Outcome::Success || reply.outcome == Outcome::PermissionDenied {
        print!("{}", reply.render_text());
    } else {
        eprint!("{}", reply.render_text());
    }
}

fn fail(e: &RegistryError, json: bool) -> ExitCode {
    let reply = HostReply::from_error(e);
    print(&reply, json);
    ExitCode::from(reply.outcome.exit_code())
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let mut cfg = match ConfigManager::load(&args.workspace) {
        Ok(cfg) => cfg,
        Err(e) => {
            init_tracing(None);
            return fail(&e, args.json);
        }
    };
    cfg.apply_runtime_overlay(args.overlay());
    init_tracing(cfg.get().log.filter.as_deref());

    let registry = match Registry::load(&cfg) {
        Ok(r) => Arc::new(r),
        Err(e) => return fail(&e, args.json),
    };
    let runtime = McpRuntime::with_process_launcher(registry, RuntimeSettings::from(&cfg.get().runtime));
    let host = Host::new(runtime);

    let (cmd, hold) = match args.cmd {
        Cmd::Session => {
            info!(session = %host.runtime().session_id(), "session started");
            return match host.run_session(BufReader::new(stdin()), stdout()).await {
                Ok(()) => ExitCode::SUCCESS,
                Err(e) => {
                    error!(error = %e, "session aborted");
                    ExitCode::FAILURE
                }
            };
        }
        Cmd::ListAgents => (HostCommand::ListAgents, false),
        Cmd::DescribeAgent { name } => (HostCommand::DescribeAgent { name }, false),
        Cmd::CheckPermission { agent, capability, action } => {
            (HostCommand::CheckPermission { agent, capability, action: action_from_words(&action) }, false)
        }
        Cmd::ListProviders => (HostCommand::ListProviders, false),
        Cmd::StartProvider { name, hold } => (HostCommand::StartProvider { name }, hold),
        Cmd::StopProvider { name } => (HostCommand::StopProvider { name }, false),
    };

    let reply = host.execute(cmd).await;
    print(&reply, args.json);
    if hold && reply.outcome == Outcome::Success {
        info!("holding provider; Ctrl-C to stop");
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "could not listen for Ctrl-C");
        }
    }
    host.runtime().shutdown().await;
    ExitCode::from(reply.outcome.exit_code())
}
