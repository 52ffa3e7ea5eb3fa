// agentry/src/provider.rs

use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, path::{Path, PathBuf}, time::Duration};

use crate::{
    agent::valid_name,
    error::{RegistryError, Result},
    ordered_map::OrderedMap,
};

/// How the dispatcher reaches a tool provider.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Transport {
    /// A child process speaking MCP over stdio. Needs its runtime on `PATH`.
    Local {
        /// Executable first, then arguments.
        command: Vec<String>,
        #[serde(skip_serializing)]
        environment: BTreeMap<String, String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        cwd: Option<PathBuf>,
    },
    /// An endpoint owned by someone else; nothing to launch.
    Remote {
        url: String,
        #[serde(skip_serializing)]
        headers: BTreeMap<String, String>,
    },
}

impl Transport {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Local { .. } => "local",
            Self::Remote { .. } => "remote",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ToolProviderDescriptor {
    pub name: String,
    pub enabled: bool,
    pub transport: Transport,
    /// Launch and handshake budget; falls back to the session default.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(skip)]
    pub origin: String,
}

impl ToolProviderDescriptor {
    pub fn timeout(&self) -> Option<Duration> { self.timeout_ms.map(Duration::from_millis) }
    pub fn is_local(&self) -> bool { matches!(self.transport, Transport::Local { .. }) }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DocumentFormat { Json, Yaml, Toml }

impl DocumentFormat {
    pub fn from_path(path: &Path) -> Option<Self> {
        match path.extension()?.to_str()? {
            "json" => Some(Self::Json),
            "yaml" | "yml" => Some(Self::Yaml),
            "toml" => Some(Self::Toml),
            _ => None,
        }
    }
}

/// One provider configuration document, before parsing.
#[derive(Clone, Debug)]
pub struct ProviderSource {
    pub origin: String,
    pub format: DocumentFormat,
    pub text: String,
}

impl ProviderSource {
    pub fn new(origin: impl Into<String>, format: DocumentFormat, text: impl Into<String>) -> Self {
        Self { origin: origin.into(), format, text: text.into() }
    }
}

#[derive(Deserialize)]
struct ProviderDocument {
    #[serde(default, alias = "servers")]
    mcp: OrderedMap<RawProvider>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum CommandLine {
    Argv(Vec<String>),
    Line(String),
}

#[derive(Deserialize)]
struct RawProvider {
    #[serde(rename = "type", alias = "transport")]
    kind: Option<String>,
    command: Option<CommandLine>,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default, alias = "env")]
    environment: BTreeMap<String, String>,
    cwd: Option<PathBuf>,
    url: Option<String>,
    #[serde(default)]
    headers: BTreeMap<String, String>,
    enabled: Option<bool>,
    timeout: Option<u64>,
}

/// Parse every provider entry of one document, in declaration order.
pub fn parse_providers(source: &ProviderSource) -> Result<Vec<ToolProviderDescriptor>> {
    let origin = source.origin.as_str();
    let doc: ProviderDocument = match source.format {
        DocumentFormat::Json => serde_json::from_str(&source.text).map_err(|e| e.to_string()),
        DocumentFormat::Yaml => serde_yml::from_str(&source.text).map_err(|e| e.to_string()),
        DocumentFormat::Toml => toml::from_str(&source.text).map_err(|e| e.to_string()),
    }
    .map_err(|e| RegistryError::config(origin, format!("invalid provider document: {e}")))?;

    doc.mcp.into_inner().into_iter().map(|(name, raw)| descriptor(origin, name, raw)).collect()
}

fn descriptor(origin: &str, name: String, raw: RawProvider) -> Result<ToolProviderDescriptor> {
    let err = |msg: String| RegistryError::config(origin, msg);
    if !valid_name(&name) {
        return Err(err(format!("invalid provider name `{name}`")));
    }
    let kind = raw.kind.ok_or_else(|| err(format!("provider `{name}` is missing required field `type`")))?;
    let transport = match kind.as_str() {
        "local" | "local-process" | "stdio" => {
            let mut command = match raw.command {
                Some(CommandLine::Argv(argv)) => argv,
                Some(CommandLine::Line(line)) => line.split_whitespace().map(str::to_string).collect(),
                None => Vec::new(),
            };
            command.extend(raw.args);
            if command.first().is_none_or(|exe| exe.trim().is_empty()) {
                return Err(err(format!("local provider `{name}` needs a non-empty `command`")));
            }
            Transport::Local { command, environment: raw.environment, cwd: raw.cwd }
        }
        "remote" => {
            let url = raw.url.filter(|u| !u.trim().is_empty())
                .ok_or_else(|| err(format!("remote provider `{name}` needs a `url`")))?;
            Transport::Remote { url, headers: raw.headers }
        }
        other => return Err(err(format!("provider `{name}` has unknown transport `{other}` (expected local or remote)"))),
    };
    if raw.timeout == Some(0) {
        return Err(err(format!("provider `{name}` timeout must be greater than 0")));
    }
    Ok(ToolProviderDescriptor {
        name,
        enabled: raw.enabled.unwrap_or(true),
        transport,
        timeout_ms: raw.timeout,
        origin: origin.to_string(),
    })
}
