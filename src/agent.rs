// agentry/src/agent.rs

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, sync::LazyLock};
use tracing::warn;

use crate::{
    error::{RegistryError, Result},
    permission::{Capability, Decision, PermissionCheck, PermissionPolicy, Reason},
};

static NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.-]*$").expect("static regex"));

/// Agent and provider names: alphanumeric first, then `[A-Za-z0-9_.-]`.
pub(crate) fn valid_name(name: &str) -> bool { NAME_RE.is_match(name) }

/// How an agent can be reached.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentMode {
    /// Directly selectable by a user.
    Primary,
    /// Only reachable by delegation from a primary agent or the host.
    Subagent,
    /// Both.
    All,
}

impl AgentMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Subagent => "subagent",
            Self::All => "all",
        }
    }
}

/// One agent definition document, before parsing.
#[derive(Clone, Debug)]
pub struct AgentSource {
    /// Where the text came from; used in error messages.
    pub origin: String,
    /// Fallback name when the header has none (usually the file stem).
    pub name_hint: Option<String>,
    pub text: String,
}

impl AgentSource {
    pub fn new(origin: impl Into<String>, name_hint: Option<String>, text: impl Into<String>) -> Self {
        Self { origin: origin.into(), name_hint, text: text.into() }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct AgentProfile {
    pub name: String,
    pub mode: AgentMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Passed through to the model caller untouched.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(rename = "maxSteps", skip_serializing_if = "Option::is_none")]
    pub max_steps: Option<u32>,
    pub tools: BTreeMap<String, bool>,
    pub permission: PermissionPolicy,
    /// Instruction text after the header. Never interpreted here.
    pub prompt: String,
    #[serde(skip)]
    pub origin: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AgentHeader {
    name: Option<String>,
    mode: Option<AgentMode>,
    description: Option<String>,
    model: Option<String>,
    temperature: Option<f32>,
    #[serde(alias = "max_steps")]
    max_steps: Option<u32>,
    #[serde(default)]
    tools: BTreeMap<String, bool>,
    #[serde(default)]
    permission: PermissionPolicy,
}

impl AgentProfile {
    /// Parse a markdown document with a `---` delimited YAML header.
    pub fn parse(source: &AgentSource) -> Result<Self> {
        let origin = source.origin.as_str();
        let (header, body) = split_front_matter(&source.text)
            .ok_or_else(|| RegistryError::config(origin, "agent definition must start with a `---` delimited YAML header"))?;
        if header.trim().is_empty() {
            return Err(RegistryError::config(origin, "agent header is empty; `mode` is required"));
        }
        let h: AgentHeader = serde_yml::from_str(header)
            .map_err(|e| RegistryError::config(origin, format!("invalid agent header: {e}")))?;

        let name = h.name.or_else(|| source.name_hint.clone())
            .ok_or_else(|| RegistryError::config(origin, "agent has no `name` and none can be derived from its source"))?;
        if !valid_name(&name) {
            return Err(RegistryError::config(origin, format!("invalid agent name `{name}`")));
        }
        let mode = h.mode
            .ok_or_else(|| RegistryError::config(origin, format!("agent `{name}` is missing required field `mode`")))?;
        if let Some(t) = h.temperature {
            if !t.is_finite() || !(0.0..=2.0).contains(&t) {
                return Err(RegistryError::config(origin, format!("agent `{name}` temperature {t} is outside 0.0..=2.0")));
            }
        }
        if h.max_steps == Some(0) {
            return Err(RegistryError::config(origin, format!("agent `{name}` maxSteps must be greater than 0")));
        }
        if !h.permission.bash.is_total() {
            return Err(RegistryError::config(
                origin,
                format!("agent `{name}` bash permission has no `*` fallback rule; unmatched commands would be undecidable"),
            ));
        }
        for rule in h.permission.bash.unreachable() {
            warn!(agent = %name, pattern = rule.pattern.as_str(), "bash rule follows a `*` rule and can never match");
        }

        Ok(Self {
            name,
            mode,
            description: h.description,
            model: h.model,
            temperature: h.temperature,
            max_steps: h.max_steps,
            tools: h.tools,
            permission: h.permission,
            prompt: body.trim_start_matches(['\r', '\n']).trim_end().to_string(),
            origin: origin.to_string(),
        })
    }

    /// Tools are enabled unless explicitly switched off.
    pub fn tool_enabled(&self, tool: &str) -> bool {
        self.tools.get(tool).copied().unwrap_or(true)
    }

    pub fn is_selectable(&self) -> bool { matches!(self.mode, AgentMode::Primary | AgentMode::All) }
    pub fn is_delegable(&self) -> bool { matches!(self.mode, AgentMode::Subagent | AgentMode::All) }

    /// Capability gate first, then the permission policy.
    pub fn check(&self, capability: Capability, action: &str) -> PermissionCheck {
        if !self.tool_enabled(capability.tool_name()) {
            return PermissionCheck { decision: Decision::Deny, reason: Reason::ToolDisabled };
        }
        self.permission.evaluate(capability, action)
    }
}

/// Returns `(header, body)` when `text` opens with a `---` line and has a closing one.
fn split_front_matter(text: &str) -> Option<(&str, &str)> {
    let text = text.strip_prefix('\u{feff}').unwrap_or(text);
    let mut lines = text.split_inclusive('\n');
    let first = lines.next()?;
    if first.trim_end() != "---" { return None; }
    let start = first.len();
    let mut offset = start;
    for line in lines {
        if line.trim_end() == "---" {
            return Some((&text[start..offset], &text[offset + line.len()..]));
        }
        offset += line.len();
    }
    None
}
