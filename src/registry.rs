// agentry/src/registry.rs

use std::{
    collections::{BTreeMap, BTreeSet},
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::{
    agent::{AgentProfile, AgentSource},
    error::{RegistryError, Result},
    layered_config::ConfigManager,
    permission::{Capability, Decision, PermissionCheck},
    provider::{parse_providers, DocumentFormat, ProviderSource, ToolProviderDescriptor},
};

/// Raw definition documents, in the order they should be loaded.
#[derive(Clone, Debug, Default)]
pub struct DefinitionSources {
    pub agents: Vec<AgentSource>,
    pub providers: Vec<ProviderSource>,
}

impl DefinitionSources {
    /// Read agent directories and provider documents named by the settings.
    /// Paths that do not exist are skipped.
    pub fn discover(cfg: &ConfigManager) -> Result<Self> {
        let mut seen = BTreeSet::new();
        let mut sources = Self::default();
        for dir in cfg.agent_dirs() {
            if !dir.is_dir() {
                debug!(dir = %dir.display(), "agent directory not present");
                continue;
            }
            for entry in WalkDir::new(&dir).min_depth(1).follow_links(true).sort_by_file_name() {
                let entry = entry.map_err(|e| RegistryError::config(dir.display(), e.to_string()))?;
                let path = entry.path();
                if !entry.file_type().is_file() || path.extension().is_none_or(|e| e != "md") { continue; }
                if !seen.insert(canonical(path)) { continue; }
                let name_hint = path.file_stem().and_then(|s| s.to_str()).map(str::to_string);
                sources.agents.push(AgentSource::new(path.display().to_string(), name_hint, read(path)?));
            }
        }
        for file in cfg.provider_files() {
            if !file.is_file() {
                debug!(file = %file.display(), "provider document not present");
                continue;
            }
            if !seen.insert(canonical(&file)) { continue; }
            let format = DocumentFormat::from_path(&file).ok_or_else(|| {
                RegistryError::config(file.display(), "unsupported provider document extension (expected .json, .yaml, .yml or .toml)")
            })?;
            sources.providers.push(ProviderSource::new(file.display().to_string(), format, read(&file)?));
        }
        Ok(sources)
    }
}

fn canonical(path: &Path) -> PathBuf {
    fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

fn read(path: &Path) -> Result<String> {
    fs::read_to_string(path).map_err(|e| RegistryError::config(path.display(), e.to_string()))
}

/// Every agent profile and tool provider known to this process. Immutable once built.
#[derive(Debug, Default)]
pub struct Registry {
    agents: BTreeMap<String, Arc<AgentProfile>>,
    providers: BTreeMap<String, Arc<ToolProviderDescriptor>>,
}

impl Registry {
    /// Parse and validate everything, or fail without a partial registry.
    pub fn load_definitions(sources: DefinitionSources) -> Result<Self> {
        let mut agents: BTreeMap<String, Arc<AgentProfile>> = BTreeMap::new();
        for src in &sources.agents {
            let profile = AgentProfile::parse(src)?;
            if let Some(prev) = agents.get(&profile.name) {
                return Err(RegistryError::config(
                    &src.origin,
                    format!("agent `{}` is already defined in {}", profile.name, prev.origin),
                ));
            }
            agents.insert(profile.name.clone(), Arc::new(profile));
        }

        let mut providers: BTreeMap<String, Arc<ToolProviderDescriptor>> = BTreeMap::new();
        for src in &sources.providers {
            for desc in parse_providers(src)? {
                if let Some(prev) = providers.get(&desc.name) {
                    return Err(RegistryError::config(
                        &src.origin,
                        format!("provider `{}` is already defined in {}", desc.name, prev.origin),
                    ));
                }
                providers.insert(desc.name.clone(), Arc::new(desc));
            }
        }

        info!(agents = agents.len(), providers = providers.len(), "definitions loaded");
        Ok(Self { agents, providers })
    }

    /// Discover sources from the settings and load them.
    pub fn load(cfg: &ConfigManager) -> Result<Self> {
        Self::load_definitions(DefinitionSources::discover(cfg)?)
    }

    pub fn resolve_agent(&self, name: &str) -> Result<Arc<AgentProfile>> {
        self.agents.get(name).cloned().ok_or_else(|| RegistryError::agent_not_found(name))
    }

    /// Agents in name order.
    pub fn agents(&self) -> impl Iterator<Item = &Arc<AgentProfile>> { self.agents.values() }

    pub fn evaluate_permission(&self, agent: &str, capability: Capability, action: &str) -> Result<Decision> {
        Ok(self.explain_permission(agent, capability, action)?.decision)
    }

    /// Same as [`Registry::evaluate_permission`], with the reason for the decision.
    pub fn explain_permission(&self, agent: &str, capability: Capability, action: &str) -> Result<PermissionCheck> {
        let profile = self.agents.get(agent).ok_or_else(|| RegistryError::agent_not_found(agent))?;
        Ok(profile.check(capability, action))
    }

    pub fn provider(&self, name: &str) -> Result<Arc<ToolProviderDescriptor>> {
        self.providers.get(name).cloned().ok_or_else(|| RegistryError::provider_not_found(name))
    }

    /// Providers in name order.
    pub fn providers(&self) -> impl Iterator<Item = &Arc<ToolProviderDescriptor>> { self.providers.values() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{error::EntryKind, permission::Reason};

    fn agent(name: &str, text: &str) -> AgentSource {
        AgentSource::new(format!("{name}.md"), Some(name.to_string()), text)
    }

    fn sample() -> DefinitionSources {
        DefinitionSources {
            agents: vec![
                agent("rust-dev", "---\nmode: primary\npermission:\n  edit: allow\n  bash:\n    \"git status\": allow\n    \"git diff\": allow\n    \"git log*\": allow\n    \"*\": ask\n---\nRust."),
                agent("sag_review", "---\nmode: subagent\ntools:\n  write: false\n  edit: false\n  bash: false\n---\nReview."),
                agent("locked", "---\nmode: primary\n---\nNo bash rules."),
            ],
            providers: vec![ProviderSource::new(
                "providers.json",
                DocumentFormat::Json,
                r#"{"mcp":{"docs-rs":{"type":"local","command":["npx","-y","docs-rs-mcp"]}}}"#,
            )],
        }
    }

    #[test]
    fn every_declared_name_resolves_to_its_definition() {
        let reg = Registry::load_definitions(sample()).unwrap();
        let names: Vec<_> = reg.agents().map(|a| a.name.as_str()).collect();
        assert_eq!(names, ["locked", "rust-dev", "sag_review"]);
        for name in names {
            let a = reg.resolve_agent(name).unwrap();
            let b = reg.resolve_agent(name).unwrap();
            assert!(Arc::ptr_eq(&a, &b));
            assert_eq!(a.name, name);
        }
        assert_eq!(reg.provider("docs-rs").unwrap().name, "docs-rs");
    }

    #[test]
    fn unknown_names_are_not_found() {
        let reg = Registry::load_definitions(sample()).unwrap();
        assert!(matches!(
            reg.resolve_agent("go-dev"),
            Err(RegistryError::NotFound { kind: EntryKind::Agent, .. })
        ));
        assert!(matches!(
            reg.provider("fetch"),
            Err(RegistryError::NotFound { kind: EntryKind::Provider, .. })
        ));
        assert!(reg.evaluate_permission("go-dev", Capability::Bash, "ls").is_err());
    }

    #[test]
    fn rust_dev_bash_scenario() {
        let reg = Registry::load_definitions(sample()).unwrap();
        assert_eq!(reg.evaluate_permission("rust-dev", Capability::Bash, "git status").unwrap(), Decision::Allow);
        assert_eq!(reg.evaluate_permission("rust-dev", Capability::Bash, "cargo publish").unwrap(), Decision::Ask);
        // Same question, same answer.
        assert_eq!(reg.evaluate_permission("rust-dev", Capability::Bash, "cargo publish").unwrap(), Decision::Ask);
    }

    #[test]
    fn disabled_capabilities_are_denied_at_the_gate() {
        let reg = Registry::load_definitions(sample()).unwrap();
        let check = reg.explain_permission("sag_review", Capability::Edit, "src/lib.rs").unwrap();
        assert_eq!(check.decision, Decision::Deny);
        assert_eq!(check.reason, Reason::ToolDisabled);
    }

    #[test]
    fn empty_bash_policy_denies_everything() {
        let reg = Registry::load_definitions(sample()).unwrap();
        for cmd in ["ls", "git status", "", "rm -rf /"] {
            assert_eq!(reg.evaluate_permission("locked", Capability::Bash, cmd).unwrap(), Decision::Deny);
        }
    }

    #[test]
    fn duplicate_agent_names_abort_the_load() {
        let mut sources = sample();
        sources.agents.push(AgentSource::new("other/rust-dev.md", Some("rust-dev".into()), "---\nmode: subagent\n---\n"));
        let err = Registry::load_definitions(sources).unwrap_err();
        assert!(err.to_string().contains("already defined"), "{err}");
    }

    #[test]
    fn duplicate_provider_names_across_documents_abort_the_load() {
        let mut sources = sample();
        sources.providers.push(ProviderSource::new(
            "more.yaml",
            DocumentFormat::Yaml,
            "mcp:\n  docs-rs:\n    type: remote\n    url: https://example.invalid/mcp\n",
        ));
        assert!(matches!(Registry::load_definitions(sources), Err(RegistryError::Configuration { .. })));
    }
}
