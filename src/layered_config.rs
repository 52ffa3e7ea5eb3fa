// agentry/src/layered_config.rs

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::{fs, path::{Path, PathBuf}, time::Duration};

use crate::error::{RegistryError, Result};

/// Dispatcher settings, merged: system -> user -> workspace -> runtime (ephemeral).
#[derive(Clone, Debug, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct Config {
    pub agents: AgentsConfig,
    pub providers: ProvidersConfig,
    pub runtime: RuntimeConfig,
    pub log: LogConfig,
}

#[derive(Clone, Debug, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct AgentsConfig {
    /// Directories scanned for `*.md` agent definitions.
    pub dirs: Vec<PathBuf>,
}

#[derive(Clone, Debug, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct ProvidersConfig {
    /// Provider documents (`.json`, `.yaml`, `.yml`, `.toml`).
    pub files: Vec<PathBuf>,
}

#[derive(Clone, Debug, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct RuntimeConfig {
    pub launch_timeout_ms: Option<u64>,
    pub request_timeout_ms: Option<u64>,
    pub shutdown_grace_ms: Option<u64>,
}

impl RuntimeConfig {
    pub fn launch_timeout(&self) -> Duration { Duration::from_millis(self.launch_timeout_ms.unwrap_or(30_000)) }
    pub fn request_timeout(&self) -> Duration { Duration::from_millis(self.request_timeout_ms.unwrap_or(60_000)) }
    pub fn shutdown_grace(&self) -> Duration { Duration::from_millis(self.shutdown_grace_ms.unwrap_or(5_000)) }
}

#[derive(Clone, Debug, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct LogConfig {
    /// `tracing_subscriber::EnvFilter` directive used when `RUST_LOG` is unset.
    pub filter: Option<String>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Scope { System, User, Workspace, Runtime }

fn merge(a: &mut Config, b: &Config) {
    if !b.agents.dirs.is_empty() { a.agents.dirs = b.agents.dirs.clone(); }
    if !b.providers.files.is_empty() { a.providers.files = b.providers.files.clone(); }

    if b.runtime.launch_timeout_ms.is_some() { a.runtime.launch_timeout_ms = b.runtime.launch_timeout_ms; }
    if b.runtime.request_timeout_ms.is_some() { a.runtime.request_timeout_ms = b.runtime.request_timeout_ms; }
    if b.runtime.shutdown_grace_ms.is_some() { a.runtime.shutdown_grace_ms = b.runtime.shutdown_grace_ms; }

    if b.log.filter.is_some() { a.log.filter = b.log.filter.clone(); }
}

fn config_paths(workspace_root: &Path) -> (PathBuf, Option<PathBuf>, PathBuf) {
    let system = if cfg!(target_os = "windows") {
        PathBuf::from(r"C:\ProgramData\Agentry\config.toml")
    } else {
        PathBuf::from("/etc/agentry/config.toml")
    };
    let user = ProjectDirs::from("dev", "agentry", "agentry").map(|p| p.config_dir().join("config.toml"));
    let workspace = workspace_root.join(".agentry").join("config.toml");
    (system, user, workspace)
}

/// Settings for one workspace. Loaded once; only the runtime overlay changes afterwards.
#[derive(Clone, Debug)]
pub struct ConfigManager {
    merged: Config,
    runtime_overlay: Config,
    layers: Vec<(Scope, Config)>,
    workspace_root: PathBuf,
}

impl ConfigManager {
    pub fn load(workspace_root: impl AsRef<Path>) -> Result<Self> {
        let workspace_root = workspace_root.as_ref().to_path_buf();
        let (system, user, workspace) = config_paths(&workspace_root);
        let mut layers = Vec::new();
        if let Some(c) = Self::read_file(&system)? { layers.push((Scope::System, c)); }
        if let Some(c) = user.as_deref().map(Self::read_file).transpose()?.flatten() { layers.push((Scope::User, c)); }
        if let Some(c) = Self::read_file(&workspace)? { layers.push((Scope::Workspace, c)); }
        Ok(Self::from_layers(workspace_root, layers))
    }

    /// Build from already-read layers, lowest precedence first.
    pub fn from_layers(workspace_root: impl Into<PathBuf>, layers: Vec<(Scope, Config)>) -> Self {
        let mut me = Self {
            merged: Config::default(),
            runtime_overlay: Config::default(),
            layers,
            workspace_root: workspace_root.into(),
        };
        me.remerge();
        me
    }

    /// A missing file is an empty layer; an unreadable or malformed one is an error.
    fn read_file(path: &Path) -> Result<Option<Config>> {
        let text = match fs::read_to_string(path) {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(RegistryError::config(path.display(), e.to_string())),
        };
        let cfg: Config = toml::from_str(&text)
            .map_err(|e| RegistryError::config(path.display(), format!("invalid settings: {e}")))?;
        Ok(Some(cfg))
    }

    fn remerge(&mut self) {
        let mut merged = Config::default();
        for (_, layer) in &self.layers { merge(&mut merged, layer); }
        merge(&mut merged, &self.runtime_overlay);
        self.merged = merged;
    }

    pub fn get(&self) -> &Config { &self.merged }
    pub fn workspace_root(&self) -> &Path { &self.workspace_root }

    /// In-memory overlay (not persisted), e.g. from command-line flags.
    pub fn apply_runtime_overlay(&mut self, patch: Config) {
        merge(&mut self.runtime_overlay, &patch);
        self.remerge();
    }

    /// Agent directories, resolved against the workspace root. Defaults to `.agentry/agents`.
    pub fn agent_dirs(&self) -> Vec<PathBuf> {
        let dirs = &self.merged.agents.dirs;
        if dirs.is_empty() {
            return vec![self.workspace_root.join(".agentry").join("agents")];
        }
        dirs.iter().map(|d| self.resolve(d)).collect()
    }

    /// Provider documents, resolved against the workspace root. Defaults to `.agentry/providers.json`.
    pub fn provider_files(&self) -> Vec<PathBuf> {
        let files = &self.merged.providers.files;
        if files.is_empty() {
            return vec![self.workspace_root.join(".agentry").join("providers.json")];
        }
        files.iter().map(|f| self.resolve(f)).collect()
    }

    fn resolve(&self, p: &Path) -> PathBuf {
        if p.is_absolute() { p.to_path_buf() } else { self.workspace_root.join(p) }
    }
}
