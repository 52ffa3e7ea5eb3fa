pub mod error;
pub mod ordered_map;
pub mod permission;
pub mod agent;
pub mod provider;
pub mod layered_config;
pub mod registry;
pub mod mcp_client;
pub mod launcher;
pub mod mcp_runtime;
pub mod host;

pub use error::{EntryKind, RegistryError, Result};
pub use permission::{Capability, Decision, PermissionCheck, PermissionPolicy, Reason};
pub use agent::{AgentMode, AgentProfile, AgentSource};
pub use provider::{DocumentFormat, ProviderSource, ToolProviderDescriptor, Transport};
pub use layered_config::{Config, ConfigManager, Scope};
pub use registry::{DefinitionSources, Registry};
pub use launcher::{Launcher, ProcessLauncher, ProviderConnection};
pub use mcp_runtime::{McpRuntime, ProviderEvent, ProviderHandle, ProviderState, RuntimeSettings};
pub use host::{Host, HostCommand, HostReply, Outcome};
