// agentry/src/error.rs

use std::fmt;
use thiserror::Error;

/// What kind of registry entry a lookup was for.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EntryKind { Agent, Provider }

impl fmt::Display for EntryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Agent => f.write_str("agent"),
            Self::Provider => f.write_str("provider"),
        }
    }
}

#[derive(Error, Debug)]
pub enum RegistryError {
    /// Malformed or contradictory definitions. Fatal at startup.
    #[error("configuration error in {origin}: {message}")]
    Configuration { origin: String, message: String },

    #[error("{kind} not found: {name}")]
    NotFound { kind: EntryKind, name: String },

    /// A provider failed to start or handshake. Other providers are unaffected.
    #[error("failed to launch provider `{name}`: {reason}")]
    ProviderLaunch { name: String, reason: String },

    #[error("request to provider `{name}` failed: {reason}")]
    Request { name: String, reason: String },

    #[error("unknown capability: {0} (expected one of: edit, write, bash, webfetch)")]
    UnknownCapability(String),
}

impl RegistryError {
    pub fn config(origin: impl fmt::Display, message: impl Into<String>) -> Self {
        Self::Configuration { origin: origin.to_string(), message: message.into() }
    }

    pub fn agent_not_found(name: &str) -> Self {
        Self::NotFound { kind: EntryKind::Agent, name: name.to_string() }
    }

    pub fn provider_not_found(name: &str) -> Self {
        Self::NotFound { kind: EntryKind::Provider, name: name.to_string() }
    }

    pub fn launch(name: &str, reason: impl Into<String>) -> Self {
        Self::ProviderLaunch { name: name.to_string(), reason: reason.into() }
    }
}

pub type Result<T> = std::result::Result<T, RegistryError>;
