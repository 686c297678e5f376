//! Transport settings loaded from the process environment.
//!
//! Values come from real environment variables, optionally seeded from a `.env`
//! file. Loading goes through a lookup closure so tests never mutate the process
//! environment.

use crate::error::config::ConfigError;

use std::env::{self, VarError};
use std::path::PathBuf;

use log::{debug, info};

pub const ENV_ENGINE_MODULE: &str = "OP_SDK_ENGINE_MODULE";
pub const ENV_ENGINE_ISOLATION: &str = "OP_SDK_ENGINE_ISOLATION";
pub const ENV_ENGINE_ALLOWED_HOSTS: &str = "OP_SDK_ENGINE_ALLOWED_HOSTS";
pub const ENV_DELEGATED_SOCKET: &str = "OP_SDK_DELEGATED_SOCKET";
pub const ENV_DESKTOP_LIBRARY: &str = "OP_SDK_DESKTOP_LIBRARY";

/// Hosts the bytecode engine may reach through the `http_get` host callback.
pub const DEFAULT_ALLOWED_HOSTS: &[&str] = &[
    "*.1password.com",
    "*.1password.ca",
    "*.1password.eu",
    "*.b5staging.com",
    "*.b5dev.com",
    "*.b5dev.ca",
    "*.b5dev.eu",
    "*.b5test.com",
    "*.b5test.ca",
    "*.b5test.eu",
    "*.b5rev.com",
    "*.b5local.com",
];

/// How sessions map onto bytecode VM instances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Isolation {
    /// One VM instance per session; distinct sessions run concurrently.
    #[default]
    Spawned,
    /// A single VM instance serves every session; all calls are serialized.
    Shared,
}

impl Isolation {
    /// # Errors
    ///
    /// Returns [`ConfigError::ValidationError`] for anything other than `spawned` or
    /// `shared` (case-insensitive).
    #[track_caller]
    pub fn parse(value: &str) -> Result<Self, ConfigError> {
        match value.trim().to_ascii_lowercase().as_str() {
            "spawned" => Ok(Isolation::Spawned),
            "shared" => Ok(Isolation::Shared),
            other => Err(ConfigError::validation(format!(
                "{ENV_ENGINE_ISOLATION} must be 'spawned' or 'shared', got '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineSettings {
    /// Compiled engine module for the bytecode backend.
    pub module_path: Option<PathBuf>,
    pub isolation: Isolation,
    pub allowed_hosts: Vec<String>,
    /// When set, sessions are delegated to the peer listening on this socket.
    pub delegated_socket: Option<PathBuf>,
    /// Explicit companion library, tried before the per-OS install locations.
    pub desktop_library: Option<PathBuf>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            module_path: None,
            isolation: Isolation::default(),
            allowed_hosts: DEFAULT_ALLOWED_HOSTS.iter().map(|h| h.to_string()).collect(),
            delegated_socket: None,
            desktop_library: None,
        }
    }
}

impl EngineSettings {
    /// Load settings from the environment, reading `.env` first when one exists.
    pub fn from_env() -> Result<Self, ConfigError> {
        match dotenvy::dotenv() {
            Ok(path) => info!("Loaded .env from: {:?}", path),
            Err(_) => debug!("No .env file found - using process environment"),
        }

        Self::from_lookup(|key| env::var(key))
    }

    /// Load settings through `lookup`, which behaves like [`std::env::var`].
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::EnvironmentError`] for non-unicode values and
    /// [`ConfigError::ValidationError`] for values that fail [`EngineSettings::validate`].
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Result<String, VarError>,
    {
        let read = |key: &str| -> Result<Option<String>, ConfigError> {
            match lookup(key) {
                Ok(value) if value.trim().is_empty() => Ok(None),
                Ok(value) => Ok(Some(value)),
                Err(VarError::NotPresent) => Ok(None),
                Err(e) => Err(ConfigError::environment(key, &e)),
            }
        };

        let mut settings = EngineSettings::default();

        if let Some(path) = read(ENV_ENGINE_MODULE)? {
            settings.module_path = Some(PathBuf::from(path));
        }
        if let Some(isolation) = read(ENV_ENGINE_ISOLATION)? {
            settings.isolation = Isolation::parse(&isolation)?;
        }
        if let Some(hosts) = read(ENV_ENGINE_ALLOWED_HOSTS)? {
            settings.allowed_hosts = hosts
                .split(',')
                .map(str::trim)
                .filter(|h| !h.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(socket) = read(ENV_DELEGATED_SOCKET)? {
            settings.delegated_socket = Some(PathBuf::from(socket));
        }
        if let Some(library) = read(ENV_DESKTOP_LIBRARY)? {
            settings.desktop_library = Some(PathBuf::from(library));
        }

        settings.validate()?;
        Ok(settings)
    }

    #[track_caller]
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.allowed_hosts.is_empty() {
            return Err(ConfigError::validation(format!(
                "{ENV_ENGINE_ALLOWED_HOSTS} must name at least one host"
            )));
        }

        for host in &self.allowed_hosts {
            let bare = host.strip_prefix("*.").unwrap_or(host);
            if bare.is_empty() || bare.contains(['/', ':', '*', ' ']) {
                return Err(ConfigError::validation(format!(
                    "allowed host '{host}' must be a host name or a '*.domain' wildcard"
                )));
            }
        }

        Ok(())
    }
}
