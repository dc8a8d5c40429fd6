//! Configuration system for labfeed.
//!
//! Uses `figment` for layered configuration: defaults -> user config ->
//! workspace `labfeed.toml` -> explicit file -> environment.

use crate::error::ConfigError;
use crate::types::Collection;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Workspace-level configuration file name.
pub const WORKSPACE_CONFIG_FILE: &str = "labfeed.toml";

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LabfeedConfig {
    pub store: StoreConfig,
    pub server: ServerConfig,
}

/// Document store settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// SQLite database file.
    pub path: PathBuf,
    /// How often a change stream polls the change log.
    pub poll_interval_ms: u64,
    /// Physical collection names.
    pub collections: CollectionNames,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("labfeed.db"),
            poll_interval_ms: 250,
            collections: CollectionNames::default(),
        }
    }
}

impl StoreConfig {
    /// Change-log polling interval.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Maps each logical collection to the table that stores it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectionNames {
    pub experiments: String,
    pub transformations: String,
    pub tests: String,
    pub analytics: String,
}

impl Default for CollectionNames {
    fn default() -> Self {
        Self {
            experiments: Collection::Experiments.as_str().to_string(),
            transformations: Collection::Transformations.as_str().to_string(),
            tests: Collection::Tests.as_str().to_string(),
            analytics: Collection::Analytics.as_str().to_string(),
        }
    }
}

impl CollectionNames {
    /// The physical name of a logical collection.
    pub fn name(&self, collection: Collection) -> &str {
        match collection {
            Collection::Experiments => &self.experiments,
            Collection::Transformations => &self.transformations,
            Collection::Tests => &self.tests,
            Collection::Analytics => &self.analytics,
        }
    }

    /// Names must be plain identifiers (they are spliced into SQL) and distinct.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for collection in Collection::ALL {
            let name = self.name(collection);
            let valid = !name.is_empty()
                && !name.starts_with('_')
                && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
            if !valid {
                return Err(ConfigError::Invalid {
                    message: format!(
                        "collection name for {collection} must be a non-empty identifier \
                         of [A-Za-z0-9_] not starting with '_', got '{name}'"
                    ),
                });
            }
            if !seen.insert(name) {
                return Err(ConfigError::Invalid {
                    message: format!("collection name '{name}' is used twice"),
                });
            }
        }
        Ok(())
    }
}

/// HTTP / WebSocket server settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to.
    pub host: String,
    /// Port to listen on.
    pub port: u16,
    /// Directory of static front-end files, served for unmatched paths.
    pub static_dir: Option<PathBuf>,
    /// Maximum concurrent WebSocket connections.
    pub max_connections: usize,
    /// Per-connection buffer of change-feed messages awaiting the socket.
    pub feed_buffer: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3000,
            static_dir: None,
            max_connections: 1024,
            feed_buffer: 64,
        }
    }
}

impl LabfeedConfig {
    /// Reject values the server cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.store.collections.validate()?;
        if self.store.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid {
                message: "store.poll_interval_ms must be greater than zero".into(),
            });
        }
        if self.server.feed_buffer == 0 {
            return Err(ConfigError::Invalid {
                message: "server.feed_buffer must be greater than zero".into(),
            });
        }
        if self.server.max_connections == 0 {
            return Err(ConfigError::Invalid {
                message: "server.max_connections must be greater than zero".into(),
            });
        }
        Ok(())
    }
}

/// Load configuration from layered sources.
///
/// Priority (highest to lowest):
/// 1. Environment variables (prefixed with `LABFEED_`, `__` separates sections)
/// 2. Explicit config file (`--config`)
/// 3. Workspace-local config (`labfeed.toml`)
/// 4. User config (`~/.config/labfeed/config.toml`)
/// 5. Built-in defaults
pub fn load_config(
    workspace: Option<&Path>,
    explicit: Option<&Path>,
) -> Result<LabfeedConfig, ConfigError> {
    let mut figment = Figment::from(Serialized::defaults(LabfeedConfig::default()));

    if let Some(user_config) = user_config_path() {
        if user_config.exists() {
            figment = figment.merge(Toml::file(&user_config));
        }
    }

    if let Some(ws) = workspace {
        let ws_config = ws.join(WORKSPACE_CONFIG_FILE);
        if ws_config.exists() {
            figment = figment.merge(Toml::file(&ws_config));
        }
    }

    if let Some(path) = explicit {
        if !path.exists() {
            return Err(ConfigError::Invalid {
                message: format!("config file not found: {}", path.display()),
            });
        }
        figment = figment.merge(Toml::file(path));
    }

    // LABFEED_SERVER__PORT, LABFEED_STORE__COLLECTIONS__TESTS, ...
    figment = figment.merge(Env::prefixed("LABFEED_").split("__"));

    let config: LabfeedConfig = figment.extract()?;
    config.validate()?;
    Ok(config)
}

/// `~/.config/labfeed/config.toml` (platform equivalent).
pub fn user_config_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("dev", "labfeed", "labfeed")
        .map(|d| d.config_dir().join("config.toml"))
}
