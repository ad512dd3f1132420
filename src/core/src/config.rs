use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{BuildError, Result};
use crate::log::LogConfig;

/// Builder configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BuilderConfig {
    /// Consult the layer cache before executing a step
    pub use_cache: bool,

    /// Remove intermediate containers after a successful commit
    pub remove_intermediate: bool,

    /// Suppress step-by-step progress output
    pub quiet: bool,

    /// Persist the cache entry table here (in-memory only when unset)
    pub cache_index: Option<PathBuf>,

    /// Remote fetcher settings
    pub network: NetworkConfig,

    /// Logging settings
    pub log: LogConfig,
}

impl Default for BuilderConfig {
    fn default() -> Self {
        Self {
            use_cache: true,
            remove_intermediate: true,
            quiet: false,
            cache_index: None,
            network: NetworkConfig::default(),
            log: LogConfig::default(),
        }
    }
}

impl BuilderConfig {
    /// Load a configuration file.
    ///
    /// Files ending in `.json` are read as JSON, everything else as YAML.
    /// Missing fields take their defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            BuildError::Config(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;

        let is_json = path
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("json"))
            .unwrap_or(false);

        let config: Self = if is_json {
            serde_json::from_str(&content)?
        } else {
            serde_yaml::from_str(&content)?
        };
        tracing::debug!(
            path = %path.display(),
            use_cache = config.use_cache,
            cache_index = ?config.cache_index,
            "Loaded builder config"
        );
        Ok(config)
    }

    /// Same configuration with caching turned off.
    pub fn without_cache(mut self) -> Self {
        self.use_cache = false;
        self
    }
}

/// Network configuration for remote ADD sources
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// HTTP(S) proxy URL applied to all requests
    pub proxy: Option<String>,

    /// User-Agent header sent with every request
    pub user_agent: String,

    /// TCP connect timeout in seconds; no timeout when unset
    pub connect_timeout_secs: Option<u64>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            proxy: None,
            user_agent: format!("strata-builder/{}", crate::VERSION),
            connect_timeout_secs: None,
        }
    }
}
