use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::atomic::write_atomic;
use crate::error::{PatchlineError, Result};
use crate::registry::{DEFAULT_REGISTRY_URL, DEFAULT_TIMEOUT_SECS};

const CONFIG_FILE: &str = "config.toml";

/// Default config template with rich comments
const DEFAULT_CONFIG_TEMPLATE: &str = r#"# patchline configuration file
# Location: <config dir>/patchline/config.toml (override with PATCHLINE_HOME)

[paths]
# OpenCode plugin cache. Detected from XDG_CACHE_HOME / ~/.cache when unset.
# cache_dir = "/home/me/.cache/opencode"

# Where upgrade/rollback history is kept. Defaults to the platform data dir.
# snapshot_dir = "/home/me/.local/share/patchline/snapshots"

[registry]
# npm-compatible registry used for outdated checks and upgrades
url = "https://registry.npmjs.org"

# Request deadline in seconds
timeout_secs = 10

# Never contact the registry (upgrades then need an explicit --to)
offline = false
"#;

/// Tool settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct PathsConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_dir: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryConfig {
    #[serde(default = "default_registry_url")]
    pub url: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub offline: bool,
}

fn default_registry_url() -> String {
    DEFAULT_REGISTRY_URL.to_string()
}

fn default_timeout_secs() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            url: default_registry_url(),
            timeout_secs: default_timeout_secs(),
            offline: false,
        }
    }
}

const KEYS: &[&str] = &[
    "paths.cache_dir",
    "paths.snapshot_dir",
    "registry.url",
    "registry.timeout_secs",
    "registry.offline",
];

impl Config {
    /// Load config from base directory
    pub fn load(base_dir: &Path) -> Result<Self> {
        let path = Self::path(base_dir);
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(&path).map_err(|e| PatchlineError::io_at(&path, e))?;
        toml::from_str(&content).map_err(|e| PatchlineError::ConfigParse {
            path,
            message: e.to_string(),
        })
    }

    /// Save config to base directory
    pub fn save(&self, base_dir: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        write_atomic(&Self::path(base_dir), content.as_bytes())
    }

    pub fn path(base_dir: &Path) -> PathBuf {
        base_dir.join(CONFIG_FILE)
    }

    /// Write the commented template unless a config already exists
    pub fn init(base_dir: &Path) -> Result<PathBuf> {
        let path = Self::path(base_dir);
        fs::create_dir_all(base_dir).map_err(|e| PatchlineError::io_at(base_dir, e))?;

        if !path.exists() {
            fs::write(&path, DEFAULT_CONFIG_TEMPLATE).map_err(|e| PatchlineError::io_at(&path, e))?;
        }

        Ok(path)
    }

    /// Get a config value by dot-notation key
    pub fn get(&self, key: &str) -> Option<String> {
        let display = |p: &Option<PathBuf>| {
            p.as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_default()
        };
        match key {
            "paths.cache_dir" => Some(display(&self.paths.cache_dir)),
            "paths.snapshot_dir" => Some(display(&self.paths.snapshot_dir)),
            "registry.url" => Some(self.registry.url.clone()),
            "registry.timeout_secs" => Some(self.registry.timeout_secs.to_string()),
            "registry.offline" => Some(self.registry.offline.to_string()),
            _ => None,
        }
    }

    /// Set a config value by dot-notation key. An empty path clears it.
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        let value = value.trim();
        match key {
            "paths.cache_dir" => self.paths.cache_dir = optional_path(value),
            "paths.snapshot_dir" => self.paths.snapshot_dir = optional_path(value),
            "registry.url" => {
                if value.is_empty() {
                    return Err(PatchlineError::invalid("registry.url cannot be empty"));
                }
                self.registry.url = value.to_string();
            }
            "registry.timeout_secs" => {
                self.registry.timeout_secs = value
                    .parse()
                    .ok()
                    .filter(|secs| *secs > 0)
                    .ok_or_else(|| {
                        PatchlineError::invalid(format!(
                            "registry.timeout_secs expects a positive integer, got '{value}'"
                        ))
                    })?;
            }
            "registry.offline" => self.registry.offline = parse_bool(value)?,
            _ => {
                return Err(PatchlineError::ConfigKeyNotFound {
                    key: key.to_string(),
                })
            }
        }
        Ok(())
    }

    /// List all config keys with their current values
    pub fn list(&self) -> Vec<(String, String)> {
        KEYS.iter()
            .filter_map(|key| self.get(key).map(|value| (key.to_string(), value)))
            .collect()
    }
}

fn optional_path(value: &str) -> Option<PathBuf> {
    (!value.is_empty()).then(|| PathBuf::from(value))
}

fn parse_bool(value: &str) -> Result<bool> {
    match value.to_lowercase().as_str() {
        "true" | "yes" | "on" | "1" => Ok(true),
        "false" | "no" | "off" | "0" => Ok(false),
        other => Err(PatchlineError::invalid(format!(
            "expected true or false, got '{other}'"
        ))),
    }
}
