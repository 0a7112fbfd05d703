//! Environment-driven default locations.
//!
//! Everything the process environment contributes is captured once in a
//! [`PathEnv`], so resolution is a pure function of that value.

use std::collections::HashSet;
use std::env;
use std::path::{Path, PathBuf};

/// Config filenames, in preference order at any one directory.
pub const CONFIG_FILENAMES: &[&str] = &["opencode.json", ".opencode.json"];

pub const CUSTOM_CONFIG_ENV: &str = "OPENCODE_CONFIG";
pub const CUSTOM_CONFIG_DIR_ENV: &str = "OPENCODE_CONFIG_DIR";

const APP_DIR: &str = "opencode";
const TOOL_DIR: &str = "patchline";
const PLUGINS_DIR: &str = "plugins";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OsFamily {
    MacOs,
    Windows,
    #[default]
    Other,
}

impl OsFamily {
    pub fn current() -> Self {
        if cfg!(target_os = "macos") {
            Self::MacOs
        } else if cfg!(windows) {
            Self::Windows
        } else {
            Self::Other
        }
    }
}

/// Snapshot of the environment inputs used for path resolution.
#[derive(Debug, Clone, Default)]
pub struct PathEnv {
    pub home: Option<PathBuf>,
    pub xdg_config_home: Option<PathBuf>,
    pub xdg_data_home: Option<PathBuf>,
    pub xdg_cache_home: Option<PathBuf>,
    pub local_app_data: Option<PathBuf>,
    pub custom_config: Option<PathBuf>,
    pub custom_config_dir: Option<PathBuf>,
    pub os: OsFamily,
}

fn env_path(key: &str) -> Option<PathBuf> {
    env::var_os(key)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}

impl PathEnv {
    pub fn from_process() -> Self {
        Self {
            home: dirs::home_dir(),
            xdg_config_home: env_path("XDG_CONFIG_HOME"),
            xdg_data_home: env_path("XDG_DATA_HOME"),
            xdg_cache_home: env_path("XDG_CACHE_HOME"),
            local_app_data: env_path("LOCALAPPDATA"),
            custom_config: env_path(CUSTOM_CONFIG_ENV),
            custom_config_dir: env_path(CUSTOM_CONFIG_DIR_ENV),
            os: OsFamily::current(),
        }
    }

    /// Candidate global config files, most preferred first.
    pub fn global_config_candidates(&self) -> Vec<PathBuf> {
        let mut bases = Vec::new();
        if let Some(config_home) = &self.xdg_config_home {
            bases.push(config_home.join(APP_DIR));
        }
        if let Some(home) = &self.home {
            match self.os {
                OsFamily::MacOs => {
                    bases.push(home.join("Library").join("Application Support").join(APP_DIR))
                }
                _ => bases.push(home.join(".config").join(APP_DIR)),
            }
            bases.push(home.join(".opencode"));
        }

        unique_paths(
            bases
                .iter()
                .flat_map(|base| CONFIG_FILENAMES.iter().map(move |name| base.join(name))),
        )
    }

    /// Directories that may hold filesystem plugins, besides caller extras.
    pub fn default_local_plugin_dirs(
        &self,
        project_dir: Option<&Path>,
        global_config: Option<&Path>,
        custom_config_dir: Option<&Path>,
    ) -> Vec<PathBuf> {
        let mut dirs = Vec::new();
        if let Some(parent) = global_config.and_then(Path::parent) {
            dirs.push(parent.join(PLUGINS_DIR));
        }
        if let Some(dir) = custom_config_dir {
            dirs.push(dir.join(PLUGINS_DIR));
        }
        if let Some(data_home) = &self.xdg_data_home {
            dirs.push(data_home.join(APP_DIR).join(PLUGINS_DIR));
        }
        if let Some(home) = &self.home {
            match self.os {
                OsFamily::MacOs => dirs.push(
                    home.join("Library")
                        .join("Application Support")
                        .join(APP_DIR)
                        .join(PLUGINS_DIR),
                ),
                _ => dirs.push(
                    home.join(".local")
                        .join("share")
                        .join(APP_DIR)
                        .join(PLUGINS_DIR),
                ),
            }
        }
        if let Some(project) = project_dir {
            dirs.push(project.join(".opencode").join(PLUGINS_DIR));
            dirs.push(project.join(APP_DIR).join(PLUGINS_DIR));
        }
        unique_paths(dirs)
    }

    pub fn cache_dir_candidates(&self) -> Vec<PathBuf> {
        let mut dirs = Vec::new();
        if let Some(cache_home) = &self.xdg_cache_home {
            dirs.push(cache_home.join(APP_DIR).join(PLUGINS_DIR));
            dirs.push(cache_home.join(APP_DIR));
        }
        if let Some(home) = &self.home {
            let base = match self.os {
                OsFamily::MacOs => home.join("Library").join("Caches").join(APP_DIR),
                _ => home.join(".cache").join(APP_DIR),
            };
            dirs.push(base.join(PLUGINS_DIR));
            dirs.push(base);
        }
        unique_paths(dirs)
    }

    pub fn snapshot_dir_candidates(&self) -> Vec<PathBuf> {
        let mut dirs = Vec::new();
        if let Some(data_home) = &self.xdg_data_home {
            dirs.push(data_home.join(TOOL_DIR).join("snapshots"));
        }
        if self.os == OsFamily::Windows {
            if let Some(local) = &self.local_app_data {
                dirs.push(local.join(TOOL_DIR).join("snapshots"));
            }
        }
        if let Some(home) = &self.home {
            let base = match self.os {
                OsFamily::MacOs => home.join("Library").join("Application Support"),
                OsFamily::Windows => home.join("AppData").join("Local"),
                OsFamily::Other => home.join(".local").join("share"),
            };
            dirs.push(base.join(TOOL_DIR).join("snapshots"));
        }
        unique_paths(dirs)
    }

    /// First existing cache directory, plus every candidate that was checked.
    ///
    /// An explicit override is returned as-is without checking candidates.
    pub fn resolve_cache_dir(&self, override_dir: Option<&Path>) -> (Option<PathBuf>, Vec<PathBuf>) {
        if let Some(dir) = override_dir {
            return (Some(dir.to_path_buf()), Vec::new());
        }
        let candidates = self.cache_dir_candidates();
        let found = candidates.iter().find(|d| d.is_dir()).cloned();
        (found, candidates)
    }

    /// First existing snapshot directory, else the first candidate.
    pub fn resolve_snapshot_dir(
        &self,
        override_dir: Option<&Path>,
    ) -> (Option<PathBuf>, Vec<PathBuf>) {
        if let Some(dir) = override_dir {
            return (Some(dir.to_path_buf()), Vec::new());
        }
        let candidates = self.snapshot_dir_candidates();
        let found = candidates
            .iter()
            .find(|d| d.is_dir())
            .or_else(|| candidates.first())
            .cloned();
        (found, candidates)
    }
}

/// Drop empty and repeated paths, keeping first-seen order.
pub fn unique_paths(paths: impl IntoIterator<Item = PathBuf>) -> Vec<PathBuf> {
    let mut seen = HashSet::new();
    paths
        .into_iter()
        .filter(|p| !p.as_os_str().is_empty())
        .filter(|p| seen.insert(p.clone()))
        .collect()
}

pub fn is_config_filename(name: &str) -> bool {
    CONFIG_FILENAMES.contains(&name)
}
