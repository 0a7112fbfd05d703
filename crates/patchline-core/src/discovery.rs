//! Locating and merging plugin declarations.
//!
//! Sources are read in a fixed order (global, project, custom dir, custom
//! file, local) and appended without deduplication. Callers that need one
//! authoritative spec per name apply [`Source::UPGRADE_PRECEDENCE`] themselves.

use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;
use walkdir::WalkDir;

use crate::declaration::{parse_declarations, split_spec};
use crate::error::{PatchlineError, Result};
use crate::paths::{
    is_config_filename, unique_paths, PathEnv, CONFIG_FILENAMES, CUSTOM_CONFIG_DIR_ENV,
    CUSTOM_CONFIG_ENV,
};

/// File extensions picked up as filesystem plugins.
pub const LOCAL_PLUGIN_EXTENSIONS: &[&str] = &["js", "cjs", "mjs", "ts"];

/// Where a plugin declaration came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Source {
    Project,
    Global,
    CustomFile,
    CustomDir,
    Local,
}

impl Source {
    /// Which declaration an upgrade rewrites when a name appears in several.
    pub const UPGRADE_PRECEDENCE: [Source; 4] = [
        Source::CustomFile,
        Source::CustomDir,
        Source::Project,
        Source::Global,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Project => "project",
            Self::Global => "global",
            Self::CustomFile => "custom-file",
            Self::CustomDir => "custom-dir",
            Self::Local => "local",
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One declared reference to a plugin.
///
/// `Local` specs always carry a `local_path` and never a pinned version; all
/// other sources always carry a `config_path`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginSpec {
    pub name: String,
    pub declared_spec: String,
    pub pinned_version: String,
    pub source: Source,
    pub config_path: Option<PathBuf>,
    pub local_path: Option<PathBuf>,
}

impl PluginSpec {
    /// Build a spec read from a declaration file. `None` for blank entries.
    pub fn declared(raw: &str, source: Source, config_path: &Path) -> Option<Self> {
        let spec = raw.trim();
        if spec.is_empty() {
            return None;
        }
        let (name, pinned) = split_spec(spec);
        Some(Self {
            name: name.to_string(),
            declared_spec: spec.to_string(),
            pinned_version: pinned.to_string(),
            source,
            config_path: Some(config_path.to_path_buf()),
            local_path: None,
        })
    }

    /// Build a spec for a plugin file found on disk.
    pub fn local(name: &str, path: &Path) -> Self {
        Self {
            name: name.to_string(),
            declared_spec: path.display().to_string(),
            pinned_version: String::new(),
            source: Source::Local,
            config_path: None,
            local_path: Some(path.to_path_buf()),
        }
    }

    pub fn is_local(&self) -> bool {
        self.source == Source::Local
    }

    pub fn is_pinned(&self) -> bool {
        !self.pinned_version.is_empty()
    }
}

/// Pre-resolved inputs for [`discover`].
#[derive(Debug, Clone, Default)]
pub struct DiscoveryOptions {
    /// Start of the upward project config search; current dir when `None`.
    pub project_root: Option<PathBuf>,
    /// Explicit global config file; must exist when set.
    pub global_config: Option<PathBuf>,
    /// Custom config file (`OPENCODE_CONFIG`); must exist when set.
    pub custom_config: Option<PathBuf>,
    /// Custom config directory (`OPENCODE_CONFIG_DIR`); must exist when set.
    pub custom_config_dir: Option<PathBuf>,
    /// Extra directories scanned for filesystem plugins.
    pub local_dirs: Vec<PathBuf>,
}

impl DiscoveryOptions {
    /// Fill the custom config locations from `env` unless already set.
    pub fn with_env_overrides(mut self, env: &PathEnv) -> Self {
        if self.custom_config.is_none() {
            self.custom_config = env.custom_config.clone();
        }
        if self.custom_config_dir.is_none() {
            self.custom_config_dir = env.custom_config_dir.clone();
        }
        self
    }
}

/// Find every plugin declaration visible from the given options.
pub fn discover(opts: &DiscoveryOptions, env: &PathEnv) -> Result<Vec<PluginSpec>> {
    let mut plugins = Vec::new();

    let global = resolve_global_config(opts.global_config.as_deref(), env)?;
    if let Some(path) = &global {
        plugins.extend(load_plugin_specs(path, Source::Global)?);
    }

    let start_dir = project_start_dir(opts.project_root.as_deref())?;
    if let Some(path) = find_project_config(&start_dir)? {
        plugins.extend(load_plugin_specs(&path, Source::Project)?);
    }

    let custom_dir = match &opts.custom_config_dir {
        Some(dir) if !dir.is_dir() => {
            return Err(PatchlineError::invalid(format!(
                "{CUSTOM_CONFIG_DIR_ENV} is not a directory: {}",
                dir.display()
            )));
        }
        other => other.as_deref(),
    };
    if let Some(path) = custom_dir.and_then(config_in_dir) {
        plugins.extend(load_plugin_specs(&path, Source::CustomDir)?);
    }

    if let Some(path) = &opts.custom_config {
        if !path.is_file() {
            return Err(PatchlineError::invalid(format!(
                "{CUSTOM_CONFIG_ENV} is not a file: {}",
                path.display()
            )));
        }
        plugins.extend(load_plugin_specs(path, Source::CustomFile)?);
    }

    let project_dir = if start_dir.is_file() {
        start_dir.parent().map(Path::to_path_buf)
    } else {
        Some(start_dir.clone())
    };
    let mut local_dirs =
        env.default_local_plugin_dirs(project_dir.as_deref(), global.as_deref(), custom_dir);
    local_dirs.extend(opts.local_dirs.iter().cloned());
    plugins.extend(discover_local_plugins(&local_dirs));

    debug!(count = plugins.len(), "discovered plugin declarations");
    Ok(plugins)
}

/// Read one declaration file into specs tagged with `source`.
pub fn load_plugin_specs(path: &Path, source: Source) -> Result<Vec<PluginSpec>> {
    let bytes = fs::read(path).map_err(|e| PatchlineError::io_at(path, e))?;
    let specs: Vec<PluginSpec> = parse_declarations(&bytes, path)?
        .iter()
        .filter_map(|raw| PluginSpec::declared(raw, source, path))
        .collect();
    debug!(path = %path.display(), %source, count = specs.len(), "loaded declarations");
    Ok(specs)
}

/// Resolve the global config file. `Ok(None)` when none is present.
pub fn resolve_global_config(override_path: Option<&Path>, env: &PathEnv) -> Result<Option<PathBuf>> {
    if let Some(path) = override_path {
        if path.is_file() {
            return Ok(Some(path.to_path_buf()));
        }
        return Err(PatchlineError::ConfigNotFound {
            path: path.to_path_buf(),
        });
    }
    Ok(env
        .global_config_candidates()
        .into_iter()
        .find(|candidate| candidate.is_file()))
}

fn project_start_dir(project_root: Option<&Path>) -> Result<PathBuf> {
    let cwd = || env::current_dir().map_err(PatchlineError::Io);
    match project_root {
        Some(root) if root.is_absolute() => Ok(root.to_path_buf()),
        Some(root) => Ok(cwd()?.join(root)),
        None => cwd(),
    }
}

/// Walk upward from `start` until a config file is found.
///
/// When `start` names a file it must itself be a recognized config filename.
pub fn find_project_config(start: &Path) -> Result<Option<PathBuf>> {
    if start.is_file() {
        let matches = start
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(is_config_filename);
        if matches {
            return Ok(Some(start.to_path_buf()));
        }
        return Err(PatchlineError::invalid(format!(
            "project path is not a directory or config file: {}",
            start.display()
        )));
    }

    Ok(start.ancestors().find_map(config_in_dir))
}

fn config_in_dir(dir: &Path) -> Option<PathBuf> {
    CONFIG_FILENAMES
        .iter()
        .map(|name| dir.join(name))
        .find(|candidate| candidate.is_file())
}

/// Scan `dirs` (non-recursively) for plugin files.
pub fn discover_local_plugins(dirs: &[PathBuf]) -> Vec<PluginSpec> {
    let mut plugins = Vec::new();
    for dir in unique_paths(dirs.iter().cloned()) {
        if !dir.is_dir() {
            continue;
        }

        for entry in WalkDir::new(&dir)
            .min_depth(1)
            .max_depth(1)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().is_file())
        {
            let path = entry.path();
            let recognized = path
                .extension()
                .and_then(|ext| ext.to_str())
                .map(|ext| ext.to_lowercase())
                .is_some_and(|ext| LOCAL_PLUGIN_EXTENSIONS.contains(&ext.as_str()));
            if !recognized {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            plugins.push(PluginSpec::local(stem, path));
        }
    }
    plugins
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paths::OsFamily;
    use tempfile::TempDir;

    fn isolated_env(home: &Path) -> PathEnv {
        PathEnv {
            home: Some(home.to_path_buf()),
            os: OsFamily::Other,
            ..PathEnv::default()
        }
    }

    fn write(path: &Path, content: &str) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    #[test]
    fn test_declared_spec_fields() {
        let spec =
            PluginSpec::declared(" @scope/pkg@1.2.3 ", Source::Project, Path::new("/p/opencode.json"))
                .unwrap();
        assert_eq!(spec.name, "@scope/pkg");
        assert_eq!(spec.declared_spec, "@scope/pkg@1.2.3");
        assert_eq!(spec.pinned_version, "1.2.3");
        assert!(spec.is_pinned());
        assert!(PluginSpec::declared("   ", Source::Project, Path::new("/p")).is_none());
    }

    #[test]
    fn test_project_walk_prefers_plain_filename() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("repo");
        write(&root.join(".opencode.json"), r#"{"plugin": ["dot"]}"#);
        write(&root.join("opencode.json"), r#"{"plugin": ["plain"]}"#);
        let nested = root.join("a").join("b");
        fs::create_dir_all(&nested).unwrap();

        let found = find_project_config(&nested).unwrap();
        assert_eq!(found, Some(root.join("opencode.json")));
    }

    #[test]
    fn test_project_file_must_be_config_name() {
        let temp = TempDir::new().unwrap();
        let other = temp.path().join("notes.json");
        write(&other, "{}");
        assert!(find_project_config(&other).is_err());

        let config = temp.path().join(".opencode.json");
        write(&config, "{}");
        assert_eq!(find_project_config(&config).unwrap(), Some(config));
    }

    #[test]
    fn test_global_override_must_exist() {
        let temp = TempDir::new().unwrap();
        let env = isolated_env(temp.path());
        let missing = temp.path().join("nope.json");
        let err = resolve_global_config(Some(&missing), &env).unwrap_err();
        assert!(matches!(err, PatchlineError::ConfigNotFound { .. }));
        assert_eq!(resolve_global_config(None, &env).unwrap(), None);
    }

    #[test]
    fn test_discover_merges_sources_in_order() {
        let temp = TempDir::new().unwrap();
        let home = temp.path().join("home");
        let project = temp.path().join("project");
        let custom_dir = temp.path().join("custom-dir");
        let custom_file = temp.path().join("custom.json");

        write(
            &home.join(".config/opencode/opencode.json"),
            r#"{"plugin": ["g@1.0.0"]}"#,
        );
        write(
            &project.join("opencode.json"),
            "{ // project\n \"plugin\": [\"p\",], \"plugins\": [\"p2@2.0.0\"] }",
        );
        write(&custom_dir.join("opencode.json"), r#"{"plugin": ["cd"]}"#);
        write(&custom_file, r#"{"plugin": ["cf@0.1.0"]}"#);
        write(&project.join(".opencode/plugins/tool.JS"), "export {}");
        write(&project.join(".opencode/plugins/readme.md"), "#");

        let opts = DiscoveryOptions {
            project_root: Some(project.clone()),
            custom_config: Some(custom_file.clone()),
            custom_config_dir: Some(custom_dir.clone()),
            ..DiscoveryOptions::default()
        };
        let specs = discover(&opts, &isolated_env(&home)).unwrap();

        let summary: Vec<_> = specs
            .iter()
            .map(|s| (s.name.as_str(), s.source))
            .collect();
        assert_eq!(
            summary,
            vec![
                ("g", Source::Global),
                ("p", Source::Project),
                ("p2", Source::Project),
                ("cd", Source::CustomDir),
                ("cf", Source::CustomFile),
                ("tool", Source::Local),
            ]
        );

        let local = specs.last().unwrap();
        assert!(local.pinned_version.is_empty());
        assert!(local.config_path.is_none());
        assert!(local.local_path.is_some());
        assert!(specs[..5].iter().all(|s| s.config_path.is_some()));
    }

    #[test]
    fn test_discover_keeps_duplicates_across_sources() {
        let temp = TempDir::new().unwrap();
        let home = temp.path().join("home");
        let project = temp.path().join("project");
        write(
            &home.join(".opencode/opencode.json"),
            r#"{"plugin": ["alpha@1.0.0"]}"#,
        );
        write(&project.join("opencode.json"), r#"{"plugin": ["alpha@1.1.0"]}"#);

        let opts = DiscoveryOptions {
            project_root: Some(project),
            ..DiscoveryOptions::default()
        };
        let specs = discover(&opts, &isolated_env(&home)).unwrap();
        assert_eq!(specs.len(), 2);
        assert!(specs.iter().all(|s| s.name == "alpha"));
    }

    #[test]
    fn test_unusable_custom_locations_are_errors() {
        let temp = TempDir::new().unwrap();
        let project = temp.path().join("project");
        fs::create_dir_all(&project).unwrap();
        let env = isolated_env(temp.path());

        let opts = DiscoveryOptions {
            project_root: Some(project.clone()),
            custom_config_dir: Some(temp.path().join("missing-dir")),
            ..DiscoveryOptions::default()
        };
        assert!(discover(&opts, &env).is_err());

        let opts = DiscoveryOptions {
            project_root: Some(project),
            custom_config: Some(temp.path().join("missing.json")),
            ..DiscoveryOptions::default()
        };
        assert!(discover(&opts, &env).is_err());
    }

    #[test]
    fn test_extra_local_dirs_are_deduplicated() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("plugins");
        write(&dir.join("a.mjs"), "");
        write(&dir.join("b.cjs"), "");
        fs::create_dir_all(dir.join("nested.js")).unwrap();

        let specs = discover_local_plugins(&[dir.clone(), dir.clone()]);
        let names: Vec<_> = specs.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn test_malformed_config_fails_discovery() {
        let temp = TempDir::new().unwrap();
        let project = temp.path().join("project");
        write(&project.join("opencode.json"), "{ \"plugin\": [ }");

        let opts = DiscoveryOptions {
            project_root: Some(project),
            ..DiscoveryOptions::default()
        };
        let err = discover(&opts, &isolated_env(temp.path())).unwrap_err();
        assert!(matches!(err, PatchlineError::ConfigParse { .. }));
    }
}
