//! Installed-artifact index over the OpenCode plugin cache.
//!
//! Every immediate subdirectory holding a `package.json` with a non-empty
//! `name` and `version` counts as one installed plugin.

use std::fs;
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{PatchlineError, Result};

/// Descriptor file read from each cache subdirectory.
pub const DESCRIPTOR_FILE: &str = "package.json";

/// One installed artifact. Recomputed on every scan, never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheEntry {
    pub name: String,
    pub version: String,
    pub path: PathBuf,
}

#[derive(Debug, Deserialize)]
struct Descriptor {
    #[serde(default)]
    name: String,
    #[serde(default)]
    version: String,
}

/// List installed plugins under `cache_dir`, ordered by directory name.
pub fn scan(cache_dir: &Path) -> Result<Vec<CacheEntry>> {
    let read = fs::read_dir(cache_dir).map_err(|e| PatchlineError::io_at(cache_dir, e))?;

    let mut dirs: Vec<PathBuf> = read
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_dir())
        .collect();
    dirs.sort();

    Ok(dirs.into_iter().filter_map(|dir| read_descriptor(&dir)).collect())
}

fn read_descriptor(dir: &Path) -> Option<CacheEntry> {
    let path = dir.join(DESCRIPTOR_FILE);
    let content = fs::read(&path).ok()?;
    let descriptor: Descriptor = match serde_json::from_slice(&content) {
        Ok(d) => d,
        Err(e) => {
            debug!(path = %path.display(), error = %e, "skipping malformed descriptor");
            return None;
        }
    };
    if descriptor.name.is_empty() || descriptor.version.is_empty() {
        debug!(path = %path.display(), "skipping descriptor without name or version");
        return None;
    }
    Some(CacheEntry {
        name: descriptor.name,
        version: descriptor.version,
        path: dir.to_path_buf(),
    })
}

/// Remove every cache entry whose descriptor name equals `plugin_name`.
///
/// Each match is checked with [`ensure_within`] before deletion. If a later
/// match fails after earlier ones were removed, the error is wrapped in
/// [`PatchlineError::PartialRemoval`] carrying the removed paths.
pub fn invalidate(cache_dir: &Path, plugin_name: &str) -> Result<Vec<PathBuf>> {
    if cache_dir.as_os_str().is_empty() {
        return Err(PatchlineError::InvalidCacheDir {
            path: cache_dir.to_path_buf(),
            message: "cache directory is empty".to_string(),
        });
    }
    let meta = fs::metadata(cache_dir).map_err(|e| PatchlineError::InvalidCacheDir {
        path: cache_dir.to_path_buf(),
        message: e.to_string(),
    })?;
    if !meta.is_dir() {
        return Err(PatchlineError::InvalidCacheDir {
            path: cache_dir.to_path_buf(),
            message: "not a directory".to_string(),
        });
    }
    if plugin_name.is_empty() {
        return Err(PatchlineError::invalid("plugin name is required"));
    }

    let entries = scan(cache_dir)?;
    let base = resolve(cache_dir)?;

    let mut removed = Vec::new();
    for entry in entries.into_iter().filter(|e| e.name == plugin_name) {
        let step = ensure_within(&base, &entry.path).and_then(|_| {
            fs::remove_dir_all(&entry.path).map_err(|e| PatchlineError::io_at(&entry.path, e))
        });
        if let Err(err) = step {
            if removed.is_empty() {
                return Err(err);
            }
            return Err(PatchlineError::PartialRemoval {
                removed,
                source: Box::new(err),
            });
        }
        info!(plugin = plugin_name, path = %entry.path.display(), "removed cache entry");
        removed.push(entry.path);
    }

    Ok(removed)
}

/// Require `target` to be strictly inside `base` once both are resolved.
///
/// Symlinks are followed where the paths exist, so an entry linking outside
/// the cache is rejected. `base` itself is not "within" `base`.
pub fn ensure_within(base: &Path, target: &Path) -> Result<()> {
    let base_abs = resolve(base)?;
    let target_abs = resolve(target)?;
    let unsafe_path = || PatchlineError::UnsafePath {
        base: base_abs.clone(),
        target: target_abs.clone(),
    };

    let rel = target_abs.strip_prefix(&base_abs).map_err(|_| unsafe_path())?;
    match rel.components().next() {
        None | Some(Component::ParentDir) | Some(Component::CurDir) => Err(unsafe_path()),
        Some(_) => Ok(()),
    }
}

/// Canonical form of `path`. For paths that do not exist yet, the deepest
/// existing ancestor is canonicalized and the remainder appended lexically.
fn resolve(path: &Path) -> Result<PathBuf> {
    if let Ok(canonical) = fs::canonicalize(path) {
        return Ok(canonical);
    }
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()?.join(path)
    };
    let normalized = normalize(&absolute);

    let mut existing = normalized.as_path();
    let mut rest = Vec::new();
    loop {
        if let Ok(mut canonical) = fs::canonicalize(existing) {
            canonical.extend(rest.iter().rev());
            return Ok(canonical);
        }
        match (existing.parent(), existing.file_name()) {
            (Some(parent), Some(name)) => {
                rest.push(name);
                existing = parent;
            }
            _ => return Ok(normalized),
        }
    }
}

fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn install(cache: &Path, dir: &str, name: &str, version: &str) -> PathBuf {
        let path = cache.join(dir);
        fs::create_dir_all(&path).unwrap();
        fs::write(
            path.join(DESCRIPTOR_FILE),
            format!(r#"{{"name": "{name}", "version": "{version}", "main": "index.js"}}"#),
        )
        .unwrap();
        path
    }

    #[test]
    fn test_scan_skips_invalid_entries() {
        let temp = TempDir::new().unwrap();
        let cache = temp.path();
        install(cache, "alpha", "alpha", "1.0.0");
        install(cache, "scoped", "@scope/beta", "2.1.0");
        install(cache, "noversion", "gamma", "");
        fs::create_dir_all(cache.join("empty")).unwrap();
        fs::create_dir_all(cache.join("broken")).unwrap();
        fs::write(cache.join("broken").join(DESCRIPTOR_FILE), "{oops").unwrap();
        fs::write(cache.join("stray-file"), "x").unwrap();

        let entries = scan(cache).unwrap();
        let found: Vec<_> = entries
            .iter()
            .map(|e| (e.name.as_str(), e.version.as_str()))
            .collect();
        assert_eq!(found, vec![("alpha", "1.0.0"), ("@scope/beta", "2.1.0")]);
        assert_eq!(entries[0].path, cache.join("alpha"));
    }

    #[test]
    fn test_scan_missing_dir_is_error() {
        let temp = TempDir::new().unwrap();
        assert!(scan(&temp.path().join("nope")).is_err());
    }

    #[test]
    fn test_invalidate_removes_all_matches() {
        let temp = TempDir::new().unwrap();
        let cache = temp.path();
        let a1 = install(cache, "alpha-1", "alpha", "1.0.0");
        let a2 = install(cache, "alpha-2", "alpha", "1.1.0");
        let beta = install(cache, "beta", "beta", "1.0.0");

        let removed = invalidate(cache, "alpha").unwrap();
        assert_eq!(removed, vec![a1.clone(), a2.clone()]);
        assert!(!a1.exists());
        assert!(!a2.exists());
        assert!(beta.exists());

        assert!(invalidate(cache, "alpha").unwrap().is_empty());
    }

    #[test]
    fn test_invalidate_preconditions() {
        let temp = TempDir::new().unwrap();
        let file = temp.path().join("file");
        fs::write(&file, "x").unwrap();

        assert!(matches!(
            invalidate(Path::new(""), "a").unwrap_err(),
            PatchlineError::InvalidCacheDir { .. }
        ));
        assert!(matches!(
            invalidate(&temp.path().join("missing"), "a").unwrap_err(),
            PatchlineError::InvalidCacheDir { .. }
        ));
        assert!(matches!(
            invalidate(&file, "a").unwrap_err(),
            PatchlineError::InvalidCacheDir { .. }
        ));
        assert!(matches!(
            invalidate(temp.path(), "").unwrap_err(),
            PatchlineError::InvalidInput { .. }
        ));
    }

    #[test]
    fn test_crafted_name_never_escapes() {
        let temp = TempDir::new().unwrap();
        let cache = temp.path().join("cache");
        fs::create_dir_all(&cache).unwrap();
        let outside = temp.path().join("etc");
        fs::create_dir_all(&outside).unwrap();
        install(&cache, "legit", "legit", "1.0.0");

        let removed = invalidate(&cache, "../../etc").unwrap();
        assert!(removed.is_empty());
        assert!(outside.exists());
        assert!(cache.join("legit").exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_symlinked_entry_outside_cache_is_rejected() {
        let temp = TempDir::new().unwrap();
        let cache = temp.path().join("cache");
        fs::create_dir_all(&cache).unwrap();
        let outside = install(temp.path(), "victim", "evil", "1.0.0");
        std::os::unix::fs::symlink(&outside, cache.join("evil")).unwrap();

        let err = invalidate(&cache, "evil").unwrap_err();
        assert!(matches!(err, PatchlineError::UnsafePath { .. }));
        assert!(outside.join(DESCRIPTOR_FILE).exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_invalidate_reports_partial_removal() {
        let temp = TempDir::new().unwrap();
        let cache = temp.path().join("cache");
        fs::create_dir_all(&cache).unwrap();
        let inside = install(&cache, "a-alpha", "alpha", "1.0.0");
        let outside = install(temp.path(), "outside", "alpha", "1.0.0");
        std::os::unix::fs::symlink(&outside, cache.join("b-alpha")).unwrap();

        match invalidate(&cache, "alpha").unwrap_err() {
            PatchlineError::PartialRemoval { removed, source } => {
                assert_eq!(removed, vec![inside.clone()]);
                assert!(matches!(*source, PatchlineError::UnsafePath { .. }));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(!inside.exists());
        assert!(outside.join(DESCRIPTOR_FILE).exists());
    }

    #[test]
    fn test_ensure_within() {
        let temp = TempDir::new().unwrap();
        let base = temp.path().join("cache");
        fs::create_dir_all(base.join("child")).unwrap();

        assert!(ensure_within(&base, &base.join("child")).is_ok());
        assert!(ensure_within(&base, &base.join("not-yet-created")).is_ok());
        assert!(ensure_within(&base, &base).is_err());
        assert!(ensure_within(&base, &base.join(".")).is_err());
        assert!(ensure_within(&base, &base.join("..")).is_err());
        assert!(ensure_within(&base, &base.join("child/../../x")).is_err());
        assert!(ensure_within(&base, temp.path()).is_err());
    }
}
