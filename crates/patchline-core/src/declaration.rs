//! Plugin declaration files (`opencode.json`).
//!
//! Two views of the same file:
//! - [`parse_declarations`] reads only the plugin lists, for discovery.
//! - [`ConfigDocument`] keeps every top-level key in order, so a plugin entry
//!   can be rewritten without dropping or reordering unrelated settings.

use std::fs;
use std::path::Path;

use indexmap::IndexMap;
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::info;

use crate::atomic::write_atomic;
use crate::error::{PatchlineError, Result};
use crate::jsonc;

/// Keys that hold plugin lists. Both are honored and merged in this order.
pub const PLUGIN_LIST_KEYS: &[&str] = &["plugin", "plugins"];

#[derive(Debug, Default, Deserialize)]
struct Declaration {
    #[serde(default)]
    plugin: Option<Vec<String>>,
    #[serde(default)]
    plugins: Option<Vec<String>>,
}

/// Parse a declaration file and return every declared spec string in order.
///
/// `plugin` entries come first, then `plugins`. Duplicates are kept.
pub fn parse_declarations(bytes: &[u8], path: &Path) -> Result<Vec<String>> {
    let cleaned = jsonc::sanitize(bytes);
    let decl: Declaration =
        serde_json::from_slice(&cleaned).map_err(|e| PatchlineError::ConfigParse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;

    Ok(decl
        .plugin
        .into_iter()
        .flatten()
        .chain(decl.plugins.into_iter().flatten())
        .collect())
}

/// Split a spec string into `(name, version)` on its last `@`.
///
/// A leading `@` only marks a scope, so `@scope/pkg` has no version, while
/// `@scope/pkg@1.2.3` splits into `("@scope/pkg", "1.2.3")`.
pub fn split_spec(spec: &str) -> (&str, &str) {
    match spec.rfind('@') {
        Some(at) if at > 0 && at + 1 < spec.len() => (&spec[..at], &spec[at + 1..]),
        _ => (spec, ""),
    }
}

/// A top-level value in a declaration file.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigValue {
    Text(String),
    List(Vec<String>),
    /// Anything else, passed through untouched.
    Opaque(Value),
}

impl ConfigValue {
    fn from_json(value: Value) -> Self {
        match value {
            Value::String(s) => Self::Text(s),
            Value::Array(items) if items.iter().all(Value::is_string) => Self::List(
                items
                    .into_iter()
                    .filter_map(|v| match v {
                        Value::String(s) => Some(s),
                        _ => None,
                    })
                    .collect(),
            ),
            other => Self::Opaque(other),
        }
    }

    fn to_json(&self) -> Value {
        match self {
            Self::Text(s) => Value::String(s.clone()),
            Self::List(items) => Value::Array(items.iter().cloned().map(Value::String).collect()),
            Self::Opaque(v) => v.clone(),
        }
    }
}

/// Ordered, lossless-for-values view of a declaration file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigDocument {
    entries: IndexMap<String, ConfigValue>,
}

impl ConfigDocument {
    pub fn parse(bytes: &[u8], path: &Path) -> Result<Self> {
        let cleaned = jsonc::sanitize(bytes);
        let raw: IndexMap<String, Value> =
            serde_json::from_slice(&cleaned).map_err(|e| PatchlineError::ConfigParse {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?;

        Ok(Self {
            entries: raw
                .into_iter()
                .map(|(k, v)| (k, ConfigValue::from_json(v)))
                .collect(),
        })
    }

    pub fn get(&self, key: &str) -> Option<&ConfigValue> {
        self.entries.get(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Replace every entry naming `plugin_name` in either plugin list.
    ///
    /// Returns whether anything was replaced.
    pub fn replace_spec(&mut self, plugin_name: &str, new_spec: &str, path: &Path) -> Result<bool> {
        let mut updated = false;

        for key in PLUGIN_LIST_KEYS {
            let Some(value) = self.entries.get_mut(*key) else {
                continue;
            };

            let list = match value {
                ConfigValue::List(list) => list,
                ConfigValue::Opaque(Value::Array(_)) => {
                    return Err(PatchlineError::UnsupportedList {
                        key: key.to_string(),
                        path: path.to_path_buf(),
                        message: "non-string value".to_string(),
                    });
                }
                _ => {
                    return Err(PatchlineError::UnsupportedList {
                        key: key.to_string(),
                        path: path.to_path_buf(),
                        message: "unsupported list type".to_string(),
                    });
                }
            };

            for spec in list.iter_mut() {
                if split_spec(spec.trim()).0 == plugin_name {
                    *spec = new_spec.to_string();
                    updated = true;
                }
            }
        }

        Ok(updated)
    }

    /// Strict JSON with two-space indentation and a trailing newline.
    pub fn to_json_string(&self) -> Result<String> {
        let map: Map<String, Value> = self
            .entries
            .iter()
            .map(|(k, v)| (k.clone(), v.to_json()))
            .collect();
        let mut out = serde_json::to_string_pretty(&Value::Object(map))?;
        out.push('\n');
        Ok(out)
    }
}

/// Rewrite the declared spec of `plugin_name` in the file at `path`.
///
/// The file is only replaced once the whole document has been re-serialized.
pub fn update_declared_spec(path: &Path, plugin_name: &str, new_spec: &str) -> Result<()> {
    if path.as_os_str().is_empty() {
        return Err(PatchlineError::invalid("config path is required"));
    }
    if plugin_name.is_empty() {
        return Err(PatchlineError::invalid("plugin name is required"));
    }
    if new_spec.is_empty() {
        return Err(PatchlineError::invalid("new spec is required"));
    }

    let bytes = fs::read(path).map_err(|e| PatchlineError::io_at(path, e))?;
    let mut doc = ConfigDocument::parse(&bytes, path)?;

    if !doc.replace_spec(plugin_name, new_spec, path)? {
        return Err(PatchlineError::PluginNotInConfig {
            plugin: plugin_name.to_string(),
            path: path.to_path_buf(),
        });
    }

    write_atomic(path, doc.to_json_string()?.as_bytes())?;
    info!(path = %path.display(), plugin = plugin_name, spec = new_spec, "declaration updated");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_split_spec() {
        assert_eq!(split_spec("@scope/pkg@1.2.3"), ("@scope/pkg", "1.2.3"));
        assert_eq!(split_spec("name"), ("name", ""));
        assert_eq!(split_spec("@scope/pkg"), ("@scope/pkg", ""));
        assert_eq!(split_spec("name@2.0.0"), ("name", "2.0.0"));
        assert_eq!(split_spec("name@"), ("name@", ""));
        assert_eq!(split_spec("@"), ("@", ""));
    }

    #[test]
    fn test_parse_merges_both_keys_in_order() {
        let input = br#"{
            // both list keys are honored
            "plugins": ["c"],
            "plugin": ["a@1.0.0", "b", "a@1.0.0",],
        }"#;
        let specs = parse_declarations(input, Path::new("opencode.json")).unwrap();
        assert_eq!(specs, vec!["a@1.0.0", "b", "a@1.0.0", "c"]);
    }

    #[test]
    fn test_parse_without_plugins() {
        let specs = parse_declarations(br#"{"theme": "dark"}"#, Path::new("x.json")).unwrap();
        assert!(specs.is_empty());
    }

    #[test]
    fn test_parse_error_names_path() {
        let err = parse_declarations(b"{ not json", Path::new("/tmp/bad.json")).unwrap_err();
        match err {
            PatchlineError::ConfigParse { path, .. } => {
                assert_eq!(path, Path::new("/tmp/bad.json"))
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_document_keeps_key_order_and_unknown_fields() {
        let input = br#"{"theme": "dark", "plugin": ["a@1.0.0"], "mcp": {"x": {"on": true}}, "n": 3}"#;
        let mut doc = ConfigDocument::parse(input, Path::new("c.json")).unwrap();
        assert!(doc.replace_spec("a", "a@2.0.0", Path::new("c.json")).unwrap());

        let keys: Vec<_> = doc.keys().collect();
        assert_eq!(keys, vec!["theme", "plugin", "mcp", "n"]);

        let out: Value = serde_json::from_str(&doc.to_json_string().unwrap()).unwrap();
        assert_eq!(out["plugin"], serde_json::json!(["a@2.0.0"]));
        assert_eq!(out["mcp"]["x"]["on"], true);
        assert_eq!(out["n"], 3);
    }

    #[test]
    fn test_replace_rejects_non_string_list() {
        let mut doc =
            ConfigDocument::parse(br#"{"plugin": ["a", 1]}"#, Path::new("c.json")).unwrap();
        let err = doc.replace_spec("a", "a@1.0.0", Path::new("c.json")).unwrap_err();
        assert!(matches!(err, PatchlineError::UnsupportedList { .. }));

        let mut doc = ConfigDocument::parse(br#"{"plugin": "a"}"#, Path::new("c.json")).unwrap();
        let err = doc.replace_spec("a", "a@1.0.0", Path::new("c.json")).unwrap_err();
        assert!(matches!(err, PatchlineError::UnsupportedList { .. }));
    }

    #[test]
    fn test_update_declared_spec_rewrites_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("opencode.json");
        fs::write(
            &path,
            "{\n  // comment\n  \"plugin\": [\"@scope/pkg@1.0.0\", \"other\"],\n  \"plugins\": [\"@scope/pkg\"],\n}\n",
        )
        .unwrap();

        update_declared_spec(&path, "@scope/pkg", "@scope/pkg@1.1.0").unwrap();

        let content = fs::read_to_string(&path).unwrap();
        assert!(content.ends_with('\n'));
        let value: Value = serde_json::from_str(&content).unwrap();
        assert_eq!(
            value["plugin"],
            serde_json::json!(["@scope/pkg@1.1.0", "other"])
        );
        assert_eq!(value["plugins"], serde_json::json!(["@scope/pkg@1.1.0"]));
    }

    #[test]
    fn test_update_matches_padded_declarations() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("opencode.json");
        fs::write(&path, r#"{"plugin": [" alpha@1.0.0", "beta "]}"#).unwrap();

        update_declared_spec(&path, "alpha", "alpha@1.1.0").unwrap();
        update_declared_spec(&path, "beta", "beta@2.0.0").unwrap();

        let value: Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(value["plugin"], serde_json::json!(["alpha@1.1.0", "beta@2.0.0"]));
    }

    #[test]
    fn test_update_missing_plugin_leaves_file_untouched() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("opencode.json");
        let original = "{ \"plugin\": [\"a\"], }";
        fs::write(&path, original).unwrap();

        let err = update_declared_spec(&path, "b", "b@1.0.0").unwrap_err();
        assert!(matches!(err, PatchlineError::PluginNotInConfig { .. }));
        assert_eq!(fs::read_to_string(&path).unwrap(), original);
    }

    #[test]
    fn test_update_requires_arguments() {
        let err = update_declared_spec(Path::new("x.json"), "", "a@1").unwrap_err();
        assert!(matches!(err, PatchlineError::InvalidInput { .. }));
        let err = update_declared_spec(Path::new("x.json"), "a", "").unwrap_err();
        assert!(matches!(err, PatchlineError::InvalidInput { .. }));
    }
}
