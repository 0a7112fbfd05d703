//! Package metadata lookup against an npm-compatible registry.

use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;
use tracing::debug;

use crate::error::{PatchlineError, Result};

pub const DEFAULT_REGISTRY_URL: &str = "https://registry.npmjs.org";
pub const DEFAULT_TIMEOUT_SECS: u64 = 10;

/// Abbreviated metadata document ("corgi") is enough for version lookup.
const ACCEPT_ABBREVIATED: &str = "application/vnd.npm.install-v1+json";

/// What the registry knows about one package.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PackageInfo {
    pub name: String,
    /// The `latest` dist-tag, when published.
    pub latest: Option<String>,
    /// Every published version, in lexical order.
    pub versions: Vec<String>,
}

/// Anything that can answer "which versions of this package exist".
pub trait MetadataFetcher {
    fn fetch(&self, package: &str) -> Result<PackageInfo>;
}

#[derive(Debug, Deserialize)]
struct Packument {
    #[serde(rename = "dist-tags", default)]
    dist_tags: HashMap<String, String>,
    #[serde(default)]
    versions: serde_json::Map<String, serde_json::Value>,
}

/// Decode a registry metadata document.
pub fn parse_package_info(package: &str, body: &[u8]) -> Result<PackageInfo> {
    let doc: Packument = serde_json::from_slice(body).map_err(|e| PatchlineError::Registry {
        package: package.to_string(),
        message: format!("invalid metadata: {e}"),
    })?;

    let mut versions: Vec<String> = doc.versions.keys().cloned().collect();
    versions.sort();

    Ok(PackageInfo {
        name: package.to_string(),
        latest: doc.dist_tags.get("latest").filter(|v| !v.is_empty()).cloned(),
        versions,
    })
}

/// HTTP client for the public npm registry or a mirror.
pub struct NpmRegistry {
    base_url: String,
    client: reqwest::blocking::Client,
}

impl NpmRegistry {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .user_agent(format!("patchline/{}", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| PatchlineError::Registry {
                package: String::new(),
                message: e.to_string(),
            })?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Metadata URL for a package. Scoped names keep their `@` but escape `/`.
    pub fn package_url(&self, package: &str) -> String {
        let encoded = urlencoding::encode(package).replacen("%40", "@", 1);
        format!("{}/{}", self.base_url, encoded)
    }
}

impl MetadataFetcher for NpmRegistry {
    fn fetch(&self, package: &str) -> Result<PackageInfo> {
        if package.is_empty() {
            return Err(PatchlineError::invalid("package name is required"));
        }
        let url = self.package_url(package);
        debug!(%url, "fetching package metadata");

        let registry_err = |message: String| PatchlineError::Registry {
            package: package.to_string(),
            message,
        };

        let response = self
            .client
            .get(&url)
            .header(reqwest::header::ACCEPT, ACCEPT_ABBREVIATED)
            .send()
            .map_err(|e| registry_err(e.to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(PatchlineError::PackageNotFound {
                package: package.to_string(),
            });
        }
        if !status.is_success() {
            return Err(registry_err(format!("HTTP {status}")));
        }

        let body = response.bytes().map_err(|e| registry_err(e.to_string()))?;
        parse_package_info(package, &body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_package_info() {
        let body = br#"{
            "name": "alpha",
            "dist-tags": {"latest": "1.3.0", "next": "2.0.0-rc.1"},
            "versions": {"1.3.0": {}, "1.10.0": {}, "1.2.0": {}, "2.0.0-rc.1": {}}
        }"#;
        let info = parse_package_info("alpha", body).unwrap();
        assert_eq!(info.name, "alpha");
        assert_eq!(info.latest.as_deref(), Some("1.3.0"));
        assert_eq!(info.versions, vec!["1.10.0", "1.2.0", "1.3.0", "2.0.0-rc.1"]);
    }

    #[test]
    fn test_parse_without_tags_or_versions() {
        let info = parse_package_info("alpha", b"{}").unwrap();
        assert_eq!(info.latest, None);
        assert!(info.versions.is_empty());
    }

    #[test]
    fn test_parse_rejects_garbage() {
        let err = parse_package_info("alpha", b"<html>").unwrap_err();
        assert!(matches!(err, PatchlineError::Registry { .. }));
    }

    #[test]
    fn test_package_url_escapes_scope() {
        let registry = NpmRegistry::new("https://registry.example.com/", Duration::from_secs(1)).unwrap();
        assert_eq!(registry.base_url(), "https://registry.example.com");
        assert_eq!(
            registry.package_url("@scope/pkg"),
            "https://registry.example.com/@scope%2Fpkg"
        );
        assert_eq!(
            registry.package_url("plain"),
            "https://registry.example.com/plain"
        );
    }
}
