//! Semantic version parsing, comparison and upgrade target selection.
//!
//! Only `major.minor.patch` takes part in ordering. Prerelease and build
//! suffixes are stripped before parsing, so `1.2.3-rc.1` equals `1.2.3`.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{PatchlineError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Semver {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
}

impl Semver {
    pub fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }
}

impl fmt::Display for Semver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Parse a version, returning `None` when it cannot be compared.
///
/// A leading `v` and any `+build` / `-prerelease` suffix are ignored; missing
/// minor and patch segments default to zero.
pub fn parse_version(version: &str) -> Option<Semver> {
    let clean = version.trim();
    let clean = clean.strip_prefix('v').unwrap_or(clean);
    let clean = clean.split('+').next().unwrap_or_default();
    let clean = clean.split('-').next().unwrap_or_default();
    if clean.is_empty() {
        return None;
    }

    let mut parts = clean.split('.');
    let major = parse_part(parts.next())?;
    let minor = parse_part(parts.next())?;
    let patch = parse_part(parts.next())?;

    Some(Semver::new(major, minor, patch))
}

fn parse_part(part: Option<&str>) -> Option<u64> {
    match part {
        None => Some(0),
        Some(value) => value.trim().parse().ok(),
    }
}

/// Compare two version strings. `None` if either side does not parse.
pub fn compare(a: &str, b: &str) -> Option<Ordering> {
    Some(parse_version(a)?.cmp(&parse_version(b)?))
}

/// Policy for choosing an upgrade target from registry metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpgradeMode {
    /// The registry's `latest` dist-tag, verbatim.
    #[default]
    Latest,
    /// Highest version overall.
    Major,
    /// Highest version within the base major.
    Minor,
    /// Highest version within the base major.minor.
    Patch,
}

impl UpgradeMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Latest => "latest",
            Self::Major => "major",
            Self::Minor => "minor",
            Self::Patch => "patch",
        }
    }
}

impl fmt::Display for UpgradeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for UpgradeMode {
    type Err = PatchlineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "" | "latest" => Ok(Self::Latest),
            "major" => Ok(Self::Major),
            "minor" => Ok(Self::Minor),
            "patch" => Ok(Self::Patch),
            other => Err(PatchlineError::invalid(format!(
                "unknown upgrade mode: {other}"
            ))),
        }
    }
}

/// Choose the version to upgrade to.
///
/// `base` is only consulted by [`UpgradeMode::Minor`] and [`UpgradeMode::Patch`],
/// which fail if it does not parse. Unparseable candidates are skipped.
pub fn select_target(
    latest: Option<&str>,
    versions: &[String],
    base: &str,
    mode: UpgradeMode,
) -> Result<String> {
    match mode {
        UpgradeMode::Latest => match latest {
            Some(tag) if !tag.is_empty() => Ok(tag.to_string()),
            _ => Err(PatchlineError::invalid("latest version is unavailable")),
        },
        UpgradeMode::Major => select_highest(versions, |_| true),
        UpgradeMode::Minor => {
            let base = parse_base(base)?;
            select_highest(versions, |c| c.major == base.major)
        }
        UpgradeMode::Patch => {
            let base = parse_base(base)?;
            select_highest(versions, |c| c.major == base.major && c.minor == base.minor)
        }
    }
}

fn parse_base(base: &str) -> Result<Semver> {
    parse_version(base).ok_or_else(|| PatchlineError::InvalidVersion {
        version: base.to_string(),
        message: "base version is not semver".to_string(),
    })
}

fn select_highest(versions: &[String], accept: impl Fn(&Semver) -> bool) -> Result<String> {
    let mut best: Option<(Semver, &String)> = None;
    for version in versions {
        let Some(parsed) = parse_version(version) else {
            continue;
        };
        if !accept(&parsed) {
            continue;
        }
        if best.map_or(true, |(current, _)| parsed > current) {
            best = Some((parsed, version));
        }
    }

    best.map(|(_, v)| v.clone())
        .ok_or_else(|| PatchlineError::invalid("no matching versions found"))
}
