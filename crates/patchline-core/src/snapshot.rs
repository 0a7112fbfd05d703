//! Per-plugin history of prior declared and installed states.
//!
//! Each plugin gets one JSON array file in a flat directory, named by the
//! percent-escaped plugin name. Every save rewrites the whole file through a
//! temp file and rename, sorted ascending by timestamp.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration, Local, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::atomic::write_atomic;
use crate::discovery::Source;
use crate::error::{PatchlineError, Result};

const SNAPSHOT_EXTENSION: &str = "json";

/// Source of "now" for timestamping entries.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Deterministic clock: each call returns `start + n * step`.
///
/// Saturates at `DateTime::<Utc>::MAX_UTC` once the tick count no longer
/// fits in an `i32` or the offset overflows the representable range.
#[derive(Debug)]
pub struct SteppingClock {
    start: DateTime<Utc>,
    step: Duration,
    ticks: AtomicI64,
}

impl SteppingClock {
    pub fn new(start: DateTime<Utc>, step: Duration) -> Self {
        Self {
            start,
            step,
            ticks: AtomicI64::new(0),
        }
    }
}

impl Clock for SteppingClock {
    fn now(&self) -> DateTime<Utc> {
        let n = self.ticks.fetch_add(1, Ordering::SeqCst);
        i32::try_from(n)
            .ok()
            .and_then(|n| self.step.checked_mul(n))
            .and_then(|offset| self.start.checked_add_signed(offset))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

/// Why a snapshot entry was written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotReason {
    /// Explicit capture of current state.
    Snapshot,
    /// Written before an upgrade rewrote the declaration.
    Upgrade,
    /// Written before a rollback rewrote the declaration.
    Rollback,
}

impl SnapshotReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Snapshot => "snapshot",
            Self::Upgrade => "upgrade",
            Self::Rollback => "rollback",
        }
    }
}

impl fmt::Display for SnapshotReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotEntry {
    /// Assigned from the store's clock on save when unset.
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    pub plugin_name: String,
    pub previous_spec: String,
    /// Installed version at capture time, or `missing`.
    pub previous_installed: String,
    pub source: Source,
    pub reason: SnapshotReason,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_path: Option<PathBuf>,
}

impl SnapshotEntry {
    pub fn display_time(&self) -> String {
        self.timestamp
            .map(|t| {
                t.with_timezone(&Local)
                    .format("%Y-%m-%d %H:%M:%S")
                    .to_string()
            })
            .unwrap_or_else(|| "-".to_string())
    }
}

/// Reversible filename encoding for plugin names (`@scope/pkg` -> `%40scope%2Fpkg`).
pub fn escape_plugin_name(name: &str) -> String {
    urlencoding::encode(name).into_owned()
}

pub fn unescape_plugin_name(escaped: &str) -> Option<String> {
    urlencoding::decode(escaped).ok().map(|s| s.into_owned())
}

pub struct SnapshotStore {
    dir: PathBuf,
    clock: Arc<dyn Clock>,
}

impl SnapshotStore {
    pub fn new(dir: PathBuf) -> Self {
        Self::with_clock(dir, Arc::new(SystemClock))
    }

    pub fn with_clock(dir: PathBuf, clock: Arc<dyn Clock>) -> Self {
        Self { dir, clock }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// History file for a plugin.
    pub fn path_for(&self, plugin_name: &str) -> PathBuf {
        self.dir.join(format!(
            "{}.{}",
            escape_plugin_name(plugin_name),
            SNAPSHOT_EXTENSION
        ))
    }

    fn load(&self, plugin_name: &str) -> Result<Vec<SnapshotEntry>> {
        let path = self.path_for(plugin_name);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let content = fs::read(&path).map_err(|e| PatchlineError::io_at(&path, e))?;
        serde_json::from_slice(&content).map_err(|e| PatchlineError::ConfigParse {
            path,
            message: e.to_string(),
        })
    }

    /// Append `entry` to its plugin's history and return it as stored.
    pub fn save(&self, mut entry: SnapshotEntry) -> Result<SnapshotEntry> {
        if entry.plugin_name.is_empty() {
            return Err(PatchlineError::invalid("plugin name is required"));
        }
        if entry.timestamp.is_none() {
            entry.timestamp = Some(self.clock.now());
        }

        let mut history = self.load(&entry.plugin_name)?;
        history.push(entry.clone());
        history.sort_by_key(|e| e.timestamp);

        let path = self.path_for(&entry.plugin_name);
        write_atomic(&path, &serde_json::to_vec_pretty(&history)?)?;

        info!(
            plugin = %entry.plugin_name,
            reason = %entry.reason,
            spec = %entry.previous_spec,
            "snapshot saved"
        );
        Ok(entry)
    }

    /// Full history for a plugin, ascending. Empty when none exists.
    pub fn list(&self, plugin_name: &str) -> Result<Vec<SnapshotEntry>> {
        let mut history = self.load(plugin_name)?;
        history.sort_by_key(|e| e.timestamp);
        Ok(history)
    }

    /// Entry with the greatest timestamp.
    pub fn latest(&self, plugin_name: &str) -> Result<SnapshotEntry> {
        self.latest_matching(plugin_name, |_| true)
    }

    /// Latest entry that is a restore point, ignoring rollback records.
    pub fn latest_restorable(&self, plugin_name: &str) -> Result<SnapshotEntry> {
        self.latest_matching(plugin_name, |e| e.reason != SnapshotReason::Rollback)
    }

    fn latest_matching(
        &self,
        plugin_name: &str,
        accept: impl Fn(&SnapshotEntry) -> bool,
    ) -> Result<SnapshotEntry> {
        let mut best: Option<SnapshotEntry> = None;
        for entry in self.load(plugin_name)? {
            if !accept(&entry) {
                continue;
            }
            if best.as_ref().map_or(true, |b| entry.timestamp >= b.timestamp) {
                best = Some(entry);
            }
        }
        best.ok_or_else(|| PatchlineError::SnapshotNotFound {
            plugin: plugin_name.to_string(),
        })
    }

    /// Names of every plugin with a history file, sorted.
    pub fn plugins(&self) -> Result<Vec<String>> {
        if !self.dir.is_dir() {
            return Ok(Vec::new());
        }
        let read = fs::read_dir(&self.dir).map_err(|e| PatchlineError::io_at(&self.dir, e))?;

        let mut names: Vec<String> = read
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_file())
            .filter(|p| p.extension().and_then(|e| e.to_str()) == Some(SNAPSHOT_EXTENSION))
            .filter_map(|p| {
                p.file_stem()
                    .and_then(|s| s.to_str())
                    .and_then(unescape_plugin_name)
            })
            .collect();
        names.sort();
        Ok(names)
    }
}
