//! Reconciliation of declarations, installed artifacts and history.
//!
//! Read paths (`list`, `outdated`, `sync_plan`) report every declaration
//! as discovered, duplicates included. Write paths (`upgrade`, `rollback`)
//! pick exactly one declaration per file using [`Source::UPGRADE_PRECEDENCE`].
//!
//! Every mutating transition runs in the same order: snapshot, then
//! declaration rewrite, then cache invalidation.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::cache::{self, CacheEntry};
use crate::declaration::update_declared_spec;
use crate::discovery::{load_plugin_specs, PluginSpec, Source};
use crate::error::{PatchlineError, Result};
use crate::registry::{MetadataFetcher, PackageInfo};
use crate::snapshot::{SnapshotEntry, SnapshotReason, SnapshotStore};
use crate::version::{compare, parse_version, select_target, UpgradeMode};

/// Installed label for a declaration with no cache entry.
pub const MISSING_LABEL: &str = "missing";
/// Installed label for filesystem plugins.
pub const LOCAL_LABEL: &str = "local";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Ok,
    Missing,
    Mismatch,
    Unmanaged,
    Outdated,
    Unknown,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Missing => "missing",
            Self::Mismatch => "mismatch",
            Self::Unmanaged => "unmanaged",
            Self::Outdated => "outdated",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Status of one declaration against what is installed.
pub fn classify(spec: &PluginSpec, installed: Option<&CacheEntry>) -> Status {
    if spec.is_local() {
        return Status::Unmanaged;
    }
    match installed {
        None => Status::Missing,
        Some(entry) if spec.is_pinned() && entry.version != spec.pinned_version => {
            Status::Mismatch
        }
        Some(_) => Status::Ok,
    }
}

fn installed_label(entry: Option<&CacheEntry>) -> String {
    entry
        .map(|e| e.version.clone())
        .unwrap_or_else(|| MISSING_LABEL.to_string())
}

/// Cache entries by name. The first entry wins when a name repeats.
fn index_by_name(entries: &[CacheEntry]) -> HashMap<&str, &CacheEntry> {
    let mut index = HashMap::new();
    for entry in entries {
        index.entry(entry.name.as_str()).or_insert(entry);
    }
    index
}

fn sort_rows<T>(rows: &mut [T], key: impl Fn(&T) -> (&str, Source)) {
    rows.sort_by(|a, b| {
        let (name_a, source_a) = key(a);
        let (name_b, source_b) = key(b);
        name_a
            .cmp(name_b)
            .then_with(|| source_a.as_str().cmp(source_b.as_str()))
    });
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginReport {
    pub name: String,
    pub declared: String,
    /// Installed version, `missing` or `local`.
    pub installed: String,
    pub status: Status,
    pub source: Source,
    pub config_path: Option<PathBuf>,
    pub cache_path: Option<PathBuf>,
    pub local_path: Option<PathBuf>,
}

/// One report per declaration, sorted by name then source.
pub fn build_reports(specs: &[PluginSpec], entries: &[CacheEntry]) -> Vec<PluginReport> {
    let index = index_by_name(entries);
    let mut reports: Vec<PluginReport> = specs
        .iter()
        .map(|spec| {
            let entry = if spec.is_local() {
                None
            } else {
                index.get(spec.name.as_str()).copied()
            };
            PluginReport {
                name: spec.name.clone(),
                declared: spec.declared_spec.clone(),
                installed: if spec.is_local() {
                    LOCAL_LABEL.to_string()
                } else {
                    installed_label(entry)
                },
                status: classify(spec, entry),
                source: spec.source,
                config_path: spec.config_path.clone(),
                cache_path: entry.map(|e| e.path.clone()),
                local_path: spec.local_path.clone(),
            }
        })
        .collect();
    sort_rows(&mut reports, |r| (r.name.as_str(), r.source));
    reports
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutdatedRow {
    pub name: String,
    pub declared: String,
    pub installed: String,
    pub latest: Option<String>,
    pub status: Status,
    pub source: Source,
}

#[derive(Debug, Default)]
pub struct OutdatedReport {
    pub rows: Vec<OutdatedRow>,
    /// Local declarations left out of the check.
    pub local_count: usize,
    /// Registry lookups that failed, by package name.
    pub failures: Vec<(String, PatchlineError)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncAction {
    Noop,
    Refresh,
    Skip,
}

impl SyncAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Noop => "noop",
            Self::Refresh => "refresh",
            Self::Skip => "skip",
        }
    }
}

impl fmt::Display for SyncAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncRow {
    pub name: String,
    pub declared: String,
    pub installed: String,
    pub status: Status,
    pub action: SyncAction,
    pub source: Source,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncPlan {
    pub rows: Vec<SyncRow>,
    /// Distinct names whose cache entries should be dropped.
    pub refresh_targets: Vec<String>,
    pub skipped_unpinned: usize,
    pub local_count: usize,
}

/// Compare pinned declarations with the cache. Rows keep discovery order.
pub fn build_sync_plan(specs: &[PluginSpec], entries: &[CacheEntry]) -> SyncPlan {
    let index = index_by_name(entries);
    let mut plan = SyncPlan::default();
    let mut queued = HashSet::new();

    for spec in specs {
        let (installed, status, action) = if spec.is_local() {
            plan.local_count += 1;
            (LOCAL_LABEL.to_string(), Status::Unmanaged, SyncAction::Skip)
        } else {
            let entry = index.get(spec.name.as_str()).copied();
            let installed = installed_label(entry);
            if !spec.is_pinned() {
                plan.skipped_unpinned += 1;
                (installed, Status::Unknown, SyncAction::Skip)
            } else {
                match classify(spec, entry) {
                    Status::Ok => (installed, Status::Ok, SyncAction::Noop),
                    status => (installed, status, SyncAction::Refresh),
                }
            }
        };

        if action == SyncAction::Refresh && queued.insert(spec.name.clone()) {
            plan.refresh_targets.push(spec.name.clone());
        }
        plan.rows.push(SyncRow {
            name: spec.name.clone(),
            declared: spec.declared_spec.clone(),
            installed,
            status,
            action,
            source: spec.source,
        });
    }
    plan
}

#[derive(Debug, Default)]
pub struct SyncSummary {
    /// Targets with at least one cache entry removed.
    pub refreshed: usize,
    /// Targets with nothing cached to remove.
    pub not_cached: usize,
    pub failures: Vec<(String, PatchlineError)>,
}

#[derive(Debug, Default)]
pub struct SnapshotSummary {
    pub saved: usize,
    pub local_count: usize,
    pub failures: Vec<(String, PatchlineError)>,
}

/// One declaration chosen for rewriting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgradeTarget {
    pub name: String,
    pub config_path: PathBuf,
    pub source: Source,
    pub declared: String,
    pub pinned: String,
}

/// Pick the declarations an upgrade rewrites.
///
/// For each name, only the highest-precedence source that declares it is
/// used, and within that source only the first declaration per file. With
/// `all`, every declared name is processed in sorted order.
pub fn select_upgrade_targets(
    specs: &[PluginSpec],
    name: Option<&str>,
    all: bool,
) -> Vec<UpgradeTarget> {
    let mut by_name: HashMap<&str, Vec<&PluginSpec>> = HashMap::new();
    for spec in specs.iter().filter(|s| !s.is_local() && s.config_path.is_some()) {
        by_name.entry(spec.name.as_str()).or_default().push(spec);
    }

    let names: Vec<&str> = if all {
        let mut names: Vec<&str> = by_name.keys().copied().collect();
        names.sort_unstable();
        names
    } else {
        name.into_iter().collect()
    };

    names
        .into_iter()
        .filter_map(|n| by_name.get(n))
        .flat_map(|candidates| preferred_targets(candidates))
        .collect()
}

fn preferred_targets(specs: &[&PluginSpec]) -> Vec<UpgradeTarget> {
    for source in Source::UPGRADE_PRECEDENCE {
        let mut seen = HashSet::new();
        let targets: Vec<UpgradeTarget> = specs
            .iter()
            .filter(|s| s.source == source)
            .filter_map(|s| s.config_path.as_ref().map(|path| (*s, path)))
            .filter(|(_, path)| seen.insert(path.as_path()))
            .map(|(s, path)| UpgradeTarget {
                name: s.name.clone(),
                config_path: path.clone(),
                source: s.source,
                declared: s.declared_spec.clone(),
                pinned: s.pinned_version.clone(),
            })
            .collect();
        if !targets.is_empty() {
            return targets;
        }
    }
    Vec::new()
}

/// Version that `minor`/`patch` upgrades stay compatible with.
pub fn choose_base_version(pinned: &str, installed: &str) -> String {
    if !pinned.is_empty() && parse_version(pinned).is_some() {
        return pinned.to_string();
    }
    installed.to_string()
}

#[derive(Debug, Clone, Default)]
pub struct UpgradeRequest {
    /// Plugin to upgrade. Ignored when `all` is set.
    pub name: Option<String>,
    pub all: bool,
    /// Explicit version; skips the registry.
    pub target: Option<String>,
    pub mode: UpgradeMode,
}

#[derive(Debug)]
pub enum UpgradeOutcome {
    Upgraded {
        from: String,
        to: String,
        removed: Vec<PathBuf>,
    },
    AlreadySatisfied { spec: String },
    Failed(PatchlineError),
}

#[derive(Debug)]
pub struct UpgradeResult {
    pub target: UpgradeTarget,
    pub outcome: UpgradeOutcome,
}

#[derive(Debug, Default)]
pub struct UpgradeReport {
    pub results: Vec<UpgradeResult>,
}

impl UpgradeReport {
    pub fn upgraded(&self) -> usize {
        self.count(|o| matches!(o, UpgradeOutcome::Upgraded { .. }))
    }

    pub fn already_satisfied(&self) -> usize {
        self.count(|o| matches!(o, UpgradeOutcome::AlreadySatisfied { .. }))
    }

    pub fn failed(&self) -> usize {
        self.count(|o| matches!(o, UpgradeOutcome::Failed(_)))
    }

    fn count(&self, pred: impl Fn(&UpgradeOutcome) -> bool) -> usize {
        self.results.iter().filter(|r| pred(&r.outcome)).count()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RollbackOutcome {
    pub plugin: String,
    pub restored_spec: String,
    /// Spec that was declared before the rollback.
    pub replaced_spec: String,
    pub config_path: PathBuf,
    pub removed: Vec<PathBuf>,
}

/// Drives status checks and upgrade/rollback transitions.
pub struct Reconciler<'a> {
    cache_dir: Option<PathBuf>,
    store: SnapshotStore,
    fetcher: Option<&'a dyn MetadataFetcher>,
}

impl<'a> Reconciler<'a> {
    /// Without a cache dir every plugin reads as missing and nothing is invalidated.
    pub fn new(cache_dir: Option<PathBuf>, store: SnapshotStore) -> Self {
        Self {
            cache_dir,
            store,
            fetcher: None,
        }
    }

    pub fn with_fetcher(mut self, fetcher: &'a dyn MetadataFetcher) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    pub fn cache_dir(&self) -> Option<&Path> {
        self.cache_dir.as_deref()
    }

    pub fn store(&self) -> &SnapshotStore {
        &self.store
    }

    fn installed(&self) -> Result<Vec<CacheEntry>> {
        match &self.cache_dir {
            Some(dir) => cache::scan(dir),
            None => Ok(Vec::new()),
        }
    }

    fn require_cache_dir(&self) -> Result<&Path> {
        self.cache_dir
            .as_deref()
            .ok_or_else(|| PatchlineError::InvalidCacheDir {
                path: PathBuf::new(),
                message: "cache directory not found".to_string(),
            })
    }

    fn invalidate(&self, plugin_name: &str) -> Result<Vec<PathBuf>> {
        match &self.cache_dir {
            Some(dir) => cache::invalidate(dir, plugin_name),
            None => {
                debug!(plugin = plugin_name, "no cache directory, skipping invalidation");
                Ok(Vec::new())
            }
        }
    }

    pub fn list(&self, specs: &[PluginSpec]) -> Result<Vec<PluginReport>> {
        Ok(build_reports(specs, &self.installed()?))
    }

    /// Compare installed versions with the registry's latest tag.
    pub fn outdated(&self, specs: &[PluginSpec]) -> Result<OutdatedReport> {
        let fetcher = self.fetcher.ok_or(PatchlineError::Offline)?;
        let installed = self.installed()?;
        let index = index_by_name(&installed);

        let mut report = OutdatedReport::default();
        let mut latest: HashMap<&str, Option<String>> = HashMap::new();
        for spec in specs {
            if spec.is_local() {
                report.local_count += 1;
                continue;
            }
            if latest.contains_key(spec.name.as_str()) {
                continue;
            }
            let tag = match fetcher.fetch(&spec.name) {
                Ok(info) => info.latest,
                Err(e) => {
                    warn!(plugin = %spec.name, error = %e, "registry lookup failed");
                    report.failures.push((spec.name.clone(), e));
                    None
                }
            };
            latest.insert(spec.name.as_str(), tag);
        }

        for spec in specs.iter().filter(|s| !s.is_local()) {
            let entry = index.get(spec.name.as_str()).copied();
            let tag = latest.get(spec.name.as_str()).cloned().flatten();
            let status = match (entry, tag.as_deref()) {
                (None, _) => Status::Missing,
                (Some(_), None) => Status::Unknown,
                (Some(entry), Some(tag)) => match compare(&entry.version, tag) {
                    Some(std::cmp::Ordering::Less) => Status::Outdated,
                    Some(_) => Status::Ok,
                    None => Status::Unknown,
                },
            };
            report.rows.push(OutdatedRow {
                name: spec.name.clone(),
                declared: spec.declared_spec.clone(),
                installed: installed_label(entry),
                latest: tag,
                status,
                source: spec.source,
            });
        }
        sort_rows(&mut report.rows, |r| (r.name.as_str(), r.source));
        Ok(report)
    }

    pub fn sync_plan(&self, specs: &[PluginSpec]) -> Result<SyncPlan> {
        let dir = self.require_cache_dir()?;
        Ok(build_sync_plan(specs, &cache::scan(dir)?))
    }

    /// Drop cache entries for every refresh target so the host reinstalls them.
    pub fn sync(&self, plan: &SyncPlan) -> Result<SyncSummary> {
        let dir = self.require_cache_dir()?;
        let mut summary = SyncSummary::default();
        for name in &plan.refresh_targets {
            match cache::invalidate(dir, name) {
                Ok(removed) if removed.is_empty() => summary.not_cached += 1,
                Ok(_) => summary.refreshed += 1,
                Err(e) => {
                    warn!(plugin = %name, error = %e, "refresh failed");
                    summary.failures.push((name.clone(), e));
                }
            }
        }
        Ok(summary)
    }

    /// Record the current state of every registry-managed declaration.
    pub fn snapshot_all(&self, specs: &[PluginSpec]) -> Result<SnapshotSummary> {
        let installed = self.installed()?;
        let index = index_by_name(&installed);

        let mut summary = SnapshotSummary::default();
        for spec in specs {
            if spec.is_local() {
                summary.local_count += 1;
                continue;
            }
            let entry = SnapshotEntry {
                timestamp: None,
                plugin_name: spec.name.clone(),
                previous_spec: spec.declared_spec.clone(),
                previous_installed: installed_label(index.get(spec.name.as_str()).copied()),
                source: spec.source,
                reason: SnapshotReason::Snapshot,
                config_path: spec.config_path.clone(),
            };
            match self.store.save(entry) {
                Ok(_) => summary.saved += 1,
                Err(e) => {
                    warn!(plugin = %spec.name, error = %e, "snapshot failed");
                    summary.failures.push((spec.name.clone(), e));
                }
            }
        }
        Ok(summary)
    }

    pub fn upgrade(&self, specs: &[PluginSpec], request: &UpgradeRequest) -> Result<UpgradeReport> {
        if !request.all && request.name.as_deref().map_or(true, str::is_empty) {
            return Err(PatchlineError::invalid("a plugin name or --all is required"));
        }
        let targets = select_upgrade_targets(specs, request.name.as_deref(), request.all);
        if targets.is_empty() {
            return Err(match (&request.name, request.all) {
                (Some(name), false) => PatchlineError::PluginNotDeclared {
                    plugin: name.clone(),
                },
                _ => PatchlineError::invalid("no registry plugins declared"),
            });
        }
        let explicit = match request.target.as_deref().map(str::trim) {
            Some("") => return Err(PatchlineError::invalid("target version is empty")),
            other => other,
        };
        if explicit.is_none() && self.fetcher.is_none() {
            return Err(PatchlineError::Offline);
        }

        let installed = self.installed()?;
        let index = index_by_name(&installed);
        let mut infos: HashMap<String, PackageInfo> = HashMap::new();

        let mut report = UpgradeReport::default();
        for target in targets {
            let entry = index.get(target.name.as_str()).copied();
            let outcome = match self.upgrade_one(&target, entry, explicit, request.mode, &mut infos)
            {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!(plugin = %target.name, error = %e, "upgrade failed");
                    UpgradeOutcome::Failed(e)
                }
            };
            report.results.push(UpgradeResult { target, outcome });
        }
        Ok(report)
    }

    fn upgrade_one(
        &self,
        target: &UpgradeTarget,
        installed: Option<&CacheEntry>,
        explicit: Option<&str>,
        mode: UpgradeMode,
        infos: &mut HashMap<String, PackageInfo>,
    ) -> Result<UpgradeOutcome> {
        let resolved = match explicit {
            Some(version) => version.to_string(),
            None => {
                let installed_version = installed.map(|e| e.version.as_str()).unwrap_or_default();
                let base = choose_base_version(&target.pinned, installed_version);
                let info = self.package_info(&target.name, infos)?;
                select_target(info.latest.as_deref(), &info.versions, &base, mode)?
            }
        };

        let new_spec = format!("{}@{}", target.name, resolved);
        if target.declared.trim() == new_spec {
            debug!(plugin = %target.name, spec = %new_spec, "already satisfied");
            return Ok(UpgradeOutcome::AlreadySatisfied { spec: new_spec });
        }

        self.store.save(SnapshotEntry {
            timestamp: None,
            plugin_name: target.name.clone(),
            previous_spec: target.declared.clone(),
            previous_installed: installed_label(installed),
            source: target.source,
            reason: SnapshotReason::Upgrade,
            config_path: Some(target.config_path.clone()),
        })?;
        update_declared_spec(&target.config_path, &target.name, &new_spec)?;
        let removed = self.invalidate(&target.name)?;

        info!(plugin = %target.name, from = %target.declared, to = %new_spec, "upgraded");
        Ok(UpgradeOutcome::Upgraded {
            from: target.declared.clone(),
            to: new_spec,
            removed,
        })
    }

    fn package_info(
        &self,
        name: &str,
        infos: &mut HashMap<String, PackageInfo>,
    ) -> Result<PackageInfo> {
        if let Some(info) = infos.get(name) {
            return Ok(info.clone());
        }
        let fetcher = self.fetcher.ok_or(PatchlineError::Offline)?;
        let info = fetcher.fetch(name)?;
        infos.insert(name.to_string(), info.clone());
        Ok(info)
    }

    /// Restore the most recent non-rollback snapshot for `plugin_name`.
    ///
    /// The declaration being replaced is itself recorded with reason `rollback`
    /// before the declaration is rewritten.
    pub fn rollback(&self, plugin_name: &str) -> Result<RollbackOutcome> {
        if plugin_name.is_empty() {
            return Err(PatchlineError::invalid("plugin name is required"));
        }
        let restore = self.store.latest_restorable(plugin_name)?;
        let config_path = restore
            .config_path
            .clone()
            .filter(|p| !p.as_os_str().is_empty())
            .ok_or_else(|| PatchlineError::SnapshotMissingConfigPath {
                plugin: plugin_name.to_string(),
            })?;

        let current = load_plugin_specs(&config_path, restore.source)?
            .into_iter()
            .find(|s| s.name == plugin_name)
            .ok_or_else(|| PatchlineError::PluginNotInConfig {
                plugin: plugin_name.to_string(),
                path: config_path.clone(),
            })?;

        let installed = self.installed()?;
        let entry = index_by_name(&installed).get(plugin_name).copied();
        self.store.save(SnapshotEntry {
            timestamp: None,
            plugin_name: plugin_name.to_string(),
            previous_spec: current.declared_spec.clone(),
            previous_installed: installed_label(entry),
            source: restore.source,
            reason: SnapshotReason::Rollback,
            config_path: Some(config_path.clone()),
        })?;

        update_declared_spec(&config_path, plugin_name, &restore.previous_spec)?;
        let removed = self.invalidate(plugin_name)?;

        info!(plugin = plugin_name, spec = %restore.previous_spec, "rolled back");
        Ok(RollbackOutcome {
            plugin: plugin_name.to_string(),
            restored_spec: restore.previous_spec,
            replaced_spec: current.declared_spec,
            config_path,
            removed,
        })
    }

    pub fn history(&self, plugin_name: &str) -> Result<Vec<SnapshotEntry>> {
        self.store.list(plugin_name)
    }
}
