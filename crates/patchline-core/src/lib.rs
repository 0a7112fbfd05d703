pub mod atomic;
pub mod cache;
pub mod declaration;
pub mod discovery;
pub mod engine;
pub mod error;
pub mod jsonc;
pub mod paths;
pub mod registry;
pub mod settings;
pub mod snapshot;
pub mod version;

pub use cache::{ensure_within, CacheEntry};
pub use declaration::{
    parse_declarations, split_spec, update_declared_spec, ConfigDocument, ConfigValue,
    PLUGIN_LIST_KEYS,
};
pub use discovery::{discover, DiscoveryOptions, PluginSpec, Source};
pub use engine::{
    build_reports, build_sync_plan, choose_base_version, classify, select_upgrade_targets,
    OutdatedReport, OutdatedRow, PluginReport, Reconciler, RollbackOutcome, SnapshotSummary,
    Status, SyncAction, SyncPlan, SyncRow, SyncSummary, UpgradeOutcome, UpgradeReport,
    UpgradeRequest, UpgradeResult, UpgradeTarget,
};
pub use error::{ErrorKind, PatchlineError, Result};
pub use paths::{OsFamily, PathEnv};
pub use registry::{MetadataFetcher, NpmRegistry, PackageInfo};
pub use settings::Config;
pub use snapshot::{
    Clock, SnapshotEntry, SnapshotReason, SnapshotStore, SteppingClock, SystemClock,
};
pub use version::{compare, parse_version, select_target, Semver, UpgradeMode};
