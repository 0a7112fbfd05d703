use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};
use patchline_core::UpgradeMode;

#[derive(Parser)]
#[command(name = "patchline")]
#[command(about = "Track, upgrade and roll back OpenCode plugins")]
#[command(version)]
pub struct Cli {
    /// Verbose output
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    pub verbose: bool,

    /// Quiet output (errors only)
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Settings directory (default: <config dir>/patchline)
    #[arg(long, global = true)]
    pub base_dir: Option<PathBuf>,

    #[command(flatten)]
    pub paths: PathArgs,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Location overrides shared by every command.
#[derive(Args, Debug, Clone, Default)]
pub struct PathArgs {
    /// Project directory or config file to start the search from
    #[arg(long, global = true)]
    pub project: Option<PathBuf>,

    /// Global opencode.json to use instead of the detected one
    #[arg(long, global = true)]
    pub global_config: Option<PathBuf>,

    /// OpenCode plugin cache directory
    #[arg(long, global = true)]
    pub cache_dir: Option<PathBuf>,

    /// Snapshot history directory
    #[arg(long, global = true)]
    pub snapshot_dir: Option<PathBuf>,

    /// Extra directory to scan for local plugins (repeatable)
    #[arg(long = "local-dir", global = true)]
    pub local_dirs: Vec<PathBuf>,

    /// Never contact the registry
    #[arg(long, global = true)]
    pub offline: bool,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
#[allow(clippy::enum_variant_names)]
pub enum Shell {
    Bash,
    Zsh,
    Fish,
    PowerShell,
    Elvish,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Show declared plugins and what is installed
    List,

    /// Compare installed plugins with the registry's latest release
    Outdated,

    /// Drop cache entries that do not match pinned versions
    Sync {
        /// Show the plan without touching the cache
        #[arg(long)]
        dry_run: bool,
    },

    /// Rewrite plugin declarations to a newer version
    Upgrade {
        /// Plugin to upgrade
        #[arg(required_unless_present = "all", conflicts_with = "all")]
        name: Option<String>,

        /// Upgrade every declared registry plugin
        #[arg(long)]
        all: bool,

        /// Exact version to pin (skips the registry)
        #[arg(long, value_name = "VERSION", group = "mode")]
        to: Option<String>,

        /// Highest available version
        #[arg(long, group = "mode")]
        major: bool,

        /// Highest version within the current major
        #[arg(long, group = "mode")]
        minor: bool,

        /// Highest version within the current major.minor
        #[arg(long, group = "mode")]
        patch: bool,
    },

    /// Restore a plugin's declaration from its latest snapshot
    Rollback {
        /// Plugin to roll back
        name: String,
    },

    /// Record the current state of every declared plugin
    Snapshot,

    /// Show snapshot history for a plugin (all plugins when omitted)
    History {
        name: Option<String>,
    },

    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Subcommand)]
pub enum ConfigAction {
    /// Get a config value
    Get {
        /// Config key (e.g., registry.url)
        key: String,
    },
    /// Set a config value
    Set {
        /// Config key (e.g., registry.offline)
        key: String,
        /// Value to set
        value: String,
    },
    /// List all config values
    List,
    /// Show config file path
    Path,
    /// Initialize config with default values
    Init,
}

/// Mode selected by the `upgrade` flags. `--to` bypasses mode selection.
pub fn upgrade_mode(major: bool, minor: bool, patch: bool) -> UpgradeMode {
    if major {
        UpgradeMode::Major
    } else if minor {
        UpgradeMode::Minor
    } else if patch {
        UpgradeMode::Patch
    } else {
        UpgradeMode::Latest
    }
}
