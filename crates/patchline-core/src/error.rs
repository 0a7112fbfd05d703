use std::path::PathBuf;
use thiserror::Error;

/// Coarse classification of failures, used by callers that render or map errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    InvalidInput,
    UnsafePath,
    Io,
    Parse,
    Registry,
}

#[derive(Debug, Error)]
pub enum PatchlineError {
    #[error("Config not found: {path}")]
    ConfigNotFound { path: PathBuf },

    #[error("Failed to parse {path}: {message}")]
    ConfigParse { path: PathBuf, message: String },

    #[error("Config key not found: {key}")]
    ConfigKeyNotFound { key: String },

    #[error("No snapshot found for {plugin}")]
    SnapshotNotFound { plugin: String },

    #[error("Snapshot for {plugin} has no config path")]
    SnapshotMissingConfigPath { plugin: String },

    #[error("Plugin {plugin} not found in {path}")]
    PluginNotInConfig { plugin: String, path: PathBuf },

    #[error("Plugin not declared: {plugin}")]
    PluginNotDeclared { plugin: String },

    #[error("Package not found in registry: {package}")]
    PackageNotFound { package: String },

    #[error("Registry error for {package}: {message}")]
    Registry { package: String, message: String },

    #[error("Registry access disabled (offline)")]
    Offline,

    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    #[error("Invalid version '{version}': {message}")]
    InvalidVersion { version: String, message: String },

    #[error("Unsupported '{key}' list in {path}: {message}")]
    UnsupportedList {
        key: String,
        path: PathBuf,
        message: String,
    },

    #[error("Invalid cache directory {path}: {message}")]
    InvalidCacheDir { path: PathBuf, message: String },

    #[error("Refusing to touch {target}: not inside {base}")]
    UnsafePath { base: PathBuf, target: PathBuf },

    #[error("Removed {} cache entries before failing: {source}", .removed.len())]
    PartialRemoval {
        removed: Vec<PathBuf>,
        #[source]
        source: Box<PatchlineError>,
    },

    #[error("IO error at {path}: {source}")]
    IoAt {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML serialization error: {0}")]
    TomlSer(#[from] toml::ser::Error),

    #[error("TOML deserialization error: {0}")]
    TomlDe(#[from] toml::de::Error),
}

pub type Result<T> = std::result::Result<T, PatchlineError>;

impl PatchlineError {
    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    pub(crate) fn io_at(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::IoAt {
            path: path.into(),
            source,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ConfigNotFound { .. }
            | Self::ConfigKeyNotFound { .. }
            | Self::SnapshotNotFound { .. }
            | Self::PluginNotInConfig { .. }
            | Self::PluginNotDeclared { .. }
            | Self::PackageNotFound { .. } => ErrorKind::NotFound,
            Self::InvalidInput { .. }
            | Self::InvalidVersion { .. }
            | Self::UnsupportedList { .. }
            | Self::InvalidCacheDir { .. }
            | Self::SnapshotMissingConfigPath { .. }
            | Self::Offline => ErrorKind::InvalidInput,
            Self::UnsafePath { .. } => ErrorKind::UnsafePath,
            Self::IoAt { .. } | Self::Io(_) => ErrorKind::Io,
            Self::ConfigParse { .. } | Self::Json(_) | Self::TomlSer(_) | Self::TomlDe(_) => {
                ErrorKind::Parse
            }
            Self::Registry { .. } => ErrorKind::Registry,
            Self::PartialRemoval { source, .. } => source.kind(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }

    pub fn exit_code(&self) -> i32 {
        match self.kind() {
            ErrorKind::InvalidInput => 2,
            ErrorKind::NotFound => 3,
            ErrorKind::UnsafePath => 4,
            ErrorKind::Parse => 5,
            ErrorKind::Registry => 6,
            ErrorKind::Io => 1,
        }
    }
}
