//! Error types for the ProjectSync core library.
//!
//! Each subsystem has its own error type derived with `thiserror`, and a
//! top-level [`CoreError`] enum unifies them for callers that want a single
//! error type.

use thiserror::Error;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Top-level error
// ---------------------------------------------------------------------------

/// Unified error type for the entire core library.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error(transparent)]
    Serialization(#[from] SerializationError),

    #[error(transparent)]
    Merge(#[from] MergeError),

    #[error(transparent)]
    Watch(#[from] WatchError),

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

// ---------------------------------------------------------------------------
// Repository errors
// ---------------------------------------------------------------------------

/// Errors from repository operations (local filesystem, cloud, in-memory).
#[derive(Debug, Error)]
pub enum RepositoryError {
    /// The stored version advanced past the version the save was based on.
    ///
    /// This is an expected condition; the synchronizer retries it.
    #[error("project {id} is outdated (stored version {stored_version:?}, basis version {basis_version})")]
    Outdated {
        id: Uuid,
        stored_version: Option<u64>,
        basis_version: u64,
    },

    /// The project does not exist in this repository.
    #[error("project {0} not found")]
    NotFound(Uuid),

    /// A resource name was rejected by the resolver.
    #[error("invalid resource name '{0}'")]
    InvalidResourceName(String),

    /// Any other persistence failure (disk, network, backend status).
    #[error("persistence failure: {0}")]
    Persistence(String),

    /// The stored document could not be read.
    #[error("repository serialization error: {0}")]
    Serialization(#[from] SerializationError),

    /// Transport error talking to a remote repository.
    #[error("repository HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Generic I/O wrapper.
    #[error("repository I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RepositoryError {
    /// Whether the synchronizer should re-merge and retry after this error.
    pub fn is_outdated(&self) -> bool {
        matches!(self, Self::Outdated { .. })
    }
}

// ---------------------------------------------------------------------------
// Serialization errors
// ---------------------------------------------------------------------------

/// Errors reading or writing the `project.json` document.
#[derive(Debug, Error)]
pub enum SerializationError {
    /// Malformed JSON or a document that does not match the project schema.
    #[error("malformed project document: {0}")]
    Malformed(#[from] serde_json::Error),

    /// The document declares a format this build cannot read.
    #[error("unsupported project document format {found} (newest supported is {supported})")]
    UnsupportedFormat { found: u32, supported: u32 },

    /// The project id inside the document does not match its directory.
    #[error("project document at '{path}' declares id {found}, expected {expected}")]
    IdMismatch {
        path: String,
        expected: Uuid,
        found: Uuid,
    },

    /// Generic I/O error reading the document.
    #[error("project document I/O error: {0}")]
    Io(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Merge errors
// ---------------------------------------------------------------------------

/// Errors from the merge engine. These indicate programming errors and are
/// never retried.
#[derive(Debug, Error)]
pub enum MergeError {
    /// Two different projects were handed to the merger.
    #[error("cannot merge project {theirs} into project {ours}")]
    IdentifierMismatch { ours: Uuid, theirs: Uuid },
}

// ---------------------------------------------------------------------------
// Watcher errors
// ---------------------------------------------------------------------------

/// Errors from the filesystem change watcher.
#[derive(Debug, Error)]
pub enum WatchError {
    /// The OS watch service could not be initialized.
    #[error("watch service unavailable: {0}")]
    Unavailable(#[from] notify::Error),

    /// The watched root does not exist or is not a directory.
    #[error("watch root '{0}' is not a directory")]
    NotADirectory(String),

    /// Walking the directory tree failed.
    #[error("failed to scan '{path}': {detail}")]
    Scan { path: String, detail: String },
}

// ---------------------------------------------------------------------------
// Sync errors
// ---------------------------------------------------------------------------

/// Errors from the project manager's synchronization pipeline.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The project is not known to the manager.
    #[error("project {0} is not available")]
    UnknownProject(Uuid),

    /// The project's repository is not registered with the manager.
    #[error("repository '{0}' is not registered")]
    UnknownRepository(String),

    /// A by-id query returned more than one project.
    #[error("repository '{repository}' returned {count} projects for id {id}")]
    AmbiguousQuery {
        repository: String,
        id: Uuid,
        count: usize,
    },

    /// The merge/save loop did not settle within the configured attempts.
    #[error("project {id} did not settle after {attempts} attempts")]
    RetriesExhausted { id: Uuid, attempts: u32 },

    /// The manager has been shut down.
    #[error("project manager is shut down")]
    ShutDown,

    /// Underlying repository error.
    #[error("sync repository error: {0}")]
    Repository(#[from] RepositoryError),

    /// Underlying merge error.
    #[error("sync merge error: {0}")]
    Merge(#[from] MergeError),
}

// ---------------------------------------------------------------------------
// Configuration errors
// ---------------------------------------------------------------------------

/// Errors from configuration loading and validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file not found.
    #[error("configuration file not found: {0}")]
    FileNotFound(String),

    /// TOML parse error.
    #[error("configuration parse error: {0}")]
    ParseError(String),

    /// A required environment variable is not set.
    #[error("required environment variable '{var}' is not set (referenced by config field '{field}')")]
    EnvVarMissing { var: String, field: String },

    /// A config value is invalid.
    #[error("invalid configuration value for '{field}': {detail}")]
    InvalidValue { field: String, detail: String },

    /// Generic I/O error reading the config file.
    #[error("configuration I/O error: {0}")]
    IoError(#[from] std::io::Error),
}
