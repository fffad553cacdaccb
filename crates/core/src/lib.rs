//! ProjectSync core library.
//!
//! This crate keeps survey projects in sync across local and cloud
//! repositories: the project model, the three-way merge engine, the
//! repository backends with their change watcher, and the project manager
//! that debounces local edits into merge/save cycles.

pub mod config;
pub mod errors;
pub mod merge;
pub mod model;
pub mod repository;
pub mod resource;
pub mod serialization;
pub mod sync;
pub mod watcher;

// Re-exports for convenience.
pub use config::SyncConfig;
pub use errors::{CoreError, RepositoryError, SyncError};
pub use merge::{MergeConflict, MergeStrategy, Merger};
pub use model::{Project, ProjectSnapshot, SharedProject};
pub use repository::{CloudRepository, LocalRepository, MemoryRepository, Query, Repository, RepositoryId};
pub use sync::{ProjectManager, SyncOutcome, SyncSettings, SyncState};
