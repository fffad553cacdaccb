//! Local filesystem repository.
//!
//! Layout: one directory per project, named by the project id, holding
//! `project.json` and any attachments:
//!
//! ```text
//! <root>/
//!   0f8e...c2/
//!     project.json
//!     orthophoto.tif
//! ```
//!
//! The root is watched for changes made by other processes. Writes made by
//! this repository are remembered so their watcher echo is not reported as
//! an external change.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use async_trait::async_trait;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{
    check_basis, next_revision, ChangeListener, ListenerId, ListenerRegistry, Query, Repository,
    RepositoryId,
};
use crate::errors::{RepositoryError, SerializationError};
use crate::model::{Project, ProjectSnapshot, RepositoryType};
use crate::resource::{FsResourceResolver, ResourceResolver};
use crate::serialization::{read_project_file, write_project_file, PROJECT_FILE};
use crate::watcher::{ChangeWatcher, WatchHandler, WatcherOptions};

pub struct LocalRepository {
    inner: Arc<LocalInner>,
    watcher: Mutex<Option<ChangeWatcher>>,
}

struct LocalInner {
    id: RepositoryId,
    root: PathBuf,
    listeners: ListenerRegistry,
    /// Serializes the version check and the write of a save.
    write_lock: tokio::sync::Mutex<()>,
    /// Last value this process wrote per project.
    written: Mutex<HashMap<Uuid, ProjectSnapshot>>,
    /// Projects this process deleted.
    deleted: Mutex<HashSet<Uuid>>,
}

impl LocalRepository {
    /// Open (creating if needed) a repository rooted at `root`. With
    /// `watch` set, changes by other processes are reported to listeners;
    /// a watcher that cannot be started is logged and skipped.
    pub fn open(root: impl Into<PathBuf>, watch: Option<WatcherOptions>) -> Result<Self, RepositoryError> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        // Watch events carry canonical paths.
        let root = root.canonicalize().unwrap_or(root);
        let inner = Arc::new(LocalInner {
            id: RepositoryId::new(format!("local:{}", root.display())),
            root,
            listeners: ListenerRegistry::default(),
            write_lock: tokio::sync::Mutex::new(()),
            written: Mutex::new(HashMap::new()),
            deleted: Mutex::new(HashSet::new()),
        });

        let watcher = match watch {
            Some(options) => {
                let handler = Arc::new(LocalWatchHandler {
                    inner: Arc::downgrade(&inner),
                });
                match ChangeWatcher::new(inner.root.clone(), true, handler, options) {
                    Ok(watcher) => Some(watcher),
                    Err(e) => {
                        warn!(
                            root = %inner.root.display(),
                            error = %e,
                            "change watcher unavailable, external changes will not be detected"
                        );
                        None
                    }
                }
            }
            None => None,
        };

        info!(
            repository = %inner.id,
            watching = watcher.is_some(),
            "opened local repository"
        );
        Ok(Self {
            inner,
            watcher: Mutex::new(watcher),
        })
    }

    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    pub fn project_dir(&self, id: Uuid) -> PathBuf {
        self.inner.project_dir(id)
    }

    pub fn is_watching(&self) -> bool {
        self.lock_watcher().is_some()
    }

    /// Stop external change detection.
    pub fn stop_watching(&self) {
        let watcher = self.lock_watcher().take();
        if let Some(mut watcher) = watcher {
            watcher.close();
        }
    }

    fn lock_watcher(&self) -> MutexGuard<'_, Option<ChangeWatcher>> {
        self.watcher.lock().unwrap_or_else(|poisoned| {
            warn!("watcher slot mutex was poisoned, recovering");
            poisoned.into_inner()
        })
    }
}

impl LocalInner {
    fn project_dir(&self, id: Uuid) -> PathBuf {
        self.root.join(id.to_string())
    }

    fn lock_written(&self) -> MutexGuard<'_, HashMap<Uuid, ProjectSnapshot>> {
        self.written.lock().unwrap_or_else(|poisoned| {
            warn!("echo table mutex was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    fn lock_deleted(&self) -> MutexGuard<'_, HashSet<Uuid>> {
        self.deleted.lock().unwrap_or_else(|poisoned| {
            warn!("echo table mutex was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    /// Load one project directory, checking the document's id against the
    /// directory name.
    fn load(&self, id: Uuid) -> Result<ProjectSnapshot, SerializationError> {
        let dir = self.project_dir(id);
        let snapshot = read_project_file(&dir)?;
        if snapshot.id != id {
            return Err(SerializationError::IdMismatch {
                path: dir.display().to_string(),
                expected: id,
                found: snapshot.id,
            });
        }
        Ok(snapshot)
    }

    fn scan(&self, query: &Query) -> Result<Vec<ProjectSnapshot>, RepositoryError> {
        let ids: Vec<Uuid> = match query {
            Query::ById(id) => vec![*id],
            Query::All => std::fs::read_dir(&self.root)?
                .filter_map(|entry| entry.ok())
                .filter(|entry| entry.file_type().map(|t| t.is_dir()).unwrap_or(false))
                .filter_map(|entry| entry.file_name().to_str().and_then(|n| Uuid::parse_str(n).ok()))
                .collect(),
        };

        let mut snapshots = Vec::with_capacity(ids.len());
        for id in ids {
            match self.load(id) {
                Ok(snapshot) => snapshots.push(snapshot),
                Err(SerializationError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                    debug!(project_id = %id, "no project document, skipping");
                }
                Err(e) => {
                    warn!(project_id = %id, error = %e, "skipping unreadable project");
                }
            }
        }
        snapshots.sort_by_key(|s| s.id);
        debug!(root = %self.root.display(), count = snapshots.len(), "scanned projects");
        Ok(snapshots)
    }

    fn store(&self, snapshot: &ProjectSnapshot) -> Result<ProjectSnapshot, RepositoryError> {
        let stored_version = match self.load(snapshot.id) {
            Ok(current) => Some(current.version),
            Err(SerializationError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };
        check_basis(snapshot, stored_version)?;

        let stored = next_revision(snapshot, RepositoryType::Local);
        // Recorded before writing so the watcher never sees an unknown echo.
        self.lock_written().insert(stored.id, stored.clone());
        self.lock_deleted().remove(&stored.id);
        write_project_file(&self.project_dir(stored.id), &stored)?;
        Ok(stored)
    }

    fn remove(&self, id: Uuid) -> Result<(), RepositoryError> {
        self.lock_written().remove(&id);
        self.lock_deleted().insert(id);
        match std::fs::remove_dir_all(self.project_dir(id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(RepositoryError::NotFound(id)),
            Err(e) => Err(e.into()),
        }
    }

    /// Project id for a path directly below the root.
    fn project_of(&self, path: &Path) -> Option<Uuid> {
        let relative = path.strip_prefix(&self.root).ok()?;
        let mut components = relative.components();
        let id = components.next()?.as_os_str().to_str()?;
        Uuid::parse_str(id).ok()
    }
}

async fn blocking<T, F>(inner: &Arc<LocalInner>, work: F) -> Result<T, RepositoryError>
where
    T: Send + 'static,
    F: FnOnce(&LocalInner) -> Result<T, RepositoryError> + Send + 'static,
{
    let inner = inner.clone();
    tokio::task::spawn_blocking(move || work(&inner))
        .await
        .map_err(|e| RepositoryError::Persistence(format!("filesystem task failed: {}", e)))?
}

#[async_trait]
impl Repository for LocalRepository {
    fn id(&self) -> &RepositoryId {
        &self.inner.id
    }

    fn repository_type(&self) -> RepositoryType {
        RepositoryType::Local
    }

    async fn query(&self, query: &Query) -> Result<Vec<Project>, RepositoryError> {
        let query = *query;
        let snapshots = blocking(&self.inner, move |inner| inner.scan(&query)).await?;
        Ok(snapshots
            .into_iter()
            .map(|s| Project::loaded(s, self.inner.id.clone()))
            .collect())
    }

    async fn save(&self, snapshot: &ProjectSnapshot) -> Result<ProjectSnapshot, RepositoryError> {
        let _guard = self.inner.write_lock.lock().await;
        let snapshot = snapshot.clone();
        let stored = blocking(&self.inner, move |inner| inner.store(&snapshot)).await?;
        debug!(project_id = %stored.id, version = stored.version, "project saved");
        Ok(stored)
    }

    async fn delete(&self, id: Uuid) -> Result<(), RepositoryError> {
        let _guard = self.inner.write_lock.lock().await;
        blocking(&self.inner, move |inner| inner.remove(id)).await?;
        info!(project_id = %id, "project deleted");
        Ok(())
    }

    fn add_change_listener(&self, listener: Arc<dyn ChangeListener>) -> ListenerId {
        self.inner.listeners.add(listener)
    }

    fn remove_change_listener(&self, id: ListenerId) -> bool {
        self.inner.listeners.remove(id)
    }

    fn resource_resolver(&self, project: Uuid) -> Option<Box<dyn ResourceResolver>> {
        Some(Box::new(FsResourceResolver::new(self.inner.project_dir(project))))
    }
}

// ---------------------------------------------------------------------------
// External change detection
// ---------------------------------------------------------------------------

struct LocalWatchHandler {
    inner: Weak<LocalInner>,
}

impl LocalWatchHandler {
    fn document_changed(&self, path: &Path) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        if path.file_name().and_then(|n| n.to_str()) != Some(PROJECT_FILE) {
            return;
        }
        let Some(id) = inner.project_of(path) else {
            return;
        };
        if path.parent() != Some(inner.project_dir(id).as_path()) {
            return;
        }

        let snapshot = match inner.load(id) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(project_id = %id, error = %e, "ignoring unreadable external change");
                return;
            }
        };
        if inner.lock_written().get(&id) == Some(&snapshot) {
            debug!(project_id = %id, version = snapshot.version, "ignoring own write");
            return;
        }

        info!(project_id = %id, version = snapshot.version, "external project change");
        inner
            .listeners
            .notify(&inner.id, &Project::loaded(snapshot, inner.id.clone()));
    }
}

impl WatchHandler for LocalWatchHandler {
    fn file_added(&self, path: &Path) {
        self.document_changed(path);
    }

    fn file_modified(&self, path: &Path) {
        self.document_changed(path);
    }

    fn file_deleted(&self, path: &Path) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        let Some(id) = inner.project_of(path) else {
            return;
        };
        let is_project_dir = path == inner.project_dir(id);
        let is_document = path.file_name().and_then(|n| n.to_str()) == Some(PROJECT_FILE);
        if !(is_project_dir || is_document) {
            return;
        }
        if inner.lock_deleted().contains(&id) {
            debug!(project_id = %id, "ignoring own delete");
            return;
        }
        inner.lock_written().remove(&id);
        info!(project_id = %id, path = %path.display(), "project removed externally");
        inner.listeners.notify_removed(&inner.id, id);
    }
}
