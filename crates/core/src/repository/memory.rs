//! In-memory repository.
//!
//! Implements the full repository contract without any I/O. Besides serving
//! as a reference backend it lets callers play the part of another writer:
//! [`MemoryRepository::put_external`] stores a snapshot as if some other
//! process had saved it and notifies listeners, and
//! [`MemoryRepository::inject_concurrent_write`] makes the next save race
//! against such a write.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{
    check_basis, next_revision, ChangeListener, ListenerId, ListenerRegistry, Query, Repository,
    RepositoryId,
};
use crate::errors::RepositoryError;
use crate::model::{Project, ProjectSnapshot, RepositoryType};

type PendingEdit = Box<dyn FnOnce(&mut ProjectSnapshot) + Send>;

pub struct MemoryRepository {
    id: RepositoryId,
    projects: Mutex<HashMap<Uuid, ProjectSnapshot>>,
    listeners: ListenerRegistry,
    saves: AtomicUsize,
    queries: AtomicUsize,
    failures: AtomicUsize,
    concurrent: Mutex<Vec<PendingEdit>>,
}

impl MemoryRepository {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: RepositoryId::new(id),
            projects: Mutex::new(HashMap::new()),
            listeners: ListenerRegistry::default(),
            saves: AtomicUsize::new(0),
            queries: AtomicUsize::new(0),
            failures: AtomicUsize::new(0),
            concurrent: Mutex::new(Vec::new()),
        }
    }

    pub fn shared(id: impl Into<String>) -> Arc<Self> {
        Arc::new(Self::new(id))
    }

    /// Number of accepted saves.
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    pub fn query_count(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }

    pub fn get(&self, id: Uuid) -> Option<ProjectSnapshot> {
        self.lock_projects().get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock_projects().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Make the next `count` save attempts fail with a persistence error.
    pub fn fail_next_saves(&self, count: usize) {
        self.failures.store(count, Ordering::SeqCst);
    }

    /// Apply `edit` as an external write right before the next save of the
    /// edited project is checked, so that save sees an advanced version.
    pub fn inject_concurrent_write(&self, edit: impl FnOnce(&mut ProjectSnapshot) + Send + 'static) {
        self.lock_concurrent().push(Box::new(edit));
    }

    /// Store `snapshot` as written by another process and notify listeners.
    /// The stored version is one past the current one.
    pub fn put_external(&self, snapshot: ProjectSnapshot) -> ProjectSnapshot {
        let stored = {
            let mut projects = self.lock_projects();
            let version = projects
                .get(&snapshot.id)
                .map_or(snapshot.version, |current| current.version);
            let mut stored = next_revision(&snapshot, RepositoryType::Memory);
            stored.version = version + 1;
            projects.insert(stored.id, stored.clone());
            stored
        };
        debug!(project_id = %stored.id, version = stored.version, "external write");
        self.listeners
            .notify(&self.id, &Project::loaded(stored.clone(), self.id.clone()));
        stored
    }

    /// Remove a project as another process would and notify listeners.
    pub fn remove_external(&self, id: Uuid) -> bool {
        let removed = self.lock_projects().remove(&id).is_some();
        if removed {
            self.listeners.notify_removed(&self.id, id);
        }
        removed
    }

    fn run_concurrent_writes(&self, id: Uuid) {
        let edits = std::mem::take(&mut *self.lock_concurrent());
        for edit in edits {
            if let Some(mut current) = self.get(id) {
                edit(&mut current);
                self.put_external(current);
            }
        }
    }

    fn lock_projects(&self) -> MutexGuard<'_, HashMap<Uuid, ProjectSnapshot>> {
        self.projects.lock().unwrap_or_else(|poisoned| {
            warn!("memory repository mutex was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    fn lock_concurrent(&self) -> MutexGuard<'_, Vec<PendingEdit>> {
        self.concurrent.lock().unwrap_or_else(|poisoned| {
            warn!("memory repository mutex was poisoned, recovering");
            poisoned.into_inner()
        })
    }
}

#[async_trait]
impl Repository for MemoryRepository {
    fn id(&self) -> &RepositoryId {
        &self.id
    }

    fn repository_type(&self) -> RepositoryType {
        RepositoryType::Memory
    }

    async fn query(&self, query: &Query) -> Result<Vec<Project>, RepositoryError> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        let mut snapshots: Vec<ProjectSnapshot> = self
            .lock_projects()
            .values()
            .filter(|s| query.matches(s))
            .cloned()
            .collect();
        snapshots.sort_by_key(|s| s.id);
        Ok(snapshots
            .into_iter()
            .map(|s| Project::loaded(s, self.id.clone()))
            .collect())
    }

    async fn save(&self, snapshot: &ProjectSnapshot) -> Result<ProjectSnapshot, RepositoryError> {
        let injected = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(RepositoryError::Persistence("injected save failure".into()));
        }

        self.run_concurrent_writes(snapshot.id);

        let stored = {
            let mut projects = self.lock_projects();
            check_basis(snapshot, projects.get(&snapshot.id).map(|s| s.version))?;
            let stored = next_revision(snapshot, RepositoryType::Memory);
            projects.insert(stored.id, stored.clone());
            stored
        };
        self.saves.fetch_add(1, Ordering::SeqCst);
        debug!(project_id = %stored.id, version = stored.version, "project saved");
        Ok(stored)
    }

    async fn delete(&self, id: Uuid) -> Result<(), RepositoryError> {
        match self.lock_projects().remove(&id) {
            Some(_) => Ok(()),
            None => Err(RepositoryError::NotFound(id)),
        }
    }

    fn add_change_listener(&self, listener: Arc<dyn ChangeListener>) -> ListenerId {
        self.listeners.add(listener)
    }

    fn remove_change_listener(&self, id: ListenerId) -> bool {
        self.listeners.remove(id)
    }
}
