//! Storage backends for projects.
//!
//! Every backend implements [`Repository`]. Saves use optimistic
//! concurrency: a snapshot is saved *based on* the version it carries, and
//! the save fails with [`RepositoryError::Outdated`] when the stored version
//! has moved on. A successful save stores `version + 1`.

pub mod cloud;
pub mod local;
pub mod memory;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use tracing::warn;
use uuid::Uuid;

use crate::errors::RepositoryError;
use crate::model::{Project, ProjectSnapshot, RepositoryType};
use crate::resource::ResourceResolver;

pub use cloud::CloudRepository;
pub use local::LocalRepository;
pub use memory::MemoryRepository;

/// Identifies one repository instance, e.g. `local:/home/me/projects`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RepositoryId(String);

impl RepositoryId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RepositoryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Selects projects in a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Query {
    All,
    ById(Uuid),
}

impl Query {
    pub fn matches(&self, snapshot: &ProjectSnapshot) -> bool {
        match self {
            Self::All => true,
            Self::ById(id) => snapshot.id == *id,
        }
    }
}

/// Notified when a repository observes a change it did not make itself.
pub trait ChangeListener: Send + Sync {
    fn project_changed(&self, repository: &RepositoryId, project: Project);

    fn project_removed(&self, _repository: &RepositoryId, _id: Uuid) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Listener bookkeeping shared by the repository implementations.
#[derive(Default)]
pub struct ListenerRegistry {
    next: AtomicU64,
    listeners: Mutex<Vec<(ListenerId, Arc<dyn ChangeListener>)>>,
}

impl ListenerRegistry {
    pub fn add(&self, listener: Arc<dyn ChangeListener>) -> ListenerId {
        let id = ListenerId(self.next.fetch_add(1, Ordering::Relaxed));
        self.lock().push((id, listener));
        id
    }

    pub fn remove(&self, id: ListenerId) -> bool {
        let mut listeners = self.lock();
        let before = listeners.len();
        listeners.retain(|(l, _)| *l != id);
        listeners.len() != before
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deliver `project` to every listener. Listeners are called outside the
    /// registry lock so they may add or remove listeners.
    pub fn notify(&self, repository: &RepositoryId, project: &Project) {
        let listeners: Vec<Arc<dyn ChangeListener>> =
            self.lock().iter().map(|(_, l)| l.clone()).collect();
        for listener in listeners {
            listener.project_changed(repository, project.clone());
        }
    }

    pub fn notify_removed(&self, repository: &RepositoryId, id: Uuid) {
        let listeners: Vec<Arc<dyn ChangeListener>> =
            self.lock().iter().map(|(_, l)| l.clone()).collect();
        for listener in listeners {
            listener.project_removed(repository, id);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<(ListenerId, Arc<dyn ChangeListener>)>> {
        self.listeners.lock().unwrap_or_else(|poisoned| {
            warn!("listener registry mutex was poisoned, recovering");
            poisoned.into_inner()
        })
    }
}

/// A project store.
#[async_trait]
pub trait Repository: Send + Sync {
    fn id(&self) -> &RepositoryId;

    fn repository_type(&self) -> RepositoryType;

    /// A new, unsaved project tagged for this repository.
    fn create(&self, name: &str) -> Project {
        let mut project = Project::new(ProjectSnapshot::new(name, self.repository_type()));
        project.set_repository(self.id().clone());
        project
    }

    /// Projects matching `query`, each stamped with this repository and with
    /// the stored value as its baseline.
    async fn query(&self, query: &Query) -> Result<Vec<Project>, RepositoryError>;

    /// Store `snapshot` based on its `version`; returns the stored value.
    async fn save(&self, snapshot: &ProjectSnapshot) -> Result<ProjectSnapshot, RepositoryError>;

    async fn delete(&self, id: Uuid) -> Result<(), RepositoryError>;

    fn add_change_listener(&self, listener: Arc<dyn ChangeListener>) -> ListenerId;

    fn remove_change_listener(&self, id: ListenerId) -> bool;

    /// Attachment access for one project, if the backend stores attachments.
    fn resource_resolver(&self, _project: Uuid) -> Option<Box<dyn ResourceResolver>> {
        None
    }
}

/// Version check shared by the backends: `stored` is the currently stored
/// version, `None` if the project does not exist yet.
pub(crate) fn check_basis(
    snapshot: &ProjectSnapshot,
    stored: Option<u64>,
) -> Result<(), RepositoryError> {
    match stored {
        Some(stored) if stored != snapshot.version => Err(RepositoryError::Outdated {
            id: snapshot.id,
            stored_version: Some(stored),
            basis_version: snapshot.version,
        }),
        _ => Ok(()),
    }
}

/// The value a backend stores for an accepted save.
pub(crate) fn next_revision(snapshot: &ProjectSnapshot, repository_type: RepositoryType) -> ProjectSnapshot {
    let mut stored = snapshot.clone();
    stored.version = snapshot.version + 1;
    stored.modified = Utc::now();
    stored.repository_type = repository_type;
    stored
}
