//! The project manager: aggregated project list, current project and the
//! per-project lanes.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};

use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::lane::{self, LaneMsg};
use super::{
    ConflictCallback, StatsCounters, SyncOutcome, SyncSettings, SyncState, SyncStats,
};
use crate::errors::{RepositoryError, SyncError};
use crate::merge::{merge_project_sets, MergeConflict, MergeStrategy};
use crate::model::{lock_project, Project, ProjectSnapshot, SharedProject};
use crate::repository::{ChangeListener, ListenerId, Query, Repository, RepositoryId};

/// Published list of available projects.
pub type ProjectList = Arc<Vec<ProjectSnapshot>>;

/// Coordinates repositories, the aggregated project list and the
/// synchronization of individual projects.
///
/// Must be created inside a tokio runtime. Cloning yields another handle to
/// the same manager.
#[derive(Clone)]
pub struct ProjectManager {
    inner: Arc<Inner>,
}

struct Registered {
    repository: Arc<dyn Repository>,
    listener: ListenerId,
}

struct Lane {
    sender: mpsc::UnboundedSender<LaneMsg>,
    task: JoinHandle<()>,
}

pub(super) struct Inner {
    repositories: RwLock<BTreeMap<RepositoryId, Registered>>,
    available: RwLock<BTreeMap<Uuid, SharedProject>>,
    published: watch::Sender<ProjectList>,
    current: Mutex<Option<Uuid>>,
    states: Mutex<HashMap<Uuid, SyncState>>,
    callback: RwLock<Option<ConflictCallback>>,
    lanes: Mutex<HashMap<Uuid, Lane>>,
    aggregation: Mutex<Option<mpsc::UnboundedSender<()>>>,
    aggregation_task: Mutex<Option<JoinHandle<()>>>,
    /// Refresh generations requested and completed.
    requested: AtomicU64,
    completed: watch::Sender<u64>,
    shut_down: AtomicBool,
    /// Lanes may be started from repository notification threads.
    runtime: Handle,
    pub(super) settings: SyncSettings,
    pub(super) stats: StatsCounters,
}

fn recover<T>(result: Result<T, std::sync::PoisonError<T>>, what: &str) -> T {
    result.unwrap_or_else(|poisoned| {
        warn!(lock = what, "project manager lock was poisoned, recovering");
        poisoned.into_inner()
    })
}

impl ProjectManager {
    pub fn new(settings: SyncSettings) -> Self {
        let (aggregation_tx, aggregation_rx) = mpsc::unbounded_channel();
        let (published, _) = watch::channel(Arc::new(Vec::new()));
        let (completed, _) = watch::channel(0);

        let runtime = Handle::current();
        let inner = Arc::new_cyclic(|weak: &Weak<Inner>| {
            let task = runtime.spawn(run_aggregation(weak.clone(), aggregation_rx));
            Inner {
                repositories: RwLock::new(BTreeMap::new()),
                available: RwLock::new(BTreeMap::new()),
                published,
                current: Mutex::new(None),
                states: Mutex::new(HashMap::new()),
                callback: RwLock::new(None),
                lanes: Mutex::new(HashMap::new()),
                aggregation: Mutex::new(Some(aggregation_tx)),
                aggregation_task: Mutex::new(Some(task)),
                requested: AtomicU64::new(0),
                completed,
                shut_down: AtomicBool::new(false),
                runtime,
                settings,
                stats: StatsCounters::default(),
            }
        });

        info!(
            debounce_ms = settings.debounce.as_millis() as u64,
            max_delay_ms = settings.max_delay.as_millis() as u64,
            max_attempts = settings.max_attempts,
            "project manager created"
        );
        Self { inner }
    }

    // -----------------------------------------------------------------------
    // Repositories
    // -----------------------------------------------------------------------

    /// Register a repository, listen for its changes and schedule a refresh.
    /// A repository with the same id replaces the earlier one.
    pub fn add_repository(&self, repository: Arc<dyn Repository>) -> RepositoryId {
        let id = repository.id().clone();
        let listener = repository.add_change_listener(Arc::new(ManagerListener {
            inner: Arc::downgrade(&self.inner),
        }));
        let previous = self.inner.write_repositories().insert(
            id.clone(),
            Registered {
                repository,
                listener,
            },
        );
        if let Some(previous) = previous {
            previous.repository.remove_change_listener(previous.listener);
            warn!(repository = %id, "replaced repository with the same id");
        }
        info!(repository = %id, "repository added");
        self.inner.request_refresh();
        id
    }

    pub fn remove_repository(&self, id: &RepositoryId) -> bool {
        let removed = self.inner.write_repositories().remove(id);
        match removed {
            Some(registered) => {
                registered
                    .repository
                    .remove_change_listener(registered.listener);
                info!(repository = %id, "repository removed");
                self.inner.request_refresh();
                true
            }
            None => false,
        }
    }

    pub fn repository(&self, id: &RepositoryId) -> Option<Arc<dyn Repository>> {
        self.inner.repository(id)
    }

    pub fn repository_ids(&self) -> Vec<RepositoryId> {
        self.inner.read_repositories().keys().cloned().collect()
    }

    /// Set the function consulted whenever a cycle detects conflicts.
    pub fn register_conflict_callback(
        &self,
        callback: impl Fn(&[MergeConflict]) -> MergeStrategy + Send + Sync + 'static,
    ) {
        *recover(self.inner.callback.write(), "callback") = Some(Arc::new(callback));
    }

    // -----------------------------------------------------------------------
    // Available projects
    // -----------------------------------------------------------------------

    /// The aggregated projects, ordered by id.
    pub fn available_projects(&self) -> Vec<SharedProject> {
        self.inner.read_available().values().cloned().collect()
    }

    pub fn project(&self, id: Uuid) -> Option<SharedProject> {
        self.inner.read_available().get(&id).cloned()
    }

    /// A receiver that sees every new version of the available project list.
    pub fn subscribe(&self) -> watch::Receiver<ProjectList> {
        self.inner.published.subscribe()
    }

    /// Schedule an aggregation run and return its generation. Requests made
    /// while a run is in flight coalesce into one more run.
    pub fn refresh(&self) -> u64 {
        self.inner.request_refresh()
    }

    /// Schedule an aggregation run and wait until it has completed.
    pub async fn refresh_and_wait(&self) -> Result<(), SyncError> {
        self.inner.ensure_running()?;
        let mut completed = self.inner.completed.subscribe();
        let generation = self.inner.request_refresh();
        let inner = &self.inner;
        completed
            .wait_for(|done| *done >= generation || inner.is_shut_down())
            .await
            .map_err(|_| SyncError::ShutDown)?;
        inner.ensure_running()
    }

    /// Create a project in `repository`, save it and make it available.
    #[instrument(skip(self, repository), fields(repository = %repository))]
    pub async fn create_project(
        &self,
        repository: &RepositoryId,
        name: &str,
    ) -> Result<SharedProject, SyncError> {
        self.inner.ensure_running()?;
        let repo = self
            .inner
            .repository(repository)
            .ok_or_else(|| SyncError::UnknownRepository(repository.to_string()))?;
        let project = repo.create(name);
        let saved = repo.save(project.working()).await?;
        let shared = Project::loaded(saved, repository.clone()).into_shared();
        let id = lock_project(&shared).id();
        self.inner.write_available().insert(id, shared.clone());
        self.inner.publish();
        info!(project_id = %id, "project created");
        Ok(shared)
    }

    // -----------------------------------------------------------------------
    // Current project
    // -----------------------------------------------------------------------

    /// Make `id` the project whose local edits are synchronized, or detach
    /// the current one with `None`. An in-flight cycle of the previous
    /// project is not cancelled.
    pub fn set_current_project(&self, id: Option<Uuid>) -> Result<(), SyncError> {
        self.inner.ensure_running()?;
        if let Some(id) = id {
            let shared = self.project(id).ok_or(SyncError::UnknownProject(id))?;
            self.inner.ensure_lane(id, &shared);
        }
        let previous = std::mem::replace(&mut *self.inner.lock_current(), id);
        if previous != id {
            info!(previous = ?previous, current = ?id, "current project changed");
        }
        Ok(())
    }

    pub fn current_project(&self) -> Option<SharedProject> {
        let id = self.inner.current_id()?;
        self.project(id)
    }

    /// Report that the current project was edited. Returns `false` when `id`
    /// is not the current project.
    pub fn notify_local_edit(&self, id: Uuid) -> bool {
        if self.inner.is_shut_down() || !self.inner.is_current(id) {
            return false;
        }
        self.inner.send_to_lane(id, LaneMsg::LocalEdit)
    }

    // -----------------------------------------------------------------------
    // Per-project operations
    // -----------------------------------------------------------------------

    /// Run a cycle for `id` on its lane and wait for the outcome.
    pub async fn synchronize(&self, id: Uuid) -> Result<SyncOutcome, SyncError> {
        let (reply, outcome) = oneshot::channel();
        self.submit(id, LaneMsg::Synchronize(reply))?;
        outcome.await.map_err(|_| SyncError::ShutDown)?
    }

    /// Move `id` into the repository `target`.
    pub async fn move_project(&self, id: Uuid, target: &RepositoryId) -> Result<(), SyncError> {
        if self.inner.repository(target).is_none() {
            return Err(SyncError::UnknownRepository(target.to_string()));
        }
        let (reply, done) = oneshot::channel();
        self.submit(
            id,
            LaneMsg::Move {
                target: target.clone(),
                reply,
            },
        )?;
        done.await.map_err(|_| SyncError::ShutDown)?
    }

    /// Delete `id` from its repository and forget it.
    pub async fn delete_project(&self, id: Uuid) -> Result<(), SyncError> {
        self.inner.ensure_running()?;
        let shared = self.project(id).ok_or(SyncError::UnknownProject(id))?;
        if let Some(lane) = self.inner.lock_lanes().remove(&id) {
            let _ = lane.sender.send(LaneMsg::Shutdown);
            if let Err(e) = lane.task.await {
                warn!(project_id = %id, error = %e, "lane ended abnormally");
            }
        }

        let repository_id = lock_project(&shared).repository().cloned();
        if let Some(repository) = repository_id.as_ref().and_then(|r| self.inner.repository(r)) {
            match repository.delete(id).await {
                Ok(()) => {}
                Err(RepositoryError::NotFound(_)) => {
                    debug!(project_id = %id, "project was not stored");
                }
                Err(e) => return Err(e.into()),
            }
        }

        self.inner.write_available().remove(&id);
        self.inner.lock_states().remove(&id);
        {
            let mut current = self.inner.lock_current();
            if *current == Some(id) {
                *current = None;
            }
        }
        // A change notification may have restarted the lane meanwhile.
        if let Some(lane) = self.inner.lock_lanes().remove(&id) {
            let _ = lane.sender.send(LaneMsg::Shutdown);
        }
        self.inner.publish();
        info!(project_id = %id, "project deleted");
        Ok(())
    }

    pub fn state(&self, id: Uuid) -> SyncState {
        self.inner.state_of(id)
    }

    pub fn stats(&self) -> SyncStats {
        self.inner.stats.snapshot()
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.inner.settings
    }

    // -----------------------------------------------------------------------
    // Shutdown
    // -----------------------------------------------------------------------

    /// Detach from every repository and stop all lanes once their in-flight
    /// work is done. Later operations fail with [`SyncError::ShutDown`].
    pub async fn shutdown(&self) {
        if self.inner.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("shutting down project manager");

        let registered: Vec<(RepositoryId, Registered)> =
            std::mem::take(&mut *self.inner.write_repositories())
                .into_iter()
                .collect();
        for (_, registered) in registered {
            registered
                .repository
                .remove_change_listener(registered.listener);
        }

        let lanes: Vec<(Uuid, Lane)> = self.inner.lock_lanes().drain().collect();
        for (_, lane) in &lanes {
            let _ = lane.sender.send(LaneMsg::Shutdown);
        }
        for (id, lane) in lanes {
            if let Err(e) = lane.task.await {
                warn!(project_id = %id, error = %e, "lane ended abnormally");
            }
        }

        self.inner.lock_aggregation().take();
        let task = recover(self.inner.aggregation_task.lock(), "aggregation").take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(error = %e, "aggregation task ended abnormally");
            }
        }
        // Wake callers still waiting for a refresh that will never run.
        self.inner.completed.send_modify(|_| {});
        info!("project manager stopped");
    }

    fn submit(&self, id: Uuid, msg: LaneMsg) -> Result<(), SyncError> {
        self.inner.ensure_running()?;
        let shared = self.project(id).ok_or(SyncError::UnknownProject(id))?;
        let sender = self.inner.ensure_lane(id, &shared);
        sender.send(msg).map_err(|_| SyncError::ShutDown)
    }
}

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

impl Inner {
    pub(super) fn repository(&self, id: &RepositoryId) -> Option<Arc<dyn Repository>> {
        self.read_repositories()
            .get(id)
            .map(|r| r.repository.clone())
    }

    pub(super) fn set_state(&self, id: Uuid, state: SyncState) {
        self.lock_states().insert(id, state);
    }

    fn state_of(&self, id: Uuid) -> SyncState {
        self.lock_states().get(&id).copied().unwrap_or_default()
    }

    pub(super) fn is_current(&self, id: Uuid) -> bool {
        self.current_id() == Some(id)
    }

    /// Strategy for a non-empty conflict list. Without a callback, and when
    /// the callback answers `DryRun`, conflicts are left open and the cycle
    /// saves nothing.
    pub(super) fn conflict_strategy(&self, conflicts: &[MergeConflict]) -> MergeStrategy {
        let callback = recover(self.callback.read(), "callback").clone();
        match callback.map(|cb| cb(conflicts)) {
            Some(MergeStrategy::DryRun) | None => MergeStrategy::Default,
            Some(strategy) => strategy,
        }
    }

    pub(super) fn request_refresh(&self) -> u64 {
        let generation = self.requested.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(sender) = self.lock_aggregation().as_ref() {
            let _ = sender.send(());
        }
        generation
    }

    fn current_id(&self) -> Option<Uuid> {
        *self.lock_current()
    }

    fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    fn ensure_running(&self) -> Result<(), SyncError> {
        if self.is_shut_down() {
            Err(SyncError::ShutDown)
        } else {
            Ok(())
        }
    }

    /// The lane of project `id`, started if it is not running.
    fn ensure_lane(self: &Arc<Self>, id: Uuid, project: &SharedProject) -> mpsc::UnboundedSender<LaneMsg> {
        let mut lanes = self.lock_lanes();
        if let Some(lane) = lanes.get(&id) {
            if !lane.sender.is_closed() {
                return lane.sender.clone();
            }
        }
        let (sender, rx) = mpsc::unbounded_channel();
        let task = self.runtime.spawn(lane::run(
            Arc::downgrade(self),
            project.clone(),
            rx,
            self.settings,
        ));
        lanes.insert(
            id,
            Lane {
                sender: sender.clone(),
                task,
            },
        );
        sender
    }

    fn send_to_lane(self: &Arc<Self>, id: Uuid, msg: LaneMsg) -> bool {
        let Some(project) = self.read_available().get(&id).cloned() else {
            return false;
        };
        self.ensure_lane(id, &project).send(msg).is_ok()
    }

    fn publish(&self) {
        let snapshots: Vec<ProjectSnapshot> = self
            .read_available()
            .values()
            .map(|p| lock_project(p).snapshot())
            .collect();
        self.published.send_replace(Arc::new(snapshots));
    }

    // -----------------------------------------------------------------------
    // Aggregation
    // -----------------------------------------------------------------------

    async fn aggregate(self: &Arc<Self>) {
        let repositories: Vec<Arc<dyn Repository>> = self
            .read_repositories()
            .values()
            .map(|r| r.repository.clone())
            .collect();
        // Projects created while the queries run are not in any result yet.
        let seen: HashSet<Uuid> = self.read_available().keys().copied().collect();

        let mut results = Vec::with_capacity(repositories.len());
        let mut unreachable: HashSet<RepositoryId> = HashSet::new();
        for repository in &repositories {
            match repository.query(&Query::All).await {
                Ok(projects) => {
                    debug!(repository = %repository.id(), count = projects.len(), "queried repository");
                    results.push(projects);
                }
                Err(e) => {
                    warn!(
                        repository = %repository.id(),
                        error = %e,
                        "repository unavailable, keeping its last known projects"
                    );
                    unreachable.insert(repository.id().clone());
                }
            }
        }

        // Projects of unreachable repositories are carried over untouched.
        let mut known = Vec::new();
        let mut stale = HashSet::new();
        for (id, shared) in self.read_available().iter() {
            if !seen.contains(id) {
                continue;
            }
            let project = lock_project(shared).clone();
            match project.repository() {
                Some(repository) if unreachable.contains(repository) => {
                    stale.insert(*id);
                }
                _ => known.push(project),
            }
        }

        let merged = match merge_project_sets(known, results) {
            Ok(merged) => merged,
            Err(e) => {
                error!(error = %e, "aggregation failed");
                return;
            }
        };
        self.replace_available(merged, &stale, &seen);
        self.stats.aggregation();
    }

    /// Swap in the aggregated projects. Existing projects keep their shared
    /// handle; the current project is never overwritten, its lane is told
    /// about a newer stored version instead.
    fn replace_available(
        self: &Arc<Self>,
        merged: Vec<Project>,
        stale: &HashSet<Uuid>,
        seen: &HashSet<Uuid>,
    ) {
        let current = self.current_id();
        let mut current_changed = false;
        let dropped: Vec<Uuid>;
        let count;
        {
            let mut available = self.write_available();
            let mut next: BTreeMap<Uuid, SharedProject> = BTreeMap::new();
            for project in merged {
                let id = project.id();
                let shared = match available.remove(&id) {
                    Some(shared) => {
                        let idle = self.state_of(id) == SyncState::Idle;
                        let mut live = lock_project(&shared);
                        if current == Some(id) {
                            current_changed = live.baseline() != project.baseline();
                        } else if idle && !live.is_dirty() && live.version() <= project.version() {
                            *live = project;
                        } else {
                            debug!(
                                project_id = %id,
                                idle,
                                live_version = live.version(),
                                fetched_version = project.version(),
                                "keeping live project over refreshed copy"
                            );
                        }
                        drop(live);
                        shared
                    }
                    None => project.into_shared(),
                };
                next.insert(id, shared);
            }
            for id in stale {
                if let Some(shared) = available.remove(id) {
                    next.insert(*id, shared);
                }
            }
            if let Some(id) = current {
                if let Some(shared) = available.remove(&id) {
                    warn!(project_id = %id, "current project is in no repository, keeping it");
                    next.insert(id, shared);
                }
            }
            let created: Vec<Uuid> = available
                .keys()
                .filter(|id| !seen.contains(id))
                .copied()
                .collect();
            for id in created {
                if let Some(shared) = available.remove(&id) {
                    next.insert(id, shared);
                }
            }
            dropped = available.keys().copied().collect();
            count = next.len();
            *available = next;
        }

        if !dropped.is_empty() {
            let mut lanes = self.lock_lanes();
            let mut states = self.lock_states();
            for id in &dropped {
                if let Some(lane) = lanes.remove(id) {
                    let _ = lane.sender.send(LaneMsg::Shutdown);
                }
                states.remove(id);
            }
        }
        if let (Some(id), true) = (current, current_changed) {
            debug!(project_id = %id, "stored copy of current project changed");
            self.send_to_lane(id, LaneMsg::RepositoryChanged);
        }

        self.publish();
        info!(count, dropped = dropped.len(), stale = stale.len(), "available projects updated");
    }

    // -----------------------------------------------------------------------
    // Lock helpers
    // -----------------------------------------------------------------------

    fn read_repositories(&self) -> RwLockReadGuard<'_, BTreeMap<RepositoryId, Registered>> {
        recover(self.repositories.read(), "repositories")
    }

    fn write_repositories(&self) -> RwLockWriteGuard<'_, BTreeMap<RepositoryId, Registered>> {
        recover(self.repositories.write(), "repositories")
    }

    fn read_available(&self) -> RwLockReadGuard<'_, BTreeMap<Uuid, SharedProject>> {
        recover(self.available.read(), "available")
    }

    fn write_available(&self) -> RwLockWriteGuard<'_, BTreeMap<Uuid, SharedProject>> {
        recover(self.available.write(), "available")
    }

    fn lock_current(&self) -> MutexGuard<'_, Option<Uuid>> {
        recover(self.current.lock(), "current")
    }

    fn lock_states(&self) -> MutexGuard<'_, HashMap<Uuid, SyncState>> {
        recover(self.states.lock(), "states")
    }

    fn lock_lanes(&self) -> MutexGuard<'_, HashMap<Uuid, Lane>> {
        recover(self.lanes.lock(), "lanes")
    }

    fn lock_aggregation(&self) -> MutexGuard<'_, Option<mpsc::UnboundedSender<()>>> {
        recover(self.aggregation.lock(), "aggregation")
    }
}

/// Aggregation lane: one run per batch of requests.
async fn run_aggregation(inner: Weak<Inner>, mut rx: mpsc::UnboundedReceiver<()>) {
    while rx.recv().await.is_some() {
        while rx.try_recv().is_ok() {}
        let Some(inner) = inner.upgrade() else { break };
        if inner.is_shut_down() {
            break;
        }
        let target = inner.requested.load(Ordering::SeqCst);
        inner.aggregate().await;
        inner.completed.send_replace(target);
    }
    debug!("aggregation lane stopped");
}

// ---------------------------------------------------------------------------
// Repository change listener
// ---------------------------------------------------------------------------

struct ManagerListener {
    inner: Weak<Inner>,
}

impl ChangeListener for ManagerListener {
    fn project_changed(&self, repository: &RepositoryId, project: Project) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        let id = project.id();
        if inner.is_current(id) && inner.send_to_lane(id, LaneMsg::RepositoryChanged) {
            debug!(project_id = %id, repository = %repository, "current project changed in repository");
        } else {
            debug!(project_id = %id, repository = %repository, "project changed in repository, refreshing");
            inner.request_refresh();
        }
    }

    fn project_removed(&self, repository: &RepositoryId, id: Uuid) {
        if let Some(inner) = self.inner.upgrade() {
            debug!(project_id = %id, repository = %repository, "project removed from repository, refreshing");
            inner.request_refresh();
        }
    }
}
