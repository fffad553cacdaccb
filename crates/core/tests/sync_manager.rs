//! Project manager tests against in-memory repositories.
//!
//! Timing-sensitive tests run on a paused tokio clock, so the debounce
//! window is measured in virtual time.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Notify, Semaphore};
use uuid::Uuid;

use projectsync_core::errors::{RepositoryError, SyncError};
use projectsync_core::merge::{MergeConflict, MergeStrategy};
use projectsync_core::model::{lock_project, Goal, GoalKind, Project, ProjectSnapshot, RepositoryType};
use projectsync_core::repository::{
    ChangeListener, ListenerId, MemoryRepository, Query, Repository, RepositoryId,
};
use projectsync_core::sync::{ProjectManager, SyncOutcome, SyncSettings, SyncState};

// ===========================================================================
// Helpers
// ===========================================================================

fn settings() -> SyncSettings {
    SyncSettings {
        debounce: Duration::from_millis(250),
        max_delay: Duration::from_secs(2),
        max_attempts: 0,
        backoff_base: Duration::from_millis(5),
        backoff_max: Duration::from_millis(40),
    }
}

async fn manager_with(repo: &Arc<MemoryRepository>) -> (ProjectManager, RepositoryId) {
    let manager = ProjectManager::new(settings());
    let repo_id = manager.add_repository(repo.clone());
    manager.refresh_and_wait().await.unwrap();
    (manager, repo_id)
}

fn project_id(project: &projectsync_core::SharedProject) -> Uuid {
    lock_project(project).id()
}

/// A repository that can be switched offline; queries then fail.
struct FlakyRepository {
    inner: MemoryRepository,
    offline: AtomicBool,
}

impl FlakyRepository {
    fn new(id: &str) -> Arc<Self> {
        Arc::new(Self {
            inner: MemoryRepository::new(id),
            offline: AtomicBool::new(false),
        })
    }

    fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }
}

#[async_trait]
impl Repository for FlakyRepository {
    fn id(&self) -> &RepositoryId {
        self.inner.id()
    }

    fn repository_type(&self) -> RepositoryType {
        RepositoryType::Cloud
    }

    async fn query(&self, query: &Query) -> Result<Vec<Project>, RepositoryError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(RepositoryError::Persistence("service unreachable".into()));
        }
        self.inner.query(query).await
    }

    async fn save(&self, snapshot: &ProjectSnapshot) -> Result<ProjectSnapshot, RepositoryError> {
        self.inner.save(snapshot).await
    }

    async fn delete(&self, id: Uuid) -> Result<(), RepositoryError> {
        self.inner.delete(id).await
    }

    fn add_change_listener(&self, listener: Arc<dyn ChangeListener>) -> ListenerId {
        self.inner.add_change_listener(listener)
    }

    fn remove_change_listener(&self, id: ListenerId) -> bool {
        self.inner.remove_change_listener(id)
    }
}

/// A repository whose saves, or listings, can be held until the test
/// releases them. A held listing answers with what was stored when it was
/// asked.
struct GatedRepository {
    inner: MemoryRepository,
    hold_saves: AtomicBool,
    hold_listings: AtomicBool,
    entered: Notify,
    release: Semaphore,
}

impl GatedRepository {
    fn new(id: &str) -> Arc<Self> {
        Arc::new(Self {
            inner: MemoryRepository::new(id),
            hold_saves: AtomicBool::new(false),
            hold_listings: AtomicBool::new(false),
            entered: Notify::new(),
            release: Semaphore::new(0),
        })
    }

    fn hold_saves(&self, hold: bool) {
        self.hold_saves.store(hold, Ordering::SeqCst);
    }

    fn hold_listings(&self, hold: bool) {
        self.hold_listings.store(hold, Ordering::SeqCst);
    }

    async fn wait_for_release(&self) -> Result<(), RepositoryError> {
        self.entered.notify_one();
        self.release
            .acquire()
            .await
            .map_err(|_| RepositoryError::Persistence("gate closed".into()))?
            .forget();
        Ok(())
    }
}

#[async_trait]
impl Repository for GatedRepository {
    fn id(&self) -> &RepositoryId {
        self.inner.id()
    }

    fn repository_type(&self) -> RepositoryType {
        RepositoryType::Memory
    }

    async fn query(&self, query: &Query) -> Result<Vec<Project>, RepositoryError> {
        let found = self.inner.query(query).await;
        if matches!(query, Query::All) && self.hold_listings.load(Ordering::SeqCst) {
            self.wait_for_release().await?;
        }
        found
    }

    async fn save(&self, snapshot: &ProjectSnapshot) -> Result<ProjectSnapshot, RepositoryError> {
        if self.hold_saves.load(Ordering::SeqCst) {
            self.wait_for_release().await?;
        }
        self.inner.save(snapshot).await
    }

    async fn delete(&self, id: Uuid) -> Result<(), RepositoryError> {
        self.inner.delete(id).await
    }

    fn add_change_listener(&self, listener: Arc<dyn ChangeListener>) -> ListenerId {
        self.inner.add_change_listener(listener)
    }

    fn remove_change_listener(&self, id: ListenerId) -> bool {
        self.inner.remove_change_listener(id)
    }
}

// ===========================================================================
// Debounce
// ===========================================================================

#[tokio::test(start_paused = true)]
async fn test_edits_within_window_collapse_into_one_save() {
    let repo = MemoryRepository::shared("memory:test");
    let (manager, repo_id) = manager_with(&repo).await;
    let project = manager.create_project(&repo_id, "Survey").await.unwrap();
    let id = project_id(&project);
    manager.set_current_project(Some(id)).unwrap();
    let saves_before = repo.save_count();

    for i in 0..5 {
        lock_project(&project).set_name(format!("Survey {}", i));
        assert!(manager.notify_local_edit(id));
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert_eq!(repo.save_count(), saves_before + 1);
    assert_eq!(repo.get(id).unwrap().name, "Survey 4");
    let live = lock_project(&project);
    assert!(!live.is_dirty());
    assert_eq!(live.version(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_spaced_edits_each_get_a_cycle() {
    let repo = MemoryRepository::shared("memory:test");
    let (manager, repo_id) = manager_with(&repo).await;
    let project = manager.create_project(&repo_id, "Survey").await.unwrap();
    let id = project_id(&project);
    manager.set_current_project(Some(id)).unwrap();
    let saves_before = repo.save_count();

    for i in 0..3 {
        lock_project(&project).set_name(format!("Survey {}", i));
        manager.notify_local_edit(id);
        tokio::time::sleep(Duration::from_millis(600)).await;
    }

    assert_eq!(repo.save_count(), saves_before + 3);
    assert_eq!(manager.stats().cycles, 3);
    assert_eq!(manager.state(id), SyncState::Idle);
}

#[tokio::test(start_paused = true)]
async fn test_continuous_editing_still_saves() {
    let repo = MemoryRepository::shared("memory:test");
    let (manager, repo_id) = manager_with(&repo).await;
    let project = manager.create_project(&repo_id, "Survey").await.unwrap();
    let id = project_id(&project);
    manager.set_current_project(Some(id)).unwrap();
    let saves_before = repo.save_count();

    // Edits 100 ms apart never leave a 250 ms quiet period.
    for i in 0..25 {
        lock_project(&project).set_name(format!("Survey {}", i));
        manager.notify_local_edit(id);
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(repo.save_count() > saves_before);
    assert_ne!(repo.get(id).unwrap().name, "Survey");

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(repo.get(id).unwrap().name, "Survey 24");
    assert!(repo.save_count() <= saves_before + 3);
    assert!(!lock_project(&project).is_dirty());
}

#[tokio::test(start_paused = true)]
async fn test_edits_of_detached_project_are_dropped() {
    let repo = MemoryRepository::shared("memory:test");
    let (manager, repo_id) = manager_with(&repo).await;
    let project = manager.create_project(&repo_id, "Survey").await.unwrap();
    let id = project_id(&project);
    manager.set_current_project(Some(id)).unwrap();
    let saves_before = repo.save_count();

    lock_project(&project).set_name("Edited");
    assert!(manager.notify_local_edit(id));
    manager.set_current_project(None).unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert_eq!(repo.save_count(), saves_before);
    assert!(!manager.notify_local_edit(id));
    assert!(lock_project(&project).is_dirty());
}

// ===========================================================================
// Merge/save cycle
// ===========================================================================

#[tokio::test]
async fn test_outdated_save_retries_until_it_converges() {
    let repo = MemoryRepository::shared("memory:test");
    let (manager, repo_id) = manager_with(&repo).await;
    let project = manager.create_project(&repo_id, "Survey").await.unwrap();
    let id = project_id(&project);

    let goal = Goal::new("North field", GoalKind::Area);
    let goal_id = goal.id;
    lock_project(&project).add_goal(goal);
    repo.inject_concurrent_write(|s| s.name = "Renamed elsewhere".into());

    let outcome = manager.synchronize(id).await.unwrap();
    assert_eq!(
        outcome,
        SyncOutcome::Saved {
            version: 3,
            attempts: 2
        }
    );
    assert_eq!(manager.stats().retries, 1);

    let stored = repo.get(id).unwrap();
    assert_eq!(stored.name, "Renamed elsewhere");
    assert!(stored.goal(&goal_id).is_some());
    let live = lock_project(&project);
    assert_eq!(live.working(), &stored);
    assert!(!live.has_conflicts());
}

#[tokio::test]
async fn test_two_managers_converge() {
    let repo = MemoryRepository::shared("memory:shared");
    let (first, repo_id) = manager_with(&repo).await;
    let (second, _) = manager_with(&repo).await;

    let project_a = first.create_project(&repo_id, "Survey").await.unwrap();
    let id = project_id(&project_a);
    second.refresh_and_wait().await.unwrap();
    let project_b = second.project(id).unwrap();

    lock_project(&project_a).set_name("Renamed");
    let goal = Goal::new("Field", GoalKind::Area);
    let goal_id = goal.id;
    lock_project(&project_b).add_goal(goal);

    first.synchronize(id).await.unwrap();
    second.synchronize(id).await.unwrap();
    first.refresh_and_wait().await.unwrap();

    let a = lock_project(&project_a).snapshot();
    let b = lock_project(&project_b).snapshot();
    assert_eq!(a, b);
    assert_eq!(a.name, "Renamed");
    assert!(a.goal(&goal_id).is_some());
    assert_eq!(repo.get(id).unwrap(), a);
}

#[tokio::test]
async fn test_bounded_retries_give_up() {
    let repo = MemoryRepository::shared("memory:test");
    let manager = ProjectManager::new(SyncSettings {
        max_attempts: 1,
        ..settings()
    });
    let repo_id = manager.add_repository(repo.clone());
    manager.refresh_and_wait().await.unwrap();
    let project = manager.create_project(&repo_id, "Survey").await.unwrap();
    let id = project_id(&project);

    lock_project(&project).set_name("Ours");
    repo.inject_concurrent_write(|s| s.users.clear());

    let err = manager.synchronize(id).await.unwrap_err();
    assert!(matches!(
        err,
        SyncError::RetriesExhausted { attempts: 1, .. }
    ));
    assert_eq!(manager.state(id), SyncState::Idle);
}

#[tokio::test]
async fn test_persistence_failure_is_surfaced() {
    let repo = MemoryRepository::shared("memory:test");
    let (manager, repo_id) = manager_with(&repo).await;
    let project = manager.create_project(&repo_id, "Survey").await.unwrap();
    let id = project_id(&project);

    lock_project(&project).set_name("Ours");
    repo.fail_next_saves(1);
    let err = manager.synchronize(id).await.unwrap_err();
    assert!(matches!(
        err,
        SyncError::Repository(RepositoryError::Persistence(_))
    ));
    assert_eq!(manager.state(id), SyncState::Idle);
    assert_eq!(manager.stats().failures, 1);
    assert!(lock_project(&project).is_dirty());

    // Nothing was lost; the next cycle saves.
    assert!(matches!(
        manager.synchronize(id).await.unwrap(),
        SyncOutcome::Saved { .. }
    ));
    assert_eq!(repo.get(id).unwrap().name, "Ours");
}

#[tokio::test]
async fn test_clean_project_is_unchanged() {
    let repo = MemoryRepository::shared("memory:test");
    let (manager, repo_id) = manager_with(&repo).await;
    let project = manager.create_project(&repo_id, "Survey").await.unwrap();
    let saves_before = repo.save_count();

    let outcome = manager.synchronize(project_id(&project)).await.unwrap();
    assert_eq!(outcome, SyncOutcome::Unchanged);
    assert_eq!(repo.save_count(), saves_before);
}

#[tokio::test]
async fn test_repository_change_is_taken_over_without_saving() {
    let repo = MemoryRepository::shared("memory:test");
    let (manager, repo_id) = manager_with(&repo).await;
    let project = manager.create_project(&repo_id, "Survey").await.unwrap();
    let id = project_id(&project);

    let mut external = repo.get(id).unwrap();
    external.name = "Changed elsewhere".into();
    repo.put_external(external);
    let saves_before = repo.save_count();

    let outcome = manager.synchronize(id).await.unwrap();
    assert!(matches!(
        outcome,
        SyncOutcome::Updated { version: 2 } | SyncOutcome::Unchanged
    ));
    assert_eq!(repo.save_count(), saves_before);
    assert_eq!(lock_project(&project).name(), "Changed elsewhere");
}

// ===========================================================================
// Conflicts
// ===========================================================================

#[tokio::test]
async fn test_conflict_callback_chooses_strategy() {
    let repo = MemoryRepository::shared("memory:test");
    let (manager, repo_id) = manager_with(&repo).await;
    let project = manager.create_project(&repo_id, "Survey").await.unwrap();
    let id = project_id(&project);
    manager.set_current_project(Some(id)).unwrap();

    let seen: Arc<Mutex<Vec<MergeConflict>>> = Arc::new(Mutex::new(Vec::new()));
    let calls = Arc::new(AtomicUsize::new(0));
    {
        let seen = seen.clone();
        let calls = calls.clone();
        manager.register_conflict_callback(move |conflicts| {
            calls.fetch_add(1, Ordering::SeqCst);
            seen.lock().unwrap().extend_from_slice(conflicts);
            MergeStrategy::KeepOurs
        });
    }

    lock_project(&project).set_name("Ours");
    let mut external = repo.get(id).unwrap();
    external.name = "Theirs".into();
    // The change notification reaches the current project's lane.
    repo.put_external(external);
    manager.synchronize(id).await.unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].field, "name");
    assert_eq!(repo.get(id).unwrap().name, "Ours");
    assert!(!lock_project(&project).has_conflicts());
    assert_eq!(manager.stats().conflicts, 1);
}

#[tokio::test]
async fn test_conflicts_without_callback_are_left_open() {
    let repo = MemoryRepository::shared("memory:test");
    let (manager, repo_id) = manager_with(&repo).await;
    let project = manager.create_project(&repo_id, "Survey").await.unwrap();
    let id = project_id(&project);
    manager.set_current_project(Some(id)).unwrap();
    let saves_before = repo.save_count();

    lock_project(&project).set_name("Ours");
    let mut external = repo.get(id).unwrap();
    external.name = "Theirs".into();
    repo.put_external(external);

    let outcome = manager.synchronize(id).await.unwrap();
    assert_eq!(outcome, SyncOutcome::Conflicted { conflicts: 1 });
    assert_eq!(repo.get(id).unwrap().name, "Theirs");
    assert_eq!(repo.save_count(), saves_before);
    {
        let live = lock_project(&project);
        assert_eq!(live.name(), "Ours");
        assert_eq!(live.conflicts().len(), 1);
        assert_eq!(live.conflicts()[0].field, "name");
        assert_eq!(live.baseline().map(|b| b.name.as_str()), Some("Survey"));
    }

    // Asking again does not push our side over theirs.
    assert_eq!(
        manager.synchronize(id).await.unwrap(),
        SyncOutcome::Conflicted { conflicts: 1 }
    );
    assert_eq!(repo.get(id).unwrap().name, "Theirs");
    assert_eq!(repo.save_count(), saves_before);

    // Settling the field locally lets the stored copy through.
    lock_project(&project).set_name("Theirs");
    assert_eq!(
        manager.synchronize(id).await.unwrap(),
        SyncOutcome::Updated { version: 2 }
    );
    let live = lock_project(&project);
    assert!(!live.has_conflicts());
    assert!(!live.is_dirty());
}

#[tokio::test]
async fn test_callback_leaving_conflicts_saves_nothing() {
    let repo = MemoryRepository::shared("memory:test");
    let (manager, repo_id) = manager_with(&repo).await;
    let project = manager.create_project(&repo_id, "Survey").await.unwrap();
    let id = project_id(&project);
    manager.register_conflict_callback(|_| MergeStrategy::Default);
    let saves_before = repo.save_count();

    lock_project(&project).set_name("Ours");
    let mut external = repo.get(id).unwrap();
    external.name = "Theirs".into();
    repo.put_external(external);

    let outcome = manager.synchronize(id).await.unwrap();
    assert_eq!(outcome, SyncOutcome::Conflicted { conflicts: 1 });
    assert_eq!(repo.get(id).unwrap().name, "Theirs");
    assert_eq!(repo.save_count(), saves_before);
    assert_eq!(lock_project(&project).name(), "Ours");
    assert!(manager.stats().conflicts >= 1);
    assert_eq!(manager.state(id), SyncState::Idle);
}

// ===========================================================================
// Aggregation
// ===========================================================================

#[tokio::test]
async fn test_available_projects_span_repositories() {
    let local = MemoryRepository::shared("memory:local");
    let cloud = MemoryRepository::shared("memory:cloud");
    let a = local.put_external(ProjectSnapshot::new("A", RepositoryType::Memory));
    let b = cloud.put_external(ProjectSnapshot::new("B", RepositoryType::Memory));

    let manager = ProjectManager::new(settings());
    let mut published = manager.subscribe();
    manager.add_repository(local.clone());
    manager.add_repository(cloud.clone());
    manager.refresh_and_wait().await.unwrap();

    let ids: Vec<Uuid> = manager
        .available_projects()
        .iter()
        .map(project_id)
        .collect();
    let mut expected = vec![a.id, b.id];
    expected.sort();
    assert_eq!(ids, expected);
    assert!(published.has_changed().unwrap());
    assert_eq!(published.borrow_and_update().len(), 2);

    let project_b = manager.project(b.id).unwrap();
    assert_eq!(
        lock_project(&project_b).repository(),
        Some(cloud.id())
    );
}

#[tokio::test]
async fn test_refresh_keeps_handles_and_takes_changes() {
    let repo = MemoryRepository::shared("memory:test");
    let stored = repo.put_external(ProjectSnapshot::new("Survey", RepositoryType::Memory));
    let (manager, _) = manager_with(&repo).await;
    let handle = manager.project(stored.id).unwrap();

    let mut external = stored.clone();
    external.name = "Renamed".into();
    repo.put_external(external);
    manager.refresh_and_wait().await.unwrap();

    let again = manager.project(stored.id).unwrap();
    assert!(Arc::ptr_eq(&handle, &again));
    assert_eq!(lock_project(&handle).name(), "Renamed");
    assert!(manager.stats().aggregations >= 2);
}

#[tokio::test]
async fn test_unreachable_repository_keeps_last_known_projects() {
    let local = MemoryRepository::shared("memory:local");
    let cloud = FlakyRepository::new("memory:cloud");
    local.put_external(ProjectSnapshot::new("A", RepositoryType::Memory));
    let remote = cloud
        .inner
        .put_external(ProjectSnapshot::new("B", RepositoryType::Memory));

    let manager = ProjectManager::new(settings());
    manager.add_repository(local.clone());
    manager.add_repository(cloud.clone());
    manager.refresh_and_wait().await.unwrap();
    assert_eq!(manager.available_projects().len(), 2);

    cloud.set_offline(true);
    manager.refresh_and_wait().await.unwrap();
    assert_eq!(manager.available_projects().len(), 2);
    assert!(manager.project(remote.id).is_some());

    cloud.set_offline(false);
    cloud.inner.remove_external(remote.id);
    manager.refresh_and_wait().await.unwrap();
    assert_eq!(manager.available_projects().len(), 1);
}

#[tokio::test]
async fn test_refresh_during_save_keeps_live_project() {
    let repo = GatedRepository::new("memory:gated");
    let manager = ProjectManager::new(settings());
    let repo_id = manager.add_repository(repo.clone());
    manager.refresh_and_wait().await.unwrap();
    let project = manager.create_project(&repo_id, "Survey").await.unwrap();
    let id = project_id(&project);

    repo.hold_saves(true);
    lock_project(&project).set_name("Edited");
    let pending = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.synchronize(id).await })
    };
    repo.entered.notified().await;
    assert_eq!(manager.state(id), SyncState::Saving);

    // The refresh sees the old stored copy while the save is held.
    manager.refresh_and_wait().await.unwrap();
    assert_eq!(lock_project(&project).name(), "Edited");

    repo.release.add_permits(1);
    let outcome = pending.await.unwrap().unwrap();
    assert_eq!(
        outcome,
        SyncOutcome::Saved {
            version: 2,
            attempts: 1
        }
    );
    repo.hold_saves(false);

    manager.refresh_and_wait().await.unwrap();
    let live = lock_project(&project);
    assert_eq!(live.name(), "Edited");
    assert_eq!(live.version(), 2);
    assert!(!live.is_dirty());
    assert_eq!(repo.inner.get(id).unwrap().name, "Edited");
}

#[tokio::test]
async fn test_stale_listing_does_not_undo_a_save() {
    let repo = GatedRepository::new("memory:gated");
    let manager = ProjectManager::new(settings());
    let repo_id = manager.add_repository(repo.clone());
    manager.refresh_and_wait().await.unwrap();
    let project = manager.create_project(&repo_id, "Survey").await.unwrap();
    let id = project_id(&project);

    // A refresh fetches the listing, then stalls before applying it.
    repo.hold_listings(true);
    let refresh = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.refresh_and_wait().await })
    };
    repo.entered.notified().await;

    lock_project(&project).set_name("Edited");
    let outcome = manager.synchronize(id).await.unwrap();
    assert_eq!(
        outcome,
        SyncOutcome::Saved {
            version: 2,
            attempts: 1
        }
    );

    repo.hold_listings(false);
    repo.release.add_permits(8);
    refresh.await.unwrap().unwrap();

    let live = lock_project(&project);
    assert_eq!(live.name(), "Edited");
    assert_eq!(live.version(), 2);
    assert!(!live.is_dirty());
    assert_eq!(repo.inner.get(id).unwrap().name, "Edited");
}

#[tokio::test]
async fn test_refresh_does_not_overwrite_unsaved_edits() {
    let repo = MemoryRepository::shared("memory:test");
    let stored = repo.put_external(ProjectSnapshot::new("Survey", RepositoryType::Memory));
    let (manager, _) = manager_with(&repo).await;
    let project = manager.project(stored.id).unwrap();

    lock_project(&project).set_name("Unsaved");
    let mut external = repo.get(stored.id).unwrap();
    external.users.clear();
    repo.put_external(external);
    manager.refresh_and_wait().await.unwrap();

    assert_eq!(lock_project(&project).name(), "Unsaved");
    let outcome = manager.synchronize(stored.id).await.unwrap();
    assert!(matches!(outcome, SyncOutcome::Saved { .. }));
    assert_eq!(repo.get(stored.id).unwrap().name, "Unsaved");
}

#[tokio::test]
async fn test_current_project_missing_from_results_is_kept() {
    let repo = MemoryRepository::shared("memory:test");
    let (manager, repo_id) = manager_with(&repo).await;
    let project = manager.create_project(&repo_id, "Survey").await.unwrap();
    let id = project_id(&project);
    manager.set_current_project(Some(id)).unwrap();

    repo.remove_external(id);
    manager.refresh_and_wait().await.unwrap();
    assert!(manager.project(id).is_some());
    assert_eq!(
        manager.current_project().map(|p| project_id(&p)),
        Some(id)
    );
}

#[tokio::test]
async fn test_lanes_start_from_threads_outside_the_runtime() {
    let repo = MemoryRepository::shared("memory:test");
    let (manager, repo_id) = manager_with(&repo).await;
    let project = manager.create_project(&repo_id, "Survey").await.unwrap();
    let id = project_id(&project);

    // Repository notifications arrive on plain threads.
    let handle = manager.clone();
    std::thread::spawn(move || handle.set_current_project(Some(id)))
        .join()
        .unwrap()
        .unwrap();
    lock_project(&project).set_name("From a watcher thread");
    let handle = manager.clone();
    assert!(std::thread::spawn(move || handle.notify_local_edit(id))
        .join()
        .unwrap());

    let outcome = manager.synchronize(id).await.unwrap();
    assert!(matches!(
        outcome,
        SyncOutcome::Saved { .. } | SyncOutcome::Unchanged
    ));
    assert_eq!(repo.get(id).unwrap().name, "From a watcher thread");
}

#[tokio::test]
async fn test_set_current_requires_available_project() {
    let repo = MemoryRepository::shared("memory:test");
    let (manager, _) = manager_with(&repo).await;
    let missing = Uuid::new_v4();
    assert!(matches!(
        manager.set_current_project(Some(missing)),
        Err(SyncError::UnknownProject(id)) if id == missing
    ));
    assert!(manager.current_project().is_none());
}

// ===========================================================================
// Move, delete, shutdown
// ===========================================================================

#[tokio::test]
async fn test_move_project_between_repositories() {
    let source = MemoryRepository::shared("memory:source");
    let target = MemoryRepository::shared("memory:target");
    let manager = ProjectManager::new(settings());
    let source_id = manager.add_repository(source.clone());
    let target_id = manager.add_repository(target.clone());
    manager.refresh_and_wait().await.unwrap();

    let project = manager.create_project(&source_id, "Survey").await.unwrap();
    let id = project_id(&project);
    lock_project(&project).set_name("Moved");

    manager.move_project(id, &target_id).await.unwrap();
    assert!(source.get(id).is_none());
    assert_eq!(target.get(id).unwrap().name, "Moved");
    assert_eq!(lock_project(&project).repository(), Some(&target_id));

    manager.refresh_and_wait().await.unwrap();
    let listed = manager.project(id).unwrap();
    assert_eq!(lock_project(&listed).repository(), Some(&target_id));

    let unknown = RepositoryId::new("memory:nowhere");
    assert!(matches!(
        manager.move_project(id, &unknown).await,
        Err(SyncError::UnknownRepository(_))
    ));
}

#[tokio::test]
async fn test_delete_project() {
    let repo = MemoryRepository::shared("memory:test");
    let (manager, repo_id) = manager_with(&repo).await;
    let project = manager.create_project(&repo_id, "Survey").await.unwrap();
    let id = project_id(&project);
    manager.set_current_project(Some(id)).unwrap();

    manager.delete_project(id).await.unwrap();
    assert!(repo.get(id).is_none());
    assert!(manager.project(id).is_none());
    assert!(manager.current_project().is_none());
    assert!(matches!(
        manager.delete_project(id).await,
        Err(SyncError::UnknownProject(_))
    ));
}

#[tokio::test]
async fn test_operations_fail_after_shutdown() {
    let repo = MemoryRepository::shared("memory:test");
    let (manager, repo_id) = manager_with(&repo).await;
    let project = manager.create_project(&repo_id, "Survey").await.unwrap();
    let id = project_id(&project);
    manager.set_current_project(Some(id)).unwrap();

    manager.shutdown().await;
    assert!(matches!(
        manager.synchronize(id).await,
        Err(SyncError::ShutDown)
    ));
    assert!(matches!(
        manager.refresh_and_wait().await,
        Err(SyncError::ShutDown)
    ));
    assert!(!manager.notify_local_edit(id));
    // A second shutdown is a no-op.
    manager.shutdown().await;
}
