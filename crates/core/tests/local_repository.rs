//! Local filesystem repository tests against real temporary directories.

use std::io::{Read, Write};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tempfile::TempDir;
use uuid::Uuid;

use projectsync_core::errors::RepositoryError;
use projectsync_core::model::{
    lock_project, FlightPlan, Goal, GoalKind, Project, ProjectSnapshot, RepositoryType, ResourceRef,
};
use projectsync_core::repository::{ChangeListener, LocalRepository, Query, Repository, RepositoryId};
use projectsync_core::serialization::{read_project_file, write_project_file, PROJECT_FILE};
use projectsync_core::sync::{ProjectManager, SyncSettings};
use projectsync_core::watcher::WatcherOptions;

// ===========================================================================
// Helpers
// ===========================================================================

#[derive(Default)]
struct Recorder {
    changed: Mutex<Vec<ProjectSnapshot>>,
    removed: Mutex<Vec<Uuid>>,
}

impl ChangeListener for Recorder {
    fn project_changed(&self, _repository: &RepositoryId, project: Project) {
        self.changed.lock().unwrap().push(project.snapshot());
    }

    fn project_removed(&self, _repository: &RepositoryId, id: Uuid) {
        self.removed.lock().unwrap().push(id);
    }
}

fn watch_options() -> Option<WatcherOptions> {
    Some(WatcherOptions {
        coalesce: Duration::from_millis(50),
        ..WatcherOptions::default()
    })
}

async fn wait_until(mut done: impl FnMut() -> bool) -> bool {
    for _ in 0..250 {
        if done() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    done()
}

// ===========================================================================
// Storage
// ===========================================================================

#[tokio::test]
async fn test_save_and_query_round_trip() {
    let dir = TempDir::new().unwrap();
    let repo = LocalRepository::open(dir.path(), None).unwrap();

    let mut project = repo.create("Survey");
    let goal = Goal::new("North field", GoalKind::Area);
    let goal_id = goal.id;
    project.add_goal(goal);
    let mut plan = FlightPlan::new("Pass 1");
    plan.goal_ids.push(goal_id);
    project.add_flight_plan(plan);

    let stored = repo.save(project.working()).await.unwrap();
    assert_eq!(stored.version, 1);
    assert_eq!(stored.repository_type, RepositoryType::Local);
    assert!(repo.project_dir(stored.id).join(PROJECT_FILE).is_file());

    let found = repo.query(&Query::ById(stored.id)).await.unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].working(), &stored);
    assert_eq!(found[0].repository(), Some(repo.id()));

    let all = repo.query(&Query::All).await.unwrap();
    assert_eq!(all.len(), 1);
    assert!(repo.query(&Query::ById(Uuid::new_v4())).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_stale_save_is_outdated() {
    let dir = TempDir::new().unwrap();
    let repo = LocalRepository::open(dir.path(), None).unwrap();
    let stored = repo.save(repo.create("Survey").working()).await.unwrap();
    repo.save(&stored).await.unwrap();

    let err = repo.save(&stored).await.unwrap_err();
    assert!(err.is_outdated());
    let on_disk = read_project_file(&repo.project_dir(stored.id)).unwrap();
    assert_eq!(on_disk.version, 2);
}

#[tokio::test]
async fn test_unreadable_projects_are_skipped() {
    let dir = TempDir::new().unwrap();
    let repo = LocalRepository::open(dir.path(), None).unwrap();
    let good = repo.save(repo.create("Good").working()).await.unwrap();

    let corrupt = repo.project_dir(Uuid::new_v4());
    std::fs::create_dir_all(&corrupt).unwrap();
    std::fs::write(corrupt.join(PROJECT_FILE), b"{ not json").unwrap();

    // A document whose id does not match its directory.
    let misplaced = repo.project_dir(Uuid::new_v4());
    write_project_file(&misplaced, &good).unwrap();

    // Directories without a document and non-project entries.
    std::fs::create_dir_all(repo.project_dir(Uuid::new_v4())).unwrap();
    std::fs::create_dir_all(dir.path().join("not-a-project")).unwrap();
    std::fs::write(dir.path().join("notes.txt"), b"hello").unwrap();

    let all = repo.query(&Query::All).await.unwrap();
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].id(), good.id);
}

#[tokio::test]
async fn test_delete_removes_directory() {
    let dir = TempDir::new().unwrap();
    let repo = LocalRepository::open(dir.path(), None).unwrap();
    let stored = repo.save(repo.create("Survey").working()).await.unwrap();

    repo.delete(stored.id).await.unwrap();
    assert!(!repo.project_dir(stored.id).exists());
    assert!(matches!(
        repo.delete(stored.id).await,
        Err(RepositoryError::NotFound(id)) if id == stored.id
    ));
}

#[tokio::test]
async fn test_attachments_live_next_to_the_document() {
    let dir = TempDir::new().unwrap();
    let repo = LocalRepository::open(dir.path(), None).unwrap();
    let mut project = repo.create("Survey");
    project.add_resource(ResourceRef::new("orthophoto.tif"));
    let stored = repo.save(project.working()).await.unwrap();

    let resolver = repo.resource_resolver(stored.id).unwrap();
    let mut writer = resolver.open_output("orthophoto.tif").unwrap();
    writer.write_all(b"tiff bytes").unwrap();
    writer.commit().unwrap();

    assert!(resolver.exists("orthophoto.tif").unwrap());
    let mut contents = String::new();
    resolver
        .open_input("orthophoto.tif")
        .unwrap()
        .read_to_string(&mut contents)
        .unwrap();
    assert_eq!(contents, "tiff bytes");
    assert!(resolver.open_output(PROJECT_FILE).is_err());
    assert!(resolver.open_output("../escape").is_err());

    // Attachments do not disturb scanning.
    let all = repo.query(&Query::All).await.unwrap();
    assert_eq!(all.len(), 1);
    assert!(all[0].working().resource("orthophoto.tif").is_some());
}

// ===========================================================================
// External change detection
// ===========================================================================

#[tokio::test]
async fn test_own_writes_are_not_reported() {
    let dir = TempDir::new().unwrap();
    let repo = LocalRepository::open(dir.path(), watch_options()).unwrap();
    assert!(repo.is_watching());
    let recorder = Arc::new(Recorder::default());
    repo.add_change_listener(recorder.clone());

    let stored = repo.save(repo.create("Survey").working()).await.unwrap();
    repo.save(&stored).await.unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;

    assert!(recorder.changed.lock().unwrap().is_empty());
    repo.stop_watching();
    assert!(!repo.is_watching());
}

#[tokio::test]
async fn test_external_change_is_reported() {
    let dir = TempDir::new().unwrap();
    let repo = LocalRepository::open(dir.path(), watch_options()).unwrap();
    let recorder = Arc::new(Recorder::default());
    repo.add_change_listener(recorder.clone());

    let stored = repo.save(repo.create("Survey").working()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    // Another process writes a newer version.
    let mut external = stored.clone();
    external.name = "Edited elsewhere".into();
    external.version = stored.version + 1;
    write_project_file(&repo.project_dir(stored.id), &external).unwrap();

    let seen = wait_until(|| {
        recorder
            .changed
            .lock()
            .unwrap()
            .iter()
            .any(|s| s.name == "Edited elsewhere")
    })
    .await;
    assert!(seen, "external change was not reported");

    std::fs::remove_dir_all(repo.project_dir(stored.id)).unwrap();
    let removed = wait_until(|| recorder.removed.lock().unwrap().contains(&stored.id)).await;
    assert!(removed, "external removal was not reported");
}

#[tokio::test]
async fn test_own_delete_is_not_reported() {
    let dir = TempDir::new().unwrap();
    let repo = LocalRepository::open(dir.path(), watch_options()).unwrap();
    let recorder = Arc::new(Recorder::default());
    repo.add_change_listener(recorder.clone());

    let stored = repo.save(repo.create("Survey").working()).await.unwrap();
    repo.delete(stored.id).await.unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;

    assert!(recorder.removed.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_manager_picks_up_external_changes() {
    let dir = TempDir::new().unwrap();
    let repo = Arc::new(LocalRepository::open(dir.path(), watch_options()).unwrap());
    let manager = ProjectManager::new(SyncSettings::default());
    let repo_id = manager.add_repository(repo.clone());
    manager.refresh_and_wait().await.unwrap();

    let project = manager.create_project(&repo_id, "Survey").await.unwrap();
    let id = lock_project(&project).id();
    let stored = read_project_file(&repo.project_dir(id)).unwrap();

    let mut external = stored.clone();
    external.name = "Edited elsewhere".into();
    external.version = stored.version + 1;
    write_project_file(&repo.project_dir(id), &external).unwrap();

    let updated = wait_until(|| lock_project(&project).name() == "Edited elsewhere").await;
    assert!(updated, "manager did not take over the external change");
    manager.shutdown().await;
}
