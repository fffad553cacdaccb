//! Per-project lane.
//!
//! A lane is a tokio task owning the merge/save pipeline of one project.
//! Messages are handled one at a time, so two cycles for the same project
//! never overlap. Local edits are debounced: every edit pushes the deadline
//! out by the debounce window and a single cycle runs once the project has
//! been quiet for that long, or once the first unsaved edit is older than
//! the maximum delay.

use std::sync::Weak;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::cycle;
use super::manager::Inner;
use super::{SyncOutcome, SyncSettings};
use crate::errors::{RepositoryError, SyncError};
use crate::model::{lock_project, SharedProject};
use crate::repository::RepositoryId;

pub(super) type Reply<T> = oneshot::Sender<Result<T, SyncError>>;

pub(super) enum LaneMsg {
    /// The project was edited locally.
    LocalEdit,
    /// The project's repository reported a change made elsewhere.
    RepositoryChanged,
    /// Run a cycle now and report its outcome.
    Synchronize(Reply<SyncOutcome>),
    /// Move the project to another repository.
    Move {
        target: RepositoryId,
        reply: Reply<()>,
    },
    Shutdown,
}

pub(super) async fn run(
    inner: Weak<Inner>,
    project: SharedProject,
    mut rx: mpsc::UnboundedReceiver<LaneMsg>,
    settings: SyncSettings,
) {
    let id = lock_project(&project).id();
    let far_future = Instant::now() + Duration::from_secs(86400 * 365);
    let mut deadline = far_future;
    let mut first_edit = Instant::now();
    let mut pending = false;
    debug!(project_id = %id, "lane started");

    loop {
        tokio::select! {
            msg = rx.recv() => {
                let Some(msg) = msg else { break };
                let Some(manager) = inner.upgrade() else { break };
                match msg {
                    LaneMsg::LocalEdit => {
                        let now = Instant::now();
                        if !pending {
                            first_edit = now;
                        }
                        pending = true;
                        deadline = (now + settings.debounce).min(first_edit + settings.max_delay);
                    }
                    LaneMsg::RepositoryChanged => {
                        // The cycle also covers any edit still waiting out the
                        // debounce window.
                        pending = false;
                        deadline = far_future;
                        debug!(project_id = %id, "repository change, synchronizing");
                        let _ = cycle::run(&manager, &project).await;
                    }
                    LaneMsg::Synchronize(reply) => {
                        pending = false;
                        deadline = far_future;
                        let outcome = cycle::run(&manager, &project).await;
                        let _ = reply.send(outcome);
                    }
                    LaneMsg::Move { target, reply } => {
                        let result = relocate(&manager, &project, &target).await;
                        let _ = reply.send(result);
                    }
                    LaneMsg::Shutdown => break,
                }
            }
            () = sleep_until(deadline), if pending => {
                pending = false;
                deadline = far_future;
                let Some(manager) = inner.upgrade() else { break };
                if manager.is_current(id) {
                    let _ = cycle::run(&manager, &project).await;
                } else {
                    debug!(project_id = %id, "project no longer current, dropping local edits");
                }
            }
        }
    }

    debug!(project_id = %id, "lane stopped");
}

/// Save the project into `target`, point it there and remove it from the
/// repository it came from.
async fn relocate(
    inner: &Inner,
    project: &SharedProject,
    target: &RepositoryId,
) -> Result<(), SyncError> {
    let target_repository = inner
        .repository(target)
        .ok_or_else(|| SyncError::UnknownRepository(target.to_string()))?;
    let (id, original, source) = {
        let project = lock_project(project);
        (project.id(), project.snapshot(), project.repository().cloned())
    };
    if source.as_ref() == Some(target) {
        debug!(project_id = %id, repository = %target, "project already in target repository");
        return Ok(());
    }

    let saved = target_repository.save(&original).await?;
    {
        let mut live = lock_project(project);
        live.set_repository(target.clone());
    }
    cycle::absorb_saved(project, &original, &saved)?;
    info!(
        project_id = %id,
        from = ?source.as_ref().map(ToString::to_string),
        to = %target,
        version = saved.version,
        "project moved"
    );

    if let Some(source_repository) = source.as_ref().and_then(|s| inner.repository(s)) {
        match source_repository.delete(id).await {
            Ok(()) | Err(RepositoryError::NotFound(_)) => {}
            Err(e) => {
                warn!(project_id = %id, error = %e, "moved project could not be removed from its old repository");
                return Err(e.into());
            }
        }
    }
    inner.request_refresh();
    Ok(())
}
