//! One merge/save cycle for a project.
//!
//! The cycle works on a detached copy of the project so the caller may keep
//! editing while repository I/O is in flight. When the cycle finishes, the
//! live project absorbs the result; edits made in the meantime survive and
//! are picked up by the next cycle.

use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::manager::Inner;
use super::{SyncOutcome, SyncState};
use crate::errors::SyncError;
use crate::merge::{conflicts_equivalent, MergeConflict, MergeStrategy, Merger};
use crate::model::{lock_project, ProjectSnapshot, SharedProject};
use crate::repository::{Query, Repository};

/// Holds a project's [`SyncState`] for the duration of a cycle and puts it
/// back to `Idle` when dropped, whichever way the cycle ends.
struct StateGuard<'a> {
    inner: &'a Inner,
    id: Uuid,
}

impl<'a> StateGuard<'a> {
    fn enter(inner: &'a Inner, id: Uuid) -> Self {
        inner.set_state(id, SyncState::MergePending);
        Self { inner, id }
    }

    fn set(&self, state: SyncState) {
        self.inner.set_state(self.id, state);
    }
}

impl Drop for StateGuard<'_> {
    fn drop(&mut self) {
        self.inner.set_state(self.id, SyncState::Idle);
    }
}

/// What happened when the live project took over a cycle's result.
#[derive(Debug, PartialEq, Eq)]
enum Absorbed {
    Done,
    /// Edits made during the cycle conflict with the result in a new way.
    Diverged,
}

/// Run one full cycle for `project` against its repository.
pub(super) async fn run(inner: &Inner, project: &SharedProject) -> Result<SyncOutcome, SyncError> {
    let (id, repository_id) = {
        let project = lock_project(project);
        (project.id(), project.repository().cloned())
    };
    let repository = repository_id
        .as_ref()
        .and_then(|r| inner.repository(r))
        .ok_or_else(|| {
            SyncError::UnknownRepository(
                repository_id
                    .as_ref()
                    .map(ToString::to_string)
                    .unwrap_or_else(|| "<none>".into()),
            )
        })?;

    inner.stats.cycle();
    let state = StateGuard::enter(inner, id);
    let result = cycle(inner, &state, repository.as_ref(), project).await;
    match &result {
        Ok(outcome) => debug!(project_id = %id, outcome = ?outcome, "cycle complete"),
        Err(e) => {
            inner.stats.failure();
            error!(project_id = %id, error = %e, "synchronization failed");
        }
    }
    result
}

#[instrument(skip_all, fields(project_id = %state.id, repository = %repository.id()))]
async fn cycle(
    inner: &Inner,
    state: &StateGuard<'_>,
    repository: &dyn Repository,
    project: &SharedProject,
) -> Result<SyncOutcome, SyncError> {
    let id = state.id;
    let mut attempts: u32 = 0;

    loop {
        state.set(SyncState::MergePending);
        let mut copy = lock_project(project).clone();
        let original = copy.snapshot();

        // Conflicts reported by the dry run and settled by the strategy.
        let mut detected: Vec<MergeConflict> = Vec::new();

        match fetch(repository, id).await? {
            None => debug!("no stored copy, local copy is authoritative"),
            Some(theirs) if theirs == original => {
                let mut live = lock_project(project);
                if live.working == original {
                    live.clear_conflicts();
                }
                live.baseline = Some(theirs);
                return Ok(SyncOutcome::Unchanged);
            }
            Some(theirs) => {
                let probe = Merger::merge(&mut copy, &theirs, MergeStrategy::DryRun)?;
                let strategy = if probe.is_clean() {
                    MergeStrategy::Default
                } else {
                    inner.stats.conflicts(probe.conflicts.len());
                    let strategy = inner.conflict_strategy(&probe.conflicts);
                    info!(
                        conflicts = probe.conflicts.len(),
                        strategy = %strategy,
                        "merge conflicts detected"
                    );
                    strategy
                };
                let merged = Merger::merge(&mut copy, &theirs, strategy)?;
                if !merged.is_clean() {
                    // Saving now would overwrite their side of every open
                    // conflict. The live project keeps its baseline.
                    let conflicts = merged.conflicts.len();
                    lock_project(project).set_conflicts(merged.conflicts);
                    warn!(
                        conflicts,
                        version = theirs.version,
                        "conflicts left open, not saving"
                    );
                    return Ok(SyncOutcome::Conflicted { conflicts });
                }
                detected = probe.conflicts;

                if copy.working == theirs {
                    absorb(project, &original, &theirs, &detected, Vec::new())?;
                    return Ok(SyncOutcome::Updated {
                        version: theirs.version,
                    });
                }
            }
        }

        state.set(SyncState::Saving);
        attempts += 1;
        match repository.save(copy.working()).await {
            Ok(saved) => {
                inner.stats.save();
                debug!(version = saved.version, attempts, "saved");
                match absorb(project, &original, &saved, &detected, Vec::new())? {
                    Absorbed::Done => {
                        return Ok(SyncOutcome::Saved {
                            version: saved.version,
                            attempts,
                        })
                    }
                    Absorbed::Diverged => {
                        debug!("edits during save conflict with the saved copy, merging again");
                    }
                }
            }
            Err(e) if e.is_outdated() => {
                let max = inner.settings.max_attempts;
                if max > 0 && attempts >= max {
                    return Err(SyncError::RetriesExhausted { id, attempts });
                }
                inner.stats.retry();
                state.set(SyncState::RetryPending);
                let delay = inner.settings.backoff(attempts);
                warn!(attempts, delay_ms = delay.as_millis() as u64, error = %e, "save outdated, retrying");
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e.into()),
        }
    }
}

/// The stored copy of project `id`, if the repository has one.
async fn fetch(repository: &dyn Repository, id: Uuid) -> Result<Option<ProjectSnapshot>, SyncError> {
    let mut found = repository.query(&Query::ById(id)).await?;
    match found.len() {
        0 => Ok(None),
        1 => Ok(found.pop().map(|p| p.working)),
        count => Err(SyncError::AmbiguousQuery {
            repository: repository.id().to_string(),
            id,
            count,
        }),
    }
}

/// Bring `result` into the live project. `original` is the working copy the
/// cycle started from; `detected` the conflicts the cycle already settled;
/// `recorded` replaces the live project's conflict list.
fn absorb(
    project: &SharedProject,
    original: &ProjectSnapshot,
    result: &ProjectSnapshot,
    detected: &[MergeConflict],
    recorded: Vec<MergeConflict>,
) -> Result<Absorbed, SyncError> {
    let mut live = lock_project(project);
    if live.working == *original {
        live.working = result.clone();
        live.baseline = Some(result.clone());
        live.relink();
        live.set_conflicts(recorded);
        return Ok(Absorbed::Done);
    }

    // Edited meanwhile: merge the result into the live copy, relative to the
    // value the cycle started from.
    live.baseline = Some(original.clone());
    let probe = Merger::merge(&mut live, result, MergeStrategy::DryRun)?;
    let strategy = if probe.is_clean() {
        MergeStrategy::Default
    } else if conflicts_equivalent(&probe.conflicts, detected) {
        MergeStrategy::KeepTheirs
    } else {
        return Ok(Absorbed::Diverged);
    };
    Merger::merge(&mut live, result, strategy)?;
    live.set_conflicts(recorded);
    debug!(project_id = %live.id(), strategy = %strategy, "absorbed result into edited project");
    Ok(Absorbed::Done)
}

/// Absorb a copy saved outside a cycle. Conflicting edits made meanwhile
/// stay on the live project for its next cycle.
pub(super) fn absorb_saved(
    project: &SharedProject,
    original: &ProjectSnapshot,
    saved: &ProjectSnapshot,
) -> Result<(), SyncError> {
    let recorded = lock_project(project).conflicts().to_vec();
    if absorb(project, original, saved, &[], recorded)? == Absorbed::Diverged {
        debug!(project_id = %saved.id, "saved copy left for the next cycle");
    }
    Ok(())
}
