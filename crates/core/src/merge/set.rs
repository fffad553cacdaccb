//! Merging of project lists gathered from several repositories.

use std::collections::BTreeMap;

use tracing::{debug, warn};
use uuid::Uuid;

use super::merger::Merger;
use super::strategy::MergeStrategy;
use crate::errors::MergeError;
use crate::model::Project;

/// Combine freshly queried project sets with the projects already known.
///
/// * A project appearing in more than one result set is taken from the
///   first repository that reported it; later copies are skipped.
/// * A project already present in `known` keeps its identity: the fresh copy
///   is merged into the known one with `Default` and the known project is
///   restamped with the repository the fresh copy came from.
/// * Everything else is taken as-is.
///
/// The output is ordered by project id.
pub fn merge_project_sets(
    known: Vec<Project>,
    results: Vec<Vec<Project>>,
) -> Result<Vec<Project>, MergeError> {
    let mut known: BTreeMap<Uuid, Project> = known.into_iter().map(|p| (p.id(), p)).collect();
    let mut merged: BTreeMap<Uuid, Project> = BTreeMap::new();

    for incoming in results.into_iter().flatten() {
        let id = incoming.id();
        if let Some(existing) = merged.get(&id) {
            warn!(
                project_id = %id,
                first = ?existing.repository().map(|r| r.to_string()),
                second = ?incoming.repository().map(|r| r.to_string()),
                "project found in more than one repository, keeping the first copy"
            );
            continue;
        }

        match known.remove(&id) {
            Some(mut project) => {
                project.clear_conflicts();
                Merger::merge(&mut project, incoming.working(), MergeStrategy::Default)?;
                if let Some(repository) = incoming.repository() {
                    project.set_repository(repository.clone());
                }
                debug!(project_id = %id, "refreshed known project");
                merged.insert(id, project);
            }
            None => {
                merged.insert(id, incoming);
            }
        }
    }

    Ok(merged.into_values().collect())
}
