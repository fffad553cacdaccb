//! The mutable working copy of a project.
//!
//! A [`Project`] owns its object graph as a [`ProjectSnapshot`] value and
//! keeps, next to it, everything the synchronizer needs: the baseline the
//! working copy diverged from, the open merge conflicts, the repository it
//! currently lives in, and a parent index used to walk from any sub-object
//! up to the project.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use super::snapshot::{Dataset, FlightPlan, Goal, ProjectSnapshot, ResourceRef, User, Waypoint};
use crate::merge::MergeConflict;
use crate::repository::RepositoryId;

// ---------------------------------------------------------------------------
// Node references
// ---------------------------------------------------------------------------

/// A non-owning reference to a node of the project graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum NodeRef {
    Project(Uuid),
    FlightPlan(Uuid),
    Waypoint(Uuid),
    Goal(Uuid),
    Dataset(Uuid),
    User(Uuid),
    Resource(Uuid),
}

impl NodeRef {
    pub fn id(&self) -> Uuid {
        match *self {
            Self::Project(id)
            | Self::FlightPlan(id)
            | Self::Waypoint(id)
            | Self::Goal(id)
            | Self::Dataset(id)
            | Self::User(id)
            | Self::Resource(id) => id,
        }
    }
}

impl std::fmt::Display for NodeRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self {
            Self::Project(_) => "project",
            Self::FlightPlan(_) => "flight_plan",
            Self::Waypoint(_) => "waypoint",
            Self::Goal(_) => "goal",
            Self::Dataset(_) => "dataset",
            Self::User(_) => "user",
            Self::Resource(_) => "resource",
        };
        write!(f, "{}:{}", kind, self.id())
    }
}

// ---------------------------------------------------------------------------
// Parent index
// ---------------------------------------------------------------------------

/// Child-to-parent links for every sub-object of one project.
#[derive(Debug, Clone, Default)]
pub struct ParentIndex {
    parents: HashMap<NodeRef, NodeRef>,
}

impl ParentIndex {
    pub fn build(snapshot: &ProjectSnapshot) -> Self {
        let root = NodeRef::Project(snapshot.id);
        let mut index = Self::default();
        for plan in &snapshot.flight_plans {
            index.link_flight_plan(root, plan);
        }
        for goal in snapshot.goals.iter() {
            index.link(NodeRef::Goal(goal.id), root);
        }
        for dataset in snapshot.datasets.iter() {
            index.link(NodeRef::Dataset(dataset.id), root);
        }
        for user in &snapshot.users {
            index.link(NodeRef::User(user.id), root);
        }
        for resource in &snapshot.resources {
            index.link(NodeRef::Resource(resource.id), root);
        }
        index
    }

    pub fn parent(&self, node: NodeRef) -> Option<NodeRef> {
        self.parents.get(&node).copied()
    }

    /// The chain from `node` up to its root, `node` first.
    pub fn path(&self, node: NodeRef) -> Vec<NodeRef> {
        let mut path = vec![node];
        let mut current = node;
        while let Some(parent) = self.parent(current) {
            // A cycle would mean a corrupted index.
            if path.contains(&parent) {
                warn!(node = %node, "cycle in parent index");
                break;
            }
            path.push(parent);
            current = parent;
        }
        path
    }

    pub fn len(&self) -> usize {
        self.parents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parents.is_empty()
    }

    fn link(&mut self, child: NodeRef, parent: NodeRef) {
        self.parents.insert(child, parent);
    }

    fn unlink(&mut self, child: NodeRef) {
        self.parents.remove(&child);
    }

    fn link_flight_plan(&mut self, root: NodeRef, plan: &FlightPlan) {
        let node = NodeRef::FlightPlan(plan.id);
        self.link(node, root);
        for waypoint in &plan.waypoints {
            self.link(NodeRef::Waypoint(waypoint.id), node);
        }
    }

    fn unlink_flight_plan(&mut self, plan: &FlightPlan) {
        self.unlink(NodeRef::FlightPlan(plan.id));
        for waypoint in &plan.waypoints {
            self.unlink(NodeRef::Waypoint(waypoint.id));
        }
    }
}

// ---------------------------------------------------------------------------
// Project
// ---------------------------------------------------------------------------

/// A project working copy.
#[derive(Debug, Clone)]
pub struct Project {
    pub(crate) working: ProjectSnapshot,
    pub(crate) baseline: Option<ProjectSnapshot>,
    pub(crate) conflicts: Vec<MergeConflict>,
    repository: Option<RepositoryId>,
    parents: ParentIndex,
}

/// A project shared between the project manager and its callers.
pub type SharedProject = Arc<Mutex<Project>>;

impl Project {
    /// A project that has never been saved; it has no baseline.
    pub fn new(snapshot: ProjectSnapshot) -> Self {
        let parents = ParentIndex::build(&snapshot);
        Self {
            working: snapshot,
            baseline: None,
            conflicts: Vec::new(),
            repository: None,
            parents,
        }
    }

    /// A project as loaded from `repository`; the loaded value is its baseline.
    pub fn loaded(snapshot: ProjectSnapshot, repository: RepositoryId) -> Self {
        let mut project = Self::new(snapshot);
        project.baseline = Some(project.working.clone());
        project.repository = Some(repository);
        project
    }

    pub fn into_shared(self) -> SharedProject {
        Arc::new(Mutex::new(self))
    }

    pub fn id(&self) -> Uuid {
        self.working.id
    }

    pub fn name(&self) -> &str {
        &self.working.name
    }

    pub fn version(&self) -> u64 {
        self.working.version
    }

    /// Read access to the working copy.
    pub fn working(&self) -> &ProjectSnapshot {
        &self.working
    }

    /// A detached copy of the working copy.
    pub fn snapshot(&self) -> ProjectSnapshot {
        self.working.clone()
    }

    pub fn baseline(&self) -> Option<&ProjectSnapshot> {
        self.baseline.as_ref()
    }

    /// Whether the working copy differs from its baseline.
    pub fn is_dirty(&self) -> bool {
        self.baseline.as_ref() != Some(&self.working)
    }

    pub fn conflicts(&self) -> &[MergeConflict] {
        &self.conflicts
    }

    pub fn has_conflicts(&self) -> bool {
        !self.conflicts.is_empty()
    }

    pub fn set_conflicts(&mut self, conflicts: Vec<MergeConflict>) {
        self.conflicts = conflicts;
    }

    pub fn clear_conflicts(&mut self) {
        self.conflicts.clear();
    }

    pub fn repository(&self) -> Option<&RepositoryId> {
        self.repository.as_ref()
    }

    pub fn set_repository(&mut self, repository: RepositoryId) {
        self.repository = Some(repository);
    }

    pub fn parents(&self) -> &ParentIndex {
        &self.parents
    }

    /// Path from `node` up to the project, used to locate a conflict.
    pub fn path_to(&self, node: NodeRef) -> Vec<NodeRef> {
        self.parents.path(node)
    }

    /// Rebuild the parent index after the graph was replaced wholesale.
    pub fn relink(&mut self) {
        self.parents = ParentIndex::build(&self.working);
    }

    // -----------------------------------------------------------------------
    // Edits
    // -----------------------------------------------------------------------

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.working.name = name.into();
    }

    pub fn add_goal(&mut self, goal: Goal) {
        self.parents
            .link(NodeRef::Goal(goal.id), NodeRef::Project(self.working.id));
        self.working.goals.insert(goal);
    }

    /// Remove a goal and every flight-plan reference to it.
    pub fn remove_goal(&mut self, id: Uuid) -> Option<Goal> {
        let goal = self.working.goals.remove(&id)?;
        self.parents.unlink(NodeRef::Goal(id));
        for plan in &mut self.working.flight_plans {
            plan.goal_ids.retain(|g| *g != id);
        }
        Some(goal)
    }

    /// Edit a goal in place. Returns `false` if there is no such goal.
    pub fn update_goal(&mut self, id: Uuid, edit: impl FnOnce(&mut Goal)) -> bool {
        match self.working.goals.get_mut(&id) {
            Some(goal) => {
                edit(goal);
                goal.id = id;
                true
            }
            None => false,
        }
    }

    pub fn add_flight_plan(&mut self, plan: FlightPlan) {
        self.parents
            .link_flight_plan(NodeRef::Project(self.working.id), &plan);
        self.working.flight_plans.push(plan);
    }

    pub fn remove_flight_plan(&mut self, id: Uuid) -> Option<FlightPlan> {
        let index = self.working.flight_plans.iter().position(|p| p.id == id)?;
        let plan = self.working.flight_plans.remove(index);
        self.parents.unlink_flight_plan(&plan);
        Some(plan)
    }

    pub fn rename_flight_plan(&mut self, id: Uuid, name: impl Into<String>) -> bool {
        match self.flight_plan_mut(id) {
            Some(plan) => {
                plan.name = name.into();
                true
            }
            None => false,
        }
    }

    /// Reference an existing goal from a flight plan.
    pub fn attach_goal(&mut self, plan_id: Uuid, goal_id: Uuid) -> bool {
        if !self.working.goals.contains(&goal_id) {
            return false;
        }
        match self.flight_plan_mut(plan_id) {
            Some(plan) => {
                if !plan.goal_ids.contains(&goal_id) {
                    plan.goal_ids.push(goal_id);
                }
                true
            }
            None => false,
        }
    }

    pub fn add_waypoint(&mut self, plan_id: Uuid, waypoint: Waypoint) -> bool {
        let waypoint_node = NodeRef::Waypoint(waypoint.id);
        match self.flight_plan_mut(plan_id) {
            Some(plan) => {
                plan.waypoints.push(waypoint);
                self.parents
                    .link(waypoint_node, NodeRef::FlightPlan(plan_id));
                true
            }
            None => false,
        }
    }

    pub fn remove_waypoint(&mut self, plan_id: Uuid, waypoint_id: Uuid) -> Option<Waypoint> {
        let plan = self.flight_plan_mut(plan_id)?;
        let index = plan.waypoints.iter().position(|w| w.id == waypoint_id)?;
        let waypoint = plan.waypoints.remove(index);
        self.parents.unlink(NodeRef::Waypoint(waypoint_id));
        Some(waypoint)
    }

    pub fn move_waypoint(
        &mut self,
        plan_id: Uuid,
        waypoint_id: Uuid,
        position: super::snapshot::Position,
    ) -> bool {
        let Some(plan) = self.flight_plan_mut(plan_id) else {
            return false;
        };
        match plan.waypoints.iter_mut().find(|w| w.id == waypoint_id) {
            Some(waypoint) => {
                waypoint.position = position;
                true
            }
            None => false,
        }
    }

    pub fn add_dataset(&mut self, dataset: Dataset) {
        self.parents
            .link(NodeRef::Dataset(dataset.id), NodeRef::Project(self.working.id));
        self.working.datasets.insert(dataset);
    }

    pub fn remove_dataset(&mut self, id: Uuid) -> Option<Dataset> {
        let dataset = self.working.datasets.remove(&id)?;
        self.parents.unlink(NodeRef::Dataset(id));
        Some(dataset)
    }

    pub fn add_user(&mut self, user: User) {
        self.parents
            .link(NodeRef::User(user.id), NodeRef::Project(self.working.id));
        self.working.users.push(user);
    }

    pub fn remove_user(&mut self, id: Uuid) -> Option<User> {
        let index = self.working.users.iter().position(|u| u.id == id)?;
        self.parents.unlink(NodeRef::User(id));
        Some(self.working.users.remove(index))
    }

    pub fn add_resource(&mut self, resource: ResourceRef) {
        self.parents.link(
            NodeRef::Resource(resource.id),
            NodeRef::Project(self.working.id),
        );
        self.working.resources.push(resource);
    }

    pub fn remove_resource(&mut self, id: Uuid) -> Option<ResourceRef> {
        let index = self.working.resources.iter().position(|r| r.id == id)?;
        self.parents.unlink(NodeRef::Resource(id));
        Some(self.working.resources.remove(index))
    }

    fn flight_plan_mut(&mut self, id: Uuid) -> Option<&mut FlightPlan> {
        self.working.flight_plans.iter_mut().find(|p| p.id == id)
    }
}

/// Lock a shared project, recovering the guard if a previous holder panicked.
pub fn lock_project(project: &SharedProject) -> MutexGuard<'_, Project> {
    project.lock().unwrap_or_else(|poisoned| {
        warn!("project mutex was poisoned, recovering");
        poisoned.into_inner()
    })
}
