//! Project domain model: immutable snapshots and the mutable working copy.

pub mod keyed;
pub mod project;
pub mod snapshot;

pub use keyed::{Keyed, KeyedSet};
pub use project::{lock_project, NodeRef, ParentIndex, Project, SharedProject};
pub use snapshot::{
    Dataset, DatasetKind, FlightPlan, Goal, GoalKind, Position, ProjectSnapshot, RepositoryType,
    ResourceRef, User, UserRole, Waypoint,
};
