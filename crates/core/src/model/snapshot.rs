//! Value types making up a project snapshot.
//!
//! Everything here is plain data: `Clone + PartialEq + Serialize +
//! Deserialize`, with no back-references. Two snapshots with equal field
//! values are equal regardless of where they came from.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use super::keyed::{Keyed, KeyedSet};

// ---------------------------------------------------------------------------
// Enumerations
// ---------------------------------------------------------------------------

/// Which kind of repository a project lives in.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RepositoryType {
    #[default]
    Local,
    Cloud,
    Memory,
}

impl std::fmt::Display for RepositoryType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Local => write!(f, "local"),
            Self::Cloud => write!(f, "cloud"),
            Self::Memory => write!(f, "memory"),
        }
    }
}

/// Geometry of a goal.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum GoalKind {
    Point,
    #[default]
    Area,
    Corridor,
}

impl std::fmt::Display for GoalKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Point => write!(f, "point"),
            Self::Area => write!(f, "area"),
            Self::Corridor => write!(f, "corridor"),
        }
    }
}

/// Kind of data captured or attached to a project.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DatasetKind {
    #[default]
    Imagery,
    PointCloud,
    Elevation,
    Other,
}

/// Access level of a project member.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum UserRole {
    Owner,
    #[default]
    Editor,
    Viewer,
}

// ---------------------------------------------------------------------------
// Sub-objects
// ---------------------------------------------------------------------------

/// WGS84 position with altitude in metres.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct Position {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub altitude: f64,
}

impl Position {
    pub fn new(latitude: f64, longitude: f64, altitude: f64) -> Self {
        Self {
            latitude,
            longitude,
            altitude,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Waypoint {
    pub id: Uuid,
    pub position: Position,
    /// Ground speed in m/s; `None` uses the flight plan default.
    #[serde(default)]
    pub speed: Option<f64>,
    #[serde(default)]
    pub hold_secs: u32,
}

impl Waypoint {
    pub fn new(position: Position) -> Self {
        Self {
            id: Uuid::new_v4(),
            position,
            speed: None,
            hold_secs: 0,
        }
    }
}

/// An ordered route. Goals are referenced by id; the goal itself lives once
/// in the project's goal set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FlightPlan {
    pub id: Uuid,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub waypoints: Vec<Waypoint>,
    #[serde(default)]
    pub goal_ids: Vec<Uuid>,
}

impl FlightPlan {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            waypoints: Vec::new(),
            goal_ids: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Goal {
    pub id: Uuid,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub kind: GoalKind,
    #[serde(default)]
    pub vertices: Vec<Position>,
    #[serde(default)]
    pub altitude: f64,
}

impl Goal {
    pub fn new(name: impl Into<String>, kind: GoalKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            kind,
            vertices: Vec::new(),
            altitude: 0.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Dataset {
    pub id: Uuid,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub kind: DatasetKind,
    /// Name of the attachment holding the data, resolved per repository.
    #[serde(default)]
    pub resource: Option<String>,
}

impl Dataset {
    pub fn new(name: impl Into<String>, kind: DatasetKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            kind,
            resource: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct User {
    pub id: Uuid,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub role: UserRole,
}

/// A named attachment stored next to the project document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceRef {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub media_type: Option<String>,
}

impl ResourceRef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            media_type: None,
        }
    }
}

macro_rules! keyed_by_id {
    ($($ty:ty),* $(,)?) => {
        $(impl Keyed for $ty {
            fn key(&self) -> Uuid {
                self.id
            }
        })*
    };
}

keyed_by_id!(Waypoint, FlightPlan, Goal, Dataset, User, ResourceRef);

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

/// Immutable point-in-time value of a project, the unit exchanged with
/// repositories and one side of every merge.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProjectSnapshot {
    pub id: Uuid,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub repository_type: RepositoryType,
    #[serde(default)]
    pub created: DateTime<Utc>,
    #[serde(default)]
    pub modified: DateTime<Utc>,
    /// Optimistic-concurrency version, bumped by the repository on save.
    #[serde(default)]
    pub version: u64,
    #[serde(default)]
    pub flight_plans: Vec<FlightPlan>,
    #[serde(default)]
    pub goals: KeyedSet<Goal>,
    #[serde(default)]
    pub datasets: KeyedSet<Dataset>,
    #[serde(default)]
    pub users: Vec<User>,
    #[serde(default)]
    pub resources: Vec<ResourceRef>,
}

impl ProjectSnapshot {
    /// A fresh, never-saved snapshot with a new identifier.
    pub fn new(name: impl Into<String>, repository_type: RepositoryType) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            repository_type,
            created: now,
            modified: now,
            version: 0,
            flight_plans: Vec::new(),
            goals: KeyedSet::new(),
            datasets: KeyedSet::new(),
            users: Vec::new(),
            resources: Vec::new(),
        }
    }

    pub fn goal(&self, id: &Uuid) -> Option<&Goal> {
        self.goals.get(id)
    }

    pub fn flight_plan(&self, id: &Uuid) -> Option<&FlightPlan> {
        self.flight_plans.iter().find(|p| p.id == *id)
    }

    pub fn resource(&self, name: &str) -> Option<&ResourceRef> {
        self.resources.iter().find(|r| r.name == name)
    }

    /// Goals referenced by a flight plan, resolved against the goal set.
    pub fn goals_of<'a>(&'a self, plan: &'a FlightPlan) -> impl Iterator<Item = &'a Goal> + 'a {
        plan.goal_ids.iter().filter_map(move |id| self.goals.get(id))
    }

    /// Drop goal references that point at no goal and duplicate entries in
    /// ordered collections. Returns the number of entries removed.
    pub fn prune_dangling_references(&mut self) -> usize {
        let mut removed = 0;
        let goals = &self.goals;
        for plan in &mut self.flight_plans {
            let before = plan.goal_ids.len();
            let mut seen = HashSet::new();
            plan.goal_ids
                .retain(|id| goals.contains(id) && seen.insert(*id));
            let dropped = before - plan.goal_ids.len();
            if dropped > 0 {
                warn!(
                    project_id = %self.id,
                    flight_plan_id = %plan.id,
                    dropped,
                    "dropping dangling goal references"
                );
            }
            removed += dropped;
        }
        removed += dedup_by_key(&mut self.flight_plans);
        for plan in &mut self.flight_plans {
            removed += dedup_by_key(&mut plan.waypoints);
        }
        removed += dedup_by_key(&mut self.users);
        removed += dedup_by_key(&mut self.resources);
        removed
    }
}

fn dedup_by_key<T: Keyed>(items: &mut Vec<T>) -> usize {
    let before = items.len();
    let mut seen = HashSet::new();
    items.retain(|item| seen.insert(item.key()));
    before - items.len()
}
