//! Three-way merge of a project working copy with a repository snapshot.
//!
//! "Ours" is the project's working copy, "theirs" the incoming snapshot and
//! the base is the project's baseline (the value last loaded from or saved to
//! its repository). Each field is decided independently:
//!
//! * equal on both sides: nothing to do;
//! * changed on one side only: the changed side wins;
//! * changed on both sides: the [`MergeStrategy`] decides, `Default` and
//!   `DryRun` record a [`MergeConflict`].
//!
//! Without a base every difference counts as a change on both sides.
//! Keyed collections additionally track additions and removals, and ordered
//! lists keep a deterministic order for concurrent insertions.

use std::collections::{BTreeMap, HashMap, HashSet};

use serde::Serialize;
use tracing::debug;
use uuid::Uuid;

use super::conflict::MergeConflict;
use super::strategy::{Decision, MergeStrategy};
use crate::errors::MergeError;
use crate::model::{
    Dataset, FlightPlan, Goal, Keyed, KeyedSet, NodeRef, ParentIndex, Project, ProjectSnapshot,
    ResourceRef, User, Waypoint,
};

/// Result of one merge pass.
#[derive(Debug, Clone, Default)]
pub struct MergeOutcome {
    /// Conflicts recorded by `Default` or `DryRun`.
    pub conflicts: Vec<MergeConflict>,
    /// Conflicts settled by `KeepOurs` or `KeepTheirs`.
    pub resolved: usize,
    /// Whether the merged value differs from the working copy.
    pub changed: bool,
}

impl MergeOutcome {
    pub fn is_clean(&self) -> bool {
        self.conflicts.is_empty()
    }
}

/// Stateful walker for a single merge pass.
pub struct Merger<'a> {
    strategy: MergeStrategy,
    parents: &'a ParentIndex,
    conflicts: Vec<MergeConflict>,
    resolved: usize,
}

impl Merger<'_> {
    /// Merge `theirs` into `project` using `strategy`.
    ///
    /// Unless the strategy is `DryRun`, the merged value replaces the working
    /// copy, `theirs` becomes the new baseline and the project's conflict
    /// list is replaced with this pass's conflicts.
    pub fn merge(
        project: &mut Project,
        theirs: &ProjectSnapshot,
        strategy: MergeStrategy,
    ) -> Result<MergeOutcome, MergeError> {
        let ours_id = project.id();
        if ours_id != theirs.id {
            return Err(MergeError::IdentifierMismatch {
                ours: ours_id,
                theirs: theirs.id,
            });
        }

        let mut merged = project.working.clone();
        let (conflicts, resolved) = {
            let mut merger = Merger {
                strategy,
                parents: project.parents(),
                conflicts: Vec::new(),
                resolved: 0,
            };
            merger.merge_snapshot(&mut merged, project.baseline.as_ref(), theirs);
            (merger.conflicts, merger.resolved)
        };

        let changed = merged != project.working;
        debug!(
            project_id = %ours_id,
            strategy = %strategy,
            conflicts = conflicts.len(),
            resolved,
            changed,
            "merge pass complete"
        );

        if strategy.mutates() {
            project.working = merged;
            project.baseline = Some(theirs.clone());
            project.conflicts = conflicts.clone();
            project.relink();
        }

        Ok(MergeOutcome {
            conflicts,
            resolved,
            changed,
        })
    }

    fn merge_snapshot(
        &mut self,
        ours: &mut ProjectSnapshot,
        base: Option<&ProjectSnapshot>,
        theirs: &ProjectSnapshot,
    ) {
        let node = NodeRef::Project(theirs.id);
        self.merge_value(
            &mut ours.name,
            base.map(|b| &b.name),
            &theirs.name,
            node,
            "name",
        );
        self.merge_list(
            &mut ours.flight_plans,
            base.map(|b| b.flight_plans.as_slice()),
            &theirs.flight_plans,
            node,
            "flight_plans",
        );
        self.merge_set(
            &mut ours.goals,
            base.map(|b| &b.goals),
            &theirs.goals,
            node,
            "goals",
        );
        self.merge_set(
            &mut ours.datasets,
            base.map(|b| &b.datasets),
            &theirs.datasets,
            node,
            "datasets",
        );
        self.merge_list(
            &mut ours.users,
            base.map(|b| b.users.as_slice()),
            &theirs.users,
            node,
            "users",
        );
        self.merge_list(
            &mut ours.resources,
            base.map(|b| b.resources.as_slice()),
            &theirs.resources,
            node,
            "resources",
        );

        // Repository bookkeeping always follows the repository's side.
        ours.version = theirs.version;
        ours.modified = theirs.modified;
        ours.repository_type = theirs.repository_type;
        ours.prune_dangling_references();
    }

    // -----------------------------------------------------------------------
    // Scalars
    // -----------------------------------------------------------------------

    fn merge_value<T: PartialEq + Clone + Serialize>(
        &mut self,
        ours: &mut T,
        base: Option<&T>,
        theirs: &T,
        node: NodeRef,
        field: &str,
    ) {
        if *ours == *theirs {
            return;
        }
        let ours_changed = base.map_or(true, |b| *b != *ours);
        let theirs_changed = base.map_or(true, |b| *b != *theirs);
        let both = ours_changed && theirs_changed;

        match self.strategy.decide(ours_changed, theirs_changed) {
            Decision::Ours => {
                if both {
                    self.resolved += 1;
                }
            }
            Decision::Theirs => {
                if both {
                    self.resolved += 1;
                }
                *ours = theirs.clone();
            }
            Decision::Conflict => {
                let conflict = MergeConflict::value(
                    self.parents.path(node),
                    field,
                    to_json(ours),
                    to_json(theirs),
                );
                debug!(%conflict, "value conflict");
                self.conflicts.push(conflict);
            }
        }
    }

    // -----------------------------------------------------------------------
    // Collections
    // -----------------------------------------------------------------------

    /// Decide an item present on one side only that the base also had.
    /// Returns whether the item is part of the merged collection.
    fn settle_removal(
        &mut self,
        removed_by_us: bool,
        modified: bool,
        node: NodeRef,
        owner: NodeRef,
        field: &str,
    ) -> bool {
        let (ours_changed, theirs_changed) = if removed_by_us {
            (true, modified)
        } else {
            (modified, true)
        };
        let decision = self.strategy.decide(ours_changed, theirs_changed);
        if ours_changed && theirs_changed && decision != Decision::Conflict {
            self.resolved += 1;
        }
        match decision {
            Decision::Ours => !removed_by_us,
            Decision::Theirs => removed_by_us,
            Decision::Conflict => {
                let mut path = vec![node];
                path.extend(self.parents.path(owner));
                let conflict = MergeConflict::removed(path, field, removed_by_us);
                debug!(%conflict, "removal conflict");
                self.conflicts.push(conflict);
                !removed_by_us
            }
        }
    }

    fn merge_item<T: MergeItem>(&mut self, ours: &mut T, base: Option<&T>, theirs: &T) {
        if *ours != *theirs {
            T::merge_fields(self, ours, base, theirs);
        }
    }

    fn merge_set<T: MergeItem>(
        &mut self,
        ours: &mut KeyedSet<T>,
        base: Option<&KeyedSet<T>>,
        theirs: &KeyedSet<T>,
        owner: NodeRef,
        field: &str,
    ) {
        if *ours == *theirs {
            return;
        }
        let our_keys: HashSet<Uuid> = ours.keys().collect();

        for key in &our_keys {
            let base_item = base.and_then(|b| b.get(key));
            match theirs.get(key) {
                Some(their_item) => {
                    if let Some(item) = ours.get_mut(key) {
                        self.merge_item(item, base_item, their_item);
                    }
                }
                None => {
                    // Not in base means we added it.
                    let Some(base_item) = base_item else {
                        continue;
                    };
                    let modified = ours.get(key).map_or(false, |item| item != base_item);
                    if !self.settle_removal(false, modified, T::node(*key), owner, field) {
                        ours.remove(key);
                    }
                }
            }
        }

        for their_item in theirs.iter() {
            let key = their_item.key();
            if our_keys.contains(&key) {
                continue;
            }
            let keep = match base.and_then(|b| b.get(&key)) {
                Some(base_item) => {
                    self.settle_removal(true, their_item != base_item, T::node(key), owner, field)
                }
                None => true,
            };
            if keep {
                ours.insert(their_item.clone());
            }
        }
    }

    fn merge_list<T: MergeItem>(
        &mut self,
        ours: &mut Vec<T>,
        base: Option<&[T]>,
        theirs: &[T],
        owner: NodeRef,
        field: &str,
    ) {
        if ours.as_slice() == theirs {
            return;
        }
        let base_items: HashMap<Uuid, &T> = base
            .map(|b| b.iter().map(|item| (item.key(), item)).collect())
            .unwrap_or_default();
        let their_items: HashMap<Uuid, &T> =
            theirs.iter().map(|item| (item.key(), item)).collect();
        let our_keys: Vec<Uuid> = ours.iter().map(Keyed::key).collect();
        let their_keys: Vec<Uuid> = theirs.iter().map(Keyed::key).collect();
        let our_key_set: HashSet<Uuid> = our_keys.iter().copied().collect();

        // Membership and values.
        let mut merged: HashMap<Uuid, T> = HashMap::new();
        for mut item in ours.drain(..) {
            let key = item.key();
            let base_item = base_items.get(&key).copied();
            match their_items.get(&key) {
                Some(their_item) => {
                    self.merge_item(&mut item, base_item, their_item);
                    merged.insert(key, item);
                }
                None => {
                    let keep = match base_item {
                        Some(base_item) => {
                            let modified = item != *base_item;
                            self.settle_removal(false, modified, T::node(key), owner, field)
                        }
                        None => true,
                    };
                    if keep {
                        merged.insert(key, item);
                    }
                }
            }
        }
        for their_item in theirs {
            let key = their_item.key();
            if our_key_set.contains(&key) {
                continue;
            }
            let keep = match base_items.get(&key) {
                Some(base_item) => {
                    self.settle_removal(true, their_item != *base_item, T::node(key), owner, field)
                }
                None => true,
            };
            if keep {
                merged.insert(key, their_item.clone());
            }
        }

        // Order. Items on both sides form the skeleton; the skeleton follows
        // our order unless only their side reordered relative to the base.
        let shared: HashSet<Uuid> = our_keys
            .iter()
            .filter(|k| their_items.contains_key(k))
            .copied()
            .collect();
        let our_order: Vec<Uuid> = our_keys
            .iter()
            .filter(|k| shared.contains(k))
            .copied()
            .collect();
        let their_order: Vec<Uuid> = their_keys
            .iter()
            .filter(|k| shared.contains(k))
            .copied()
            .collect();
        let skeleton = if our_order == their_order {
            our_order
        } else {
            let base_order: Option<Vec<Uuid>> = base.map(|b| {
                b.iter()
                    .map(Keyed::key)
                    .filter(|k| shared.contains(k))
                    .collect()
            });
            let reordered = |order: &[Uuid]| match &base_order {
                Some(base_order) => {
                    let known: Vec<Uuid> = order
                        .iter()
                        .filter(|k| base_items.contains_key(k))
                        .copied()
                        .collect();
                    known != *base_order
                }
                None => true,
            };
            if reordered(&their_order) && !reordered(&our_order) {
                their_order
            } else {
                our_order
            }
        };

        // One-sided items stay after the nearest preceding shared item of
        // their own side; runs anchored at the same place are ordered by
        // their first id so the result does not depend on merge direction.
        let mut runs: BTreeMap<Option<Uuid>, Vec<Vec<Uuid>>> = BTreeMap::new();
        collect_runs(&our_keys, &shared, &merged, &mut runs);
        collect_runs(&their_keys, &shared, &merged, &mut runs);
        for group in runs.values_mut() {
            group.sort_by_key(|run| run.first().copied());
        }

        let mut order = Vec::with_capacity(merged.len());
        if let Some(group) = runs.remove(&None) {
            order.extend(group.into_iter().flatten());
        }
        for key in skeleton {
            order.push(key);
            if let Some(group) = runs.remove(&Some(key)) {
                order.extend(group.into_iter().flatten());
            }
        }
        *ours = order.into_iter().filter_map(|k| merged.remove(&k)).collect();
    }
}

fn collect_runs<T>(
    keys: &[Uuid],
    shared: &HashSet<Uuid>,
    merged: &HashMap<Uuid, T>,
    runs: &mut BTreeMap<Option<Uuid>, Vec<Vec<Uuid>>>,
) {
    let mut anchor = None;
    let mut run = Vec::new();
    for key in keys {
        if shared.contains(key) {
            if !run.is_empty() {
                runs.entry(anchor).or_default().push(std::mem::take(&mut run));
            }
            anchor = Some(*key);
        } else if merged.contains_key(key) {
            run.push(*key);
        }
    }
    if !run.is_empty() {
        runs.entry(anchor).or_default().push(run);
    }
}

fn to_json<T: Serialize>(value: &T) -> serde_json::Value {
    serde_json::to_value(value).unwrap_or(serde_json::Value::Null)
}

// ---------------------------------------------------------------------------
// Per-type field merges
// ---------------------------------------------------------------------------

/// A collection member the merger can recurse into.
trait MergeItem: Keyed + Clone + PartialEq + Serialize {
    fn node(id: Uuid) -> NodeRef;
    fn merge_fields(merger: &mut Merger<'_>, ours: &mut Self, base: Option<&Self>, theirs: &Self);
}

macro_rules! merge_fields {
    ($merger:expr, $ours:expr, $base:expr, $theirs:expr, $node:expr; $($field:ident),+ $(,)?) => {
        $(
            $merger.merge_value(
                &mut $ours.$field,
                $base.map(|b| &b.$field),
                &$theirs.$field,
                $node,
                stringify!($field),
            );
        )+
    };
}

impl MergeItem for FlightPlan {
    fn node(id: Uuid) -> NodeRef {
        NodeRef::FlightPlan(id)
    }

    fn merge_fields(merger: &mut Merger<'_>, ours: &mut Self, base: Option<&Self>, theirs: &Self) {
        let node = Self::node(ours.id);
        merge_fields!(merger, ours, base, theirs, node; name, goal_ids);
        merger.merge_list(
            &mut ours.waypoints,
            base.map(|b| b.waypoints.as_slice()),
            &theirs.waypoints,
            node,
            "waypoints",
        );
    }
}

impl MergeItem for Waypoint {
    fn node(id: Uuid) -> NodeRef {
        NodeRef::Waypoint(id)
    }

    fn merge_fields(merger: &mut Merger<'_>, ours: &mut Self, base: Option<&Self>, theirs: &Self) {
        let node = Self::node(ours.id);
        merge_fields!(merger, ours, base, theirs, node; position, speed, hold_secs);
    }
}

impl MergeItem for Goal {
    fn node(id: Uuid) -> NodeRef {
        NodeRef::Goal(id)
    }

    fn merge_fields(merger: &mut Merger<'_>, ours: &mut Self, base: Option<&Self>, theirs: &Self) {
        let node = Self::node(ours.id);
        merge_fields!(merger, ours, base, theirs, node; name, kind, vertices, altitude);
    }
}

impl MergeItem for Dataset {
    fn node(id: Uuid) -> NodeRef {
        NodeRef::Dataset(id)
    }

    fn merge_fields(merger: &mut Merger<'_>, ours: &mut Self, base: Option<&Self>, theirs: &Self) {
        let node = Self::node(ours.id);
        merge_fields!(merger, ours, base, theirs, node; name, kind, resource);
    }
}

impl MergeItem for User {
    fn node(id: Uuid) -> NodeRef {
        NodeRef::User(id)
    }

    fn merge_fields(merger: &mut Merger<'_>, ours: &mut Self, base: Option<&Self>, theirs: &Self) {
        let node = Self::node(ours.id);
        merge_fields!(merger, ours, base, theirs, node; name, role);
    }
}

impl MergeItem for ResourceRef {
    fn node(id: Uuid) -> NodeRef {
        NodeRef::Resource(id)
    }

    fn merge_fields(merger: &mut Merger<'_>, ours: &mut Self, base: Option<&Self>, theirs: &Self) {
        let node = Self::node(ours.id);
        merge_fields!(merger, ours, base, theirs, node; name, media_type);
    }
}
