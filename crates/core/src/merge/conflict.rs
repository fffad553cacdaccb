//! Merge conflict records.

use serde::{Deserialize, Serialize};

use crate::model::NodeRef;

/// What kind of disagreement a conflict records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConflictKind {
    /// Both sides changed the same field to different values.
    Value {
        ours: serde_json::Value,
        theirs: serde_json::Value,
    },
    /// One side removed an item the other side modified.
    Removed { removed_by_us: bool },
}

/// One irreconcilable difference found by a merge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeConflict {
    /// The conflicting node first, then its parents up to the project.
    pub path: Vec<NodeRef>,
    /// Field of the node (or collection holding the removed item).
    pub field: String,
    pub kind: ConflictKind,
}

impl MergeConflict {
    pub fn value(
        path: Vec<NodeRef>,
        field: impl Into<String>,
        ours: serde_json::Value,
        theirs: serde_json::Value,
    ) -> Self {
        Self {
            path,
            field: field.into(),
            kind: ConflictKind::Value { ours, theirs },
        }
    }

    pub fn removed(path: Vec<NodeRef>, field: impl Into<String>, removed_by_us: bool) -> Self {
        Self {
            path,
            field: field.into(),
            kind: ConflictKind::Removed { removed_by_us },
        }
    }

    /// The node the conflict is attached to.
    pub fn node(&self) -> Option<NodeRef> {
        self.path.first().copied()
    }

    pub fn is_removal(&self) -> bool {
        matches!(self.kind, ConflictKind::Removed { .. })
    }

    /// The same conflict seen from the other side of the merge.
    pub fn mirrored(&self) -> Self {
        let kind = match &self.kind {
            ConflictKind::Value { ours, theirs } => ConflictKind::Value {
                ours: theirs.clone(),
                theirs: ours.clone(),
            },
            ConflictKind::Removed { removed_by_us } => ConflictKind::Removed {
                removed_by_us: !removed_by_us,
            },
        };
        Self {
            path: self.path.clone(),
            field: self.field.clone(),
            kind,
        }
    }
}

impl std::fmt::Display for MergeConflict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let node = self
            .node()
            .map(|n| n.to_string())
            .unwrap_or_else(|| "?".to_string());
        match &self.kind {
            ConflictKind::Value { ours, theirs } => {
                write!(f, "{}.{}: ours={} theirs={}", node, self.field, ours, theirs)
            }
            ConflictKind::Removed { removed_by_us: true } => {
                write!(f, "{} in {}: removed here, modified remotely", node, self.field)
            }
            ConflictKind::Removed {
                removed_by_us: false,
            } => write!(f, "{} in {}: modified here, removed remotely", node, self.field),
        }
    }
}

/// Whether two conflict lists describe the same disagreements, ignoring order.
pub fn conflicts_equivalent(a: &[MergeConflict], b: &[MergeConflict]) -> bool {
    a.len() == b.len() && a.iter().all(|c| b.contains(c))
}
