//! Three-way merging of projects.

pub mod conflict;
pub mod merger;
pub mod set;
pub mod strategy;

pub use conflict::{conflicts_equivalent, ConflictKind, MergeConflict};
pub use merger::{MergeOutcome, Merger};
pub use set::merge_project_sets;
pub use strategy::{Decision, MergeStrategy};
