//! Debounced project synchronization.
//!
//! The [`ProjectManager`] keeps the aggregated list of available projects,
//! watches the current project for local edits and runs the merge/save
//! cycle that persists them. Each managed project gets its own lane (a tokio
//! task fed by a channel), so two cycles for the same project never run at
//! the same time; aggregation runs on a lane of its own.

mod cycle;
mod lane;
mod manager;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::SyncTuning;
use crate::merge::{MergeConflict, MergeStrategy};

pub use manager::{ProjectList, ProjectManager};

// ---------------------------------------------------------------------------
// Per-project state machine
// ---------------------------------------------------------------------------

/// Where a project is in its synchronization cycle.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    #[default]
    Idle,
    MergePending,
    Saving,
    RetryPending,
}

impl std::fmt::Display for SyncState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::MergePending => write!(f, "merge_pending"),
            Self::Saving => write!(f, "saving"),
            Self::RetryPending => write!(f, "retry_pending"),
        }
    }
}

/// Result of one synchronization cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Local copy and repository already agreed.
    Unchanged,
    /// The repository's changes were taken over; nothing needed saving.
    Updated { version: u64 },
    /// The merged project was saved.
    Saved { version: u64, attempts: u32 },
    /// Conflicts were left open; they are recorded on the project and
    /// nothing was saved.
    Conflicted { conflicts: usize },
}

/// Chooses a strategy for a non-empty list of merge conflicts.
pub type ConflictCallback = Arc<dyn Fn(&[MergeConflict]) -> MergeStrategy + Send + Sync>;

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub struct SyncSettings {
    /// Quiet period after the last local edit before a cycle runs.
    pub debounce: Duration,
    /// Longest a stream of edits may hold back a cycle, counted from the
    /// first unsaved edit.
    pub max_delay: Duration,
    /// Save attempts per cycle; 0 means unbounded.
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self::from(&SyncTuning::default())
    }
}

impl From<&SyncTuning> for SyncSettings {
    fn from(tuning: &SyncTuning) -> Self {
        Self {
            debounce: Duration::from_millis(tuning.debounce_ms),
            max_delay: Duration::from_millis(tuning.max_delay_ms),
            max_attempts: tuning.max_attempts,
            backoff_base: Duration::from_millis(tuning.backoff_base_ms),
            backoff_max: Duration::from_millis(tuning.backoff_max_ms),
        }
    }
}

impl SyncSettings {
    /// Delay before retry number `attempt` (1-based), doubling from the base
    /// up to the cap.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.backoff_base
            .saturating_mul(1u32 << exponent)
            .min(self.backoff_max)
    }
}

// ---------------------------------------------------------------------------
// Statistics
// ---------------------------------------------------------------------------

/// Counters since the manager was created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStats {
    pub cycles: u64,
    pub saves: u64,
    pub retries: u64,
    pub conflicts: u64,
    pub failures: u64,
    pub aggregations: u64,
}

#[derive(Default)]
pub(crate) struct StatsCounters {
    cycles: AtomicU64,
    saves: AtomicU64,
    retries: AtomicU64,
    conflicts: AtomicU64,
    failures: AtomicU64,
    aggregations: AtomicU64,
}

impl StatsCounters {
    pub(crate) fn snapshot(&self) -> SyncStats {
        SyncStats {
            cycles: self.cycles.load(Ordering::SeqCst),
            saves: self.saves.load(Ordering::SeqCst),
            retries: self.retries.load(Ordering::SeqCst),
            conflicts: self.conflicts.load(Ordering::SeqCst),
            failures: self.failures.load(Ordering::SeqCst),
            aggregations: self.aggregations.load(Ordering::SeqCst),
        }
    }

    fn bump(counter: &AtomicU64, by: u64) {
        counter.fetch_add(by, Ordering::SeqCst);
    }

    pub(crate) fn cycle(&self) {
        Self::bump(&self.cycles, 1);
    }

    pub(crate) fn save(&self) {
        Self::bump(&self.saves, 1);
    }

    pub(crate) fn retry(&self) {
        Self::bump(&self.retries, 1);
    }

    pub(crate) fn conflicts(&self, count: usize) {
        Self::bump(&self.conflicts, count as u64);
    }

    pub(crate) fn failure(&self) {
        Self::bump(&self.failures, 1);
    }

    pub(crate) fn aggregation(&self) {
        Self::bump(&self.aggregations, 1);
    }
}
