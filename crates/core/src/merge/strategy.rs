//! Merge strategies.

use serde::{Deserialize, Serialize};

/// Outcome of a single strategy decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Keep our value.
    Ours,
    /// Take their value.
    Theirs,
    /// Leave our value and record a conflict.
    Conflict,
}

/// Policy used to reconcile two differing versions of a value.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategy {
    /// Take the changed side; record a conflict when both sides changed.
    #[default]
    Default,
    /// Same decisions as `Default` but nothing is mutated.
    DryRun,
    /// Every conflict is resolved toward our side.
    #[serde(alias = "keep_local")]
    KeepOurs,
    /// Every conflict is resolved toward their side.
    KeepTheirs,
}

impl MergeStrategy {
    /// Decide a differing value given which sides changed it relative to the
    /// common baseline.
    pub fn decide(self, ours_changed: bool, theirs_changed: bool) -> Decision {
        if !theirs_changed {
            return Decision::Ours;
        }
        if !ours_changed {
            return Decision::Theirs;
        }
        match self {
            Self::Default | Self::DryRun => Decision::Conflict,
            Self::KeepOurs => Decision::Ours,
            Self::KeepTheirs => Decision::Theirs,
        }
    }

    /// Whether a merge with this strategy writes its result back.
    pub fn mutates(self) -> bool {
        !matches!(self, Self::DryRun)
    }
}

impl std::fmt::Display for MergeStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Default => write!(f, "default"),
            Self::DryRun => write!(f, "dry_run"),
            Self::KeepOurs => write!(f, "keep_ours"),
            Self::KeepTheirs => write!(f, "keep_theirs"),
        }
    }
}
