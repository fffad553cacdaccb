//! Refresh scheduler that re-aggregates the available projects on a
//! configurable interval and reports synchronizer activity.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time;
use tracing::{debug, info, warn};

use projectsync_core::sync::{ProjectManager, SyncStats};

/// The refresh scheduler.
///
/// Repositories without change notifications (the cloud backend) are only
/// picked up by these periodic refreshes. Refresh requests made while an
/// aggregation is still running coalesce inside the manager, so a slow
/// repository never queues up work here.
pub struct Scheduler {
    manager: ProjectManager,
    poll_interval: Duration,
    last: SyncStats,
}

impl Scheduler {
    pub fn new(manager: ProjectManager, poll_interval: Duration) -> Self {
        let last = manager.stats();
        Self {
            manager,
            poll_interval,
            last,
        }
    }

    /// Main scheduler loop. Runs until `shutdown` is notified.
    pub async fn run(&mut self, shutdown: Arc<Notify>) {
        info!(
            poll_interval_secs = self.poll_interval.as_secs(),
            "scheduler started"
        );

        let mut interval = time::interval(self.poll_interval);
        // The first tick fires immediately; the daemon has just aggregated.
        interval.tick().await;

        let mut projects = self.manager.subscribe();

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let generation = self.manager.refresh();
                    debug!(generation, "refresh requested");
                    self.report();
                }
                changed = projects.changed() => {
                    if changed.is_err() {
                        warn!("project list closed, stopping scheduler");
                        break;
                    }
                    let count = projects.borrow_and_update().len();
                    info!(projects = count, "available projects changed");
                }
                _ = shutdown.notified() => {
                    info!("scheduler received shutdown");
                    break;
                }
            }
        }
    }

    /// Log what the synchronizer did since the previous report.
    fn report(&mut self) {
        let stats = self.manager.stats();
        let last = std::mem::replace(&mut self.last, stats);
        if stats == last {
            return;
        }

        let failures = stats.failures - last.failures;
        if failures > 0 {
            warn!(
                failures,
                total_failures = stats.failures,
                "sync cycles failed since last report"
            );
        }
        info!(
            cycles = stats.cycles - last.cycles,
            saves = stats.saves - last.saves,
            retries = stats.retries - last.retries,
            conflicts = stats.conflicts - last.conflicts,
            aggregations = stats.aggregations - last.aggregations,
            "sync activity"
        );
    }
}
