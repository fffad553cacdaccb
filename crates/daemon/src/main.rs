//! ProjectSync daemon entry point.
//!
//! Loads configuration, wires the local and optional cloud repository into
//! a project manager, runs the refresh scheduler and handles graceful
//! shutdown.

mod scheduler;
mod signals;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use projectsync_core::config::SyncConfig;
use projectsync_core::merge::MergeConflict;
use projectsync_core::repository::{CloudRepository, LocalRepository};
use projectsync_core::sync::{ProjectManager, SyncSettings};

// ---------------------------------------------------------------------------
// CLI arguments
// ---------------------------------------------------------------------------

/// ProjectSync synchronization daemon.
#[derive(Parser, Debug)]
#[command(
    name = "projectsync-daemon",
    version,
    about = "Keeps survey projects in sync across local and cloud repositories"
)]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(short, long)]
    config: PathBuf,

    /// Override the log level from the config file (trace, debug, info, warn, error).
    #[arg(long)]
    log_level: Option<String>,
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

/// Install the global subscriber. With a log directory the output goes to a
/// daily rolling file; the returned guard flushes it on drop.
fn init_tracing(log_level: &str, log_dir: Option<&PathBuf>) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir).context("failed to create log directory")?;
            let appender = tracing_appender::rolling::daily(dir, "projectsync.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(true)
                .with_ansi(false)
                .with_writer(writer)
                .init();
            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(true)
                .with_thread_ids(false)
                .with_file(false)
                .init();
            Ok(None)
        }
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load and resolve configuration
    let mut config =
        SyncConfig::load_from_file(&args.config).context("failed to load configuration file")?;
    config
        .resolve_env_vars()
        .context("failed to resolve environment variables in config")?;
    config
        .validate()
        .context("configuration validation failed")?;

    let log_level = args
        .log_level
        .clone()
        .unwrap_or_else(|| config.daemon.log_level.clone());
    let _log_guard = init_tracing(&log_level, config.daemon.log_dir.as_ref())?;

    // Startup banner
    info!("========================================");
    info!("  ProjectSync Daemon v{}", env!("CARGO_PKG_VERSION"));
    info!("========================================");
    info!("Config file     : {}", args.config.display());
    info!("Local root      : {}", config.local.root.display());
    info!("Watch local     : {}", config.local.watch);
    info!(
        "Cloud           : {}",
        config
            .cloud
            .as_ref()
            .map(|c| c.base_url.as_str())
            .unwrap_or("disabled")
    );
    info!("Poll interval   : {}s", config.daemon.poll_interval_secs);
    info!("Debounce        : {}ms", config.sync.debounce_ms);
    info!("Max sync delay  : {}ms", config.sync.max_delay_ms);
    info!("Conflict policy : {}", config.sync.conflict_policy);
    info!("Log level       : {}", log_level);
    info!("========================================");

    let manager = ProjectManager::new(SyncSettings::from(&config.sync));

    let strategy = config.sync.conflict_policy.strategy();
    manager.register_conflict_callback(move |conflicts: &[MergeConflict]| {
        for conflict in conflicts {
            warn!(%conflict, ?strategy, "merge conflict");
        }
        strategy
    });

    // Local repository
    let watch = config.local.watch.then(|| config.watcher.options());
    let local = LocalRepository::open(&config.local.root, watch)
        .context("failed to open local repository")?;
    let local_id = manager.add_repository(Arc::new(local));
    info!(repository = %local_id, "local repository registered");

    // Cloud repository. An unusable cloud section is not fatal; the daemon
    // still serves the local projects.
    if let Some(cloud) = &config.cloud {
        match CloudRepository::new(cloud) {
            Ok(repository) => {
                let cloud_id = manager.add_repository(Arc::new(repository));
                info!(repository = %cloud_id, "cloud repository registered");
            }
            Err(e) => warn!(error = %e, "cloud repository unavailable, continuing without it"),
        }
    }

    manager
        .refresh_and_wait()
        .await
        .context("initial project aggregation failed")?;
    info!(
        projects = manager.available_projects().len(),
        "initial aggregation complete"
    );

    // Create a shutdown notify for cooperative cancellation
    let shutdown = Arc::new(tokio::sync::Notify::new());
    let scheduler_shutdown = shutdown.clone();

    let poll_interval = Duration::from_secs(config.daemon.poll_interval_secs);
    let mut sched = scheduler::Scheduler::new(manager.clone(), poll_interval);

    let scheduler_handle = tokio::spawn(async move {
        sched.run(scheduler_shutdown).await;
    });

    // Wait for shutdown signal
    signals::wait_for_shutdown().await;

    info!("Shutdown signal received, stopping...");

    shutdown.notify_waiters();

    match tokio::time::timeout(Duration::from_secs(10), scheduler_handle).await {
        Ok(Ok(())) => info!("scheduler stopped gracefully"),
        Ok(Err(e)) => warn!("scheduler task error: {}", e),
        Err(_) => warn!("scheduler did not stop within 10s, forcing shutdown"),
    }

    // Let in-flight cycles finish so pending edits reach their repository.
    if tokio::time::timeout(Duration::from_secs(10), manager.shutdown())
        .await
        .is_err()
    {
        warn!("project manager did not stop within 10s");
    }

    info!("ProjectSync daemon stopped.");
    Ok(())
}
