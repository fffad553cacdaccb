//! TOML-based configuration for ProjectSync.
//!
//! Secrets (the cloud bearer token) are never stored in the file; the file
//! names an environment variable instead and the value is resolved at runtime
//! via [`SyncConfig::resolve_env_vars`].

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::errors::ConfigError;
use crate::merge::MergeStrategy;
use crate::watcher::{WatchMode, WatcherOptions};

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Top-level configuration loaded from a TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Host process settings.
    #[serde(default)]
    pub daemon: DaemonConfig,

    /// Local filesystem repository.
    #[serde(default)]
    pub local: LocalConfig,

    /// Filesystem change watcher.
    #[serde(default)]
    pub watcher: WatcherConfig,

    /// Optional cloud repository.
    #[serde(default)]
    pub cloud: Option<CloudConfig>,

    /// Synchronizer tunables.
    #[serde(default)]
    pub sync: SyncTuning,
}

// ---------------------------------------------------------------------------
// Daemon
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Minimum tracing level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Seconds between aggregation refreshes (repositories without change
    /// notifications are only picked up this way).
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Write daily-rolling log files here in addition to stdout.
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
}

fn default_log_level() -> String {
    "info".into()
}
fn default_poll_interval() -> u64 {
    30
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            poll_interval_secs: default_poll_interval(),
            log_dir: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Local repository
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalConfig {
    /// Directory holding one subdirectory per project.
    #[serde(default = "default_local_root")]
    pub root: PathBuf,

    /// Watch the root for changes made by other processes.
    #[serde(default = "default_true")]
    pub watch: bool,
}

fn default_local_root() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("projectsync")
        .join("projects")
}
fn default_true() -> bool {
    true
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            root: default_local_root(),
            watch: true,
        }
    }
}

// ---------------------------------------------------------------------------
// Watcher
// ---------------------------------------------------------------------------

/// Watch registration mode as written in the config file.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WatchModeSetting {
    /// Pick the platform default.
    #[default]
    Auto,
    Native,
    PerDirectory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatcherConfig {
    #[serde(default)]
    pub mode: WatchModeSetting,

    /// Window in which duplicate notifications for a path collapse.
    #[serde(default = "default_coalesce_ms")]
    pub coalesce_ms: u64,
}

fn default_coalesce_ms() -> u64 {
    50
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            mode: WatchModeSetting::default(),
            coalesce_ms: default_coalesce_ms(),
        }
    }
}

impl WatcherConfig {
    pub fn options(&self) -> WatcherOptions {
        let mode = match self.mode {
            WatchModeSetting::Auto => WatchMode::for_platform(),
            WatchModeSetting::Native => WatchMode::Native,
            WatchModeSetting::PerDirectory => WatchMode::PerDirectory,
        };
        WatcherOptions {
            coalesce: Duration::from_millis(self.coalesce_ms),
            mode,
        }
    }
}

// ---------------------------------------------------------------------------
// Cloud repository
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloudConfig {
    /// Service base URL, e.g. `https://sync.example.com/api`.
    pub base_url: String,

    /// Environment variable holding the bearer token.
    #[serde(default = "default_token_env")]
    pub token_env: String,

    /// Per-request timeout.
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Resolved token (populated by `resolve_env_vars`).
    #[serde(skip)]
    pub token: Option<String>,
}

fn default_token_env() -> String {
    "PROJECTSYNC_CLOUD_TOKEN".into()
}
fn default_timeout() -> u64 {
    30
}

// ---------------------------------------------------------------------------
// Sync
// ---------------------------------------------------------------------------

/// How the daemon answers the conflict callback.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// Resolve every conflict toward the local working copy.
    KeepLocal,
    /// Resolve every conflict toward the repository.
    KeepTheirs,
    /// Save nothing and leave the conflict open on the project until it is
    /// resolved by an edit.
    #[default]
    Leave,
}

impl ConflictPolicy {
    pub fn strategy(self) -> MergeStrategy {
        match self {
            Self::KeepLocal => MergeStrategy::KeepOurs,
            Self::KeepTheirs => MergeStrategy::KeepTheirs,
            Self::Leave => MergeStrategy::Default,
        }
    }
}

impl std::fmt::Display for ConflictPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::KeepLocal => write!(f, "keep_local"),
            Self::KeepTheirs => write!(f, "keep_theirs"),
            Self::Leave => write!(f, "leave"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncTuning {
    /// Quiet period after the last local edit before a cycle runs.
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,

    /// Upper bound on how long continuous editing postpones a cycle.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Save attempts per cycle; 0 retries `Outdated` saves indefinitely.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,

    #[serde(default)]
    pub conflict_policy: ConflictPolicy,
}

fn default_debounce_ms() -> u64 {
    250
}
fn default_max_delay_ms() -> u64 {
    2_000
}
fn default_max_attempts() -> u32 {
    10
}
fn default_backoff_base_ms() -> u64 {
    20
}
fn default_backoff_max_ms() -> u64 {
    2_000
}

impl Default for SyncTuning {
    fn default() -> Self {
        Self {
            debounce_ms: default_debounce_ms(),
            max_delay_ms: default_max_delay_ms(),
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            conflict_policy: ConflictPolicy::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Loading & resolving
// ---------------------------------------------------------------------------

impl SyncConfig {
    /// Load a [`SyncConfig`] from a TOML file at the given path.
    ///
    /// This does **not** resolve environment variables -- call
    /// [`resolve_env_vars`](Self::resolve_env_vars) afterwards.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        info!(path = %path.display(), "loading configuration");

        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }

        let contents = std::fs::read_to_string(path)?;
        let config: SyncConfig =
            toml::from_str(&contents).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        debug!("configuration parsed successfully");
        Ok(config)
    }

    /// Resolve `*_env` fields from environment variables.
    ///
    /// A missing variable logs a warning but does not fail; the cloud
    /// repository then runs without authentication.
    pub fn resolve_env_vars(&mut self) -> Result<(), ConfigError> {
        if let Some(cloud) = self.cloud.as_mut() {
            cloud.token = resolve_optional_env(&cloud.token_env, "cloud.token_env");
        }
        Ok(())
    }

    /// Validate that all values are sane.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.local.root.as_os_str().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "local.root".into(),
                detail: "local repository root must not be empty".into(),
            });
        }
        if self.daemon.poll_interval_secs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "daemon.poll_interval_secs".into(),
                detail: "poll interval must be > 0".into(),
            });
        }
        if self.sync.debounce_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "sync.debounce_ms".into(),
                detail: "debounce window must be > 0".into(),
            });
        }
        if self.sync.max_delay_ms < self.sync.debounce_ms {
            return Err(ConfigError::InvalidValue {
                field: "sync.max_delay_ms".into(),
                detail: "max delay must not be shorter than debounce_ms".into(),
            });
        }
        if self.sync.backoff_base_ms > self.sync.backoff_max_ms {
            return Err(ConfigError::InvalidValue {
                field: "sync.backoff_base_ms".into(),
                detail: "backoff base must not exceed backoff_max_ms".into(),
            });
        }
        if let Some(cloud) = &self.cloud {
            if !(cloud.base_url.starts_with("http://") || cloud.base_url.starts_with("https://"))
            {
                return Err(ConfigError::InvalidValue {
                    field: "cloud.base_url".into(),
                    detail: "base URL must start with http:// or https://".into(),
                });
            }
            if cloud.timeout_secs == 0 {
                return Err(ConfigError::InvalidValue {
                    field: "cloud.timeout_secs".into(),
                    detail: "timeout must be > 0".into(),
                });
            }
        }

        Ok(())
    }

    /// Convenience: load, resolve, and validate in one call.
    pub fn load_and_resolve<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.resolve_env_vars()?;
        config.validate()?;
        Ok(config)
    }
}

/// Read an environment variable by name. Logs a warning and returns `None`
/// if the variable is unset or empty.
fn resolve_optional_env(env_name: &str, field: &str) -> Option<String> {
    match std::env::var(env_name) {
        Ok(val) if !val.is_empty() => {
            debug!(field, env_name, "resolved env var");
            Some(val)
        }
        Ok(_) => {
            warn!(field, env_name, "env var is set but empty");
            None
        }
        Err(_) => {
            warn!(field, env_name, "env var not set");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn sample_toml() -> &'static str {
        r#"
[daemon]
log_level = "debug"
poll_interval_secs = 15
log_dir = "/var/log/projectsync"

[local]
root = "/tmp/projectsync/projects"
watch = true

[watcher]
mode = "per_directory"
coalesce_ms = 75

[cloud]
base_url = "https://sync.example.com/api"
token_env = "TEST_CLOUD_TOKEN"
timeout_secs = 10

[sync]
debounce_ms = 300
max_attempts = 5
backoff_base_ms = 10
backoff_max_ms = 500
conflict_policy = "keep_theirs"
"#
    }

    #[test]
    fn test_parse_full_config() {
        let config: SyncConfig = toml::from_str(sample_toml()).expect("failed to parse toml");
        assert_eq!(config.daemon.poll_interval_secs, 15);
        assert_eq!(config.local.root, PathBuf::from("/tmp/projectsync/projects"));
        assert_eq!(config.watcher.mode, WatchModeSetting::PerDirectory);
        assert_eq!(config.watcher.options().coalesce, Duration::from_millis(75));
        let cloud = config.cloud.as_ref().unwrap();
        assert_eq!(cloud.base_url, "https://sync.example.com/api");
        assert_eq!(config.sync.max_attempts, 5);
        assert_eq!(config.sync.conflict_policy, ConflictPolicy::KeepTheirs);
        assert_eq!(
            config.sync.conflict_policy.strategy(),
            MergeStrategy::KeepTheirs
        );
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(sample_toml().as_bytes()).unwrap();

        let config = SyncConfig::load_from_file(&path).expect("load_from_file failed");
        assert_eq!(config.daemon.log_level, "debug");
    }

    #[test]
    fn test_file_not_found() {
        let result = SyncConfig::load_from_file("/nonexistent/config.toml");
        assert!(matches!(result, Err(ConfigError::FileNotFound(_))));
    }

    #[test]
    fn test_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[sync\ndebounce_ms = ").unwrap();
        let result = SyncConfig::load_from_file(&path);
        assert!(matches!(result, Err(ConfigError::ParseError(_))));
    }

    #[test]
    fn test_validate_rejects_bad_cloud_url() {
        let mut config: SyncConfig = toml::from_str(sample_toml()).unwrap();
        if let Some(cloud) = config.cloud.as_mut() {
            cloud.base_url = "sync.example.com".into();
        }
        let result = config.validate();
        assert!(matches!(
            result,
            Err(ConfigError::InvalidValue { ref field, .. }) if field == "cloud.base_url"
        ));
    }

    #[test]
    fn test_validate_rejects_inverted_backoff() {
        let mut config: SyncConfig = toml::from_str(sample_toml()).unwrap();
        config.sync.backoff_base_ms = 1_000;
        let result = config.validate();
        assert!(matches!(
            result,
            Err(ConfigError::InvalidValue { ref field, .. }) if field == "sync.backoff_base_ms"
        ));
    }

    #[test]
    fn test_validate_rejects_max_delay_below_debounce() {
        let mut config: SyncConfig = toml::from_str(sample_toml()).unwrap();
        config.sync.max_delay_ms = 100;
        let result = config.validate();
        assert!(matches!(
            result,
            Err(ConfigError::InvalidValue { ref field, .. }) if field == "sync.max_delay_ms"
        ));
    }

    #[test]
    fn test_resolve_env_vars() {
        std::env::set_var("TEST_CLOUD_TOKEN", "tok_abc");

        let mut config: SyncConfig = toml::from_str(sample_toml()).unwrap();
        config.resolve_env_vars().unwrap();
        assert_eq!(
            config.cloud.as_ref().and_then(|c| c.token.as_deref()),
            Some("tok_abc")
        );

        std::env::remove_var("TEST_CLOUD_TOKEN");
    }

    #[test]
    fn test_defaults() {
        let config: SyncConfig = toml::from_str("").unwrap();
        assert_eq!(config.daemon.log_level, "info");
        assert_eq!(config.daemon.poll_interval_secs, 30);
        assert!(config.local.watch);
        assert!(config.local.root.ends_with("projectsync/projects"));
        assert_eq!(config.watcher.coalesce_ms, 50);
        assert_eq!(config.watcher.options().mode, WatchMode::for_platform());
        assert!(config.cloud.is_none());
        assert_eq!(config.sync.debounce_ms, 250);
        assert_eq!(config.sync.max_delay_ms, 2_000);
        assert_eq!(config.sync.max_attempts, 10);
        assert_eq!(config.sync.conflict_policy, ConflictPolicy::Leave);
        config.validate().unwrap();
    }
}
