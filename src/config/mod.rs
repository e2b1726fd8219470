/// Configuration management for the Flowy engine
///
/// Handles storage locations and scheduler tuning. Every knob has an
/// environment-variable override so the engine can be dropped into a
/// container without code changes.
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Storage configuration
    pub storage: StorageConfig,
    /// Scheduler configuration
    pub scheduler: SchedulerConfig,
}

/// Storage locations for definitions, history, logs and backups
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Base directory for all engine files (default: "data")
    /// Creates: flowy.db, flowy_history.db, log/, backups/
    pub data_dir: String,
}

/// Scheduler tuning parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Number of flow executions the scheduler runs at the same time
    pub worker_pool_size: usize,
    /// Seconds between two reconciliation passes
    pub reconcile_interval_secs: u64,
    /// Seconds between two orphan-detection passes
    pub orphan_check_interval_secs: u64,
    /// Age after which a pending row without a live job is an orphan
    pub pending_timeout_secs: u64,
    /// Age after which a running row without running tasks is an orphan
    pub running_timeout_secs: u64,
    /// Rows fetched per orphan/retention scan page
    pub scan_batch_size: u32,
    /// Lateness tolerated before a cron firing counts as missed
    pub misfire_grace_secs: u64,
    /// Delay applied to ad-hoc runs when the caller does not pass one
    pub adhoc_default_delay_secs: u64,
    /// History retention window in days (None disables cleanup)
    pub retention_days: Option<u32>,
    /// Seconds between two retention passes
    pub retention_interval_secs: u64,
}

impl StorageConfig {
    /// Flow and trigger definitions database
    pub fn definitions_db_path(&self) -> PathBuf {
        PathBuf::from(&self.data_dir).join("flowy.db")
    }

    /// Execution history database (the one the migration manager evolves)
    pub fn history_db_path(&self) -> PathBuf {
        PathBuf::from(&self.data_dir).join("flowy_history.db")
    }

    /// Directory holding one log file per flow execution
    pub fn log_dir(&self) -> PathBuf {
        PathBuf::from(&self.data_dir).join("log")
    }

    /// Directory holding pre-migration backups
    pub fn backup_dir(&self) -> PathBuf {
        PathBuf::from(&self.data_dir).join("backups")
    }
}

impl SchedulerConfig {
    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs.max(1))
    }

    pub fn orphan_check_interval(&self) -> Duration {
        Duration::from_secs(self.orphan_check_interval_secs.max(1))
    }

    pub fn retention_interval(&self) -> Duration {
        Duration::from_secs(self.retention_interval_secs.max(1))
    }

    pub fn pending_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.pending_timeout_secs as i64)
    }

    pub fn running_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.running_timeout_secs as i64)
    }

    pub fn misfire_grace(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.misfire_grace_secs as i64)
    }

    /// Retention window, if cleanup is enabled
    pub fn retention(&self) -> Option<chrono::Duration> {
        self.retention_days
            .map(|days| chrono::Duration::days(i64::from(days)))
    }
}

impl Config {
    /// Default configuration rooted at a specific data directory
    pub fn with_data_dir(data_dir: impl Into<String>) -> Self {
        let mut config = Self::default();
        config.storage.data_dir = data_dir.into();
        config
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            worker_pool_size: env_or("FLOWY_WORKER_POOL_SIZE", 10),
            reconcile_interval_secs: 60,
            orphan_check_interval_secs: 300,
            pending_timeout_secs: env_or("FLOWY_PENDING_TIMEOUT_SECS", 300),
            running_timeout_secs: env_or("FLOWY_RUNNING_TIMEOUT_SECS", 86_400),
            scan_batch_size: 100,
            misfire_grace_secs: 30,
            adhoc_default_delay_secs: 1,
            retention_days: std::env::var("FLOWY_RETENTION_DAYS")
                .ok()
                .and_then(|v| v.parse().ok()),
            retention_interval_secs: 3_600,
        }
    }
}

impl Default for Config {
    /// Default configuration with ENV_VAR support for k8s/container deployment
    fn default() -> Self {
        Self {
            storage: StorageConfig {
                data_dir: std::env::var("FLOWY_DATA_DIR").unwrap_or_else(|_| "data".to_string()),
            },
            scheduler: SchedulerConfig::default(),
        }
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
