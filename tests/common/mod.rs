//! Shared helpers for integration tests.

#![allow(dead_code)]

use flowy::{config::Config, store::FlowStatus, Flowy};
use std::time::Duration;
use tempfile::TempDir;

/// Config rooted in `dir` with quiet background loops and zero ad-hoc delay.
pub fn test_config(dir: &TempDir) -> Config {
    let mut config = Config::with_data_dir(dir.path().to_string_lossy().to_string());
    config.scheduler.worker_pool_size = 4;
    config.scheduler.reconcile_interval_secs = 3600;
    config.scheduler.orphan_check_interval_secs = 3600;
    config.scheduler.retention_days = None;
    config.scheduler.adhoc_default_delay_secs = 0;
    config
}

pub async fn open_engine() -> (TempDir, Flowy) {
    let dir = TempDir::new().unwrap();
    let flowy = Flowy::open(test_config(&dir)).await.unwrap();
    (dir, flowy)
}

/// Poll a history row until it reaches `status` or the timeout passes.
pub async fn wait_for_status(flowy: &Flowy, flow_history_id: i64, status: FlowStatus, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if let Ok(Some(row)) = flowy.history_store().get_flow_history(flow_history_id).await {
            if row.status == status {
                return true;
            }
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}
