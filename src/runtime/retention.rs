/// History retention cleanup
use crate::error::Result;
use crate::store::HistoryStore;
use crate::workflow::ExecutionLogs;
use chrono::{Duration, Utc};
use serde::Serialize;
use std::time::SystemTime;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RetentionReport {
    pub flows_deleted: u64,
    pub logs_deleted: usize,
    pub log_failures: usize,
}

/// Deletes terminal executions and execution logs older than the window
pub struct RetentionCleaner {
    history: HistoryStore,
    logs: ExecutionLogs,
    window: Duration,
    batch_size: u32,
}

impl RetentionCleaner {
    pub fn new(history: HistoryStore, logs: ExecutionLogs, window: Duration, batch_size: u32) -> Self {
        Self {
            history,
            logs,
            window,
            batch_size: batch_size.max(1),
        }
    }

    pub async fn run_once(&self) -> Result<RetentionReport> {
        let mut report = RetentionReport::default();
        let cutoff = Utc::now() - self.window;

        loop {
            let deleted = self.history.purge_batch_before(cutoff, self.batch_size).await?;
            if deleted == 0 {
                break;
            }
            report.flows_deleted += deleted;
        }

        let age = std::time::Duration::from_secs(self.window.num_seconds().max(0) as u64);
        if let Some(log_cutoff) = SystemTime::now().checked_sub(age) {
            let purge = self.logs.purge_older_than(log_cutoff).await?;
            report.logs_deleted = purge.deleted;
            report.log_failures = purge.failed;
        }

        if report.flows_deleted > 0 || report.logs_deleted > 0 {
            tracing::info!(
                "🧹 Retention removed {} execution(s) and {} log file(s) older than {} day(s)",
                report.flows_deleted,
                report.logs_deleted,
                self.window.num_days()
            );
        }
        Ok(report)
    }
}
