/// Orphan detection
///
/// Finds history rows whose real execution was lost (process crash, restart,
/// dropped job) and moves them to a terminal state. Every scan is
/// keyset-paginated and every repair is its own short statement/transaction.
use crate::config::SchedulerConfig;
use crate::error::Result;
use crate::store::{FlowStatus, HistoryStore, TaskStatus};
use chrono::{Duration, Utc};
use serde::Serialize;
use serde_json::json;
use std::collections::HashSet;

/// Rows repaired by one pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OrphanReport {
    /// Pending rows without a live ad-hoc job, failed
    pub pending_failed: usize,
    /// Running rows past the running timeout with no running tasks, failed
    pub running_failed: usize,
    /// Running tasks aligned with their terminal parent
    pub tasks_reconciled: usize,
}

impl OrphanReport {
    pub fn total(&self) -> usize {
        self.pending_failed + self.running_failed + self.tasks_reconciled
    }
}

pub struct OrphanDetector {
    history: HistoryStore,
    pending_timeout: Duration,
    running_timeout: Duration,
    batch_size: u32,
}

impl OrphanDetector {
    pub fn new(history: HistoryStore, config: &SchedulerConfig) -> Self {
        Self {
            history,
            pending_timeout: config.pending_timeout(),
            running_timeout: config.running_timeout(),
            batch_size: config.scan_batch_size.max(1),
        }
    }

    /// One full pass
    ///
    /// `live_pending` holds the flow history ids that still have a live
    /// one-shot job; those rows are never touched.
    pub async fn run_once(&self, live_pending: &HashSet<i64>) -> Result<OrphanReport> {
        let mut report = OrphanReport::default();
        report.pending_failed = self.fail_pending(live_pending).await?;
        report.running_failed = self.fail_running().await?;
        report.tasks_reconciled = self.reconcile_tasks().await?;
        Ok(report)
    }

    async fn fail_pending(&self, live_pending: &HashSet<i64>) -> Result<usize> {
        let now = Utc::now();
        let cutoff = now - self.pending_timeout;
        let payload = json!({
            "error": format!(
                "orphaned: still pending after {}s with no scheduled job",
                self.pending_timeout.num_seconds()
            ),
            "kind": "Orphaned",
        });

        let mut failed = 0;
        let mut after = 0;
        loop {
            let ids = self.history.pending_before(cutoff, after, self.batch_size).await?;
            let Some(&last) = ids.last() else {
                break;
            };
            for id in &ids {
                if live_pending.contains(id) {
                    continue;
                }
                if self.history.fail_pending_orphan(*id, cutoff, &payload, now).await? {
                    tracing::warn!("🧟 Pending flow history {} failed as orphan", id);
                    failed += 1;
                }
            }
            if ids.len() < self.batch_size as usize {
                break;
            }
            after = last;
        }
        Ok(failed)
    }

    async fn fail_running(&self) -> Result<usize> {
        let now = Utc::now();
        let cutoff = now - self.running_timeout;
        let payload = json!({
            "error": format!(
                "orphaned: running for more than {}s with no running tasks",
                self.running_timeout.num_seconds()
            ),
            "kind": "Orphaned",
        });

        let mut failed = 0;
        let mut after = 0;
        loop {
            let ids = self.history.running_before(cutoff, after, self.batch_size).await?;
            let Some(&last) = ids.last() else {
                break;
            };
            for id in &ids {
                if self.history.fail_stale_running(*id, &payload, now).await? {
                    tracing::warn!("🧟 Running flow history {} failed after timeout", id);
                    failed += 1;
                }
            }
            if ids.len() < self.batch_size as usize {
                break;
            }
            after = last;
        }
        Ok(failed)
    }

    async fn reconcile_tasks(&self) -> Result<usize> {
        let mut reconciled = 0;
        let mut after = 0;
        loop {
            let rows = self.history.tasks_with_terminal_parent(after, self.batch_size).await?;
            let Some(&(last, _, _)) = rows.last() else {
                break;
            };
            for (task_id, parent_status, parent_end) in &rows {
                let status = match parent_status {
                    FlowStatus::Completed => TaskStatus::Completed,
                    _ => TaskStatus::Failed,
                };
                let end = parent_end.unwrap_or_else(Utc::now);
                if self.history.reconcile_task(*task_id, status, end).await? {
                    tracing::debug!("🔧 Task {} reconciled to parent status {}", task_id, parent_status);
                    reconciled += 1;
                }
            }
            if rows.len() < self.batch_size as usize {
                break;
            }
            after = last;
        }
        Ok(reconciled)
    }
}
