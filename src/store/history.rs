/// Execution history store (flowy_history.db)
///
/// Every status transition is a single conditional UPDATE so the
/// pending -> running -> terminal progression can never move backwards, even
/// when the flow engine and the orphan detector race on the same row.
use crate::error::Result;
use crate::store::codec;
use crate::store::types::{
    page_offset, FlowHistory, FlowStatistics, FlowStatus, Page, Remark, TaskHistory, TaskStatus,
};
use crate::store::{from_db_time, from_db_time_opt, to_db_time};
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use sqlx::{sqlite::SqlitePool, sqlite::SqliteRow, Row};

const FLOW_COLUMNS: &str =
    "id, flow_id, flow_metadata, created_at, start_time, end_time, input_data, output_data, status";
const TASK_COLUMNS: &str = "id, flow_history_id, name, created_at, start_time, end_time, input_data, \
     output_data, status, progress, progress_message, progress_updated_at";

/// Attempts made by compare-and-swap metadata updates before giving up
const CAS_ATTEMPTS: usize = 5;

/// Flow/task history store
#[derive(Debug, Clone)]
pub struct HistoryStore {
    pool: SqlitePool,
}

impl HistoryStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    // ---- flow history -------------------------------------------------------

    /// Insert a flow execution row and return its id
    ///
    /// `pending` rows are pre-created by ad-hoc scheduling; the flow engine
    /// inserts `running` rows directly.
    pub async fn create_flow_history(
        &self,
        flow_id: &str,
        status: FlowStatus,
        metadata: &Value,
        input: Option<&Value>,
        start_time: Option<DateTime<Utc>>,
    ) -> Result<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO flow_history (flow_id, flow_metadata, created_at, start_time, input_data, status)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(flow_id)
        .bind(metadata.to_string())
        .bind(to_db_time(Utc::now()))
        .bind(start_time.map(to_db_time))
        .bind(input.map(codec::encode_json))
        .bind(status.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    /// Move a pending row to running, attaching input, start time and metadata
    ///
    /// Returns false when the row is missing or no longer pending. Remarks
    /// already stored on the row are preserved.
    pub async fn promote_flow_history(
        &self,
        id: i64,
        input: &Value,
        metadata: &Value,
        start_time: DateTime<Utc>,
    ) -> Result<bool> {
        for _ in 0..CAS_ATTEMPTS {
            let row = sqlx::query("SELECT status, flow_metadata FROM flow_history WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
            let Some(row) = row else {
                return Ok(false);
            };
            let status: String = row.try_get("status")?;
            if status != FlowStatus::Pending.as_str() {
                return Ok(false);
            }
            let stored: String = row.try_get("flow_metadata")?;
            let merged = merge_metadata(&stored, metadata);

            let result = sqlx::query(
                r#"
                UPDATE flow_history
                SET status = 'running', start_time = ?, input_data = ?, flow_metadata = ?
                WHERE id = ? AND status = 'pending' AND flow_metadata = ?
                "#,
            )
            .bind(to_db_time(start_time))
            .bind(codec::encode_json(input))
            .bind(merged.to_string())
            .bind(id)
            .bind(&stored)
            .execute(&self.pool)
            .await?;

            if result.rows_affected() > 0 {
                return Ok(true);
            }
        }
        tracing::warn!("⚠️ Gave up promoting flow history {} after concurrent updates", id);
        Ok(false)
    }

    /// Write the terminal state of a pending/running row
    ///
    /// Returns false if the row was already terminal (first writer wins).
    pub async fn finalize_flow_history(
        &self,
        id: i64,
        status: FlowStatus,
        output: &Value,
        end_time: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE flow_history SET status = ?, output_data = ?, end_time = ?
            WHERE id = ? AND status IN ('pending', 'running')
            "#,
        )
        .bind(status.as_str())
        .bind(codec::encode_json(output))
        .bind(to_db_time(end_time))
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn get_flow_history(&self, id: i64) -> Result<Option<FlowHistory>> {
        let row = sqlx::query(&format!("SELECT {} FROM flow_history WHERE id = ?", FLOW_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| flow_history_from_row(&r)).transpose()
    }

    /// Flow executions newest first, optionally scoped to one flow and/or status
    pub async fn list_flow_history(
        &self,
        flow_id: Option<&str>,
        status: Option<FlowStatus>,
        page: u32,
        per_page: u32,
    ) -> Result<Page<FlowHistory>> {
        let page = page.max(1);
        let per_page = per_page.max(1);
        let status = status.map(|s| s.as_str());

        let total: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM flow_history WHERE (?1 IS NULL OR flow_id = ?1) AND (?2 IS NULL OR status = ?2)",
        )
        .bind(flow_id)
        .bind(status)
        .fetch_one(&self.pool)
        .await?;

        let rows = sqlx::query(&format!(
            r#"
            SELECT {} FROM flow_history
            WHERE (?1 IS NULL OR flow_id = ?1) AND (?2 IS NULL OR status = ?2)
            ORDER BY id DESC
            LIMIT ?3 OFFSET ?4
            "#,
            FLOW_COLUMNS
        ))
        .bind(flow_id)
        .bind(status)
        .bind(i64::from(per_page))
        .bind(page_offset(page, per_page))
        .fetch_all(&self.pool)
        .await?;

        let items = rows.iter().map(flow_history_from_row).collect::<Result<Vec<_>>>()?;
        Ok(Page::new(items, page, per_page, total))
    }

    /// Delete one execution and its tasks
    pub async fn delete_flow_history(&self, id: i64) -> Result<bool> {
        Ok(self.delete_flow_histories(&[id]).await? > 0)
    }

    /// Delete several executions and their tasks in one transaction
    ///
    /// Children go first. Returns the number of flow rows removed.
    pub async fn delete_flow_histories(&self, ids: &[i64]) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let mut deleted = 0;
        for id in ids {
            sqlx::query("DELETE FROM task_history WHERE flow_history_id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?;
            deleted += sqlx::query("DELETE FROM flow_history WHERE id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?
                .rows_affected();
        }
        tx.commit().await?;
        Ok(deleted)
    }

    /// Append a remark to a flow execution's metadata
    ///
    /// Compare-and-swap on the metadata text; returns false if the row does
    /// not exist or the swap kept losing to concurrent writers.
    pub async fn append_remark(&self, id: i64, remark: &Remark) -> Result<bool> {
        let entry = serde_json::to_value(remark)?;
        for _ in 0..CAS_ATTEMPTS {
            let stored: Option<String> =
                sqlx::query_scalar("SELECT flow_metadata FROM flow_history WHERE id = ?")
                    .bind(id)
                    .fetch_optional(&self.pool)
                    .await?;
            let Some(stored) = stored else {
                return Ok(false);
            };

            let mut metadata = parse_metadata(&stored);
            match metadata.get_mut("remarks").and_then(Value::as_array_mut) {
                Some(remarks) => remarks.push(entry.clone()),
                None => {
                    metadata["remarks"] = json!([entry.clone()]);
                }
            }

            let result = sqlx::query(
                "UPDATE flow_history SET flow_metadata = ? WHERE id = ? AND flow_metadata = ?",
            )
            .bind(metadata.to_string())
            .bind(id)
            .bind(&stored)
            .execute(&self.pool)
            .await?;
            if result.rows_affected() > 0 {
                return Ok(true);
            }
        }
        tracing::warn!("⚠️ Gave up appending remark to flow history {}", id);
        Ok(false)
    }

    /// Remarks of one execution, oldest first (empty if the row is missing)
    pub async fn list_remarks(&self, id: i64) -> Result<Vec<Remark>> {
        Ok(self
            .get_flow_history(id)
            .await?
            .map(|h| h.remarks())
            .unwrap_or_default())
    }

    /// Number of flow executions currently running
    pub async fn running_count(&self) -> Result<i64> {
        let count = sqlx::query_scalar("SELECT COUNT(*) FROM flow_history WHERE status = 'running'")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// Execution counters for one flow
    pub async fn flow_statistics(&self, flow_id: &str) -> Result<FlowStatistics> {
        let mut stats = FlowStatistics::default();

        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM flow_history WHERE flow_id = ? GROUP BY status")
            .bind(flow_id)
            .fetch_all(&self.pool)
            .await?;
        for row in &rows {
            let status: String = row.try_get("status")?;
            let n: i64 = row.try_get("n")?;
            stats.total_count += n;
            match status.parse::<FlowStatus>() {
                Ok(FlowStatus::Completed) => stats.success_count += n,
                Ok(FlowStatus::Failed) => stats.failed_count += n,
                Ok(FlowStatus::Running) => stats.running_count += n,
                Ok(FlowStatus::Pending) => stats.pending_count += n,
                Err(err) => tracing::warn!("⚠️ {}", err),
            }
        }

        if stats.total_count > 0 {
            let rate = stats.success_count as f64 / stats.total_count as f64 * 100.0;
            stats.success_rate = (rate * 100.0).round() / 100.0;
        }

        let avg: Option<f64> = sqlx::query_scalar(
            r#"
            SELECT AVG((julianday(end_time) - julianday(start_time)) * 86400.0)
            FROM flow_history
            WHERE flow_id = ? AND status = 'completed'
              AND start_time IS NOT NULL AND end_time IS NOT NULL
            "#,
        )
        .bind(flow_id)
        .fetch_one(&self.pool)
        .await?;
        stats.avg_duration_secs = avg.map(|a| (a * 10.0).round() / 10.0).unwrap_or(0.0);

        let latest = sqlx::query(
            "SELECT status, created_at FROM flow_history WHERE flow_id = ? ORDER BY id DESC LIMIT 1",
        )
        .bind(flow_id)
        .fetch_optional(&self.pool)
        .await?;
        if let Some(row) = latest {
            let status: String = row.try_get("status")?;
            stats.latest_status = status.parse().ok();
            stats.latest_execution = Some(from_db_time(&row.try_get::<String, _>("created_at")?)?);
        }

        Ok(stats)
    }

    // ---- task history -------------------------------------------------------

    /// Insert a running task row linked to a flow execution
    pub async fn create_task_history(
        &self,
        flow_history_id: i64,
        name: &str,
        input: Option<&Value>,
        start_time: DateTime<Utc>,
    ) -> Result<i64> {
        let now = to_db_time(start_time);
        let result = sqlx::query(
            r#"
            INSERT INTO task_history (flow_history_id, name, created_at, start_time, input_data, status)
            VALUES (?, ?, ?, ?, ?, 'running')
            "#,
        )
        .bind(flow_history_id)
        .bind(name)
        .bind(&now)
        .bind(&now)
        .bind(input.map(codec::encode_json))
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    /// Write the terminal state of a running task row
    pub async fn finalize_task_history(
        &self,
        id: i64,
        status: TaskStatus,
        output: &Value,
        end_time: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE task_history SET status = ?, output_data = ?, end_time = ? WHERE id = ? AND status = 'running'",
        )
        .bind(status.as_str())
        .bind(codec::encode_json(output))
        .bind(to_db_time(end_time))
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Record progress on a running task; returns false for non-running rows
    pub async fn update_task_progress(
        &self,
        id: i64,
        progress: u8,
        message: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE task_history SET progress = ?, progress_message = ?, progress_updated_at = ?
            WHERE id = ? AND status = 'running'
            "#,
        )
        .bind(i64::from(progress))
        .bind(message)
        .bind(to_db_time(at))
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn get_task_history(&self, id: i64) -> Result<Option<TaskHistory>> {
        let row = sqlx::query(&format!("SELECT {} FROM task_history WHERE id = ?", TASK_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| task_history_from_row(&r)).transpose()
    }

    /// Tasks of one flow execution in creation order
    pub async fn list_task_histories(&self, flow_history_id: i64) -> Result<Vec<TaskHistory>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM task_history WHERE flow_history_id = ? ORDER BY id",
            TASK_COLUMNS
        ))
        .bind(flow_history_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(task_history_from_row).collect()
    }

    // ---- orphan scans -------------------------------------------------------

    /// Ids of pending rows created before `cutoff`, keyset-paginated by id
    pub async fn pending_before(&self, cutoff: DateTime<Utc>, after_id: i64, limit: u32) -> Result<Vec<i64>> {
        let ids = sqlx::query_scalar(
            r#"
            SELECT id FROM flow_history
            WHERE status = 'pending' AND created_at < ? AND id > ?
            ORDER BY id LIMIT ?
            "#,
        )
        .bind(to_db_time(cutoff))
        .bind(after_id)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    /// Ids of running rows started before `cutoff`, keyset-paginated by id
    pub async fn running_before(&self, cutoff: DateTime<Utc>, after_id: i64, limit: u32) -> Result<Vec<i64>> {
        let ids = sqlx::query_scalar(
            r#"
            SELECT id FROM flow_history
            WHERE status = 'running' AND COALESCE(start_time, created_at) < ? AND id > ?
            ORDER BY id LIMIT ?
            "#,
        )
        .bind(to_db_time(cutoff))
        .bind(after_id)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    /// Number of running tasks under one flow execution
    pub async fn running_task_count(&self, flow_history_id: i64) -> Result<i64> {
        let count = sqlx::query_scalar(
            "SELECT COUNT(*) FROM task_history WHERE flow_history_id = ? AND status = 'running'",
        )
        .bind(flow_history_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    /// Fail a pending orphan and any running children, in one transaction
    ///
    /// The row must still be pending and older than `cutoff`.
    pub async fn fail_pending_orphan(
        &self,
        id: i64,
        cutoff: DateTime<Utc>,
        output: &Value,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        let updated = sqlx::query(
            r#"
            UPDATE flow_history SET status = 'failed', output_data = ?, end_time = ?
            WHERE id = ? AND status = 'pending' AND created_at < ?
            "#,
        )
        .bind(codec::encode_json(output))
        .bind(to_db_time(now))
        .bind(id)
        .bind(to_db_time(cutoff))
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if updated > 0 {
            sqlx::query(
                "UPDATE task_history SET status = 'failed', end_time = ? WHERE flow_history_id = ? AND status = 'running'",
            )
            .bind(to_db_time(now))
            .bind(id)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(updated > 0)
    }

    /// Fail a running row that has no running children left
    pub async fn fail_stale_running(&self, id: i64, output: &Value, now: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE flow_history SET status = 'failed', output_data = ?, end_time = ?
            WHERE id = ? AND status = 'running'
              AND NOT EXISTS (
                  SELECT 1 FROM task_history WHERE flow_history_id = ? AND status = 'running'
              )
            "#,
        )
        .bind(codec::encode_json(output))
        .bind(to_db_time(now))
        .bind(id)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Running tasks whose parent execution is already terminal
    ///
    /// Returns `(task_id, parent_status, parent_end_time)`, keyset-paginated
    /// by task id.
    pub async fn tasks_with_terminal_parent(
        &self,
        after_id: i64,
        limit: u32,
    ) -> Result<Vec<(i64, FlowStatus, Option<DateTime<Utc>>)>> {
        let rows = sqlx::query(
            r#"
            SELECT t.id AS task_id, f.status AS parent_status, f.end_time AS parent_end
            FROM task_history t JOIN flow_history f ON f.id = t.flow_history_id
            WHERE t.status = 'running' AND f.status IN ('completed', 'failed') AND t.id > ?
            ORDER BY t.id LIMIT ?
            "#,
        )
        .bind(after_id)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            let status: String = row.try_get("parent_status")?;
            let Ok(status) = status.parse::<FlowStatus>() else {
                continue;
            };
            out.push((
                row.try_get("task_id")?,
                status,
                from_db_time_opt(row.try_get("parent_end")?)?,
            ));
        }
        Ok(out)
    }

    /// Align a running task with its terminal parent
    pub async fn reconcile_task(&self, id: i64, status: TaskStatus, end_time: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE task_history SET status = ?, end_time = ? WHERE id = ? AND status = 'running'",
        )
        .bind(status.as_str())
        .bind(to_db_time(end_time))
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    // ---- retention ----------------------------------------------------------

    /// Delete one batch of terminal executions created before `cutoff`
    ///
    /// Children first, inside one transaction. Returns the number of flow
    /// rows removed; callers loop until it returns 0.
    pub async fn purge_batch_before(&self, cutoff: DateTime<Utc>, limit: u32) -> Result<u64> {
        let ids: Vec<i64> = sqlx::query_scalar(
            r#"
            SELECT id FROM flow_history
            WHERE created_at < ? AND status IN ('completed', 'failed')
            ORDER BY id LIMIT ?
            "#,
        )
        .bind(to_db_time(cutoff))
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        if ids.is_empty() {
            return Ok(0);
        }
        self.delete_flow_histories(&ids).await
    }
}

/// Parse stored metadata, falling back to an empty object
fn parse_metadata(text: &str) -> Value {
    match serde_json::from_str::<Value>(text) {
        Ok(value @ Value::Object(_)) => value,
        _ => json!({}),
    }
}

/// Overlay `update` on the stored metadata, keeping stored remarks
fn merge_metadata(stored: &str, update: &Value) -> Value {
    let mut merged = parse_metadata(stored);
    let had_remarks = merged.get("remarks").is_some();
    if let (Some(target), Some(source)) = (merged.as_object_mut(), update.as_object()) {
        for (key, value) in source {
            if key == "remarks" && had_remarks {
                continue;
            }
            target.insert(key.clone(), value.clone());
        }
    }
    merged
}

fn flow_history_from_row(row: &SqliteRow) -> Result<FlowHistory> {
    let status: String = row.try_get("status")?;
    let metadata: String = row.try_get("flow_metadata")?;
    let input: Option<Vec<u8>> = row.try_get("input_data")?;
    let output: Option<Vec<u8>> = row.try_get("output_data")?;

    Ok(FlowHistory {
        id: row.try_get("id")?,
        flow_id: row.try_get("flow_id")?,
        flow_metadata: parse_metadata(&metadata),
        created_at: from_db_time(&row.try_get::<String, _>("created_at")?)?,
        start_time: from_db_time_opt(row.try_get("start_time")?)?,
        end_time: from_db_time_opt(row.try_get("end_time")?)?,
        input_data: input.as_deref().map(codec::decode_json),
        output_data: output.as_deref().map(codec::decode_json),
        status: status
            .parse()
            .map_err(|e: String| sqlx::Error::Decode(e.into()))?,
    })
}

fn task_history_from_row(row: &SqliteRow) -> Result<TaskHistory> {
    let status: String = row.try_get("status")?;
    let input: Option<Vec<u8>> = row.try_get("input_data")?;
    let output: Option<Vec<u8>> = row.try_get("output_data")?;
    let progress: Option<i64> = row.try_get("progress")?;

    Ok(TaskHistory {
        id: row.try_get("id")?,
        flow_history_id: row.try_get("flow_history_id")?,
        name: row.try_get("name")?,
        created_at: from_db_time(&row.try_get::<String, _>("created_at")?)?,
        start_time: from_db_time_opt(row.try_get("start_time")?)?,
        end_time: from_db_time_opt(row.try_get("end_time")?)?,
        input_data: input.as_deref().map(codec::decode_json),
        output_data: output.as_deref().map(codec::decode_json),
        status: status
            .parse()
            .map_err(|e: String| sqlx::Error::Decode(e.into()))?,
        progress: progress.and_then(|p| u8::try_from(p).ok()),
        progress_message: row.try_get("progress_message")?,
        progress_updated_at: from_db_time_opt(row.try_get("progress_updated_at")?)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_keeps_existing_remarks() {
        let stored = r#"{"remarks":[{"level":"info","message":"m","created_at":"2025-01-01T00:00:00Z"}],"trigger_type":"immediate"}"#;
        let merged = merge_metadata(stored, &json!({"trigger_type": "scheduled", "remarks": []}));
        assert_eq!(merged["trigger_type"], "scheduled");
        assert_eq!(merged["remarks"].as_array().map(Vec::len), Some(1));
    }

    #[test]
    fn merge_over_garbage_starts_fresh() {
        let merged = merge_metadata("not json", &json!({"remarks": []}));
        assert_eq!(merged, json!({"remarks": []}));
    }
}
