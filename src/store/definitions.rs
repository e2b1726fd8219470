/// SQLite persistence for flow and trigger definitions
///
/// Flows are upserted whenever a flow is (re)defined; triggers are managed by
/// the administrative trigger service. Trigger params are stored as JSON text.
use crate::error::Result;
use crate::store::types::{page_offset, Flow, NewTrigger, Page, Trigger, TriggerUpdate};
use crate::store::{from_db_time, to_db_time};
use chrono::Utc;
use sqlx::{sqlite::SqlitePool, sqlite::SqliteRow, Row};

const TRIGGER_COLUMNS: &str = "id, flow_id, name, description, cron_expression, trigger_params, \
     max_instances, enabled, created_at, updated_at";

/// Flow/trigger definitions store
#[derive(Debug, Clone)]
pub struct DefinitionStore {
    /// SQLite connection pool for flowy.db
    pool: SqlitePool,
}

impl DefinitionStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Store a new flow or update an existing one
    ///
    /// Uses UPSERT so redefinition is idempotent. A `None` description keeps
    /// whatever description was stored before.
    pub async fn upsert_flow(&self, id: &str, name: &str, description: Option<&str>) -> Result<Flow> {
        let now = to_db_time(Utc::now());
        sqlx::query(
            r#"
            INSERT INTO flows (id, name, description, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                description = COALESCE(excluded.description, flows.description),
                updated_at = excluded.updated_at
            "#,
        )
        .bind(id)
        .bind(name)
        .bind(description)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        self.get_flow(id)
            .await?
            .ok_or_else(|| sqlx::Error::RowNotFound.into())
    }

    /// Retrieve a flow by ID
    pub async fn get_flow(&self, id: &str) -> Result<Option<Flow>> {
        let row = sqlx::query("SELECT id, name, description, created_at, updated_at FROM flows WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| flow_from_row(&r)).transpose().map_err(Into::into)
    }

    /// List flows newest first, optionally filtered by a name/description search
    pub async fn list_flows(&self, page: u32, per_page: u32, search: Option<&str>) -> Result<Page<Flow>> {
        let page = page.max(1);
        let per_page = per_page.max(1);
        let pattern = search.map(|s| format!("%{}%", s));

        let total: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM flows WHERE (?1 IS NULL OR name LIKE ?1 OR description LIKE ?1)",
        )
        .bind(&pattern)
        .fetch_one(&self.pool)
        .await?;

        let rows = sqlx::query(
            r#"
            SELECT id, name, description, created_at, updated_at FROM flows
            WHERE (?1 IS NULL OR name LIKE ?1 OR description LIKE ?1)
            ORDER BY created_at DESC, id ASC
            LIMIT ?2 OFFSET ?3
            "#,
        )
        .bind(&pattern)
        .bind(i64::from(per_page))
        .bind(page_offset(page, per_page))
        .fetch_all(&self.pool)
        .await?;

        let flows = rows.iter().map(flow_from_row).collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(Page::new(flows, page, per_page, total))
    }

    /// Insert a trigger (enabled) and return the stored row
    pub async fn insert_trigger(&self, new: &NewTrigger) -> Result<Trigger> {
        let now = to_db_time(Utc::now());
        let params = serde_json::to_string(&new.trigger_params)?;
        let result = sqlx::query(
            r#"
            INSERT INTO triggers
                (flow_id, name, description, cron_expression, trigger_params, max_instances, enabled, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, 1, ?, ?)
            "#,
        )
        .bind(&new.flow_id)
        .bind(&new.name)
        .bind(&new.description)
        .bind(&new.cron_expression)
        .bind(&params)
        .bind(i64::from(new.max_instances))
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        let id = result.last_insert_rowid();
        self.get_trigger(id)
            .await?
            .ok_or_else(|| sqlx::Error::RowNotFound.into())
    }

    pub async fn get_trigger(&self, id: i64) -> Result<Option<Trigger>> {
        let row = sqlx::query(&format!("SELECT {} FROM triggers WHERE id = ?", TRIGGER_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| trigger_from_row(&r)).transpose()
    }

    /// Every trigger, enabled or not (reconciliation input)
    pub async fn list_triggers(&self) -> Result<Vec<Trigger>> {
        let rows = sqlx::query(&format!("SELECT {} FROM triggers ORDER BY id", TRIGGER_COLUMNS))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(trigger_from_row).collect()
    }

    /// Triggers of one flow, newest first
    pub async fn list_triggers_for_flow(&self, flow_id: &str) -> Result<Vec<Trigger>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM triggers WHERE flow_id = ? ORDER BY created_at DESC, id DESC",
            TRIGGER_COLUMNS
        ))
        .bind(flow_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(trigger_from_row).collect()
    }

    /// Apply a partial update; returns the updated row, or None if absent
    pub async fn update_trigger(&self, id: i64, update: &TriggerUpdate) -> Result<Option<Trigger>> {
        let params = update
            .trigger_params
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let result = sqlx::query(
            r#"
            UPDATE triggers SET
                name = COALESCE(?, name),
                description = COALESCE(?, description),
                cron_expression = COALESCE(?, cron_expression),
                trigger_params = COALESCE(?, trigger_params),
                max_instances = COALESCE(?, max_instances),
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&update.name)
        .bind(&update.description)
        .bind(&update.cron_expression)
        .bind(&params)
        .bind(update.max_instances.map(i64::from))
        .bind(to_db_time(Utc::now()))
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }
        self.get_trigger(id).await
    }

    /// Flip the enabled flag; returns false when the trigger does not exist
    pub async fn set_trigger_enabled(&self, id: i64, enabled: bool) -> Result<bool> {
        let result = sqlx::query("UPDATE triggers SET enabled = ?, updated_at = ? WHERE id = ?")
            .bind(enabled)
            .bind(to_db_time(Utc::now()))
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Delete a trigger by ID
    pub async fn delete_trigger(&self, id: i64) -> Result<bool> {
        let result = sqlx::query("DELETE FROM triggers WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

fn flow_from_row(row: &SqliteRow) -> std::result::Result<Flow, sqlx::Error> {
    Ok(Flow {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        description: row.try_get("description")?,
        created_at: from_db_time(&row.try_get::<String, _>("created_at")?)?,
        updated_at: from_db_time(&row.try_get::<String, _>("updated_at")?)?,
    })
}

fn trigger_from_row(row: &SqliteRow) -> Result<Trigger> {
    let params_text: String = row.try_get("trigger_params")?;
    let max_instances: i64 = row.try_get("max_instances")?;
    let enabled: i64 = row.try_get("enabled")?;

    Ok(Trigger {
        id: row.try_get("id")?,
        flow_id: row.try_get("flow_id")?,
        name: row.try_get("name")?,
        description: row.try_get("description")?,
        cron_expression: row.try_get("cron_expression")?,
        trigger_params: serde_json::from_str(&params_text)?,
        max_instances: u32::try_from(max_instances.max(1)).unwrap_or(u32::MAX),
        enabled: enabled != 0,
        created_at: from_db_time(&row.try_get::<String, _>("created_at")?)?,
        updated_at: from_db_time(&row.try_get::<String, _>("updated_at")?)?,
    })
}
