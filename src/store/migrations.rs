//! Versioned schema evolution of the history store
//!
//! Migrations are compiled in as an ordered list of trait objects. The
//! `_schema_migrations` ledger records every applied version; anything with a
//! version strictly greater than the ledger head is pending. The store file is
//! copied to `backups/` before a batch runs and copied back if any step fails.

use crate::error::{FlowyError, Result};
use crate::store::database::connect_options;
use crate::store::schema::{HISTORY_SCHEMA, MIGRATIONS_TABLE};
use crate::store::types::MigrationRecord;
use crate::store::to_db_time;
use async_trait::async_trait;
use chrono::Utc;
use sqlx::{sqlite::SqliteConnection, Connection, Row};
use std::path::PathBuf;

/// One schema step
///
/// `version` is a sortable `YYYYMMDDHHMMSS` string. `up` runs inside a
/// transaction shared with the ledger insert, so it must not commit on its own.
#[async_trait]
pub trait Migration: Send + Sync {
    fn version(&self) -> &'static str;
    fn name(&self) -> &'static str;
    fn description(&self) -> &'static str;
    async fn up(&self, conn: &mut SqliteConnection) -> anyhow::Result<()>;
    async fn down(&self, conn: &mut SqliteConnection) -> anyhow::Result<()>;
}

/// Adds progress tracking columns to task_history
pub struct AddTaskProgress;

#[async_trait]
impl Migration for AddTaskProgress {
    fn version(&self) -> &'static str {
        "20250105000001"
    }

    fn name(&self) -> &'static str {
        "add_task_progress"
    }

    fn description(&self) -> &'static str {
        "add progress, progress_message and progress_updated_at to task_history"
    }

    async fn up(&self, conn: &mut SqliteConnection) -> anyhow::Result<()> {
        let existing = table_columns(conn, "task_history").await?;
        for (column, ty) in [
            ("progress", "INTEGER"),
            ("progress_message", "TEXT"),
            ("progress_updated_at", "TEXT"),
        ] {
            if !existing.iter().any(|c| c == column) {
                sqlx::query(&format!("ALTER TABLE task_history ADD COLUMN {} {}", column, ty))
                    .execute(&mut *conn)
                    .await?;
                tracing::debug!("  ➕ task_history.{}", column);
            }
        }
        Ok(())
    }

    async fn down(&self, conn: &mut SqliteConnection) -> anyhow::Result<()> {
        for column in ["progress_updated_at", "progress_message", "progress"] {
            sqlx::query(&format!("ALTER TABLE task_history DROP COLUMN {}", column))
                .execute(&mut *conn)
                .await?;
        }
        Ok(())
    }
}

/// Adds the status/created_at indexes used by orphan and retention scans
pub struct AddHistoryIndexes;

#[async_trait]
impl Migration for AddHistoryIndexes {
    fn version(&self) -> &'static str {
        "20250301000001"
    }

    fn name(&self) -> &'static str {
        "add_history_indexes"
    }

    fn description(&self) -> &'static str {
        "index flow_history by status and task_history by parent"
    }

    async fn up(&self, conn: &mut SqliteConnection) -> anyhow::Result<()> {
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_flow_history_status ON flow_history(status, created_at)")
            .execute(&mut *conn)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_task_history_parent ON task_history(flow_history_id, status)")
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    async fn down(&self, conn: &mut SqliteConnection) -> anyhow::Result<()> {
        sqlx::query("DROP INDEX IF EXISTS idx_flow_history_status")
            .execute(&mut *conn)
            .await?;
        sqlx::query("DROP INDEX IF EXISTS idx_task_history_parent")
            .execute(&mut *conn)
            .await?;
        Ok(())
    }
}

/// Every migration shipped with the engine, in version order
pub fn builtin_migrations() -> Vec<Box<dyn Migration>> {
    vec![Box::new(AddTaskProgress), Box::new(AddHistoryIndexes)]
}

/// Outcome of one `MigrationManager::run`
#[derive(Debug, Clone, Default)]
pub struct MigrationReport {
    /// Versions whose step committed during this run
    pub applied: Vec<String>,
    /// Number of failed steps (0 or 1; the batch stops at the first failure)
    pub failed: usize,
    pub errors: Vec<String>,
    /// Pre-batch copy of the store file, if a batch ran
    pub backup: Option<PathBuf>,
    /// Whether the store file was copied back from `backup`
    pub restored: bool,
    /// The store was created from the current schema in this run
    pub fresh: bool,
}

impl MigrationReport {
    pub fn is_success(&self) -> bool {
        self.failed == 0
    }
}

/// Applies pending migrations to the history store file
pub struct MigrationManager {
    db_path: PathBuf,
    backup_dir: PathBuf,
    migrations: Vec<Box<dyn Migration>>,
}

impl MigrationManager {
    pub fn new(db_path: impl Into<PathBuf>, backup_dir: impl Into<PathBuf>) -> Self {
        Self::with_migrations(db_path, backup_dir, builtin_migrations())
    }

    /// Manager over an explicit migration list (sorted by version here)
    pub fn with_migrations(
        db_path: impl Into<PathBuf>,
        backup_dir: impl Into<PathBuf>,
        mut migrations: Vec<Box<dyn Migration>>,
    ) -> Self {
        migrations.sort_by(|a, b| a.version().cmp(b.version()));
        Self {
            db_path: db_path.into(),
            backup_dir: backup_dir.into(),
            migrations,
        }
    }

    /// Bring the store up to date
    ///
    /// Step failures are reported, not returned as `Err`; an `Err` means the
    /// store could not be opened, backed up or restored at all.
    pub async fn run(&self) -> Result<MigrationReport> {
        let mut report = MigrationReport::default();
        let mut conn = SqliteConnection::connect_with(&connect_options(&self.db_path)).await?;

        if !table_exists(&mut conn, "flow_history").await? {
            tracing::info!("🆕 Creating history store at {}", self.db_path.display());
            self.create_fresh(&mut conn).await?;
            conn.close().await?;
            report.fresh = true;
            return Ok(report);
        }

        sqlx::query(MIGRATIONS_TABLE).execute(&mut conn).await?;
        let current = head_version(&mut conn).await?;
        let pending: Vec<&dyn Migration> = self
            .migrations
            .iter()
            .map(|m| m.as_ref())
            .filter(|m| current.as_deref().map_or(true, |head| m.version() > head))
            .collect();

        if pending.is_empty() {
            tracing::debug!("📋 History store schema is current ({:?})", current);
            conn.close().await?;
            return Ok(report);
        }

        tracing::info!("🔄 {} pending migration(s) for {}", pending.len(), self.db_path.display());

        // Copy the file with no open connection so the backup is a consistent snapshot
        conn.close().await?;
        let backup = self.backup().await?;
        tracing::info!("💾 History store backed up to {}", backup.display());
        report.backup = Some(backup.clone());

        let mut conn = SqliteConnection::connect_with(&connect_options(&self.db_path)).await?;
        for migration in pending {
            match apply(&mut conn, migration).await {
                Ok(()) => {
                    tracing::info!("✅ Migration {} ({}) applied", migration.version(), migration.name());
                    report.applied.push(migration.version().to_string());
                }
                Err(err) => {
                    tracing::error!("❌ Migration {} ({}) failed: {:#}", migration.version(), migration.name(), err);
                    report.failed += 1;
                    report.errors.push(format!("migration {} failed: {:#}", migration.version(), err));
                    break;
                }
            }
        }
        conn.close().await?;

        if report.failed > 0 {
            tokio::fs::copy(&backup, &self.db_path).await?;
            report.restored = true;
            tracing::warn!("↩️ History store restored from {}", backup.display());
        }

        Ok(report)
    }

    /// Highest version in the ledger, if any
    pub async fn current_version(&self) -> Result<Option<String>> {
        let mut conn = SqliteConnection::connect_with(&connect_options(&self.db_path)).await?;
        let version = if table_exists(&mut conn, "_schema_migrations").await? {
            head_version(&mut conn).await?
        } else {
            None
        };
        conn.close().await?;
        Ok(version)
    }

    /// Ledger contents, oldest version first
    pub async fn history(&self) -> Result<Vec<MigrationRecord>> {
        let mut conn = SqliteConnection::connect_with(&connect_options(&self.db_path)).await?;
        if !table_exists(&mut conn, "_schema_migrations").await? {
            conn.close().await?;
            return Ok(Vec::new());
        }

        let rows = sqlx::query(
            "SELECT version, name, description, applied_at FROM _schema_migrations ORDER BY version",
        )
        .fetch_all(&mut conn)
        .await?;
        conn.close().await?;

        let records = rows
            .iter()
            .map(|row| {
                Ok::<_, sqlx::Error>(MigrationRecord {
                    version: row.try_get("version")?,
                    name: row.try_get("name")?,
                    description: row.try_get("description")?,
                    applied_at: row.try_get("applied_at")?,
                })
            })
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(records)
    }

    /// Run `down` for the ledger head and remove its ledger row
    ///
    /// Returns the reverted version, or None when nothing known is applied.
    pub async fn revert_latest(&self) -> Result<Option<String>> {
        let Some(head) = self.current_version().await? else {
            return Ok(None);
        };
        let Some(migration) = self.migrations.iter().find(|m| m.version() == head) else {
            tracing::warn!("⚠️ Ledger head {} is not a known migration", head);
            return Ok(None);
        };

        let mut conn = SqliteConnection::connect_with(&connect_options(&self.db_path)).await?;
        let mut tx = conn.begin().await?;
        if let Err(err) = migration.down(&mut *tx).await {
            tx.rollback().await?;
            conn.close().await?;
            return Err(FlowyError::Migration(format!(
                "revert of {} failed: {:#}",
                head, err
            )));
        }
        sqlx::query("DELETE FROM _schema_migrations WHERE version = ?")
            .bind(&head)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        conn.close().await?;

        tracing::info!("⏪ Migration {} reverted", head);
        Ok(Some(head))
    }

    async fn create_fresh(&self, conn: &mut SqliteConnection) -> Result<()> {
        let mut tx = conn.begin().await?;
        for statement in HISTORY_SCHEMA {
            sqlx::query(statement).execute(&mut *tx).await?;
        }
        sqlx::query(MIGRATIONS_TABLE).execute(&mut *tx).await?;
        for migration in &self.migrations {
            record(&mut *tx, migration.as_ref()).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn backup(&self) -> Result<PathBuf> {
        tokio::fs::create_dir_all(&self.backup_dir).await?;
        let stem = self
            .db_path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("history");
        let stamp = Utc::now().format("%Y%m%d_%H%M%S_%6f");
        let path = self.backup_dir.join(format!("{}_backup_{}.db", stem, stamp));
        tokio::fs::copy(&self.db_path, &path).await?;
        Ok(path)
    }
}

async fn apply(conn: &mut SqliteConnection, migration: &dyn Migration) -> anyhow::Result<()> {
    let mut tx = conn.begin().await?;
    migration.up(&mut *tx).await?;
    record(&mut *tx, migration).await?;
    tx.commit().await?;
    Ok(())
}

async fn record(conn: &mut SqliteConnection, migration: &dyn Migration) -> std::result::Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT OR IGNORE INTO _schema_migrations (version, name, description, applied_at) VALUES (?, ?, ?, ?)",
    )
    .bind(migration.version())
    .bind(migration.name())
    .bind(migration.description())
    .bind(to_db_time(Utc::now()))
    .execute(conn)
    .await?;
    Ok(())
}

async fn table_exists(conn: &mut SqliteConnection, table: &str) -> std::result::Result<bool, sqlx::Error> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?")
        .bind(table)
        .fetch_one(conn)
        .await?;
    Ok(count > 0)
}

async fn head_version(conn: &mut SqliteConnection) -> std::result::Result<Option<String>, sqlx::Error> {
    sqlx::query_scalar("SELECT MAX(version) FROM _schema_migrations")
        .fetch_one(conn)
        .await
}

async fn table_columns(conn: &mut SqliteConnection, table: &str) -> std::result::Result<Vec<String>, sqlx::Error> {
    let rows = sqlx::query(&format!("PRAGMA table_info({})", table))
        .fetch_all(conn)
        .await?;
    rows.iter().map(|row| row.try_get::<String, _>("name")).collect()
}
