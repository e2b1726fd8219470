/// Database manager for the definitions and history stores
///
/// Opens one connection pool per store. The history store is brought up to the
/// current schema by the migration manager *before* its pool is opened, so no
/// pooled connection ever sees a half-migrated file.
use crate::config::StorageConfig;
use crate::error::{FlowyError, Result};
use crate::store::migrations::{MigrationManager, MigrationReport};
use crate::store::schema::DEFINITIONS_SCHEMA;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::time::Duration;

const MAX_CONNECTIONS: u32 = 8;

/// Connection pools for both stores
#[derive(Debug, Clone)]
pub struct DatabaseManager {
    /// Pool for flowy.db (flows, triggers)
    definitions: SqlitePool,
    /// Pool for flowy_history.db (flow_history, task_history)
    history: SqlitePool,
}

impl DatabaseManager {
    /// Open both stores, migrating the history store first
    ///
    /// Returns the migration report alongside the manager. A failed migration
    /// batch has already been rolled back from its backup when this returns
    /// `FlowyError::Migration`.
    pub async fn open(storage: &StorageConfig) -> Result<(Self, MigrationReport)> {
        tracing::info!("📁 Ensuring data directory exists: {}", storage.data_dir);
        std::fs::create_dir_all(&storage.data_dir)?;

        let manager = MigrationManager::new(storage.history_db_path(), storage.backup_dir());
        let report = manager.run().await?;
        if report.failed > 0 {
            return Err(FlowyError::Migration(report.errors.join("; ")));
        }

        let history = connect(&storage.history_db_path()).await?;
        let definitions = connect(&storage.definitions_db_path()).await?;
        init_definitions_schema(&definitions).await?;

        tracing::info!("✅ Stores opened under {}", storage.data_dir);
        Ok((Self { definitions, history }, report))
    }

    pub fn definitions_pool(&self) -> &SqlitePool {
        &self.definitions
    }

    pub fn history_pool(&self) -> &SqlitePool {
        &self.history
    }

    /// Close both pools, waiting for checked-out connections
    pub async fn close(&self) {
        self.definitions.close().await;
        self.history.close().await;
    }
}

/// Connection options shared by pools and the migration manager
///
/// Rollback-journal mode keeps each store a single self-contained file, which
/// is what the migration backup/restore copies.
pub(crate) fn connect_options(path: &Path) -> SqliteConnectOptions {
    SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Delete)
        .busy_timeout(Duration::from_secs(20))
}

/// Open a pool on a store file
pub async fn connect(path: &Path) -> Result<SqlitePool> {
    tracing::debug!("🗄️ Opening database pool: {}", path.display());
    let pool = SqlitePoolOptions::new()
        .max_connections(MAX_CONNECTIONS)
        .connect_with(connect_options(path))
        .await?;
    Ok(pool)
}

async fn init_definitions_schema(pool: &SqlitePool) -> Result<()> {
    for statement in DEFINITIONS_SCHEMA {
        sqlx::query(statement).execute(pool).await?;
    }
    Ok(())
}
