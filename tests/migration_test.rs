//! History store migrations: fresh creation, pending batches and restore on
//! failure.

use async_trait::async_trait;
use flowy::store::{
    database::connect,
    migrations::builtin_migrations,
    Migration, MigrationManager,
};
use sqlx::sqlite::SqliteConnection;
use tempfile::TempDir;

struct AddAuditTable;

#[async_trait]
impl Migration for AddAuditTable {
    fn version(&self) -> &'static str {
        "20990101000001"
    }

    fn name(&self) -> &'static str {
        "add_audit_table"
    }

    fn description(&self) -> &'static str {
        "audit table"
    }

    async fn up(&self, conn: &mut SqliteConnection) -> anyhow::Result<()> {
        sqlx::query("CREATE TABLE audit (id INTEGER PRIMARY KEY, note TEXT)")
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    async fn down(&self, conn: &mut SqliteConnection) -> anyhow::Result<()> {
        sqlx::query("DROP TABLE audit").execute(&mut *conn).await?;
        Ok(())
    }
}

struct BrokenMigration;

#[async_trait]
impl Migration for BrokenMigration {
    fn version(&self) -> &'static str {
        "20990101000002"
    }

    fn name(&self) -> &'static str {
        "broken"
    }

    fn description(&self) -> &'static str {
        "references a table that does not exist"
    }

    async fn up(&self, conn: &mut SqliteConnection) -> anyhow::Result<()> {
        sqlx::query("ALTER TABLE no_such_table ADD COLUMN x TEXT")
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    async fn down(&self, _conn: &mut SqliteConnection) -> anyhow::Result<()> {
        Ok(())
    }
}

fn with_extra(extra: Vec<Box<dyn Migration>>) -> Vec<Box<dyn Migration>> {
    let mut all = builtin_migrations();
    all.extend(extra);
    all
}

async fn table_exists(db: &std::path::Path, table: &str) -> bool {
    let pool = connect(db).await.unwrap();
    let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?")
        .bind(table)
        .fetch_one(&pool)
        .await
        .unwrap();
    pool.close().await;
    n > 0
}

#[tokio::test]
async fn test_fresh_store_records_every_migration() {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("flowy_history.db");
    let manager = MigrationManager::new(&db, dir.path().join("backups"));

    let report = manager.run().await.unwrap();
    assert!(report.fresh);
    assert!(report.is_success());
    assert!(report.backup.is_none());

    let ledger: Vec<String> = manager.history().await.unwrap().into_iter().map(|r| r.version).collect();
    assert_eq!(ledger, ["20250105000001", "20250301000001"]);
    assert_eq!(manager.current_version().await.unwrap().as_deref(), Some("20250301000001"));

    // Second run finds nothing pending
    let again = manager.run().await.unwrap();
    assert!(!again.fresh);
    assert!(again.applied.is_empty());
    assert!(again.backup.is_none());
}

#[tokio::test]
async fn test_pending_migration_applies_with_backup() {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("flowy_history.db");
    let backups = dir.path().join("backups");
    MigrationManager::new(&db, &backups).run().await.unwrap();

    let manager = MigrationManager::with_migrations(&db, &backups, with_extra(vec![Box::new(AddAuditTable)]));
    let report = manager.run().await.unwrap();
    assert!(report.is_success());
    assert_eq!(report.applied, ["20990101000001"]);
    assert!(report.backup.as_ref().unwrap().exists());
    assert!(!report.restored);
    assert!(table_exists(&db, "audit").await);
    assert_eq!(manager.current_version().await.unwrap().as_deref(), Some("20990101000001"));

    // And back down again
    assert_eq!(manager.revert_latest().await.unwrap().as_deref(), Some("20990101000001"));
    assert!(!table_exists(&db, "audit").await);
    assert_eq!(manager.current_version().await.unwrap().as_deref(), Some("20250301000001"));
}

#[tokio::test]
async fn test_failed_batch_restores_the_backup() {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("flowy_history.db");
    let backups = dir.path().join("backups");
    MigrationManager::new(&db, &backups).run().await.unwrap();

    let manager = MigrationManager::with_migrations(
        &db,
        &backups,
        with_extra(vec![Box::new(BrokenMigration), Box::new(AddAuditTable)]),
    );
    let report = manager.run().await.unwrap();
    assert!(!report.is_success());
    assert_eq!(report.failed, 1);
    assert_eq!(report.applied, ["20990101000001"]);
    assert!(report.restored);
    assert!(report.errors[0].contains("20990101000002"));

    // The store is back at its pre-batch state
    let ledger: Vec<String> = manager.history().await.unwrap().into_iter().map(|r| r.version).collect();
    assert!(!ledger.iter().any(|v| v.starts_with("2099")));
    assert!(!table_exists(&db, "audit").await);
    assert!(table_exists(&db, "flow_history").await);
}

#[tokio::test]
async fn test_store_without_progress_columns_is_upgraded() {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("flowy_history.db");

    // Layout written before task progress existed, with no ledger at all
    let pool = connect(&db).await.unwrap();
    for statement in [
        "CREATE TABLE flow_history (id INTEGER PRIMARY KEY AUTOINCREMENT, flow_id TEXT NOT NULL, \
         flow_metadata TEXT NOT NULL DEFAULT '{}', created_at TEXT NOT NULL, start_time TEXT, end_time TEXT, \
         input_data BLOB, output_data BLOB, status TEXT NOT NULL)",
        "CREATE TABLE task_history (id INTEGER PRIMARY KEY AUTOINCREMENT, flow_history_id INTEGER NOT NULL, \
         name TEXT NOT NULL, created_at TEXT NOT NULL, start_time TEXT, end_time TEXT, input_data BLOB, \
         output_data BLOB, status TEXT NOT NULL)",
        "INSERT INTO flow_history (flow_id, created_at, status) VALUES ('legacy', '2024-01-01T00:00:00.000000Z', 'completed')",
        "INSERT INTO task_history (flow_history_id, name, created_at, status) \
         VALUES (1, 'old', '2024-01-01T00:00:00.000000Z', 'completed')",
    ] {
        sqlx::query(statement).execute(&pool).await.unwrap();
    }
    pool.close().await;

    let manager = MigrationManager::new(&db, dir.path().join("backups"));
    let report = manager.run().await.unwrap();
    assert!(!report.fresh);
    assert!(report.is_success());
    assert_eq!(report.applied, ["20250105000001", "20250301000001"]);
    assert!(report.backup.as_ref().unwrap().exists());

    let ledger: Vec<String> = manager.history().await.unwrap().into_iter().map(|r| r.version).collect();
    assert_eq!(ledger, ["20250105000001", "20250301000001"]);

    let pool = connect(&db).await.unwrap();
    let columns: Vec<String> = sqlx::query_scalar("SELECT name FROM pragma_table_info('task_history')")
        .fetch_all(&pool)
        .await
        .unwrap();
    for column in ["progress", "progress_message", "progress_updated_at"] {
        assert!(columns.iter().any(|c| c == column), "missing column {}", column);
    }
    let (name, progress): (String, Option<i64>) = sqlx::query_as("SELECT name, progress FROM task_history WHERE id = 1")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(name, "old");
    assert_eq!(progress, None);
    pool.close().await;
}
