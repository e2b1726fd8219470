//! SQL schema for both stores
//!
//! The history schema here is always the *current* one. Brand-new history
//! stores are created from it directly; existing stores reach it through the
//! migration manager.

/// Flow and trigger definitions (flowy.db)
pub const DEFINITIONS_SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS flows (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        description TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS triggers (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        flow_id TEXT NOT NULL,
        name TEXT NOT NULL,
        description TEXT,
        cron_expression TEXT NOT NULL,
        trigger_params TEXT NOT NULL DEFAULT '{}',
        max_instances INTEGER NOT NULL DEFAULT 1,
        enabled INTEGER NOT NULL DEFAULT 1,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_triggers_flow ON triggers(flow_id)",
];

/// Execution history (flowy_history.db), current version
pub const HISTORY_SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS flow_history (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        flow_id TEXT NOT NULL,
        flow_metadata TEXT NOT NULL DEFAULT '{}',
        created_at TEXT NOT NULL,
        start_time TEXT,
        end_time TEXT,
        input_data BLOB,
        output_data BLOB,
        status TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS task_history (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        flow_history_id INTEGER NOT NULL,
        name TEXT NOT NULL,
        created_at TEXT NOT NULL,
        start_time TEXT,
        end_time TEXT,
        input_data BLOB,
        output_data BLOB,
        status TEXT NOT NULL,
        progress INTEGER,
        progress_message TEXT,
        progress_updated_at TEXT
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_flow_history_flow ON flow_history(flow_id, created_at)",
    "CREATE INDEX IF NOT EXISTS idx_flow_history_status ON flow_history(status, created_at)",
    "CREATE INDEX IF NOT EXISTS idx_task_history_parent ON task_history(flow_history_id, status)",
];

/// Migration ledger, lives in the history store
pub const MIGRATIONS_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS _schema_migrations (
        version TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        description TEXT,
        applied_at TEXT NOT NULL
    )
"#;
