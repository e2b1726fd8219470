//! Persistence layer
//!
//! Two SQLite stores with independent retention policy:
//! - flowy.db: flow and trigger definitions
//! - flowy_history.db: flow/task execution history plus the migration ledger

// Connection management for both stores
pub mod database;

// Flow and trigger definitions
pub mod definitions;

// Flow and task execution history
pub mod history;

// Versioned schema evolution of the history store
pub mod migrations;

// Compression codec for large payload columns
pub mod codec;

// SQL schema statements
pub mod schema;

// Record types
pub mod types;

pub use database::DatabaseManager;
pub use definitions::DefinitionStore;
pub use history::HistoryStore;
pub use migrations::{Migration, MigrationManager, MigrationReport};
pub use types::*;

use chrono::{DateTime, SecondsFormat, Utc};

/// Render a timestamp in the fixed-width form every table uses
///
/// Microsecond precision with a `Z` suffix keeps lexical order equal to
/// chronological order, which the range scans rely on.
pub(crate) fn to_db_time(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn from_db_time(text: &str) -> Result<DateTime<Utc>, sqlx::Error> {
    DateTime::parse_from_rfc3339(text)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| sqlx::Error::Decode(Box::new(e)))
}

pub(crate) fn from_db_time_opt(text: Option<String>) -> Result<Option<DateTime<Utc>>, sqlx::Error> {
    text.as_deref().map(from_db_time).transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn db_time_is_fixed_width_and_ordered() {
        let a = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let b = a + chrono::Duration::microseconds(500_000);
        let (sa, sb) = (to_db_time(a), to_db_time(b));
        assert_eq!(sa, "2025-01-01T00:00:00.000000Z");
        assert_eq!(sa.len(), sb.len());
        assert!(sa < sb);
        assert_eq!(from_db_time(&sb).unwrap(), b);
    }
}
