//! Database migration system

use rusqlite::{Connection, OptionalExtension, Result};
use tracing::{error, info, warn};

use crate::memory_db::schema;

/// Schema version and the SQL that brings a database to it
pub type Migration = (i32, &'static str);

/// Long-term memory database
pub const LONG_TERM_MIGRATIONS: &[Migration] = &[
    (1, include_str!("migrations/001_initial.sql")),
    (2, include_str!("migrations/002_users_and_turn_sequence.sql")),
];

/// Short-term session checkpoint database
pub const CHECKPOINT_MIGRATIONS: &[Migration] = &[(
    1,
    include_str!("migrations/checkpoints/001_session_checkpoints.sql"),
)];

/// Manages database schema migrations
pub struct MigrationManager<'a> {
    conn: &'a mut Connection,
    migrations: &'static [Migration],
}

impl<'a> MigrationManager<'a> {
    pub fn new(conn: &'a mut Connection, migrations: &'static [Migration]) -> Self {
        Self { conn, migrations }
    }

    /// Create the version table if needed and apply every pending migration
    pub fn initialize_database(&mut self) -> Result<()> {
        info!("Initializing database schema...");

        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER PRIMARY KEY,
                applied_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
            )",
            [],
        )?;

        let current_version = self.get_current_version()?;
        info!("Current database schema version: {}", current_version);

        self.apply_migrations()
    }

    fn apply_migrations(&mut self) -> Result<()> {
        let migrations = self.migrations;
        for &(version, migration_sql) in migrations {
            if self.has_migration_applied(version)? {
                continue;
            }
            info!("Applying migration {}...", version);

            let tx = self.conn.transaction()?;
            if let Err(e) = tx.execute_batch(migration_sql) {
                error!("Failed to apply migration {}: {}", version, e);
                return Err(e);
            }
            tx.execute("INSERT INTO schema_version (version) VALUES (?1)", [version])?;
            tx.commit()?;

            info!("Migration {} applied successfully", version);
        }
        Ok(())
    }

    pub fn get_current_version(&self) -> Result<i32> {
        self.conn.query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )
    }

    pub fn has_migration_applied(&self, version: i32) -> Result<bool> {
        self.conn
            .query_row(
                "SELECT 1 FROM schema_version WHERE version = ?1",
                [version],
                |_| Ok(1),
            )
            .optional()
            .map(|result| result.is_some())
    }
}

/// Read-only statistics query
pub fn get_database_stats(conn: &Connection) -> Result<schema::DatabaseStats> {
    fn count(conn: &Connection, sql: &str) -> i64 {
        conn.query_row(sql, [], |row| row.get(0)).unwrap_or_else(|e| {
            warn!("Statistics query failed ({}): {}", sql, e);
            0
        })
    }

    let total_records = count(conn, "SELECT COUNT(*) FROM turn_records");
    let total_keywords = count(conn, "SELECT COUNT(*) FROM record_keywords");
    let distinct_keywords = count(conn, "SELECT COUNT(DISTINCT keyword) FROM record_keywords");
    let total_sessions = count(conn, "SELECT COUNT(DISTINCT session_id) FROM turn_records");
    let total_users = count(conn, "SELECT COUNT(*) FROM users");
    let database_size_bytes = count(
        conn,
        "SELECT page_count * page_size FROM pragma_page_count(), pragma_page_size()",
    );
    let schema_version = count(conn, "SELECT COALESCE(MAX(version), 0) FROM schema_version");

    Ok(schema::DatabaseStats {
        total_records,
        total_keywords,
        distinct_keywords,
        total_sessions,
        total_users,
        database_size_bytes,
        schema_version,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_apply_once() {
        let mut conn = Connection::open_in_memory().unwrap();
        MigrationManager::new(&mut conn, LONG_TERM_MIGRATIONS).initialize_database().unwrap();
        MigrationManager::new(&mut conn, LONG_TERM_MIGRATIONS).initialize_database().unwrap();

        let manager = MigrationManager::new(&mut conn, LONG_TERM_MIGRATIONS);
        assert_eq!(manager.get_current_version().unwrap(), 2);
        assert!(manager.has_migration_applied(1).unwrap());
        assert!(manager.has_migration_applied(2).unwrap());
        assert!(!manager.has_migration_applied(3).unwrap());

        let stats = get_database_stats(&conn).unwrap();
        assert_eq!(stats.total_records, 0);
        assert_eq!(stats.total_users, 0);
        assert_eq!(stats.schema_version, 2);
    }

    #[test]
    fn test_upgrade_keeps_turn_ids_ahead_of_archive() {
        let mut conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE schema_version (
                version INTEGER PRIMARY KEY,
                applied_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
            );",
        )
        .unwrap();
        conn.execute_batch(LONG_TERM_MIGRATIONS[0].1).unwrap();
        conn.execute("INSERT INTO schema_version (version) VALUES (1)", []).unwrap();
        conn.execute(
            "INSERT INTO turn_records
             (turn_id, session_id, created_at, question, summary, turn_json, indexed_at)
             VALUES (17, 's', 'x', 'q', 's', '{}', 'x')",
            [],
        )
        .unwrap();

        MigrationManager::new(&mut conn, LONG_TERM_MIGRATIONS).initialize_database().unwrap();
        let owner: i64 = conn
            .query_row("SELECT user_id FROM turn_records WHERE turn_id = 17", [], |row| row.get(0))
            .unwrap();
        assert_eq!(owner, 0);
        conn.execute("INSERT INTO turn_sequence (allocated_at) VALUES ('now')", []).unwrap();
        assert_eq!(conn.last_insert_rowid(), 18);
    }

    #[test]
    fn test_checkpoint_schema_is_separate() {
        let mut conn = Connection::open_in_memory().unwrap();
        MigrationManager::new(&mut conn, CHECKPOINT_MIGRATIONS).initialize_database().unwrap();
        let tables: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'turn_records'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(tables, 0);
        assert_eq!(MigrationManager::new(&mut conn, CHECKPOINT_MIGRATIONS).get_current_version().unwrap(), 1);
    }
}
