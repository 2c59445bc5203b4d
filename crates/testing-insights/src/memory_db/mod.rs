//! Memory database module - SQLite-backed long-term turn archive, keyword
//! index, user accounts and short-term session checkpoints
pub mod checkpoint;
pub mod migration;
pub mod schema;
pub mod turn_store;
pub mod users;

pub use checkpoint::CheckpointStore;
pub use migration::{Migration, MigrationManager};
pub use schema::DatabaseStats;
pub use turn_store::TurnStore;
pub use users::UserStore;

use crate::memory::{LongTermRecord, LongTermStore, Turn, TurnId, UserId};
use anyhow::Context;
use chrono::{DateTime, Utc};
use migration::LONG_TERM_MIGRATIONS;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

pub const DEFAULT_POOL_SIZE: u32 = 8;

/// Open (creating if needed) a WAL-mode database at `db_path` behind a
/// connection pool and bring it up to date with `migrations`
pub(crate) fn open_pool(
    db_path: &Path,
    pool_size: u32,
    migrations: &'static [Migration],
) -> anyhow::Result<Pool<SqliteConnectionManager>> {
    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
    }

    let manager = SqliteConnectionManager::file(db_path)
        .with_flags(
            rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
                | rusqlite::OpenFlags::SQLITE_OPEN_CREATE
                | rusqlite::OpenFlags::SQLITE_OPEN_FULL_MUTEX,
        )
        .with_init(|conn| {
            conn.execute_batch(
                "PRAGMA foreign_keys = ON;
                 PRAGMA synchronous = NORMAL;
                 PRAGMA busy_timeout = 5000;",
            )
        });
    let pool = Pool::builder()
        .max_size(pool_size.max(1))
        .build(manager)
        .map_err(|e| anyhow::anyhow!("Failed to create connection pool: {}", e))?;

    {
        let mut conn = pool.get()?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        let mut migrator = MigrationManager::new(&mut conn, migrations);
        migrator
            .initialize_database()
            .with_context(|| format!("Failed to migrate {}", db_path.display()))?;
    }
    Ok(pool)
}

/// Durable long-term store
pub struct MemoryDatabase {
    pub turns: TurnStore,
    pub users: UserStore,
    pool: Arc<Pool<SqliteConnectionManager>>,
}

impl MemoryDatabase {
    /// Open (creating if needed) the database at `db_path` and apply migrations
    pub fn new(db_path: &Path, pool_size: u32) -> anyhow::Result<Self> {
        info!("Opening long-term memory database at: {}", db_path.display());
        let pool = Arc::new(open_pool(db_path, pool_size, LONG_TERM_MIGRATIONS)?);
        info!("Long-term memory database initialized successfully");
        Ok(Self {
            turns: TurnStore::new(Arc::clone(&pool)),
            users: UserStore::new(Arc::clone(&pool)),
            pool,
        })
    }

    pub fn get_stats(&self) -> anyhow::Result<DatabaseStats> {
        let conn = self.pool.get()?;
        Ok(migration::get_database_stats(&conn)?)
    }
}

impl LongTermStore for MemoryDatabase {
    fn index(&self, turn: &Turn) -> anyhow::Result<LongTermRecord> {
        self.turns.index(turn)
    }

    fn retrieve(
        &self,
        user_id: UserId,
        query_keywords: &BTreeSet<String>,
        now: DateTime<Utc>,
        limit: usize,
    ) -> anyhow::Result<Vec<LongTermRecord>> {
        self.turns.retrieve(user_id, query_keywords, now, limit)
    }

    fn fetch_turn(&self, user_id: UserId, turn_id: TurnId) -> anyhow::Result<Option<Turn>> {
        self.turns.fetch_turn(user_id, turn_id)
    }

    fn allocate_turn_id(&self) -> anyhow::Result<TurnId> {
        self.turns.allocate_turn_id()
    }
}

impl Drop for MemoryDatabase {
    fn drop(&mut self) {
        if let Ok(conn) = self.pool.get() {
            let _ = conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);");
        }
    }
}
