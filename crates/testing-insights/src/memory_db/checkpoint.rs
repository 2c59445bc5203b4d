//! Short-term session checkpoints, so a session can continue across processes

use crate::context_engine::SessionContext;
use crate::memory::UserId;
use crate::memory_db::migration::CHECKPOINT_MIGRATIONS;
use crate::memory_db::open_pool;
use crate::memory_db::schema::format_timestamp;
use anyhow::Context;
use chrono::Utc;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, OptionalExtension};
use std::path::Path;
use tracing::{debug, info};

pub struct CheckpointStore {
    pool: Pool<SqliteConnectionManager>,
}

impl CheckpointStore {
    pub fn open(db_path: &Path, pool_size: u32) -> anyhow::Result<Self> {
        info!("Opening short-term checkpoint database at: {}", db_path.display());
        let pool = open_pool(db_path, pool_size, CHECKPOINT_MIGRATIONS)
            .context("Failed to open short-term checkpoint database")?;
        Ok(Self { pool })
    }

    /// Replace the stored window of `session`
    pub fn save(&self, session: &SessionContext) -> anyhow::Result<()> {
        let json = serde_json::to_string(session).context("Failed to serialize session")?;
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO session_checkpoints (user_id, session_id, checkpoint_json, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(user_id, session_id) DO UPDATE SET
                checkpoint_json = excluded.checkpoint_json,
                updated_at = excluded.updated_at",
            params![
                session.user_id().0,
                session.session_id(),
                json,
                format_timestamp(&Utc::now())
            ],
        )?;
        debug!(
            "Checkpointed session {} ({} turns in window)",
            session.session_id(),
            session.window().len()
        );
        Ok(())
    }

    pub fn load(&self, user_id: UserId, session_id: &str) -> anyhow::Result<Option<SessionContext>> {
        let conn = self.pool.get()?;
        let raw: Option<String> = conn
            .query_row(
                "SELECT checkpoint_json FROM session_checkpoints WHERE user_id = ?1 AND session_id = ?2",
                params![user_id.0, session_id],
                |row| row.get(0),
            )
            .optional()?;
        raw.map(|json| {
            serde_json::from_str(&json)
                .with_context(|| format!("Checkpoint for session {} is not valid JSON", session_id))
        })
        .transpose()
    }

    /// Returns whether a checkpoint existed
    pub fn remove(&self, user_id: UserId, session_id: &str) -> anyhow::Result<bool> {
        let conn = self.pool.get()?;
        let removed = conn.execute(
            "DELETE FROM session_checkpoints WHERE user_id = ?1 AND session_id = ?2",
            params![user_id.0, session_id],
        )?;
        Ok(removed > 0)
    }
}

impl Drop for CheckpointStore {
    fn drop(&mut self) {
        if let Ok(conn) = self.pool.get() {
            let _ = conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context_engine::{MemoryConfig, MemoryManager};
    use crate::memory::InMemoryLongTermStore;
    use std::sync::Arc;
    use tempfile::TempDir;

    const ALICE: UserId = UserId(1);

    fn manager(capacity: usize) -> MemoryManager {
        MemoryManager::new(
            Arc::new(InMemoryLongTermStore::new()),
            MemoryConfig {
                short_term_capacity: capacity,
                long_term_top_k: 5,
            },
        )
    }

    #[tokio::test]
    async fn test_window_and_summary_survive_a_new_process() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("checkpoints.sqlite");
        let memory = manager(2);

        let mut session = memory.open_session(ALICE, "nightly");
        for question in ["flaky suites", "checkout latency", "failures by owner"] {
            let turn = memory.begin_turn(&session, question).await;
            memory.record_turn(&mut session, turn).await;
        }
        {
            let checkpoints = CheckpointStore::open(&path, 2).unwrap();
            checkpoints.save(&session).unwrap();
        }

        let checkpoints = CheckpointStore::open(&path, 2).unwrap();
        let restored = checkpoints.load(ALICE, "nightly").unwrap().unwrap();
        let restored = memory.resume_session(restored).await;
        assert_eq!(restored.session_id(), "nightly");
        assert_eq!(restored.user_id(), ALICE);
        let questions: Vec<&str> = restored
            .window()
            .turns()
            .map(|t| t.user_question.as_str())
            .collect();
        assert_eq!(questions, vec!["checkout latency", "failures by owner"]);
        assert_eq!(restored.window().summary().entries(), session.window().summary().entries());
    }

    #[tokio::test]
    async fn test_checkpoints_are_per_user_and_removable() {
        let dir = TempDir::new().unwrap();
        let checkpoints = CheckpointStore::open(&dir.path().join("cp.sqlite"), 2).unwrap();
        let memory = manager(3);

        let session = memory.open_session(ALICE, "shared-name");
        checkpoints.save(&session).unwrap();
        checkpoints.save(&session).unwrap();

        assert!(checkpoints.load(UserId(2), "shared-name").unwrap().is_none());
        assert!(checkpoints.remove(ALICE, "shared-name").unwrap());
        assert!(!checkpoints.remove(ALICE, "shared-name").unwrap());
        assert!(checkpoints.load(ALICE, "shared-name").unwrap().is_none());
    }
}
