//! Turn archive and keyword index operations

use crate::context_engine::retrieval_planner;
use crate::memory::{CompactPayload, LongTermRecord, Turn, TurnId, UserId};
use crate::memory_db::schema::{format_timestamp, parse_timestamp};
use anyhow::Context;
use chrono::{DateTime, Utc};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::types::Value;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::debug;

pub struct TurnStore {
    pool: Arc<Pool<SqliteConnectionManager>>,
}

fn to_sql_id(turn_id: TurnId) -> anyhow::Result<i64> {
    i64::try_from(turn_id.0).with_context(|| format!("Turn id {} exceeds SQLite integer range", turn_id))
}

fn from_sql_id(raw: i64) -> anyhow::Result<TurnId> {
    u64::try_from(raw)
        .map(TurnId)
        .with_context(|| format!("Stored turn id {} is negative", raw))
}

impl TurnStore {
    pub fn new(pool: Arc<Pool<SqliteConnectionManager>>) -> Self {
        Self { pool }
    }

    fn get_conn(&self) -> anyhow::Result<r2d2::PooledConnection<SqliteConnectionManager>> {
        self.pool
            .get()
            .map_err(|e| anyhow::anyhow!("Failed to get connection from pool: {}", e))
    }

    /// Upsert the record and rewrite its keywords in one IMMEDIATE transaction.
    /// The turn sequence is raised past the id so it is never handed out again.
    pub fn index(&self, turn: &Turn) -> anyhow::Result<LongTermRecord> {
        let record = LongTermRecord::from_turn(turn);
        let turn_json = serde_json::to_string(turn).context("Failed to serialize turn")?;
        let id = to_sql_id(record.turn_id)?;

        let mut conn = self.get_conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute(
            "INSERT INTO turn_records
             (turn_id, user_id, session_id, created_at, question, summary, turn_json, indexed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(turn_id) DO UPDATE SET
                user_id = excluded.user_id,
                session_id = excluded.session_id,
                created_at = excluded.created_at,
                question = excluded.question,
                summary = excluded.summary,
                turn_json = excluded.turn_json,
                indexed_at = excluded.indexed_at",
            params![
                id,
                record.user_id.0,
                record.session_id,
                format_timestamp(&record.timestamp),
                record.payload.question,
                record.payload.summary,
                turn_json,
                format_timestamp(&Utc::now()),
            ],
        )?;
        tx.execute(
            "INSERT OR IGNORE INTO turn_sequence (turn_id, allocated_at) VALUES (?1, ?2)",
            params![id, format_timestamp(&Utc::now())],
        )?;
        tx.execute("DELETE FROM record_keywords WHERE turn_id = ?1", [id])?;
        {
            let mut insert =
                tx.prepare("INSERT OR IGNORE INTO record_keywords (turn_id, keyword) VALUES (?1, ?2)")?;
            for keyword in &record.keywords {
                insert.execute(params![id, keyword])?;
            }
        }
        tx.commit()?;

        debug!(
            "Indexed turn {} for session {} with {} keywords",
            record.turn_id,
            record.session_id,
            record.keywords.len()
        );
        Ok(record)
    }

    /// Candidates are loaded inside one read transaction and ranked in memory
    pub fn retrieve(
        &self,
        user_id: UserId,
        query_keywords: &BTreeSet<String>,
        now: DateTime<Utc>,
        limit: usize,
    ) -> anyhow::Result<Vec<LongTermRecord>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.get_conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Deferred)?;

        let candidate_ids: Vec<i64> = if query_keywords.is_empty() {
            let mut stmt = tx.prepare(
                "SELECT turn_id FROM turn_records
                 WHERE user_id = ?1
                 ORDER BY created_at DESC, turn_id DESC
                 LIMIT ?2",
            )?;
            let limit = i64::try_from(limit).unwrap_or(i64::MAX);
            let ids = stmt
                .query_map(params![user_id.0, limit], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<i64>>>()?;
            ids
        } else {
            let placeholders = vec!["?"; query_keywords.len()].join(",");
            let sql = format!(
                "SELECT DISTINCT k.turn_id FROM record_keywords k
                 JOIN turn_records r ON r.turn_id = k.turn_id
                 WHERE r.user_id = ? AND k.keyword IN ({})",
                placeholders
            );
            let bound = std::iter::once(Value::Integer(user_id.0))
                .chain(query_keywords.iter().map(|k| Value::Text(k.clone())));
            let mut stmt = tx.prepare(&sql)?;
            let ids = stmt
                .query_map(rusqlite::params_from_iter(bound), |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<i64>>>()?;
            ids
        };

        let mut candidates = Vec::with_capacity(candidate_ids.len());
        for id in candidate_ids {
            if let Some(record) = load_record(&tx, id)? {
                candidates.push(record);
            }
        }
        tx.commit()?;

        debug!(
            "Loaded {} long-term candidates for {} query keywords",
            candidates.len(),
            query_keywords.len()
        );
        Ok(retrieval_planner::rank(candidates, query_keywords, now, limit))
    }

    pub fn fetch_turn(&self, user_id: UserId, turn_id: TurnId) -> anyhow::Result<Option<Turn>> {
        let conn = self.get_conn()?;
        let raw: Option<String> = conn
            .query_row(
                "SELECT turn_json FROM turn_records WHERE turn_id = ?1 AND user_id = ?2",
                params![to_sql_id(turn_id)?, user_id.0],
                |row| row.get(0),
            )
            .optional()?;
        raw.map(|json| {
            serde_json::from_str(&json)
                .with_context(|| format!("Archived turn {} is not valid JSON", turn_id))
        })
        .transpose()
    }

    /// Draw the next id from the shared sequence; older sequence rows are
    /// pruned in the same transaction
    pub fn allocate_turn_id(&self) -> anyhow::Result<TurnId> {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute(
            "INSERT INTO turn_sequence (allocated_at) VALUES (?1)",
            [format_timestamp(&Utc::now())],
        )?;
        let id = tx.last_insert_rowid();
        tx.execute("DELETE FROM turn_sequence WHERE turn_id < ?1", [id])?;
        tx.commit()?;
        from_sql_id(id)
    }
}

fn load_record(conn: &Connection, id: i64) -> anyhow::Result<Option<LongTermRecord>> {
    let row = conn
        .query_row(
            "SELECT user_id, session_id, created_at, question, summary
             FROM turn_records WHERE turn_id = ?1",
            [id],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                ))
            },
        )
        .optional()?;
    let Some((user_id, session_id, created_at, question, summary)) = row else {
        return Ok(None);
    };

    let mut stmt = conn.prepare_cached("SELECT keyword FROM record_keywords WHERE turn_id = ?1")?;
    let keywords = stmt
        .query_map([id], |row| row.get(0))?
        .collect::<rusqlite::Result<BTreeSet<String>>>()?;

    Ok(Some(LongTermRecord {
        turn_id: from_sql_id(id)?,
        user_id: UserId(user_id),
        session_id,
        keywords,
        timestamp: parse_timestamp(&created_at)?,
        payload: CompactPayload { question, summary },
    }))
}
