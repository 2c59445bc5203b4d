//! Read-only query execution against the analytics database

use crate::extractor::{ColumnMeta, ColumnType, ScalarValue};
use crate::sql_guard::SafeStatement;
use async_trait::async_trait;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::types::ValueRef;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("query timed out after {0:?}")]
    Timeout(Duration),
    #[error("database connection unavailable: {0}")]
    Pool(#[from] r2d2::Error),
    #[error("query failed: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("query task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Rows and column metadata of an executed statement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    pub columns: Vec<ColumnMeta>,
    pub rows: Vec<Vec<ScalarValue>>,
    /// More rows existed than the configured row cap
    pub truncated: bool,
}

impl QueryResult {
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// Markdown table of at most `max_rows` rows
    pub fn to_markdown(&self, max_rows: usize) -> String {
        if self.columns.is_empty() {
            return "(no columns)".to_string();
        }
        let escape = |text: String| text.replace('|', "\\|").replace('\n', " ");
        let mut out = String::new();
        let header: Vec<String> = self.columns.iter().map(|c| escape(c.name.clone())).collect();
        out.push_str(&format!("| {} |\n", header.join(" | ")));
        out.push_str(&format!("|{}\n", " --- |".repeat(self.columns.len())));
        for row in self.rows.iter().take(max_rows) {
            let cells: Vec<String> = row.iter().map(|v| escape(v.to_string())).collect();
            out.push_str(&format!("| {} |\n", cells.join(" | ")));
        }
        if self.rows.len() > max_rows || self.truncated {
            out.push_str(&format!("\n({} rows shown", self.rows.len().min(max_rows)));
            out.push_str(if self.truncated { ", result truncated)" } else { ")" });
        }
        out
    }
}

/// Runs statements that already passed the safety gate
#[async_trait]
pub trait QueryExecutor: Send + Sync {
    async fn execute(&self, statement: &SafeStatement) -> Result<QueryResult, ExecutionError>;
}

/// Executor over a SQLite file opened read-only with `query_only` enforced
pub struct SqliteExecutor {
    pool: Arc<Pool<SqliteConnectionManager>>,
    row_limit: usize,
    timeout: Duration,
}

impl SqliteExecutor {
    pub fn open(
        db_path: &Path,
        pool_size: u32,
        row_limit: usize,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        if !db_path.exists() {
            anyhow::bail!("Query database not found at {}", db_path.display());
        }
        let manager = SqliteConnectionManager::file(db_path)
            .with_flags(
                rusqlite::OpenFlags::SQLITE_OPEN_READ_ONLY
                    | rusqlite::OpenFlags::SQLITE_OPEN_FULL_MUTEX,
            )
            .with_init(|conn| conn.execute_batch("PRAGMA query_only = ON; PRAGMA busy_timeout = 5000;"));
        let pool = Pool::builder()
            .max_size(pool_size.max(1))
            .build(manager)
            .map_err(|e| anyhow::anyhow!("Failed to create query connection pool: {}", e))?;

        debug!(
            "Query executor ready for {} (row limit {}, timeout {:?})",
            db_path.display(),
            row_limit,
            timeout
        );
        Ok(Self {
            pool: Arc::new(pool),
            row_limit: row_limit.max(1),
            timeout,
        })
    }
}

#[async_trait]
impl QueryExecutor for SqliteExecutor {
    async fn execute(&self, statement: &SafeStatement) -> Result<QueryResult, ExecutionError> {
        let pool = Arc::clone(&self.pool);
        let sql = statement.normalized_statement().to_string();
        let row_limit = self.row_limit;
        let timeout = self.timeout;
        let (handle_tx, mut handle_rx) = oneshot::channel();

        let task = tokio::task::spawn_blocking(move || {
            let conn = pool.get()?;
            // a closed receiver means the caller already gave up
            if handle_tx.send(conn.get_interrupt_handle()).is_err() {
                return Err(ExecutionError::Timeout(timeout));
            }
            run_query(&conn, &sql, row_limit)
        });

        match tokio::time::timeout(timeout, task).await {
            Ok(joined) => joined?,
            Err(_) => {
                handle_rx.close();
                if let Ok(handle) = handle_rx.try_recv() {
                    handle.interrupt();
                }
                warn!("Query exceeded {:?} and was interrupted", self.timeout);
                Err(ExecutionError::Timeout(self.timeout))
            }
        }
    }
}

fn run_query(conn: &Connection, sql: &str, row_limit: usize) -> Result<QueryResult, ExecutionError> {
    let mut stmt = conn.prepare(sql)?;
    let names: Vec<String> = stmt.column_names().iter().map(ToString::to_string).collect();

    let mut rows = stmt.query([])?;
    let mut values: Vec<Vec<ScalarValue>> = Vec::new();
    let mut truncated = false;
    while let Some(row) = rows.next()? {
        if values.len() >= row_limit {
            truncated = true;
            break;
        }
        let mut record = Vec::with_capacity(names.len());
        for idx in 0..names.len() {
            record.push(scalar_from_sql(row.get_ref(idx)?));
        }
        values.push(record);
    }

    let columns = names
        .into_iter()
        .enumerate()
        .map(|(idx, name)| ColumnMeta::new(name, infer_type(&values, idx)))
        .collect();
    Ok(QueryResult {
        columns,
        rows: values,
        truncated,
    })
}

fn scalar_from_sql(value: ValueRef<'_>) -> ScalarValue {
    match value {
        ValueRef::Null => ScalarValue::Null,
        ValueRef::Integer(v) => ScalarValue::Integer(v),
        ValueRef::Real(v) => ScalarValue::Real(v),
        ValueRef::Text(bytes) => ScalarValue::Text(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => ScalarValue::Text(format!("<blob {} bytes>", bytes.len())),
    }
}

/// SQLite is dynamically typed, so column types come from the returned values
fn infer_type(rows: &[Vec<ScalarValue>], idx: usize) -> ColumnType {
    let mut inferred = None;
    for value in rows.iter().filter_map(|row| row.get(idx)) {
        let kind = match value {
            ScalarValue::Null => continue,
            ScalarValue::Integer(_) | ScalarValue::Real(_) => ColumnType::Number,
            ScalarValue::Bool(_) => ColumnType::Boolean,
            ScalarValue::Text(_) => ColumnType::Text,
        };
        match inferred {
            None => inferred = Some(kind),
            Some(seen) if seen != kind => return ColumnType::Unknown,
            Some(_) => {}
        }
    }
    inferred.unwrap_or(ColumnType::Unknown)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sql_guard::classify;
    use tempfile::TempDir;

    fn seed(dir: &TempDir) -> std::path::PathBuf {
        let path = dir.path().join("local.db");
        let conn = Connection::open(&path).unwrap();
        conn.execute_batch(
            "CREATE TABLE test_runs (id INTEGER PRIMARY KEY, suite TEXT, duration_ms REAL, passed INTEGER);
             INSERT INTO test_runs (suite, duration_ms, passed) VALUES
                ('api', 120.5, 1), ('api', 98.0, 0), ('ui', 450.0, 1), ('ui', NULL, 1);",
        )
        .unwrap();
        path
    }

    fn executor(dir: &TempDir, row_limit: usize) -> SqliteExecutor {
        SqliteExecutor::open(&seed(dir), 2, row_limit, Duration::from_secs(5)).unwrap()
    }

    fn safe(sql: &str) -> SafeStatement {
        classify(sql).safe_statement().cloned().unwrap()
    }

    #[tokio::test]
    async fn test_executes_safe_statement() {
        let dir = TempDir::new().unwrap();
        let result = executor(&dir, 100)
            .execute(&safe("SELECT count(*) AS total FROM test_runs WHERE passed = 1"))
            .await
            .unwrap();
        assert_eq!(result.columns, vec![ColumnMeta::new("total", ColumnType::Number)]);
        assert_eq!(result.rows, vec![vec![ScalarValue::Integer(3)]]);
        assert!(!result.truncated);
    }

    #[tokio::test]
    async fn test_row_cap_truncates() {
        let dir = TempDir::new().unwrap();
        let result = executor(&dir, 2)
            .execute(&safe("SELECT suite FROM test_runs ORDER BY id"))
            .await
            .unwrap();
        assert_eq!(result.row_count(), 2);
        assert!(result.truncated);
    }

    #[tokio::test]
    async fn test_types_are_inferred_from_values() {
        let dir = TempDir::new().unwrap();
        let result = executor(&dir, 100)
            .execute(&safe("SELECT suite, duration_ms FROM test_runs ORDER BY id"))
            .await
            .unwrap();
        assert_eq!(result.columns[0].column_type, ColumnType::Text);
        assert_eq!(result.columns[1].column_type, ColumnType::Number);
        assert_eq!(result.rows[3][1], ScalarValue::Null);
    }

    #[tokio::test]
    async fn test_missing_table_is_sqlite_error() {
        let dir = TempDir::new().unwrap();
        let err = executor(&dir, 100)
            .execute(&safe("SELECT * FROM nowhere"))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::Sqlite(_)), "{:?}", err);
    }

    #[tokio::test]
    async fn test_long_query_times_out() {
        let dir = TempDir::new().unwrap();
        let executor =
            SqliteExecutor::open(&seed(&dir), 1, 10, Duration::from_millis(50)).unwrap();
        let slow = safe(
            "WITH RECURSIVE n(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM n) SELECT count(*) FROM n",
        );
        let err = executor.execute(&slow).await.unwrap_err();
        assert!(matches!(err, ExecutionError::Timeout(_)), "{:?}", err);
    }

    #[test]
    fn test_missing_database_is_an_error() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("absent.db");
        assert!(SqliteExecutor::open(&missing, 1, 10, Duration::from_secs(1)).is_err());
    }

    #[test]
    fn test_markdown_preview() {
        let result = QueryResult {
            columns: vec![
                ColumnMeta::new("suite", ColumnType::Text),
                ColumnMeta::new("n", ColumnType::Number),
            ],
            rows: vec![
                vec![ScalarValue::Text("a|b".into()), ScalarValue::Integer(1)],
                vec![ScalarValue::Text("ui".into()), ScalarValue::Integer(2)],
            ],
            truncated: false,
        };
        let md = result.to_markdown(1);
        assert!(md.starts_with("| suite | n |\n| --- | --- |\n| a\\|b | 1 |\n"));
        assert!(md.contains("(1 rows shown)"));
    }
}
