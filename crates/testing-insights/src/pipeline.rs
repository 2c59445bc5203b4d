//! Per-session turn pipeline: classify, execute, extract, record

use crate::context_engine::{ContextBundle, MemoryManager, SessionContext};
use crate::executor::{ExecutionError, QueryExecutor};
use crate::extractor::{MetricExtractor, MetricMap};
use crate::memory::TurnId;
use crate::metrics;
use crate::sql_guard::{classify, ClassificationResult, UnsafeReason};
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

const PREVIEW_ROWS: usize = 20;

#[derive(Debug, Error)]
pub enum TurnError {
    /// The turn was still recorded, with empty metrics and its SQL kept
    #[error("turn {turn_id}: {source}")]
    Execution {
        turn_id: TurnId,
        #[source]
        source: ExecutionError,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TurnOutcome {
    Executed {
        metrics: MetricMap,
        row_count: usize,
        truncated: bool,
        /// Markdown rendering of the first rows
        preview: String,
    },
    Refused {
        reason: UnsafeReason,
    },
    /// No SQL was proposed for the question
    NoQuery,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TurnReport {
    pub turn_id: TurnId,
    pub outcome: TurnOutcome,
}

pub struct TurnPipeline {
    memory: Arc<MemoryManager>,
    executor: Arc<dyn QueryExecutor>,
    extractor: MetricExtractor,
}

impl TurnPipeline {
    pub fn new(memory: Arc<MemoryManager>, executor: Arc<dyn QueryExecutor>) -> Self {
        Self {
            memory,
            executor,
            extractor: MetricExtractor::new(),
        }
    }

    pub fn memory(&self) -> &Arc<MemoryManager> {
        &self.memory
    }

    /// Context bundle for an incoming question
    pub async fn prepare(&self, session: &SessionContext, question: &str) -> ContextBundle {
        self.memory.context_bundle(session, question, Utc::now()).await
    }

    /// Finish a turn with the SQL proposed for `question` (if any).
    ///
    /// Unsafe SQL is refused and never executed. Every path records the turn,
    /// including execution failures, which are then returned as errors.
    pub async fn complete(
        &self,
        session: &mut SessionContext,
        question: &str,
        proposed_sql: Option<&str>,
    ) -> Result<TurnReport, TurnError> {
        let turn = self.memory.begin_turn(session, question).await;
        let turn_id = turn.turn_id;

        let Some(sql) = proposed_sql else {
            self.memory.record_turn(session, turn).await;
            return Ok(TurnReport {
                turn_id,
                outcome: TurnOutcome::NoQuery,
            });
        };

        let verdict = classify(sql);
        match &verdict {
            ClassificationResult::Safe(_) => metrics::inc_gate_verdict("safe", "none"),
            ClassificationResult::Unsafe { reason } => {
                metrics::inc_gate_verdict("unsafe", reason.as_str())
            }
        }
        let turn = turn.with_sql(sql, verdict.clone());

        let statement = match verdict {
            ClassificationResult::Safe(statement) => statement,
            ClassificationResult::Unsafe { reason } => {
                info!("Turn {} refused by SQL gate: {}", turn_id, reason);
                self.memory.record_turn(session, turn).await;
                return Ok(TurnReport {
                    turn_id,
                    outcome: TurnOutcome::Refused { reason },
                });
            }
        };

        match self.executor.execute(&statement).await {
            Ok(result) => {
                let extracted = self.extractor.extract(&result.columns, &result.rows);
                info!(
                    "Turn {} executed: {} rows, {} metrics{}",
                    turn_id,
                    result.row_count(),
                    extracted.len(),
                    if result.truncated { " (truncated)" } else { "" }
                );
                self.memory
                    .record_turn(session, turn.with_metrics(extracted.clone()))
                    .await;
                Ok(TurnReport {
                    turn_id,
                    outcome: TurnOutcome::Executed {
                        metrics: extracted,
                        row_count: result.row_count(),
                        truncated: result.truncated,
                        preview: result.to_markdown(PREVIEW_ROWS),
                    },
                })
            }
            Err(source) => {
                warn!("Turn {} query execution failed: {}", turn_id, source);
                self.memory
                    .record_turn(session, turn.with_execution_error(source.to_string()))
                    .await;
                Err(TurnError::Execution { turn_id, source })
            }
        }
    }
}
