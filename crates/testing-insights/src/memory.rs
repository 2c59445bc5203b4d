//! Turn model and the long-term memory store abstraction

use crate::context_engine::retrieval_planner;
use crate::extractor::{highlights, MetricMap};
use crate::sql_guard::ClassificationResult;
use crate::utils::{KeywordExtractor, TextUtils};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

const SUMMARY_QUESTION_CHARS: usize = 160;
const SUMMARY_ERROR_CHARS: usize = 120;
const SUMMARY_HIGHLIGHTS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TurnId(pub u64);

impl fmt::Display for TurnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Owner of a session and of every turn recorded in it
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub i64);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One question/answer cycle of a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub turn_id: TurnId,
    pub user_id: UserId,
    pub session_id: String,
    pub timestamp: DateTime<Utc>,
    pub user_question: String,
    /// Proposed SQL, kept verbatim even when refused or failed
    pub generated_sql: Option<String>,
    pub classification: Option<ClassificationResult>,
    #[serde(default)]
    pub extracted_metrics: MetricMap,
    #[serde(default)]
    pub execution_error: Option<String>,
    #[serde(default)]
    short_summary: Option<String>,
}

impl Turn {
    pub fn new(
        turn_id: TurnId,
        user_id: UserId,
        session_id: impl Into<String>,
        user_question: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            turn_id,
            user_id,
            session_id: session_id.into(),
            timestamp,
            user_question: user_question.into(),
            generated_sql: None,
            classification: None,
            extracted_metrics: MetricMap::new(),
            execution_error: None,
            short_summary: None,
        }
    }

    pub fn with_sql(mut self, sql: impl Into<String>, classification: ClassificationResult) -> Self {
        self.generated_sql = Some(sql.into());
        self.classification = Some(classification);
        self
    }

    pub fn with_metrics(mut self, metrics: MetricMap) -> Self {
        self.extracted_metrics = metrics;
        self
    }

    pub fn with_execution_error(mut self, error: impl Into<String>) -> Self {
        self.execution_error = Some(error.into());
        self
    }

    /// Populated once the turn has left the short-term window
    pub fn short_summary(&self) -> Option<&str> {
        self.short_summary.as_deref()
    }

    /// Returns false (and keeps the existing text) if already set
    pub(crate) fn set_short_summary(&mut self, summary: String) -> bool {
        if self.short_summary.is_some() {
            return false;
        }
        self.short_summary = Some(summary);
        true
    }

    /// Deterministic one-line condensation: question plus metric highlights,
    /// or the refusal / failure note
    pub fn condense(&self) -> String {
        let question = TextUtils::one_line(&self.user_question, SUMMARY_QUESTION_CHARS);
        let outcome = match (&self.execution_error, &self.classification) {
            (Some(error), _) => {
                format!("query failed: {}", TextUtils::one_line(error, SUMMARY_ERROR_CHARS))
            }
            (None, None) => "no query".to_string(),
            (None, Some(ClassificationResult::Unsafe { reason })) => {
                format!("refused: {}", reason.description())
            }
            (None, Some(ClassificationResult::Safe(_))) => {
                let notes = highlights(&self.extracted_metrics, SUMMARY_HIGHLIGHTS);
                if notes.is_empty() {
                    "no rows".to_string()
                } else {
                    notes.join(", ")
                }
            }
        };
        format!("Q: {} -> {}", question, outcome)
    }

    /// Index keywords: question words plus referenced tables and columns
    pub fn keywords(&self, extractor: &KeywordExtractor) -> BTreeSet<String> {
        match self.classification.as_ref().and_then(|c| c.safe_statement()) {
            Some(statement) => extractor.for_turn(
                &self.user_question,
                statement.referenced_tables(),
                statement.referenced_columns(),
            ),
            None => extractor.from_text(&self.user_question),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompactPayload {
    pub question: String,
    pub summary: String,
}

/// Archived, searchable form of a turn
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LongTermRecord {
    pub turn_id: TurnId,
    pub user_id: UserId,
    pub session_id: String,
    pub keywords: BTreeSet<String>,
    pub timestamp: DateTime<Utc>,
    pub payload: CompactPayload,
}

impl LongTermRecord {
    pub fn from_turn(turn: &Turn) -> Self {
        let summary = turn
            .short_summary()
            .map(str::to_string)
            .unwrap_or_else(|| turn.condense());
        Self {
            turn_id: turn.turn_id,
            user_id: turn.user_id,
            session_id: turn.session_id.clone(),
            keywords: turn.keywords(&KeywordExtractor::default()),
            timestamp: turn.timestamp,
            payload: CompactPayload {
                question: turn.user_question.clone(),
                summary,
            },
        }
    }
}

/// Durable keyword/recency store for turns that left the short-term window.
///
/// Implementations must be safe for concurrent `index` and `retrieve`, and
/// never return one user's records to another.
pub trait LongTermStore: Send + Sync {
    /// Insert or replace the record for `turn.turn_id`
    fn index(&self, turn: &Turn) -> anyhow::Result<LongTermRecord>;

    /// At most `limit` of `user_id`'s records ranked by keyword overlap,
    /// then recency
    fn retrieve(
        &self,
        user_id: UserId,
        query_keywords: &BTreeSet<String>,
        now: DateTime<Utc>,
        limit: usize,
    ) -> anyhow::Result<Vec<LongTermRecord>>;

    /// Full archived turn, if it belongs to `user_id`
    fn fetch_turn(&self, user_id: UserId, turn_id: TurnId) -> anyhow::Result<Option<Turn>>;

    /// Next unused turn id. Ids are unique across every caller sharing the
    /// store and always exceed any id already indexed.
    fn allocate_turn_id(&self) -> anyhow::Result<TurnId>;
}

/// Process-local store, mainly for tests and ephemeral sessions
#[derive(Clone)]
pub struct InMemoryLongTermStore {
    records: Arc<DashMap<TurnId, (LongTermRecord, Turn)>>,
    next_turn_id: Arc<AtomicU64>,
}

impl InMemoryLongTermStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl Default for InMemoryLongTermStore {
    fn default() -> Self {
        Self {
            records: Arc::new(DashMap::new()),
            next_turn_id: Arc::new(AtomicU64::new(1)),
        }
    }
}

impl LongTermStore for InMemoryLongTermStore {
    fn index(&self, turn: &Turn) -> anyhow::Result<LongTermRecord> {
        let record = LongTermRecord::from_turn(turn);
        self.next_turn_id
            .fetch_max(turn.turn_id.0.saturating_add(1), Ordering::SeqCst);
        self.records
            .insert(turn.turn_id, (record.clone(), turn.clone()));
        Ok(record)
    }

    fn retrieve(
        &self,
        user_id: UserId,
        query_keywords: &BTreeSet<String>,
        now: DateTime<Utc>,
        limit: usize,
    ) -> anyhow::Result<Vec<LongTermRecord>> {
        let candidates: Vec<LongTermRecord> = self
            .records
            .iter()
            .filter(|entry| entry.value().0.user_id == user_id)
            .map(|entry| entry.value().0.clone())
            .collect();
        Ok(retrieval_planner::rank(candidates, query_keywords, now, limit))
    }

    fn fetch_turn(&self, user_id: UserId, turn_id: TurnId) -> anyhow::Result<Option<Turn>> {
        Ok(self
            .records
            .get(&turn_id)
            .filter(|entry| entry.value().1.user_id == user_id)
            .map(|entry| entry.value().1.clone()))
    }

    fn allocate_turn_id(&self) -> anyhow::Result<TurnId> {
        Ok(TurnId(self.next_turn_id.fetch_add(1, Ordering::SeqCst)))
    }
}
