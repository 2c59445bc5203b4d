//! Long-term recall planning and the shared ranking function

use crate::memory::{LongTermRecord, Turn, TurnId};
use crate::utils::KeywordExtractor;
use chrono::{DateTime, Utc};
use std::cmp::Reverse;
use std::collections::BTreeSet;
use tracing::debug;

/// What to ask the long-term store for when building a context bundle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetrievalPlan {
    pub query_keywords: BTreeSet<String>,
    /// Number of records to keep after excluding turns still in the window
    pub top_k: usize,
    /// Turns already present in the short-term window
    pub exclude: BTreeSet<TurnId>,
}

impl RetrievalPlan {
    /// Over-fetch by the window size so that excluding window turns still
    /// leaves up to `top_k` records
    pub fn fetch_limit(&self) -> usize {
        self.top_k.saturating_add(self.exclude.len())
    }

    /// Drop excluded turns and cut to `top_k`, keeping ranking order
    pub fn apply(&self, ranked: Vec<LongTermRecord>) -> Vec<LongTermRecord> {
        ranked
            .into_iter()
            .filter(|record| !self.exclude.contains(&record.turn_id))
            .take(self.top_k)
            .collect()
    }
}

#[derive(Debug, Clone, Default)]
pub struct RetrievalPlanner {
    keywords: KeywordExtractor,
}

impl RetrievalPlanner {
    pub fn create_plan<'a>(
        &self,
        question: &str,
        window: impl IntoIterator<Item = &'a Turn>,
        top_k: usize,
    ) -> RetrievalPlan {
        let plan = RetrievalPlan {
            query_keywords: self.keywords.from_text(question),
            top_k,
            exclude: window.into_iter().map(|turn| turn.turn_id).collect(),
        };
        debug!(
            "Retrieval plan: {} keywords, top_k={}, excluding {} window turns",
            plan.query_keywords.len(),
            plan.top_k,
            plan.exclude.len()
        );
        plan
    }
}

/// Number of query keywords the record carries
pub fn keyword_overlap(query: &BTreeSet<String>, keywords: &BTreeSet<String>) -> usize {
    if query.len() <= keywords.len() {
        query.iter().filter(|k| keywords.contains(*k)).count()
    } else {
        keywords.iter().filter(|k| query.contains(*k)).count()
    }
}

/// Sort key for a record: overlap descending, age ascending, turn id descending
fn score(
    record: &LongTermRecord,
    query: &BTreeSet<String>,
    now: DateTime<Utc>,
) -> (Reverse<usize>, i64, Reverse<TurnId>) {
    let overlap = keyword_overlap(query, &record.keywords);
    let age = now
        .signed_duration_since(record.timestamp)
        .num_microseconds()
        .unwrap_or(i64::MAX);
    (Reverse(overlap), age, Reverse(record.turn_id))
}

/// Rank candidates against `query`.
///
/// Records sharing no keyword with a non-empty query are dropped; an empty
/// query ranks purely by recency. Output is deterministic for a given input
/// set regardless of candidate order.
pub fn rank(
    candidates: Vec<LongTermRecord>,
    query: &BTreeSet<String>,
    now: DateTime<Utc>,
    limit: usize,
) -> Vec<LongTermRecord> {
    let mut scored: Vec<_> = candidates
        .into_iter()
        .filter(|record| query.is_empty() || keyword_overlap(query, &record.keywords) > 0)
        .map(|record| (score(&record, query, now), record))
        .collect();
    scored.sort_by(|a, b| a.0.cmp(&b.0));
    scored.into_iter().take(limit).map(|(_, record)| record).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{CompactPayload, UserId};
    use chrono::TimeZone;
    use proptest::prelude::*;

    fn at(seconds: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + seconds, 0).unwrap()
    }

    fn record(id: u64, keywords: &[&str], seconds: i64) -> LongTermRecord {
        LongTermRecord {
            turn_id: TurnId(id),
            user_id: UserId(1),
            session_id: "s".into(),
            keywords: keywords.iter().map(|k| k.to_string()).collect(),
            timestamp: at(seconds),
            payload: CompactPayload {
                question: format!("q{}", id),
                summary: format!("s{}", id),
            },
        }
    }

    fn query(words: &[&str]) -> BTreeSet<String> {
        words.iter().map(|k| k.to_string()).collect()
    }

    fn ids(records: &[LongTermRecord]) -> Vec<u64> {
        records.iter().map(|r| r.turn_id.0).collect()
    }

    #[test]
    fn test_overlap_then_recency_then_id() {
        let candidates = vec![
            record(1, &["latency", "api"], 0),
            record(2, &["latency"], 50),
            record(3, &["latency", "api"], 10),
            record(4, &["latency", "api"], 10),
            record(5, &["flaky"], 100),
        ];
        let ranked = rank(candidates, &query(&["latency", "api"]), at(200), 10);
        assert_eq!(ids(&ranked), vec![4, 3, 1, 2]);
    }

    #[test]
    fn test_empty_query_is_pure_recency() {
        let candidates = vec![record(1, &["a"], 0), record(2, &["b"], 30), record(3, &[], 20)];
        let ranked = rank(candidates, &BTreeSet::new(), at(100), 2);
        assert_eq!(ids(&ranked), vec![2, 3]);
    }

    #[test]
    fn test_plan_excludes_window_turns() {
        let plan = RetrievalPlan {
            query_keywords: query(&["latency"]),
            top_k: 2,
            exclude: [TurnId(3)].into_iter().collect(),
        };
        assert_eq!(plan.fetch_limit(), 3);
        let ranked = vec![record(3, &["latency"], 3), record(2, &["latency"], 2), record(1, &["latency"], 1)];
        assert_eq!(ids(&plan.apply(ranked)), vec![2, 1]);
    }

    #[test]
    fn test_planner_uses_question_keywords() {
        let plan = RetrievalPlanner::default().create_plan("What is the API latency?", Vec::new(), 5);
        assert_eq!(plan.query_keywords, query(&["api", "latency"]));
        assert!(plan.exclude.is_empty());
    }

    proptest! {
        #[test]
        fn prop_rank_only_returns_overlapping_records(
            keyword_sets in prop::collection::vec(prop::collection::btree_set("[a-d]{3}", 0..3), 0..12),
        ) {
            let candidates: Vec<_> = keyword_sets
                .into_iter()
                .enumerate()
                .map(|(i, set)| LongTermRecord {
                    keywords: set,
                    ..record(i as u64, &[], i as i64)
                })
                .collect();
            let q = query(&["aaa"]);
            for r in rank(candidates, &q, at(1_000), 100) {
                prop_assert!(r.keywords.contains("aaa"));
            }
        }

        #[test]
        fn prop_rank_ignores_candidate_order(seed in 0usize..100) {
            let mut candidates = vec![
                record(1, &["aaa"], 5),
                record(2, &["aaa", "bbb"], 5),
                record(3, &["bbb"], 1),
                record(4, &["aaa"], 5),
            ];
            let expected = ids(&rank(candidates.clone(), &query(&["aaa", "bbb"]), at(10), 10));
            let len = candidates.len();
            candidates.rotate_left(seed % len);
            prop_assert_eq!(ids(&rank(candidates, &query(&["aaa", "bbb"]), at(10), 10)), expected);
        }
    }
}
