//! Memory manager - records turns, promotes evicted ones to long-term memory
//! and assembles the context bundle for the next prompt

use crate::context_engine::context_builder::{ContextBuilder, ContextBundle};
use crate::context_engine::retrieval_planner::RetrievalPlanner;
use crate::context_engine::short_term::ShortTermWindow;
use crate::memory::{LongTermRecord, LongTermStore, Turn, TurnId, UserId};
use crate::metrics;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct MemoryConfig {
    /// Turns kept verbatim per session
    pub short_term_capacity: usize,
    /// Long-term records added to each context bundle
    pub long_term_top_k: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            short_term_capacity: 6,
            long_term_top_k: 5,
        }
    }
}

/// Per-session conversational state, owned by the caller and passed into
/// every manager call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionContext {
    user_id: UserId,
    session_id: String,
    window: ShortTermWindow,
}

impl SessionContext {
    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn window(&self) -> &ShortTermWindow {
        &self.window
    }
}

pub struct MemoryManager {
    store: Arc<dyn LongTermStore>,
    config: MemoryConfig,
    planner: RetrievalPlanner,
    builder: ContextBuilder,
    /// Used only while the store cannot allocate ids
    fallback_turn_id: AtomicU64,
}

impl MemoryManager {
    pub fn new(store: Arc<dyn LongTermStore>, config: MemoryConfig) -> Self {
        info!(
            "Memory manager ready (window {}, top_k {})",
            config.short_term_capacity, config.long_term_top_k
        );
        Self {
            store,
            config,
            planner: RetrievalPlanner::default(),
            builder: ContextBuilder::new(),
            fallback_turn_id: AtomicU64::new(clock_seed()),
        }
    }

    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn LongTermStore> {
        &self.store
    }

    pub fn open_session(&self, user_id: UserId, session_id: impl Into<String>) -> SessionContext {
        let session_id = session_id.into();
        debug!("Opening session {} for user {}", session_id, user_id);
        metrics::inc_sessions();
        SessionContext {
            user_id,
            session_id,
            window: ShortTermWindow::new(self.config.short_term_capacity),
        }
    }

    /// Continue a session restored from a checkpoint. The window is fitted
    /// to the configured capacity and anything that no longer fits is
    /// archived like a normal eviction.
    pub async fn resume_session(&self, mut session: SessionContext) -> SessionContext {
        let evicted = session.window.resize(self.config.short_term_capacity);
        if !evicted.is_empty() {
            metrics::add_evictions(evicted.len());
            self.archive(evicted).await;
        }
        metrics::inc_sessions();
        debug!(
            "Resumed session {} for user {} ({} turns in window)",
            session.session_id,
            session.user_id,
            session.window.len()
        );
        session
    }

    /// Ids come from the store so that every process sharing it gets unique
    /// ids. While the store is unavailable ids are drawn from a clock-seeded
    /// local counter.
    pub async fn next_turn_id(&self) -> TurnId {
        let store = Arc::clone(&self.store);
        let allocated = tokio::task::spawn_blocking(move || store.allocate_turn_id()).await;
        match allocated {
            Ok(Ok(turn_id)) => turn_id,
            Ok(Err(e)) => {
                warn!("Could not allocate turn id from long-term store, using local counter: {}", e);
                metrics::inc_long_term_failure("allocate_turn_id");
                TurnId(self.fallback_turn_id.fetch_add(1, Ordering::Relaxed))
            }
            Err(e) => {
                warn!("Turn id allocation task failed, using local counter: {}", e);
                metrics::inc_long_term_failure("allocate_turn_id");
                TurnId(self.fallback_turn_id.fetch_add(1, Ordering::Relaxed))
            }
        }
    }

    /// Fresh turn for `question` with a newly allocated id
    pub async fn begin_turn(&self, session: &SessionContext, question: &str) -> Turn {
        Turn::new(
            self.next_turn_id().await,
            session.user_id,
            session.session_id.clone(),
            question,
            Utc::now(),
        )
    }

    /// Append a finished turn to the session window. Turns pushed out of the
    /// window are summarized and archived; archive failures are logged and
    /// counted but never fail the call. Returns the number of evicted turns.
    pub async fn record_turn(&self, session: &mut SessionContext, mut turn: Turn) -> usize {
        if turn.session_id != session.session_id || turn.user_id != session.user_id {
            warn!(
                "Turn {} carried session {} of user {} but was recorded into {} of user {}",
                turn.turn_id, turn.session_id, turn.user_id, session.session_id, session.user_id
            );
            turn.session_id = session.session_id.clone();
            turn.user_id = session.user_id;
        }
        debug!("Recording turn {} in session {}", turn.turn_id, session.session_id);
        metrics::inc_turns_recorded();

        let evicted = session.window.record(turn);
        let count = evicted.len();
        if count > 0 {
            metrics::add_evictions(count);
            self.archive(evicted).await;
        }
        count
    }

    /// Summary, window turns, then recalled records. A failing store degrades
    /// the bundle to short-term memory only.
    pub async fn context_bundle(
        &self,
        session: &SessionContext,
        question: &str,
        now: DateTime<Utc>,
    ) -> ContextBundle {
        let plan = self
            .planner
            .create_plan(question, session.window.turns(), self.config.long_term_top_k);

        let recalled = if plan.top_k == 0 {
            Vec::new()
        } else {
            let limit = plan.fetch_limit();
            match self
                .retrieve(session.user_id, plan.query_keywords.clone(), now, limit)
                .await
            {
                Ok(ranked) => plan.apply(ranked),
                Err(e) => {
                    warn!(
                        "Long-term retrieval failed for session {}, using short-term context only: {}",
                        session.session_id, e
                    );
                    metrics::inc_long_term_failure("retrieve");
                    Vec::new()
                }
            }
        };
        self.builder.build(&session.window, recalled)
    }

    /// Flush every remaining window turn to long-term memory. Returns how
    /// many turns were flushed.
    pub async fn close_session(&self, mut session: SessionContext) -> usize {
        let remaining = session.window.drain();
        let count = remaining.len();
        self.archive(remaining).await;
        metrics::dec_sessions();
        info!("Closed session {} ({} turns flushed)", session.session_id, count);
        count
    }

    /// Ranked long-term records of `user_id` for a free-text question
    pub async fn recall(
        &self,
        user_id: UserId,
        question: &str,
        now: DateTime<Utc>,
        limit: usize,
    ) -> anyhow::Result<Vec<LongTermRecord>> {
        let plan = self.planner.create_plan(question, std::iter::empty(), limit);
        let fetch_limit = plan.fetch_limit();
        self.retrieve(user_id, plan.query_keywords, now, fetch_limit).await
    }

    pub async fn fetch_turn(&self, user_id: UserId, turn_id: TurnId) -> anyhow::Result<Option<Turn>> {
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || store.fetch_turn(user_id, turn_id)).await?
    }

    async fn retrieve(
        &self,
        user_id: UserId,
        keywords: BTreeSet<String>,
        now: DateTime<Utc>,
        limit: usize,
    ) -> anyhow::Result<Vec<LongTermRecord>> {
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || store.retrieve(user_id, &keywords, now, limit)).await?
    }

    async fn archive(&self, turns: Vec<Turn>) {
        if turns.is_empty() {
            return;
        }
        let store = Arc::clone(&self.store);
        let outcome = tokio::task::spawn_blocking(move || {
            let mut failures = Vec::new();
            for turn in &turns {
                if let Err(e) = store.index(turn) {
                    failures.push((turn.turn_id, e));
                }
            }
            (turns.len(), failures)
        })
        .await;

        match outcome {
            Ok((total, failures)) => {
                for (turn_id, e) in &failures {
                    warn!("Failed to archive turn {} to long-term memory: {:#}", turn_id, e);
                    metrics::inc_long_term_failure("index");
                }
                debug!("Archived {} of {} evicted turns", total - failures.len(), total);
            }
            Err(e) => {
                warn!("Archive task failed: {}", e);
                metrics::inc_long_term_failure("index");
            }
        }
    }
}

fn clock_seed() -> u64 {
    u64::try_from(Utc::now().timestamp_micros()).unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context_engine::context_builder::ContextSegment;
    use crate::memory::InMemoryLongTermStore;

    const ALICE: UserId = UserId(1);
    const BOB: UserId = UserId(2);

    struct FailingStore;

    impl LongTermStore for FailingStore {
        fn index(&self, _turn: &Turn) -> anyhow::Result<LongTermRecord> {
            anyhow::bail!("disk full")
        }

        fn retrieve(
            &self,
            _user_id: UserId,
            _query_keywords: &BTreeSet<String>,
            _now: DateTime<Utc>,
            _limit: usize,
        ) -> anyhow::Result<Vec<LongTermRecord>> {
            anyhow::bail!("database locked")
        }

        fn fetch_turn(&self, _user_id: UserId, _turn_id: TurnId) -> anyhow::Result<Option<Turn>> {
            anyhow::bail!("database locked")
        }

        fn allocate_turn_id(&self) -> anyhow::Result<TurnId> {
            anyhow::bail!("database locked")
        }
    }

    fn config(capacity: usize, top_k: usize) -> MemoryConfig {
        MemoryConfig {
            short_term_capacity: capacity,
            long_term_top_k: top_k,
        }
    }

    async fn record(manager: &MemoryManager, session: &mut SessionContext, question: &str) -> TurnId {
        let turn = manager.begin_turn(session, question).await;
        let id = turn.turn_id;
        manager.record_turn(session, turn).await;
        id
    }

    #[tokio::test]
    async fn test_default_manager_starts_at_one() {
        let manager =
            crate::context_engine::create_default_manager(Arc::new(InMemoryLongTermStore::new()));
        assert_eq!(manager.config().short_term_capacity, 6);
        assert_eq!(manager.config().long_term_top_k, 5);
        assert_eq!(manager.next_turn_id().await, TurnId(1));
        assert_eq!(manager.next_turn_id().await, TurnId(2));
    }

    #[tokio::test]
    async fn test_evicted_turn_is_recallable_by_its_keywords() {
        let store = Arc::new(InMemoryLongTermStore::new());
        let manager = MemoryManager::new(store.clone(), config(2, 5));
        let mut session = manager.open_session(ALICE, "s1");

        let first = record(&manager, &mut session, "p95 latency of the checkout suite").await;
        record(&manager, &mut session, "flaky tests this week").await;
        assert!(store.is_empty());
        record(&manager, &mut session, "failures by owner").await;
        assert_eq!(store.len(), 1);

        let bundle = manager.context_bundle(&session, "checkout latency again", Utc::now()).await;
        let recalled: Vec<TurnId> = bundle.recalled().map(|r| r.turn_id).collect();
        assert_eq!(recalled, vec![first]);
        assert!(matches!(bundle.segments[0], ContextSegment::RollingSummary(_)));
        assert_eq!(bundle.recent_turns().count(), 2);

        let archived = manager.fetch_turn(ALICE, first).await.unwrap().unwrap();
        assert!(archived.short_summary().is_some());
        assert!(manager.fetch_turn(BOB, first).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_recall_ranks_by_overlap() {
        let store = Arc::new(InMemoryLongTermStore::new());
        let now = Utc::now();
        store
            .index(&Turn::new(TurnId(1), ALICE, "old", "checkout latency p95", now))
            .unwrap();
        store
            .index(&Turn::new(TurnId(2), ALICE, "old", "checkout failures", now))
            .unwrap();
        store
            .index(&Turn::new(TurnId(3), BOB, "old", "checkout latency p95", now))
            .unwrap();
        let manager = MemoryManager::new(store, MemoryConfig::default());

        let found = manager.recall(ALICE, "checkout latency", now, 5).await.unwrap();
        let ids: Vec<TurnId> = found.iter().map(|r| r.turn_id).collect();
        assert_eq!(ids, vec![TurnId(1), TurnId(2)]);
    }

    #[tokio::test]
    async fn test_turn_ids_continue_after_archive() {
        let store = Arc::new(InMemoryLongTermStore::new());
        store
            .index(&Turn::new(TurnId(41), ALICE, "old", "earlier", Utc::now()))
            .unwrap();
        let manager = MemoryManager::new(store, MemoryConfig::default());
        assert_eq!(manager.next_turn_id().await, TurnId(42));
        assert_eq!(manager.next_turn_id().await, TurnId(43));
    }

    #[tokio::test]
    async fn test_managers_sharing_a_store_never_reuse_ids() {
        let store: Arc<dyn LongTermStore> = Arc::new(InMemoryLongTermStore::new());
        let first = MemoryManager::new(Arc::clone(&store), config(1, 5));
        let second = MemoryManager::new(Arc::clone(&store), config(1, 5));
        let mut a = first.open_session(ALICE, "a");
        let mut b = second.open_session(ALICE, "b");

        let mut seen = BTreeSet::new();
        for i in 0..5 {
            assert!(seen.insert(record(&first, &mut a, &format!("alpha {}", i)).await));
            assert!(seen.insert(record(&second, &mut b, &format!("beta {}", i)).await));
        }
        first.close_session(a).await;
        second.close_session(b).await;

        let all = store.retrieve(ALICE, &BTreeSet::new(), Utc::now(), 100).unwrap();
        assert_eq!(all.len(), 10);
    }

    #[tokio::test]
    async fn test_store_failures_do_not_block_turns() {
        let manager = MemoryManager::new(Arc::new(FailingStore), config(1, 3));
        let mut session = manager.open_session(ALICE, "s1");
        let first = record(&manager, &mut session, "first question").await;
        let second = manager.begin_turn(&session, "second question").await;
        assert!(first.0 > 1_000_000);
        assert_eq!(second.turn_id.0, first.0 + 1);
        let evicted = manager.record_turn(&mut session, second).await;
        assert_eq!(evicted, 1);

        let bundle = manager.context_bundle(&session, "first", Utc::now()).await;
        assert_eq!(bundle.recalled().count(), 0);
        assert_eq!(bundle.recent_turns().count(), 1);
    }

    #[tokio::test]
    async fn test_close_session_flushes_window() {
        let store = Arc::new(InMemoryLongTermStore::new());
        let manager = MemoryManager::new(store.clone(), config(4, 5));
        let mut session = manager.open_session(ALICE, "s1");
        for question in ["one metric", "two metric", "three metric"] {
            record(&manager, &mut session, question).await;
        }
        assert_eq!(manager.close_session(session).await, 3);
        assert_eq!(store.len(), 3);
    }

    #[tokio::test]
    async fn test_resume_fits_window_to_current_capacity() {
        let store = Arc::new(InMemoryLongTermStore::new());
        let wide = MemoryManager::new(store.clone(), config(4, 5));
        let mut session = wide.open_session(ALICE, "s1");
        for question in ["one metric", "two metric", "three metric"] {
            record(&wide, &mut session, question).await;
        }

        let narrow = MemoryManager::new(store.clone(), config(1, 5));
        let resumed = narrow.resume_session(session).await;
        assert_eq!(resumed.window().len(), 1);
        assert_eq!(resumed.window().summary().len(), 2);
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn test_window_turns_are_not_recalled_twice() {
        let store = Arc::new(InMemoryLongTermStore::new());
        let manager = MemoryManager::new(store.clone(), config(3, 5));
        let mut session = manager.open_session(ALICE, "s1");
        let id = record(&manager, &mut session, "latency report").await;
        // archived by a previous process but still in this window
        let in_window = session.window().turns().find(|t| t.turn_id == id).cloned().unwrap();
        store.index(&in_window).unwrap();

        let bundle = manager.context_bundle(&session, "latency", Utc::now()).await;
        assert_eq!(bundle.recalled().count(), 0);
        assert_eq!(bundle.recent_turns().count(), 1);
    }

    #[tokio::test]
    async fn test_sessions_are_isolated() {
        let store = Arc::new(InMemoryLongTermStore::new());
        let manager = MemoryManager::new(store, config(2, 0));
        let mut a = manager.open_session(ALICE, "a");
        let mut b = manager.open_session(BOB, "b");
        record(&manager, &mut a, "alpha").await;
        record(&manager, &mut b, "beta").await;
        record(&manager, &mut b, "gamma").await;
        assert_eq!(a.window().len(), 1);
        assert_eq!(b.window().len(), 2);
        assert!(b.window().turns().all(|t| t.user_id == BOB));
    }
}
