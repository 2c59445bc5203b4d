//! Context engine module - short-term window, long-term recall and bundle assembly

pub mod context_builder;
pub mod orchestrator;
pub mod retrieval_planner;
pub mod short_term;

pub use context_builder::{ContextBuilder, ContextBundle, ContextSegment};
pub use orchestrator::{MemoryConfig, MemoryManager, SessionContext};
pub use retrieval_planner::{RetrievalPlan, RetrievalPlanner};
pub use short_term::{RollingSummary, ShortTermWindow};

/// Memory manager over a store with default window and recall sizes
pub fn create_default_manager(
    store: std::sync::Arc<dyn crate::memory::LongTermStore>,
) -> MemoryManager {
    MemoryManager::new(store, MemoryConfig::default())
}
