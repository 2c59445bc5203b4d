pub mod config;
pub mod context_engine;
pub mod executor;
pub mod extractor;
pub mod memory;
pub mod memory_db;
pub mod metrics;
pub mod pipeline;
pub mod sql_guard;
pub mod telemetry;
pub mod utils;

// Public API exports
pub use config::Config;
pub use context_engine::{ContextBundle, ContextSegment, MemoryConfig, MemoryManager, SessionContext};
pub use executor::{ExecutionError, QueryExecutor, QueryResult, SqliteExecutor};
pub use extractor::{ColumnMeta, ColumnType, MetricExtractor, MetricMap, MetricValue, ScalarValue};
pub use memory::{InMemoryLongTermStore, LongTermRecord, LongTermStore, Turn, TurnId, UserId};
pub use memory_db::{CheckpointStore, MemoryDatabase, UserStore};
pub use pipeline::{TurnError, TurnOutcome, TurnPipeline, TurnReport};
pub use sql_guard::{classify, ClassificationResult, SafeStatement, UnsafeReason};
