//! Assembles the context bundle handed to prompt construction

use crate::context_engine::short_term::ShortTermWindow;
use crate::memory::{LongTermRecord, Turn};
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ContextSegment {
    RollingSummary(String),
    RecentTurn(Turn),
    Recalled(LongTermRecord),
}

/// Ordered context for the next prompt: rolling summary, window turns
/// oldest first, then recalled records in ranking order
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContextBundle {
    pub segments: Vec<ContextSegment>,
}

impl ContextBundle {
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn recent_turns(&self) -> impl Iterator<Item = &Turn> {
        self.segments.iter().filter_map(|segment| match segment {
            ContextSegment::RecentTurn(turn) => Some(turn),
            _ => None,
        })
    }

    pub fn recalled(&self) -> impl Iterator<Item = &LongTermRecord> {
        self.segments.iter().filter_map(|segment| match segment {
            ContextSegment::Recalled(record) => Some(record),
            _ => None,
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct ContextBuilder;

impl ContextBuilder {
    pub fn new() -> Self {
        Self
    }

    /// `recalled` must already be ranked; records whose turn is still in the
    /// window are skipped
    pub fn build(&self, window: &ShortTermWindow, recalled: Vec<LongTermRecord>) -> ContextBundle {
        let mut segments = Vec::with_capacity(1 + window.len() + recalled.len());

        let summary = window.summary();
        if !summary.is_empty() {
            segments.push(ContextSegment::RollingSummary(summary.text()));
        }
        segments.extend(window.turns().cloned().map(ContextSegment::RecentTurn));

        let mut skipped = 0;
        for record in recalled {
            if window.turns().any(|turn| turn.turn_id == record.turn_id) {
                skipped += 1;
                continue;
            }
            segments.push(ContextSegment::Recalled(record));
        }

        debug!(
            "Built context bundle with {} segments ({} recalled duplicates skipped)",
            segments.len(),
            skipped
        );
        ContextBundle { segments }
    }
}
