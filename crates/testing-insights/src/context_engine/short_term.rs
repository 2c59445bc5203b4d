//! Bounded window of recent turns plus the rolling summary of evicted ones

use crate::memory::Turn;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tracing::debug;

/// Append-only condensation of turns that left the window, in eviction order
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollingSummary {
    entries: Vec<String>,
}

impl RollingSummary {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn entries(&self) -> &[String] {
        &self.entries
    }

    pub fn text(&self) -> String {
        self.entries.join("\n")
    }

    fn append(&mut self, entry: String) {
        self.entries.push(entry);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShortTermWindow {
    capacity: usize,
    turns: VecDeque<Turn>,
    summary: RollingSummary,
}

impl ShortTermWindow {
    /// A capacity of zero is treated as one
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            turns: VecDeque::with_capacity(capacity),
            summary: RollingSummary::default(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    /// Window turns, oldest first
    pub fn turns(&self) -> impl Iterator<Item = &Turn> {
        self.turns.iter()
    }

    pub fn summary(&self) -> &RollingSummary {
        &self.summary
    }

    /// Push a turn and return whatever fell out of the window, oldest first.
    /// Each evicted turn carries its `short_summary`, which is also the text
    /// appended to the rolling summary.
    pub fn record(&mut self, turn: Turn) -> Vec<Turn> {
        self.turns.push_back(turn);
        let mut evicted = Vec::new();
        while self.turns.len() > self.capacity {
            if let Some(oldest) = self.turns.pop_front() {
                evicted.push(self.summarize(oldest));
            }
        }
        if !evicted.is_empty() {
            debug!(
                "Evicted {} turn(s) from short-term window (capacity {})",
                evicted.len(),
                self.capacity
            );
        }
        evicted
    }

    /// Change the capacity, evicting the oldest turns if the window is now
    /// over it. Used when a checkpointed window is restored under a
    /// different configuration.
    pub fn resize(&mut self, capacity: usize) -> Vec<Turn> {
        self.capacity = capacity.max(1);
        let mut evicted = Vec::new();
        while self.turns.len() > self.capacity {
            if let Some(oldest) = self.turns.pop_front() {
                evicted.push(self.summarize(oldest));
            }
        }
        evicted
    }

    /// Evict every remaining turn through the same path as overflow eviction
    pub fn drain(&mut self) -> Vec<Turn> {
        let remaining: Vec<Turn> = self.turns.drain(..).collect();
        remaining.into_iter().map(|turn| self.summarize(turn)).collect()
    }

    fn summarize(&mut self, mut turn: Turn) -> Turn {
        let condensed = turn.condense();
        if !turn.set_short_summary(condensed.clone()) {
            debug!("Turn {} already summarized, keeping existing text", turn.turn_id);
        }
        let entry = turn.short_summary().map(str::to_string).unwrap_or(condensed);
        self.summary.append(entry);
        turn
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{TurnId, UserId};
    use chrono::Utc;

    fn turn(id: u64) -> Turn {
        Turn::new(TurnId(id), UserId(1), "s", format!("question {}", id), Utc::now())
    }

    fn ids<'a>(turns: impl Iterator<Item = &'a Turn>) -> Vec<u64> {
        turns.map(|t| t.turn_id.0).collect()
    }

    #[test]
    fn test_capacity_three_with_five_inserts() {
        let mut window = ShortTermWindow::new(3);
        let mut evicted = Vec::new();
        for id in 1..=5 {
            evicted.extend(window.record(turn(id)));
        }
        assert_eq!(ids(window.turns()), vec![3, 4, 5]);
        assert_eq!(ids(evicted.iter()), vec![1, 2]);
        assert_eq!(
            window.summary().entries(),
            &[
                "Q: question 1 -> no query".to_string(),
                "Q: question 2 -> no query".to_string()
            ]
        );
        assert_eq!(evicted[0].short_summary(), Some("Q: question 1 -> no query"));
    }

    #[test]
    fn test_below_capacity_evicts_nothing() {
        let mut window = ShortTermWindow::new(2);
        assert!(window.record(turn(1)).is_empty());
        assert!(window.summary().is_empty());
        assert_eq!(window.len(), 1);
    }

    #[test]
    fn test_zero_capacity_is_one() {
        let mut window = ShortTermWindow::new(0);
        assert_eq!(window.capacity(), 1);
        window.record(turn(1));
        let evicted = window.record(turn(2));
        assert_eq!(ids(evicted.iter()), vec![1]);
        assert_eq!(ids(window.turns()), vec![2]);
    }

    #[test]
    fn test_drain_summarizes_in_order() {
        let mut window = ShortTermWindow::new(4);
        for id in 1..=3 {
            window.record(turn(id));
        }
        let flushed = window.drain();
        assert!(window.is_empty());
        assert_eq!(ids(flushed.iter()), vec![1, 2, 3]);
        assert_eq!(window.summary().len(), 3);
        assert!(flushed.iter().all(|t| t.short_summary().is_some()));
        assert_eq!(window.summary().text().lines().count(), 3);
    }

    #[test]
    fn test_resize_evicts_oldest_into_summary() {
        let mut window = ShortTermWindow::new(4);
        for id in 1..=4 {
            window.record(turn(id));
        }
        let evicted = window.resize(2);
        assert_eq!(ids(evicted.iter()), vec![1, 2]);
        assert_eq!(ids(window.turns()), vec![3, 4]);
        assert_eq!(window.summary().len(), 2);

        assert!(window.resize(5).is_empty());
        assert_eq!(window.capacity(), 5);
        assert_eq!(window.resize(0).len(), 1);
        assert_eq!(ids(window.turns()), vec![4]);
    }
}
