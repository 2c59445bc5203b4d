//! Keyword extraction for long-term memory indexing and recall

use lazy_static::lazy_static;
use regex::Regex;
use std::collections::BTreeSet;

lazy_static! {
    static ref KEYWORD_REGEX: Regex = Regex::new(r"[a-z0-9_]+").unwrap();
    static ref STOP_WORDS: BTreeSet<&'static str> = [
        "the", "and", "but", "for", "with", "are", "was", "were", "been", "being",
        "have", "has", "had", "does", "did", "will", "would", "shall", "should",
        "may", "might", "must", "can", "could", "you", "she", "they", "him", "her",
        "them", "your", "his", "its", "our", "their", "this", "that", "these",
        "those", "what", "which", "who", "whom", "when", "where", "why", "how",
        "from", "into", "about", "than", "then", "there", "here", "any", "all",
        "show", "tell", "give", "list", "get", "please", "many", "much",
    ]
    .into_iter()
    .collect();
}

/// Extracts the keyword sets used to index and query long-term memory
#[derive(Debug, Clone)]
pub struct KeywordExtractor {
    min_word_length: usize,
}

impl Default for KeywordExtractor {
    fn default() -> Self {
        Self { min_word_length: 3 }
    }
}

impl KeywordExtractor {
    /// Lowercased `[a-z0-9_]+` tokens of at least the minimum length, stop words removed
    pub fn from_text(&self, text: &str) -> BTreeSet<String> {
        let lower = text.to_lowercase();
        KEYWORD_REGEX
            .find_iter(&lower)
            .map(|m| m.as_str())
            .filter(|word| self.keeps(word))
            .map(str::to_string)
            .collect()
    }

    /// Keywords for an archived turn: question words plus the tables
    /// (full name and last segment) and columns the SQL referenced. All of
    /// them pass the same length and stop-word filter.
    pub fn for_turn<'a>(
        &self,
        question: &str,
        tables: impl IntoIterator<Item = &'a String>,
        columns: impl IntoIterator<Item = &'a String>,
    ) -> BTreeSet<String> {
        let mut keywords = self.from_text(question);
        for table in tables {
            let lower = table.to_lowercase();
            if let Some(last) = lower.rsplit('.').next() {
                if last != lower && self.keeps(last) {
                    keywords.insert(last.to_string());
                }
            }
            if self.keeps(&lower) {
                keywords.insert(lower);
            }
        }
        keywords.extend(
            columns
                .into_iter()
                .map(|column| column.to_lowercase())
                .filter(|column| self.keeps(column)),
        );
        keywords
    }

    fn keeps(&self, word: &str) -> bool {
        word.chars().count() >= self.min_word_length && !Self::is_stop_word(word)
    }

    pub fn is_stop_word(word: &str) -> bool {
        STOP_WORDS.contains(word.to_lowercase().as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_text_filters_short_and_stop_words() {
        let keywords = KeywordExtractor::default().from_text("What is the p95 Latency of the API suite?");
        let expected: BTreeSet<String> = ["api", "latency", "p95", "suite"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(keywords, expected);
    }

    #[test]
    fn test_underscores_are_kept() {
        let keywords = KeywordExtractor::default().from_text("avg duration_ms per run");
        assert!(keywords.contains("duration_ms"));
        assert!(keywords.contains("avg"));
        assert!(keywords.contains("run"));
    }

    #[test]
    fn test_for_turn_includes_table_segments_and_columns() {
        let tables = vec!["ci.Test_Runs".to_string()];
        let columns = vec!["Duration_MS".to_string()];
        let keywords = KeywordExtractor::default().for_turn("flaky tests", &tables, &columns);
        assert!(keywords.contains("ci.test_runs"));
        assert!(keywords.contains("test_runs"));
        assert!(keywords.contains("duration_ms"));
        assert!(keywords.contains("flaky"));
        assert!(keywords.contains("tests"));
    }

    #[test]
    fn test_short_references_are_filtered_like_question_words() {
        let tables = vec!["ci.tr".to_string(), "qa.all".to_string()];
        let columns = vec!["id".to_string(), "owner".to_string()];
        let keywords = KeywordExtractor::default().for_turn("flaky tests", &tables, &columns);
        assert!(!keywords.contains("id"));
        assert!(!keywords.contains("tr"));
        assert!(!keywords.contains("all"));
        assert!(keywords.contains("ci.tr"));
        assert!(keywords.contains("qa.all"));
        assert!(keywords.contains("owner"));
    }

    #[test]
    fn test_empty_question_has_no_keywords() {
        assert!(KeywordExtractor::default().from_text("  ?! ").is_empty());
    }
}
