//! Text helpers used when condensing turns into summaries

use lazy_static::lazy_static;
use regex::Regex;
use std::borrow::Cow;

lazy_static! {
    static ref WHITESPACE_REGEX: Regex = Regex::new(r"\s+").unwrap();
}

pub struct TextUtils;

impl TextUtils {
    /// Collapse runs of whitespace into single spaces and trim the ends
    pub fn normalize_whitespace(text: &str) -> Cow<'_, str> {
        let trimmed = text.trim();
        if trimmed.split(' ').any(str::is_empty) || trimmed.contains(|c: char| c.is_whitespace() && c != ' ') {
            Cow::Owned(WHITESPACE_REGEX.replace_all(trimmed, " ").into_owned())
        } else {
            Cow::Borrowed(trimmed)
        }
    }

    /// Truncate text to at most `max_chars` characters, ending with "..." when cut
    pub fn truncate_with_ellipsis(text: &str, max_chars: usize) -> Cow<'_, str> {
        if text.chars().count() <= max_chars {
            return Cow::Borrowed(text);
        }
        if max_chars <= 3 {
            return Cow::Borrowed("...");
        }
        let mut result: String = text.chars().take(max_chars - 3).collect();
        result.push_str("...");
        Cow::Owned(result)
    }

    /// Single-line rendering of free text for summaries and logs
    pub fn one_line(text: &str, max_chars: usize) -> String {
        let normalized = Self::normalize_whitespace(text);
        Self::truncate_with_ellipsis(&normalized, max_chars).into_owned()
    }
}
