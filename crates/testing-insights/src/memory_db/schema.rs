//! Row-level types for the long-term memory database
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// Summary counters reported by `stats`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseStats {
    pub total_records: i64,
    /// Rows in the keyword index (turn, keyword pairs)
    pub total_keywords: i64,
    pub distinct_keywords: i64,
    pub total_sessions: i64,
    pub total_users: i64,
    pub database_size_bytes: i64,
    pub schema_version: i64,
}

/// Fixed-width UTC rendering so that text order matches time order
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_timestamp(raw: &str) -> anyhow::Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(raw)
        .map_err(|e| anyhow::anyhow!("Failed to parse timestamp {:?}: {}", raw, e))?
        .with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_timestamp_format_sorts_lexicographically() {
        let early = Utc.timestamp_opt(1_700_000_000, 5_000).unwrap();
        let late = Utc.timestamp_opt(1_700_000_000, 900_000_000).unwrap();
        let (a, b) = (format_timestamp(&early), format_timestamp(&late));
        assert!(a < b);
        assert!(a.ends_with('Z'));
        assert_eq!(parse_timestamp(&a).unwrap(), early);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_timestamp("yesterday").is_err());
    }
}
