//! SQL safety gate - decides whether model-generated SQL is a single pure read
//!
//! The gate is deny-by-default: anything it cannot confidently recognize as
//! a `SELECT` (optionally preceded by read-only CTEs) is refused. Table and
//! column references are extracted on a best-effort basis for logging and
//! long-term memory indexing only.

pub mod classifier;
pub mod lexer;
pub mod references;

pub use classifier::classify;

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Why a statement was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnsafeReason {
    MutatingVerb,
    MultiStatement,
    DdlVerb,
    UnparseableSyntax,
    DisallowedConstruct,
}

impl UnsafeReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            UnsafeReason::MutatingVerb => "mutating_verb",
            UnsafeReason::MultiStatement => "multi_statement",
            UnsafeReason::DdlVerb => "ddl_verb",
            UnsafeReason::UnparseableSyntax => "unparseable_syntax",
            UnsafeReason::DisallowedConstruct => "disallowed_construct",
        }
    }

    /// Refusal text suitable for showing to the user
    pub fn description(&self) -> &'static str {
        match self {
            UnsafeReason::MutatingVerb => "the query would modify data",
            UnsafeReason::MultiStatement => "the query contains more than one statement",
            UnsafeReason::DdlVerb => "the query would change the database schema",
            UnsafeReason::UnparseableSyntax => "the query could not be parsed",
            UnsafeReason::DisallowedConstruct => {
                "the query uses a construct that is not a plain SELECT"
            }
        }
    }
}

impl fmt::Display for UnsafeReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A statement that passed the gate.
///
/// Only [`classify`] constructs this type; deserializing one re-runs the
/// classifier on the stored statement, so an archived or forged value can
/// never smuggle an unchecked statement to an executor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "SafeStatementRecord")]
pub struct SafeStatement {
    normalized_statement: String,
    referenced_tables: BTreeSet<String>,
    referenced_columns: BTreeSet<String>,
}

impl SafeStatement {
    pub(crate) fn new(
        normalized_statement: String,
        referenced_tables: BTreeSet<String>,
        referenced_columns: BTreeSet<String>,
    ) -> Self {
        Self {
            normalized_statement,
            referenced_tables,
            referenced_columns,
        }
    }

    /// Statement text with comments, layout and trailing semicolons removed
    pub fn normalized_statement(&self) -> &str {
        &self.normalized_statement
    }

    pub fn referenced_tables(&self) -> &BTreeSet<String> {
        &self.referenced_tables
    }

    pub fn referenced_columns(&self) -> &BTreeSet<String> {
        &self.referenced_columns
    }
}

#[derive(Deserialize)]
struct SafeStatementRecord {
    normalized_statement: String,
}

impl TryFrom<SafeStatementRecord> for SafeStatement {
    type Error = String;

    fn try_from(record: SafeStatementRecord) -> Result<Self, Self::Error> {
        match classify(&record.normalized_statement) {
            ClassificationResult::Safe(statement) => Ok(statement),
            ClassificationResult::Unsafe { reason } => {
                Err(format!("stored statement is not read-only: {}", reason))
            }
        }
    }
}

/// Safety verdict on a candidate statement
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum ClassificationResult {
    Safe(SafeStatement),
    Unsafe { reason: UnsafeReason },
}

impl ClassificationResult {
    pub fn is_safe(&self) -> bool {
        matches!(self, ClassificationResult::Safe(_))
    }

    pub fn safe_statement(&self) -> Option<&SafeStatement> {
        match self {
            ClassificationResult::Safe(statement) => Some(statement),
            ClassificationResult::Unsafe { .. } => None,
        }
    }

    pub fn unsafe_reason(&self) -> Option<UnsafeReason> {
        match self {
            ClassificationResult::Safe(_) => None,
            ClassificationResult::Unsafe { reason } => Some(*reason),
        }
    }

    /// Label used for logs and counters
    pub fn label(&self) -> &'static str {
        match self {
            ClassificationResult::Safe(_) => "safe",
            ClassificationResult::Unsafe { reason } => reason.as_str(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_safe_statement_serde_round_trip() {
        let result = classify("SELECT name FROM tests WHERE id = 1");
        let json = serde_json::to_string(&result).unwrap();
        let back: ClassificationResult = serde_json::from_str(&json).unwrap();
        assert_eq!(back, result);
    }

    #[test]
    fn test_forged_safe_statement_is_rejected() {
        let forged = r#"{"verdict":"safe","normalized_statement":"DROP TABLE tests","referenced_tables":[],"referenced_columns":[]}"#;
        assert!(serde_json::from_str::<ClassificationResult>(forged).is_err());
    }

    #[test]
    fn test_unsafe_serializes_reason() {
        let result = classify("DELETE FROM tests");
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["verdict"], "unsafe");
        assert_eq!(json["reason"], "mutating_verb");
    }
}
