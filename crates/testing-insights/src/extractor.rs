//! Structured metric extraction from query result sets

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use tracing::debug;

/// Key used when a result set can only be represented as a table
pub const TABLE_METRIC_KEY: &str = "result";

/// A single cell value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ScalarValue {
    Null,
    Bool(bool),
    Integer(i64),
    Real(f64),
    Text(String),
}

impl ScalarValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ScalarValue::Integer(v) => Some(*v as f64),
            ScalarValue::Real(v) => Some(*v),
            ScalarValue::Bool(v) => Some(if *v { 1.0 } else { 0.0 }),
            ScalarValue::Text(s) => s.trim().parse().ok(),
            ScalarValue::Null => None,
        }
    }

    fn kind(&self) -> Option<ColumnType> {
        match self {
            ScalarValue::Null => None,
            ScalarValue::Bool(_) => Some(ColumnType::Boolean),
            ScalarValue::Integer(_) | ScalarValue::Real(_) => Some(ColumnType::Number),
            ScalarValue::Text(_) => Some(ColumnType::Text),
        }
    }
}

impl fmt::Display for ScalarValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScalarValue::Null => f.write_str("null"),
            ScalarValue::Bool(v) => write!(f, "{}", v),
            ScalarValue::Integer(v) => write!(f, "{}", v),
            ScalarValue::Real(v) => write!(f, "{}", v),
            ScalarValue::Text(s) => f.write_str(s),
        }
    }
}

/// Declared column type as reported by the executor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    Number,
    Text,
    Boolean,
    /// No usable type information (e.g. an all-null column)
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnMeta {
    pub name: String,
    pub column_type: ColumnType,
}

impl ColumnMeta {
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "shape", content = "value", rename_all = "snake_case")]
pub enum MetricValue {
    Scalar(ScalarValue),
    Series(Vec<ScalarValue>),
    Table(Vec<BTreeMap<String, ScalarValue>>),
}

impl MetricValue {
    /// Numeric view of a scalar metric
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            MetricValue::Scalar(value) => value.as_f64(),
            _ => None,
        }
    }

    /// Short human-readable rendering used in rolling summaries
    pub fn highlight(&self, name: &str) -> String {
        match self {
            MetricValue::Scalar(value) => format!("{}={}", name, value),
            MetricValue::Series(values) => format!("{}: {} values", name, values.len()),
            MetricValue::Table(rows) => format!("{}: {} rows", name, rows.len()),
        }
    }
}

/// Ordered so that every rendering of a metric map is reproducible
pub type MetricMap = BTreeMap<String, MetricValue>;

/// First `max` metric highlights in key order
pub fn highlights(metrics: &MetricMap, max: usize) -> Vec<String> {
    metrics
        .iter()
        .take(max)
        .map(|(name, value)| value.highlight(name))
        .collect()
}

/// Turns raw rows into named metrics
#[derive(Debug, Clone, Default)]
pub struct MetricExtractor;

impl MetricExtractor {
    pub fn new() -> Self {
        Self
    }

    /// Shape policy: 1x1 -> one scalar, 1xN -> N scalars, Nx1 -> one series,
    /// anything else (or anything ambiguous) -> one table under
    /// [`TABLE_METRIC_KEY`]. An empty result yields an empty map.
    pub fn extract(&self, columns: &[ColumnMeta], rows: &[Vec<ScalarValue>]) -> MetricMap {
        let mut metrics = MetricMap::new();
        if columns.is_empty() || rows.is_empty() {
            return metrics;
        }

        let names = unique_names(columns);
        let well_formed = rows.iter().all(|row| row.len() == columns.len());
        if !well_formed {
            debug!("Result rows disagree with {} columns, degrading to table", columns.len());
            metrics.insert(TABLE_METRIC_KEY.to_string(), table(&names, rows));
            return metrics;
        }

        match (rows.len(), columns.len()) {
            (1, _) => {
                for (name, value) in names.iter().zip(&rows[0]) {
                    metrics.insert(name.clone(), MetricValue::Scalar(value.clone()));
                }
            }
            (_, 1) if column_is_consistent(&columns[0], rows) => {
                let series = rows.iter().map(|row| row[0].clone()).collect();
                metrics.insert(names[0].clone(), MetricValue::Series(series));
            }
            _ => {
                metrics.insert(TABLE_METRIC_KEY.to_string(), table(&names, rows));
            }
        }
        metrics
    }
}

/// Empty names become `column_<n>`; repeats get a `_<k>` suffix.
fn unique_names(columns: &[ColumnMeta]) -> Vec<String> {
    let mut used = BTreeSet::new();
    columns
        .iter()
        .enumerate()
        .map(|(idx, column)| {
            let base = if column.name.trim().is_empty() {
                format!("column_{}", idx + 1)
            } else {
                column.name.clone()
            };
            claim(&mut used, base)
        })
        .collect()
}

/// `base`, or the first `base_<k>` (k >= 2) not yet taken
fn claim(used: &mut BTreeSet<String>, base: String) -> String {
    let mut candidate = base.clone();
    let mut k = 2;
    while used.contains(&candidate) {
        candidate = format!("{}_{}", base, k);
        k += 1;
    }
    used.insert(candidate.clone());
    candidate
}

/// A column is consistent when all non-null cells share one kind, and that
/// kind matches the declared type when one is declared.
fn column_is_consistent(column: &ColumnMeta, rows: &[Vec<ScalarValue>]) -> bool {
    let mut kinds = rows.iter().filter_map(|row| row[0].kind());
    let Some(first) = kinds.next() else {
        return true;
    };
    if column.column_type != ColumnType::Unknown && column.column_type != first {
        return false;
    }
    kinds.all(|kind| kind == first)
}

fn table(names: &[String], rows: &[Vec<ScalarValue>]) -> MetricValue {
    let width = rows.iter().map(Vec::len).max().unwrap_or(0);
    let mut used: BTreeSet<String> = names.iter().cloned().collect();
    let extra_names: Vec<String> = (names.len()..width)
        .map(|idx| claim(&mut used, format!("column_{}", idx + 1)))
        .collect();

    let table_rows = rows
        .iter()
        .map(|row| {
            let mut record = BTreeMap::new();
            for (idx, name) in names.iter().enumerate() {
                record.insert(name.clone(), row.get(idx).cloned().unwrap_or(ScalarValue::Null));
            }
            for (name, extra) in extra_names.iter().zip(row.iter().skip(names.len())) {
                record.insert(name.clone(), extra.clone());
            }
            record
        })
        .collect();
    MetricValue::Table(table_rows)
}
