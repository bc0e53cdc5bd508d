//! Statement results.
//!
//! Values are kept close to their JSON form since every consumer (the
//! pipeline outcome, the job payload, the CLI) ends up rendering JSON.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use std::fmt;

/// What a statement returned.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    pub columns: Vec<ColumnInfo>,
    pub rows: Vec<Row>,
    /// Rows held in `rows`, after the row cap.
    pub row_count: usize,
    /// Rows the statement produced, when known.
    pub total_rows: Option<usize>,
    #[serde(default)]
    pub was_truncated: bool,
    /// Set for writes, as reported by the database.
    #[serde(default)]
    pub rows_affected: Option<u64>,
}

impl QueryResult {
    pub fn with_data(columns: Vec<ColumnInfo>, rows: Vec<Row>) -> Self {
        let row_count = rows.len();
        Self {
            columns,
            rows,
            row_count,
            total_rows: Some(row_count),
            was_truncated: false,
            rows_affected: None,
        }
    }

    /// A capped read: `rows` is what was kept, `more` says whether the
    /// database had further rows.
    pub fn capped(columns: Vec<ColumnInfo>, rows: Vec<Row>, more: bool) -> Self {
        let row_count = rows.len();
        Self {
            columns,
            rows,
            row_count,
            total_rows: (!more).then_some(row_count),
            was_truncated: more,
            rows_affected: None,
        }
    }

    /// A write that returned no rows.
    pub fn affected(rows_affected: u64) -> Self {
        Self {
            rows_affected: Some(rows_affected),
            ..Self::default()
        }
    }

    /// The affected count for writes, the returned row count otherwise.
    pub fn effective_row_count(&self) -> u64 {
        self.rows_affected.unwrap_or(self.row_count as u64)
    }

    /// Rows as JSON objects keyed by column name.
    pub fn to_json_rows(&self) -> Vec<Map<String, JsonValue>> {
        self.rows
            .iter()
            .map(|row| {
                self.columns
                    .iter()
                    .zip(row)
                    .map(|(col, value)| (col.name.clone(), value.to_json()))
                    .collect()
            })
            .collect()
    }

    pub fn truncation_warning(&self) -> Option<String> {
        if !self.was_truncated {
            return None;
        }
        Some(match self.total_rows {
            Some(total) => format!("Result truncated: showing {} of {} rows", self.row_count, total),
            None => format!("Result truncated: showing the first {} rows", self.row_count),
        })
    }
}

/// Name and database type of a result column.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub name: String,
    pub data_type: String,
}

impl ColumnInfo {
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
        }
    }
}

pub type Row = Vec<Value>;

/// A single cell.
///
/// Timestamps, dates, UUIDs and decimals that do not fit an `i64` arrive as
/// `Text`; JSON columns keep their structure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Json(JsonValue),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn to_json(&self) -> JsonValue {
        match self {
            Value::Null => JsonValue::Null,
            Value::Bool(b) => JsonValue::Bool(*b),
            Value::Int(i) => JsonValue::from(*i),
            // NaN and infinities have no JSON form.
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(JsonValue::Number)
                .unwrap_or(JsonValue::Null),
            Value::Text(s) => JsonValue::String(s.clone()),
            Value::Json(v) => v.clone(),
        }
    }

    /// Integer view, used to read COUNT results.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Float(f) => Some(*f as i64),
            Value::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Parses a decimal rendered as text: whole numbers become `Int`,
    /// others `Float`, anything unparseable stays `Text`.
    pub fn from_decimal(text: String) -> Self {
        if let Ok(i) = text.parse::<i64>() {
            return Value::Int(i);
        }
        // "42.00" from NUMERIC(10,2) is still a whole number.
        if let Some((whole, frac)) = text.split_once('.') {
            if frac.bytes().all(|b| b == b'0') {
                if let Ok(i) = whole.parse::<i64>() {
                    return Value::Int(i);
                }
            }
        }
        match text.parse::<f64>() {
            Ok(f) if f.is_finite() => Value::Float(f),
            _ => Value::Text(text),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("NULL"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(x) => write!(f, "{x}"),
            Value::Text(s) => f.write_str(s),
            Value::Json(v) => write!(f, "{v}"),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Null, Into::into)
    }
}
