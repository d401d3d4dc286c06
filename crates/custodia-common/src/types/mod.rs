//! Tabular types produced by the ingestion pipelines

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A typed cell of a dataset
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(untagged)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Integer(i64),
    Decimal(f64),
    Date(NaiveDate),
    DateTime(NaiveDateTime),
    Text(String),
}

impl Value {
    pub fn text(value: impl Into<String>) -> Self {
        Value::Text(value.into())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Calendar date carried by a `Date` or `DateTime` cell
    pub fn as_date(&self) -> Option<NaiveDate> {
        match self {
            Value::Date(d) => Some(*d),
            Value::DateTime(dt) => Some(dt.date()),
            _ => None,
        }
    }

    /// Rendering used for CSV side-cars; null becomes an empty field
    pub fn to_field(&self) -> String {
        match self {
            Value::Null => String::new(),
            other => other.to_string(),
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Integer(i) => write!(f, "{}", i),
            Value::Decimal(d) => write!(f, "{}", d),
            Value::Date(d) => write!(f, "{}", d.format("%Y-%m-%d")),
            Value::DateTime(dt) => write!(f, "{}", dt.format("%Y-%m-%d %H:%M:%S")),
            Value::Text(s) => write!(f, "{}", s),
        }
    }
}

impl From<Option<String>> for Value {
    fn from(value: Option<String>) -> Self {
        value.map(Value::Text).unwrap_or(Value::Null)
    }
}

/// Declared storage type of a column, known before any value is seen
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    Bool,
    Integer,
    Decimal,
    Date,
    DateTime,
    Text,
}

/// In-memory table: named columns, row-major values, and the subset of
/// columns that describe the physical partition of the rows.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Dataset {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
    pub partition_columns: Vec<String>,
    /// Types declared by whoever built the columns; others are sampled
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub column_types: BTreeMap<String, ColumnType>,
}

impl Dataset {
    /// Create an empty dataset with the given schema
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
            partition_columns: Vec::new(),
            column_types: BTreeMap::new(),
        }
    }

    /// Record the type a column holds even when every value is null
    pub fn declare_type(&mut self, name: &str, column_type: ColumnType) {
        if self.has_column(name) {
            self.column_types.insert(name.to_string(), column_type);
        }
    }

    pub fn declared_type(&self, name: &str) -> Option<ColumnType> {
        self.column_types.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn width(&self) -> usize {
        self.columns.len()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column_index(name).is_some()
    }

    /// Values of one column, top to bottom
    pub fn column(&self, name: &str) -> Option<impl Iterator<Item = &Value>> {
        let idx = self.column_index(name)?;
        Some(self.rows.iter().map(move |row| &row[idx]))
    }

    /// Cell at `row` in column `name`
    pub fn value(&self, row: usize, name: &str) -> Option<&Value> {
        let idx = self.column_index(name)?;
        self.rows.get(row).map(|r| &r[idx])
    }

    /// Append a row; short rows are padded with nulls, long rows truncated
    pub fn push_row(&mut self, mut row: Vec<Value>) {
        row.resize(self.columns.len(), Value::Null);
        self.rows.push(row);
    }

    /// Append a column computed per row
    pub fn add_column_with<F>(&mut self, name: impl Into<String>, mut compute: F)
    where
        F: FnMut(&[Value]) -> Value,
    {
        for row in &mut self.rows {
            let value = compute(row);
            row.push(value);
        }
        self.columns.push(name.into());
    }

    /// Append a column holding the same value on every row
    pub fn add_constant_column(&mut self, name: impl Into<String>, value: Value) {
        self.add_column_with(name, |_| value.clone());
    }

    /// Record `name` as a partition column (it must already exist)
    pub fn mark_partition(&mut self, name: &str) {
        if self.has_column(name) && !self.partition_columns.iter().any(|c| c == name) {
            self.partition_columns.push(name.to_string());
        }
    }

    /// Distinct non-null values of a column in first-seen order
    pub fn distinct(&self, name: &str) -> Vec<Value> {
        let mut seen: Vec<Value> = Vec::new();
        if let Some(values) = self.column(name) {
            for value in values {
                if !value.is_null() && !seen.contains(value) {
                    seen.push(value.clone());
                }
            }
        }
        seen
    }
}
