//! Row and record shapes that flow between the reconciliation stages.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::value::{RawValue, Value};

/// One input row: column name to raw cell, in source column order.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(from = "serde_json::Map<String, serde_json::Value>", into = "BTreeMap<String, RawValue>")]
pub struct RawRow {
    cells: Vec<(String, RawValue)>,
}

impl RawRow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Missing columns read as `None`, which the normalizer treats as absent.
    pub fn get(&self, column: &str) -> Option<&RawValue> {
        self.cells.iter().find(|(name, _)| name == column).map(|(_, v)| v)
    }

    /// Replaces an existing cell in place or appends a new column.
    pub fn set(&mut self, column: impl Into<String>, value: impl Into<RawValue>) {
        let column = column.into();
        let value = value.into();
        match self.cells.iter_mut().find(|(name, _)| *name == column) {
            Some(cell) => cell.1 = value,
            None => self.cells.push((column, value)),
        }
    }

    pub fn with(mut self, column: impl Into<String>, value: impl Into<RawValue>) -> Self {
        self.set(column, value);
        self
    }

    pub fn rename(&mut self, from: &str, to: &str) {
        if let Some(cell) = self.cells.iter_mut().find(|(name, _)| name == from) {
            cell.0 = to.to_string();
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &RawValue)> {
        self.cells.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }
}

impl<K: Into<String>, V: Into<RawValue>> FromIterator<(K, V)> for RawRow {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut row = RawRow::new();
        for (k, v) in iter {
            row.set(k, v);
        }
        row
    }
}

impl From<serde_json::Map<String, serde_json::Value>> for RawRow {
    fn from(map: serde_json::Map<String, serde_json::Value>) -> Self {
        map.into_iter().map(|(k, v)| (k, RawValue::from(v))).collect()
    }
}

impl From<RawRow> for BTreeMap<String, RawValue> {
    fn from(row: RawRow) -> Self {
        row.cells.into_iter().collect()
    }
}

/// A row after normalization, keyed by canonical field name.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct CanonicalRecord {
    values: BTreeMap<&'static str, Value>,
}

impl CanonicalRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, field: &'static str, value: Value) {
        self.values.insert(field, value);
    }

    /// Fields never written read as absent.
    pub fn get(&self, field: &str) -> &Value {
        static ABSENT: Value = Value::Absent;
        self.values.get(field).unwrap_or(&ABSENT)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &Value)> {
        self.values.iter().map(|(k, v)| (*k, v))
    }

    /// Printable rendering for audit and diagnostics output.
    pub fn render(&self, fields: &[&'static str]) -> BTreeMap<String, String> {
        fields
            .iter()
            .map(|f| (f.to_string(), self.get(f).to_string()))
            .collect()
    }
}

/// Column values as the store holds them.
pub type Columns = BTreeMap<String, Value>;

/// A fact record read back from the store.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredFact {
    pub id: i64,
    pub columns: Columns,
}

impl StoredFact {
    pub fn get(&self, column: &str) -> &Value {
        static ABSENT: Value = Value::Absent;
        self.columns.get(column).unwrap_or(&ABSENT)
    }
}

/// Column name to new value for exactly the columns that changed.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct FieldDiff {
    changes: BTreeMap<String, Value>,
}

impl FieldDiff {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, column: impl Into<String>, new_value: Value) {
        self.changes.insert(column.into(), new_value);
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn changed_columns(&self) -> Vec<String> {
        self.changes.keys().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.changes.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Applies the diff on top of existing columns; untouched columns keep
    /// their current value.
    pub fn apply_to(&self, columns: &mut Columns) {
        for (column, value) in &self.changes {
            columns.insert(column.clone(), value.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_row_keeps_column_order_and_reads_missing_as_none() {
        let row = RawRow::new().with("file", "AB1234").with("amount", 100.0);
        let names = row.iter().map(|(k, _)| k).collect::<Vec<_>>();
        assert_eq!(names, vec!["file", "amount"]);
        assert!(row.get("status").is_none());
    }

    #[test]
    fn raw_row_deserializes_from_json_object() {
        let row: RawRow = serde_json::from_value(serde_json::json!({
            "file": "ab1234",
            "amount": 10.5,
            "status": null
        }))
        .unwrap();
        assert_eq!(row.get("file"), Some(&RawValue::text("ab1234")));
        assert_eq!(row.get("amount"), Some(&RawValue::Number(10.5)));
        assert_eq!(row.get("status"), Some(&RawValue::Null));
    }

    #[test]
    fn diff_patches_only_listed_columns() {
        let mut columns = Columns::new();
        columns.insert("status".into(), Value::Text("OK".into()));
        columns.insert("amount".into(), Value::Integer(100));

        let mut diff = FieldDiff::new();
        diff.record("amount", Value::Integer(150));
        diff.apply_to(&mut columns);

        assert_eq!(columns["status"], Value::Text("OK".into()));
        assert_eq!(columns["amount"], Value::Integer(150));
        assert_eq!(diff.changed_columns(), vec!["amount".to_string()]);
    }
}
