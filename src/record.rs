//! # Record Module
//!
//! Models the heterogeneous, dictionary-shaped rows that connectors emit and
//! the engine routes, aggregates, and persists.
//!
//! ## Overview
//!
//! Connector output is tabular but loosely typed: each row is a mapping of
//! field names to scalar values (or lists of scalars). `Record` wraps that
//! mapping with the typed accessors the router and the aggregator need, and
//! `Frame` is an ordered collection of records with column helpers. Field
//! names are resolved against the layer's column declarations once at router
//! setup; per-row access is plain map lookup.
//!
//! `ColumnType` covers the two storable cell types (`Text`, `Integer`) and
//! knows how to coerce loosely typed values into them, substituting null and
//! recording a warning on failure.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

/// An opaque, case-sensitive node identifier. The only cross-component
/// identity in the engine.
pub type NodeId = String;

/// Cell types a layer may declare for its user columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColumnType {
    Text,
    Integer,
}

impl ColumnType {
    /// Coerces a loosely typed value into this column type. Returns `None`
    /// (null) and logs a warning when the value does not convert.
    pub fn coerce(&self, column: &str, value: &Value) -> Value {
        match (self, value) {
            (_, Value::Null) => Value::Null,
            (ColumnType::Text, Value::String(_)) => value.clone(),
            (ColumnType::Text, Value::Number(n)) => Value::String(n.to_string()),
            (ColumnType::Text, Value::Bool(b)) => Value::String(b.to_string()),
            (ColumnType::Integer, Value::Number(n)) if n.is_i64() => value.clone(),
            (ColumnType::Integer, Value::Number(n)) => n
                .as_f64()
                .map(|f| Value::from(f as i64))
                .unwrap_or(Value::Null),
            (ColumnType::Integer, Value::String(s)) => match s.trim().parse::<i64>() {
                Ok(i) => Value::from(i),
                Err(_) => {
                    warn!("column `{}`: cannot coerce {:?} to Integer, substituting null", column, s);
                    Value::Null
                }
            },
            _ => {
                warn!("column `{}`: cannot coerce {:?} to {:?}, substituting null", column, value, self);
                Value::Null
            }
        }
    }
}

/// One dictionary-shaped row as it came off a connector.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Record(pub BTreeMap<String, Value>);

impl Record {
    pub fn new() -> Self {
        Record(BTreeMap::new())
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    pub fn insert(&mut self, field: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(field.into(), value.into());
    }

    /// The field as a string, if it holds a non-empty scalar.
    pub fn get_str(&self, field: &str) -> Option<&str> {
        match self.0.get(field) {
            Some(Value::String(s)) if !s.is_empty() => Some(s),
            _ => None,
        }
    }

    pub fn get_i64(&self, field: &str) -> Option<i64> {
        match self.0.get(field) {
            Some(Value::Number(n)) => n.as_i64(),
            Some(Value::String(s)) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Numeric view of a field, tolerating integer, float, and numeric
    /// strings. Missing or non-numeric fields read as `None`.
    pub fn get_f64(&self, field: &str) -> Option<f64> {
        match self.0.get(field) {
            Some(Value::Number(n)) => n.as_f64(),
            Some(Value::String(s)) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// The scalar values held by a field: a list yields its elements in
    /// order, a scalar yields itself, null/missing yields nothing.
    pub fn scalars<'a>(&'a self, field: &str) -> Vec<&'a Value> {
        match self.0.get(field) {
            Some(Value::Array(items)) => items.iter().filter(|v| !v.is_null()).collect(),
            Some(Value::Null) | None => Vec::new(),
            Some(value) => vec![value],
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(String, Value)> for Record {
    fn from_iter<T: IntoIterator<Item = (String, Value)>>(iter: T) -> Self {
        Record(iter.into_iter().collect())
    }
}

/// An ordered collection of records, the unit connectors return and the
/// store ingests.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Frame {
    pub rows: Vec<Record>,
}

impl Frame {
    pub fn new() -> Self {
        Frame { rows: Vec::new() }
    }

    pub fn from_rows(rows: Vec<Record>) -> Self {
        Frame { rows }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn push(&mut self, row: Record) {
        self.rows.push(row);
    }

    /// Coerces every declared column in place, substituting null for values
    /// that do not convert.
    pub fn coerce_columns(&mut self, columns: &BTreeMap<String, ColumnType>) {
        for row in &mut self.rows {
            for (column, ty) in columns {
                if let Some(value) = row.0.get(column) {
                    let coerced = ty.coerce(column, value);
                    row.0.insert(column.clone(), coerced);
                }
            }
        }
    }

    /// Retains only rows whose `name` is in `allowed`, warning about the
    /// rest. Connectors may only describe nodes they were asked about.
    pub fn retain_named(&mut self, allowed: &std::collections::HashSet<NodeId>) {
        self.rows.retain(|row| match row.get_str("name") {
            Some(name) if allowed.contains(name) => true,
            Some(name) => {
                warn!("dropping unsolicited node row `{}`", name);
                false
            }
            None => {
                warn!("dropping node row without a `name` field");
                false
            }
        });
    }
}

impl IntoIterator for Frame {
    type Item = Record;
    type IntoIter = std::vec::IntoIter<Record>;

    fn into_iter(self) -> Self::IntoIter {
        self.rows.into_iter()
    }
}

/// A raw edge routed out of a connector record, addressed to a layer.
#[derive(Debug, Clone, PartialEq)]
pub struct RawEdge {
    pub layer: String,
    pub source: NodeId,
    pub target: NodeId,
    /// Layer-declared extra columns carried from the record.
    pub columns: BTreeMap<String, Value>,
    /// Set when the emitting targetspec dispatched onto another layer; the
    /// target is then also enqueued as a seed on that layer.
    pub dispatched: bool,
}

/// One aggregated edge: the weighted fold of all raw edges sharing
/// (source, target, layer).
#[derive(Debug, Clone, PartialEq)]
pub struct AggregatedEdge {
    pub layer: String,
    pub source: NodeId,
    pub target: NodeId,
    pub weight: i64,
    pub columns: BTreeMap<String, Value>,
}

impl AggregatedEdge {
    /// Numeric view over `weight` and the aggregated columns, used by the
    /// spikyball probability terms. Missing columns read as `None`.
    pub fn column_f64(&self, column: &str) -> Option<f64> {
        if column == "weight" {
            return Some(self.weight as f64);
        }
        match self.columns.get(column) {
            Some(Value::Number(n)) => n.as_f64(),
            Some(Value::String(s)) => s.trim().parse().ok(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn scalars_flatten_lists_and_skip_nulls() {
        let mut record = Record::new();
        record.insert("tags", json!(["a", null, "b"]));
        record.insert("single", json!("x"));
        record.insert("none", json!(null));
        assert_eq!(record.scalars("tags").len(), 2);
        assert_eq!(record.scalars("single").len(), 1);
        assert!(record.scalars("none").is_empty());
        assert!(record.scalars("missing").is_empty());
    }

    #[test]
    fn integer_coercion_substitutes_null_on_failure() {
        assert_eq!(
            ColumnType::Integer.coerce("views", &json!("42")),
            json!(42)
        );
        assert_eq!(
            ColumnType::Integer.coerce("views", &json!("not a number")),
            Value::Null
        );
        assert_eq!(ColumnType::Text.coerce("views", &json!(42)), json!("42"));
    }

    #[test]
    fn retain_named_drops_unsolicited_rows() {
        let mut frame = Frame::from_rows(vec![
            [("name".to_string(), json!("A"))].into_iter().collect(),
            [("name".to_string(), json!("B"))].into_iter().collect(),
            Record::new(),
        ]);
        let allowed = std::collections::HashSet::from(["A".to_string()]);
        frame.retain_named(&allowed);
        assert_eq!(frame.len(), 1);
        assert_eq!(frame.rows[0].get_str("name"), Some("A"));
    }
}
