//! State operations and how they act on a JSON document.
//!
//! Paths are dot-separated object keys (`steps.fetch.output`); the empty path
//! addresses the document root. Missing intermediate objects are created.

use chrono::{DateTime, Utc};
use fabric::{NodeId, VectorClock};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Set,
    Delete,
    Increment,
    Decrement,
    Append,
    Merge,
}

impl OperationKind {
    /// Kinds that commute with one another on the same path.
    pub fn commutes(&self) -> bool {
        !matches!(self, OperationKind::Set | OperationKind::Delete)
    }
}

/// A mutation request before it is stamped with identity and clock.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationSpec {
    pub kind: OperationKind,
    pub path: String,
    #[serde(default)]
    pub value: Value,
}

impl OperationSpec {
    pub fn new(kind: OperationKind, path: impl Into<String>, value: Value) -> Self {
        Self {
            kind,
            path: path.into(),
            value,
        }
    }

    pub fn set(path: impl Into<String>, value: Value) -> Self {
        Self::new(OperationKind::Set, path, value)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(OperationKind::Delete, path, Value::Null)
    }

    pub fn increment(path: impl Into<String>, by: f64) -> Self {
        Self::new(OperationKind::Increment, path, Value::from(by))
    }

    pub fn decrement(path: impl Into<String>, by: f64) -> Self {
        Self::new(OperationKind::Decrement, path, Value::from(by))
    }

    pub fn append(path: impl Into<String>, item: Value) -> Self {
        Self::new(OperationKind::Append, path, item)
    }

    pub fn merge(path: impl Into<String>, patch: Value) -> Self {
        Self::new(OperationKind::Merge, path, patch)
    }
}

/// One immutable state mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrdtOperation {
    pub operation_id: Uuid,
    pub kind: OperationKind,
    pub path: String,
    pub value: Value,
    pub node_id: NodeId,
    pub vector_clock: VectorClock,
    pub timestamp: DateTime<Utc>,
    /// Operations that must be applied before this one.
    pub causal_deps: Vec<Uuid>,
}

impl CrdtOperation {
    /// JSON type the operation leaves at its path, or `None` for a delete.
    pub(crate) fn result_type(&self) -> Option<&'static str> {
        match self.kind {
            OperationKind::Delete => None,
            OperationKind::Increment | OperationKind::Decrement => Some("number"),
            OperationKind::Append => Some("array"),
            OperationKind::Merge if self.value.is_object() => Some("object"),
            OperationKind::Set | OperationKind::Merge => Some(type_name(&self.value)),
        }
    }

    /// Apply to `root` using `value` in place of `self.value`, which lets a
    /// conflict resolution substitute a coerced value.
    pub(crate) fn apply_with(&self, root: &mut Value, value: &Value) {
        let segments = segments(&self.path);

        if self.kind == OperationKind::Delete {
            remove_at(root, &segments);
            return;
        }

        let slot = slot_mut(root, &segments);
        match self.kind {
            OperationKind::Set => *slot = value.clone(),
            OperationKind::Increment | OperationKind::Decrement => {
                let delta = value.as_f64().unwrap_or(1.0);
                let delta = if self.kind == OperationKind::Decrement {
                    -delta
                } else {
                    delta
                };
                *slot = number(slot.as_f64().unwrap_or(0.0) + delta);
            }
            OperationKind::Append => match slot {
                Value::Array(items) => items.push(value.clone()),
                Value::Null => *slot = Value::Array(vec![value.clone()]),
                other => {
                    let previous = other.take();
                    *other = Value::Array(vec![previous, value.clone()]);
                }
            },
            OperationKind::Merge => match value {
                Value::Object(patch) => {
                    let target = ensure_object(slot);
                    for (key, v) in patch {
                        target.insert(key.clone(), v.clone());
                    }
                }
                other => *slot = other.clone(),
            },
            OperationKind::Delete => {}
        }
    }
}

pub(crate) fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// String form used by the custom resolution strategy.
pub(crate) fn coerce_to_string(value: &Value) -> Value {
    match value {
        Value::String(_) => value.clone(),
        Value::Null => Value::String(String::new()),
        other => Value::String(other.to_string()),
    }
}

fn segments(path: &str) -> Vec<&str> {
    path.split('.').filter(|s| !s.is_empty()).collect()
}

fn ensure_object(value: &mut Value) -> &mut Map<String, Value> {
    if !value.is_object() {
        *value = Value::Object(Map::new());
    }
    match value {
        Value::Object(map) => map,
        _ => unreachable!("value was just replaced with an object"),
    }
}

fn slot_mut<'a>(root: &'a mut Value, segments: &[&str]) -> &'a mut Value {
    let mut current = root;
    for segment in segments {
        current = ensure_object(current)
            .entry((*segment).to_owned())
            .or_insert(Value::Null);
    }
    current
}

fn remove_at(root: &mut Value, segments: &[&str]) {
    let Some((last, parents)) = segments.split_last() else {
        *root = Value::Object(Map::new());
        return;
    };
    let mut current = root;
    for segment in parents {
        current = match current.get_mut(*segment) {
            Some(next) => next,
            None => return,
        };
    }
    if let Value::Object(map) = current {
        map.remove(*last);
    }
}

/// Integers stay integers so counters serialize as `3`, not `3.0`.
fn number(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < 9_007_199_254_740_992.0 {
        Value::from(n as i64)
    } else {
        serde_json::Number::from_f64(n)
            .map(Value::Number)
            .unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn op(spec: OperationSpec) -> CrdtOperation {
        CrdtOperation {
            operation_id: Uuid::new_v4(),
            kind: spec.kind,
            path: spec.path,
            value: spec.value,
            node_id: "n".into(),
            vector_clock: VectorClock::new(),
            timestamp: Utc::now(),
            causal_deps: Vec::new(),
        }
    }

    fn apply(doc: &mut Value, spec: OperationSpec) {
        let op = op(spec);
        op.apply_with(doc, &op.value);
    }

    #[test]
    fn set_creates_intermediate_objects() {
        let mut doc = json!({});
        apply(&mut doc, OperationSpec::set("a.b.c", json!(1)));
        assert_eq!(doc, json!({ "a": { "b": { "c": 1 } } }));
    }

    #[test]
    fn counters_accumulate_from_missing() {
        let mut doc = json!({});
        apply(&mut doc, OperationSpec::increment("count", 2.0));
        apply(&mut doc, OperationSpec::increment("count", 3.0));
        apply(&mut doc, OperationSpec::decrement("count", 1.0));
        assert_eq!(doc["count"], json!(4));
    }

    #[test]
    fn append_and_merge() {
        let mut doc = json!({ "cfg": { "a": 1 } });
        apply(&mut doc, OperationSpec::append("log", json!("x")));
        apply(&mut doc, OperationSpec::append("log", json!("y")));
        apply(&mut doc, OperationSpec::merge("cfg", json!({ "b": 2 })));
        assert_eq!(doc, json!({ "cfg": { "a": 1, "b": 2 }, "log": ["x", "y"] }));
    }

    #[test]
    fn delete_missing_path_is_a_no_op() {
        let mut doc = json!({ "a": 1 });
        apply(&mut doc, OperationSpec::delete("b.c"));
        apply(&mut doc, OperationSpec::delete("a"));
        assert_eq!(doc, json!({}));
    }

    #[test]
    fn commutativity_by_kind() {
        assert!(!OperationKind::Set.commutes());
        assert!(!OperationKind::Delete.commutes());
        assert!(OperationKind::Increment.commutes());
        assert!(OperationKind::Append.commutes());
    }

    #[test]
    fn coercion_stringifies_non_strings() {
        assert_eq!(coerce_to_string(&json!(42)), json!("42"));
        assert_eq!(coerce_to_string(&json!("s")), json!("s"));
        assert_eq!(coerce_to_string(&json!({ "k": true })), json!("{\"k\":true}"));
    }
}
