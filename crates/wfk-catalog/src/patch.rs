// SPDX-License-Identifier: MIT OR Apache-2.0
//! JSON-Patch application (RFC 6902 subset) and workflow canonicalization.
//!
//! Supported operations: `add`, `remove`, `replace`, with `-` meaning
//! append when addressing an array. Paths are `/`-separated; numeric
//! segments index arrays.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single patch operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct PatchOp {
    /// What to do.
    pub op: PatchOpKind,

    /// Slash-separated path (e.g. `/nodes/-`, `/edges/2`).
    pub path: String,

    /// Payload for `add` and `replace`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

/// Patch operation kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum PatchOpKind {
    /// Insert a value (append with `-`).
    Add,
    /// Remove an existing value.
    Remove,
    /// Replace an existing value.
    Replace,
}

/// Apply a list of operations to a document in order.
///
/// # Errors
///
/// Returns `(op_index, reason)` for the first malformed operation; the
/// document may be partially modified (callers materialize into a scratch
/// copy and discard on failure).
pub fn apply_ops(doc: &mut Value, ops: &[PatchOp]) -> Result<(), (usize, String)> {
    for (i, op) in ops.iter().enumerate() {
        apply_one(doc, op).map_err(|reason| (i, reason))?;
    }
    Ok(())
}

fn apply_one(doc: &mut Value, op: &PatchOp) -> Result<(), String> {
    let segments: Vec<&str> = op
        .path
        .strip_prefix('/')
        .ok_or_else(|| format!("path `{}` must start with `/`", op.path))?
        .split('/')
        .collect();
    if segments.is_empty() || segments == [""] {
        return Err("empty path".to_string());
    }

    let (parent_path, last) = segments.split_at(segments.len() - 1);
    let last = last[0];

    let mut parent = &mut *doc;
    for seg in parent_path {
        parent = match parent {
            Value::Object(map) => map
                .get_mut(*seg)
                .ok_or_else(|| format!("missing path segment `{seg}`"))?,
            Value::Array(arr) => {
                let idx: usize = seg
                    .parse()
                    .map_err(|_| format!("`{seg}` is not an array index"))?;
                arr.get_mut(idx)
                    .ok_or_else(|| format!("index {idx} out of bounds"))?
            }
            other => {
                return Err(format!(
                    "cannot descend into {} at `{seg}`",
                    type_name(other)
                ));
            }
        };
    }

    match (op.op, parent) {
        (PatchOpKind::Add, Value::Array(arr)) => {
            let value = required_value(op)?;
            if last == "-" {
                arr.push(value);
            } else {
                let idx: usize = parse_index(last)?;
                if idx > arr.len() {
                    return Err(format!("add index {idx} out of bounds (len {})", arr.len()));
                }
                arr.insert(idx, value);
            }
            Ok(())
        }
        (PatchOpKind::Add, Value::Object(map)) => {
            map.insert(last.to_string(), required_value(op)?);
            Ok(())
        }
        (PatchOpKind::Remove, Value::Array(arr)) => {
            let idx: usize = parse_index(last)?;
            if idx >= arr.len() {
                return Err(format!("remove index {idx} out of bounds (len {})", arr.len()));
            }
            arr.remove(idx);
            Ok(())
        }
        (PatchOpKind::Remove, Value::Object(map)) => {
            map.remove(last)
                .map(|_| ())
                .ok_or_else(|| format!("cannot remove missing key `{last}`"))
        }
        (PatchOpKind::Replace, Value::Array(arr)) => {
            let idx: usize = parse_index(last)?;
            let slot = arr
                .get_mut(idx)
                .ok_or_else(|| format!("replace index {idx} out of bounds"))?;
            *slot = required_value(op)?;
            Ok(())
        }
        (PatchOpKind::Replace, Value::Object(map)) => {
            let slot = map
                .get_mut(last)
                .ok_or_else(|| format!("cannot replace missing key `{last}`"))?;
            *slot = required_value(op)?;
            Ok(())
        }
        (_, other) => Err(format!(
            "cannot apply {:?} inside {}",
            op.op,
            type_name(other)
        )),
    }
}

fn required_value(op: &PatchOp) -> Result<Value, String> {
    op.value
        .clone()
        .ok_or_else(|| format!("{:?} requires a value", op.op))
}

fn parse_index(seg: &str) -> Result<usize, String> {
    seg.parse()
        .map_err(|_| format!("`{seg}` is not an array index"))
}

fn type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Canonicalize a workflow document in place: nodes sorted by `id`, edges
/// by `(from, to)`. Object key order is already canonical under
/// serde_json's sorted maps, so this makes array order deterministic too.
pub fn canonicalize_workflow(doc: &mut Value) {
    if let Some(nodes) = doc.get_mut("nodes").and_then(Value::as_array_mut) {
        nodes.sort_by(|a, b| {
            let a = a.get("id").and_then(Value::as_str).unwrap_or_default();
            let b = b.get("id").and_then(Value::as_str).unwrap_or_default();
            a.cmp(b)
        });
    }
    if let Some(edges) = doc.get_mut("edges").and_then(Value::as_array_mut) {
        edges.sort_by(|a, b| {
            let key = |v: &Value| {
                (
                    v.get("from")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    v.get("to")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                )
            };
            key(a).cmp(&key(b))
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn base_doc() -> Value {
        json!({
            "nodes": [
                {"id": "a", "type": "function"},
                {"id": "b", "type": "function"}
            ],
            "edges": [{"from": "a", "to": "b"}]
        })
    }

    #[test]
    fn append_to_nodes() {
        let mut doc = base_doc();
        let ops = vec![PatchOp {
            op: PatchOpKind::Add,
            path: "/nodes/-".into(),
            value: Some(json!({"id": "c", "type": "http"})),
        }];
        apply_ops(&mut doc, &ops).unwrap();
        assert_eq!(doc["nodes"].as_array().unwrap().len(), 3);
    }

    #[test]
    fn add_at_index_shifts() {
        let mut doc = base_doc();
        let ops = vec![PatchOp {
            op: PatchOpKind::Add,
            path: "/nodes/0".into(),
            value: Some(json!({"id": "z", "type": "function"})),
        }];
        apply_ops(&mut doc, &ops).unwrap();
        assert_eq!(doc["nodes"][0]["id"], "z");
        assert_eq!(doc["nodes"][1]["id"], "a");
    }

    #[test]
    fn remove_and_replace() {
        let mut doc = base_doc();
        let ops = vec![
            PatchOp {
                op: PatchOpKind::Replace,
                path: "/nodes/1".into(),
                value: Some(json!({"id": "b", "type": "agent"})),
            },
            PatchOp {
                op: PatchOpKind::Remove,
                path: "/edges/0".into(),
                value: None,
            },
        ];
        apply_ops(&mut doc, &ops).unwrap();
        assert_eq!(doc["nodes"][1]["type"], "agent");
        assert!(doc["edges"].as_array().unwrap().is_empty());
    }

    #[test]
    fn deep_paths_descend() {
        let mut doc = json!({"nodes": [{"id": "a", "config": {"retries": 1}}], "edges": []});
        let ops = vec![PatchOp {
            op: PatchOpKind::Replace,
            path: "/nodes/0/config/retries".into(),
            value: Some(json!(5)),
        }];
        apply_ops(&mut doc, &ops).unwrap();
        assert_eq!(doc["nodes"][0]["config"]["retries"], 5);
    }

    #[test]
    fn malformed_op_reports_index() {
        let mut doc = base_doc();
        let ops = vec![
            PatchOp {
                op: PatchOpKind::Add,
                path: "/nodes/-".into(),
                value: Some(json!({"id": "c"})),
            },
            PatchOp {
                op: PatchOpKind::Remove,
                path: "/nodes/99".into(),
                value: None,
            },
        ];
        let (idx, reason) = apply_ops(&mut doc, &ops).unwrap_err();
        assert_eq!(idx, 1);
        assert!(reason.contains("out of bounds"));
    }

    #[test]
    fn add_without_value_rejected() {
        let mut doc = base_doc();
        let ops = vec![PatchOp {
            op: PatchOpKind::Add,
            path: "/nodes/-".into(),
            value: None,
        }];
        assert!(apply_ops(&mut doc, &ops).is_err());
    }

    #[test]
    fn canonicalization_sorts_nodes_and_edges() {
        let mut doc = json!({
            "nodes": [{"id": "b"}, {"id": "a"}],
            "edges": [{"from": "b", "to": "c"}, {"from": "a", "to": "b"}]
        });
        canonicalize_workflow(&mut doc);
        assert_eq!(doc["nodes"][0]["id"], "a");
        assert_eq!(doc["edges"][0]["from"], "a");
    }
}
