//! Reconstruction of the server's job history.
//!
//! `GET /history` returns an object keyed by prompt id. Each value stores
//! the original submission as a positional array:
//!
//! ```text
//! [ordinal, prompt_id, prompt (ignored), extra_data, output_node_ids, ...]
//! ```
//!
//! plus an `outputs` object keyed by node id string. The editor graph, when
//! the job was submitted with one, sits at `extra_data.extra_pnginfo.workflow`.
//!
//! The positional layout is a closed contract: any violation fails the
//! whole decode with [`CoreError::HistoryDecode`]. The one tolerated gap is
//! a missing or unparseable embedded graph, which yields `graph: None`.

use std::collections::BTreeMap;

use indexmap::IndexMap;
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::error::CoreError;
use crate::output::DataOutput;
use crate::types::NodeId;
use crate::workflow::{WorkflowGraph, EXTRA_PNGINFO_KEY, WORKFLOW_KEY};

/// Slot holding the ordinal.
const ORDINAL_SLOT: usize = 0;

/// Slot holding the extra-data object.
const EXTRA_DATA_SLOT: usize = 3;

/// Minimum positional array length this decoder understands.
const MIN_PROMPT_SLOTS: usize = EXTRA_DATA_SLOT + 1;

/// A normalized history entry.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryRecord {
    pub prompt_id: String,
    /// Server-assigned position. Not dense, not guaranteed monotonic.
    pub ordinal: i64,
    /// Editor graph embedded at submission, if it was present and parseable.
    pub graph: Option<WorkflowGraph>,
    /// Image outputs per node, in the order the server listed them.
    pub outputs: BTreeMap<NodeId, Vec<DataOutput>>,
}

impl HistoryRecord {
    /// All image outputs across nodes, ordered by node id.
    pub fn images(&self) -> impl Iterator<Item = &DataOutput> {
        self.outputs.values().flatten()
    }
}

// ---------------------------------------------------------------------------
// Wire shapes
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawHistoryEntry {
    prompt: Vec<Value>,
    #[serde(default)]
    outputs: Map<String, Value>,
}

#[derive(Debug, Default, Deserialize)]
struct RawNodeOutput {
    #[serde(default)]
    images: Vec<DataOutput>,
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

/// Decode a `GET /history` body into normalized records.
///
/// The returned map keeps the order in which the server listed the entries.
pub fn reconstruct_history(body: &[u8]) -> Result<IndexMap<String, HistoryRecord>, CoreError> {
    let raw: Map<String, Value> = serde_json::from_slice(body)?;

    let mut records = IndexMap::with_capacity(raw.len());
    for (prompt_id, entry) in raw {
        let record = reconstruct_entry(&prompt_id, entry)?;
        records.insert(prompt_id, record);
    }
    Ok(records)
}

/// Decode a `GET /history/{prompt_id}` body.
///
/// The server answers with an empty object for unknown ids.
pub fn reconstruct_history_entry(
    body: &[u8],
    prompt_id: &str,
) -> Result<Option<HistoryRecord>, CoreError> {
    let mut records = reconstruct_history(body)?;
    Ok(records.shift_remove(prompt_id))
}

/// Flatten records into a timeline sorted by ordinal.
///
/// The sort is stable: equal ordinals keep the order of `records`.
pub fn order_by_ordinal(records: IndexMap<String, HistoryRecord>) -> Vec<HistoryRecord> {
    let mut ordered: Vec<HistoryRecord> = records.into_values().collect();
    ordered.sort_by_key(|r| r.ordinal);
    ordered
}

fn reconstruct_entry(prompt_id: &str, entry: Value) -> Result<HistoryRecord, CoreError> {
    let raw: RawHistoryEntry = serde_json::from_value(entry)
        .map_err(|e| CoreError::history(prompt_id, e.to_string()))?;

    if raw.prompt.len() < MIN_PROMPT_SLOTS {
        return Err(CoreError::history(
            prompt_id,
            format!(
                "expected at least {MIN_PROMPT_SLOTS} positional slots, found {}",
                raw.prompt.len()
            ),
        ));
    }

    let ordinal = coerce_ordinal(&raw.prompt[ORDINAL_SLOT]).ok_or_else(|| {
        CoreError::history(
            prompt_id,
            format!("ordinal is not an integer: {}", raw.prompt[ORDINAL_SLOT]),
        )
    })?;

    let graph = match embedded_graph(&raw.prompt[EXTRA_DATA_SLOT]) {
        None => None,
        Some(value) => match WorkflowGraph::from_value(value.clone()) {
            Ok(graph) => Some(graph),
            Err(e) => {
                tracing::warn!(
                    prompt_id,
                    error = %e,
                    "Embedded workflow graph is not parseable; keeping entry without it",
                );
                None
            }
        },
    };

    let mut outputs = BTreeMap::new();
    for (node_key, output) in raw.outputs {
        let node_id: NodeId = node_key.parse().map_err(|_| {
            CoreError::history(prompt_id, format!("output key {node_key:?} is not a node id"))
        })?;
        let output: RawNodeOutput = serde_json::from_value(output).map_err(|e| {
            CoreError::history(prompt_id, format!("outputs of node {node_id}: {e}"))
        })?;
        outputs.insert(node_id, output.images);
    }

    Ok(HistoryRecord {
        prompt_id: prompt_id.to_string(),
        ordinal,
        graph,
        outputs,
    })
}

/// Integer ordinal, accepting integral floats.
fn coerce_ordinal(value: &Value) -> Option<i64> {
    if let Some(n) = value.as_i64() {
        return Some(n);
    }
    value
        .as_f64()
        .filter(|f| f.fract() == 0.0 && *f >= i64::MIN as f64 && *f <= i64::MAX as f64)
        .map(|f| f as i64)
}

/// `extra_data.extra_pnginfo.workflow`, or `None` if any step is missing.
fn embedded_graph(extra_data: &Value) -> Option<&Value> {
    extra_data
        .get(EXTRA_PNGINFO_KEY)?
        .get(WORKFLOW_KEY)
        .filter(|v| !v.is_null())
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;

    fn entry(ordinal: Value, prompt_id: &str, extra: Value) -> Value {
        json!({
            "prompt": [ordinal, prompt_id, {}, extra, ["9"]],
            "outputs": {
                "9": {"images": [{"filename": "out.png", "subfolder": "", "type": "output"}]}
            },
            "status": {"status_str": "success", "completed": true}
        })
    }

    fn graph_extra() -> Value {
        json!({"extra_pnginfo": {"workflow": {"nodes": [{"id": 9, "type": "SaveImage"}], "links": []}}})
    }

    fn body(entries: Value) -> Vec<u8> {
        serde_json::to_vec(&entries).unwrap()
    }

    #[test]
    fn reconstructs_entry() {
        let raw = body(json!({"abc": entry(json!(4), "abc", graph_extra())}));
        let records = reconstruct_history(&raw).unwrap();

        let record = &records["abc"];
        assert_eq!(record.prompt_id, "abc");
        assert_eq!(record.ordinal, 4);
        let graph = record.graph.as_ref().unwrap();
        assert_eq!(graph.node(9).unwrap().class_type, "SaveImage");
        assert_eq!(record.outputs[&9][0].filename, "out.png");
        assert_eq!(record.images().count(), 1);
    }

    #[test]
    fn missing_graph_is_tolerated() {
        let raw = body(json!({
            "a": entry(json!(0), "a", json!({"client_id": "xyz"})),
            "b": entry(json!(1), "b", json!({})),
            "c": entry(json!(2), "c", json!({"extra_pnginfo": {}})),
            "d": entry(json!(3), "d", Value::Null),
        }));
        let records = reconstruct_history(&raw).unwrap();
        assert_eq!(records.len(), 4);
        assert!(records.values().all(|r| r.graph.is_none()));
    }

    #[test]
    fn unparseable_graph_is_tolerated() {
        let extra = json!({"extra_pnginfo": {"workflow": "garbage"}});
        let raw = body(json!({"a": entry(json!(0), "a", extra)}));
        let records = reconstruct_history(&raw).unwrap();
        assert!(records["a"].graph.is_none());
    }

    #[test]
    fn non_numeric_ordinal_fails_whole_decode() {
        let raw = body(json!({
            "good": entry(json!(0), "good", graph_extra()),
            "bad": entry(json!("seven"), "bad", graph_extra()),
        }));
        let err = reconstruct_history(&raw).unwrap_err();
        assert_matches!(err, CoreError::HistoryDecode { prompt_id, .. } if prompt_id == "bad");
    }

    #[test]
    fn fractional_ordinal_fails() {
        let raw = body(json!({"a": entry(json!(1.5), "a", graph_extra())}));
        assert_matches!(reconstruct_history(&raw), Err(CoreError::HistoryDecode { .. }));
    }

    #[test]
    fn integral_float_ordinal_is_accepted() {
        let raw = body(json!({"a": entry(json!(12.0), "a", graph_extra())}));
        assert_eq!(reconstruct_history(&raw).unwrap()["a"].ordinal, 12);
    }

    #[test]
    fn short_positional_array_fails() {
        let raw = body(json!({"a": {"prompt": [0, "a", {}], "outputs": {}}}));
        assert_matches!(reconstruct_history(&raw), Err(CoreError::HistoryDecode { .. }));
    }

    #[test]
    fn non_integer_output_key_fails() {
        let raw = body(json!({
            "a": {"prompt": [0, "a", {}, {}, []], "outputs": {"nine": {"images": []}}}
        }));
        assert_matches!(reconstruct_history(&raw), Err(CoreError::HistoryDecode { .. }));
    }

    #[test]
    fn output_without_images_is_empty() {
        let raw = body(json!({
            "a": {"prompt": [0, "a", {}, {}, ["5"]], "outputs": {"5": {"text": ["hello"]}}}
        }));
        let records = reconstruct_history(&raw).unwrap();
        assert!(records["a"].outputs[&5].is_empty());
    }

    #[test]
    fn non_object_body_fails() {
        assert_matches!(reconstruct_history(b"[1, 2, 3]"), Err(CoreError::Json(_)));
        assert_matches!(reconstruct_history(b"not json"), Err(CoreError::Json(_)));
    }

    #[test]
    fn orders_sparse_and_duplicate_ordinals() {
        let raw = body(json!({
            "w": entry(json!(5), "w", json!({})),
            "x": entry(json!(0), "x", json!({})),
            "y": entry(json!(0), "y", json!({})),
            "z": entry(json!(2), "z", json!({})),
        }));
        let ordered = order_by_ordinal(reconstruct_history(&raw).unwrap());
        let ordinals: Vec<i64> = ordered.iter().map(|r| r.ordinal).collect();
        assert_eq!(ordinals, vec![0, 0, 2, 5]);
        assert_eq!(ordered[3].prompt_id, "w");
    }

    #[test]
    fn ties_keep_server_order() {
        let raw = body(json!({
            "second": entry(json!(1), "second", json!({})),
            "first": entry(json!(1), "first", json!({})),
        }));
        let ordered = order_by_ordinal(reconstruct_history(&raw).unwrap());
        assert_eq!(ordered[0].prompt_id, "second");
        assert_eq!(ordered[1].prompt_id, "first");
    }

    #[test]
    fn single_entry_lookup() {
        let raw = body(json!({"abc": entry(json!(3), "abc", graph_extra())}));
        assert_eq!(reconstruct_history_entry(&raw, "abc").unwrap().unwrap().ordinal, 3);
        assert!(reconstruct_history_entry(b"{}", "abc").unwrap().is_none());
    }
}
