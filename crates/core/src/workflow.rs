//! Workflow graphs and the submission body the server accepts.
//!
//! A [`Workflow`] is what callers submit: the API-format node map the
//! server executes, plus (optionally) the editor-format
//! [`WorkflowGraph`] it was built from. The graph is not interpreted
//! here; it rides along in the submission's `extra_data` so the server's
//! history hands it back untouched.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::types::NodeId;

/// Key under `extra_data` holding the PNG-info block.
pub const EXTRA_PNGINFO_KEY: &str = "extra_pnginfo";

/// Key under `extra_pnginfo` holding the editor graph.
pub const WORKFLOW_KEY: &str = "workflow";

// ---------------------------------------------------------------------------
// WorkflowGraph
// ---------------------------------------------------------------------------

/// Editor-format workflow graph.
///
/// Only `nodes` and `links` are named; every other top-level field is kept
/// verbatim in [`extra`](Self::extra) so that a graph survives a
/// serialize/parse cycle unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowGraph {
    #[serde(default)]
    pub nodes: Vec<GraphNode>,
    #[serde(default)]
    pub links: Vec<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// One node of a [`WorkflowGraph`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphNode {
    pub id: NodeId,
    /// Node class, e.g. `KSampler`.
    #[serde(rename = "type")]
    pub class_type: String,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl WorkflowGraph {
    /// Re-parse an arbitrary JSON value as a workflow graph.
    ///
    /// Fails when the value is not graph-shaped (not an object, or nodes
    /// without an integer `id` / string `type`).
    pub fn from_value(value: Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, id: NodeId) -> Option<&GraphNode> {
        self.nodes.iter().find(|n| n.id == id)
    }
}

// ---------------------------------------------------------------------------
// Workflow
// ---------------------------------------------------------------------------

/// A unit of work to submit.
#[derive(Debug, Clone, PartialEq)]
pub struct Workflow {
    /// API-format node map keyed by node id string.
    pub prompt: Map<String, Value>,
    /// Editor graph to embed in the submission, if any.
    pub graph: Option<WorkflowGraph>,
}

impl Workflow {
    pub fn new(prompt: Map<String, Value>) -> Self {
        Self {
            prompt,
            graph: None,
        }
    }

    /// Attach the editor graph that produced this prompt.
    pub fn with_graph(mut self, graph: WorkflowGraph) -> Self {
        self.graph = Some(graph);
        self
    }

    /// Parse an API-format prompt from JSON text.
    ///
    /// The top level must be an object keyed by node id.
    pub fn from_prompt_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text).map(Self::new)
    }
}

// ---------------------------------------------------------------------------
// SubmitRequest
// ---------------------------------------------------------------------------

/// Body of `POST /prompt`.
///
/// ```json
/// {"prompt": {...}, "client_id": "...", "extra_data": {"extra_pnginfo": {"workflow": {...}}}}
/// ```
#[derive(Debug, Serialize)]
pub struct SubmitRequest<'a> {
    pub prompt: &'a Map<String, Value>,
    /// Session tag so the server routes push notifications to this client.
    pub client_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extra_data: Option<ExtraData<'a>>,
}

#[derive(Debug, Serialize)]
pub struct ExtraData<'a> {
    pub extra_pnginfo: PngInfo<'a>,
}

#[derive(Debug, Serialize)]
pub struct PngInfo<'a> {
    pub workflow: &'a WorkflowGraph,
}

impl<'a> SubmitRequest<'a> {
    pub fn new(workflow: &'a Workflow, client_id: &'a str) -> Self {
        Self {
            prompt: &workflow.prompt,
            client_id,
            extra_data: workflow.graph.as_ref().map(|workflow| ExtraData {
                extra_pnginfo: PngInfo { workflow },
            }),
        }
    }

    pub fn to_json_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}
