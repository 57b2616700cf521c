//! ComfyUI push notification types and parser.
//!
//! ComfyUI sends JSON messages over WebSocket with the shape
//! `{"type": "<kind>", "data": {...}}`. This module deserializes them
//! into a strongly-typed [`Notification`] enum.

use promptq_core::DataOutput;
use serde::Deserialize;
use serde_json::Value;

/// All known ComfyUI push notification types.
///
/// Deserialized via the adjacently-tagged `"type"` field with
/// associated `"data"` content.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum Notification {
    /// Server status broadcast (queue depth, etc.). Not tied to a job.
    #[serde(rename = "status")]
    Status(StatusData),

    /// A prompt has started executing.
    #[serde(rename = "execution_start")]
    ExecutionStart(ExecutionStartData),

    /// Some nodes were skipped because their outputs are cached.
    #[serde(rename = "execution_cached")]
    ExecutionCached(ExecutionCachedData),

    /// A specific node is currently executing (or execution finished when `node` is `None`).
    #[serde(rename = "executing")]
    Executing(ExecutingData),

    /// Progress update from a long-running node (e.g. KSampler).
    #[serde(rename = "progress")]
    Progress(ProgressData),

    /// A node has finished and produced output.
    #[serde(rename = "executed")]
    Executed(ExecutedData),

    /// Execution failed with an error.
    #[serde(rename = "execution_error")]
    ExecutionError(ErrorData),

    /// Execution was interrupted by a client.
    #[serde(rename = "execution_interrupted")]
    ExecutionInterrupted(InterruptedData),

    /// All nodes ran without error.
    #[serde(rename = "execution_success")]
    ExecutionSuccess(ExecutionSuccessData),

    /// A job-scoped message of a type not modelled above, such as
    /// `progress_state` or one sent by a custom node. Built by
    /// [`parse_message`], never by the derive.
    #[serde(skip)]
    Other(OtherData),
}

/// Type names with a dedicated [`Notification`] variant.
const KNOWN_TYPES: [&str; 9] = [
    "status",
    "execution_start",
    "execution_cached",
    "executing",
    "progress",
    "executed",
    "execution_error",
    "execution_interrupted",
    "execution_success",
];

/// Queue status information.
#[derive(Debug, Clone, Deserialize)]
pub struct StatusData {
    pub status: QueueStatus,
    /// Session id the server assigned to this socket, sent on connect.
    #[serde(default)]
    pub sid: Option<String>,
}

/// Current queue state. Also the body of `GET /prompt`.
#[derive(Debug, Clone, Deserialize)]
pub struct QueueStatus {
    pub exec_info: ExecInfo,
}

/// Execution queue statistics.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecInfo {
    pub queue_remaining: i32,
}

/// Payload for `execution_start` messages.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionStartData {
    pub prompt_id: String,
}

/// Payload for `execution_cached` messages.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionCachedData {
    pub prompt_id: String,
    /// Node IDs whose outputs were served from cache.
    #[serde(default)]
    pub nodes: Vec<String>,
}

/// Payload for `executing` messages.
///
/// When `node` is `None`, execution of the prompt has completed.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutingData {
    pub node: Option<String>,
    pub prompt_id: String,
}

/// Payload for `progress` messages (step-level progress within a node).
#[derive(Debug, Clone, Deserialize)]
pub struct ProgressData {
    /// Current step number.
    pub value: i32,
    /// Total number of steps.
    pub max: i32,
    /// Older servers omit the prompt id; such messages cannot be routed.
    #[serde(default)]
    pub prompt_id: Option<String>,
    #[serde(default)]
    pub node: Option<String>,
}

impl ProgressData {
    /// Completion percentage (0-100).
    pub fn percent(&self) -> i16 {
        if self.max > 0 {
            ((self.value as f64 / self.max as f64) * 100.0) as i16
        } else {
            0
        }
    }
}

/// Payload for `executed` messages (node output).
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutedData {
    /// The node that produced this output.
    pub node: String,
    /// Raw output value (images, filenames, etc.).
    pub output: serde_json::Value,
    pub prompt_id: String,
}

impl ExecutedData {
    /// Image references in `output.images`; empty when absent or malformed.
    pub fn images(&self) -> Vec<DataOutput> {
        self.output
            .get("images")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default()
    }
}

/// Payload for `execution_error` messages.
#[derive(Debug, Clone, Deserialize)]
pub struct ErrorData {
    pub prompt_id: String,
    pub node_id: String,
    pub exception_message: String,
    pub exception_type: String,
}

/// Payload for `execution_interrupted` messages.
#[derive(Debug, Clone, Deserialize)]
pub struct InterruptedData {
    pub prompt_id: String,
    #[serde(default)]
    pub node_id: Option<String>,
}

/// Payload for `execution_success` messages.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionSuccessData {
    pub prompt_id: String,
}

/// An unmodelled message that names its job.
#[derive(Debug, Clone)]
pub struct OtherData {
    /// The message's `type`.
    pub kind: String,
    pub prompt_id: String,
    /// The full `data` object, untouched.
    pub data: Value,
}

/// Just the envelope, for messages the typed enum does not accept.
#[derive(Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: Value,
}

impl Notification {
    /// Routing key: the job this notification belongs to.
    pub fn prompt_id(&self) -> Option<&str> {
        match self {
            Notification::Status(_) => None,
            Notification::ExecutionStart(d) => Some(&d.prompt_id),
            Notification::ExecutionCached(d) => Some(&d.prompt_id),
            Notification::Executing(d) => Some(&d.prompt_id),
            Notification::Progress(d) => d.prompt_id.as_deref(),
            Notification::Executed(d) => Some(&d.prompt_id),
            Notification::ExecutionError(d) => Some(&d.prompt_id),
            Notification::ExecutionInterrupted(d) => Some(&d.prompt_id),
            Notification::ExecutionSuccess(d) => Some(&d.prompt_id),
            Notification::Other(d) => Some(&d.prompt_id),
        }
    }

    /// The last notification the server sends for a job.
    ///
    /// ComfyUI always closes a prompt with `executing` / `node: null`,
    /// whether it succeeded, failed or was interrupted.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Notification::Executing(d) if d.node.is_none())
    }
}

/// Parse a ComfyUI WebSocket text message into a typed enum.
///
/// Unknown types whose `data` carries a string `prompt_id` become
/// [`Notification::Other`] so they still reach their job. Returns `Err`
/// for malformed JSON, for known types with a bad payload, and for
/// unknown types that name no job. Callers should log these and continue.
pub fn parse_message(text: &str) -> Result<Notification, serde_json::Error> {
    let typed_error = match serde_json::from_str::<Notification>(text) {
        Ok(notification) => return Ok(notification),
        Err(e) => e,
    };

    let envelope: Envelope = serde_json::from_str(text)?;
    if KNOWN_TYPES.contains(&envelope.kind.as_str()) {
        return Err(typed_error);
    }
    match envelope.data.get("prompt_id").and_then(Value::as_str) {
        Some(prompt_id) => Ok(Notification::Other(OtherData {
            prompt_id: prompt_id.to_string(),
            kind: envelope.kind,
            data: envelope.data,
        })),
        None => Err(typed_error),
    }
}
