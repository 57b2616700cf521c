use promptq_core::CoreError;

use crate::transport::TransportError;

/// Errors returned by [`ComfyClient`](crate::client::ComfyClient).
///
/// Nothing is retried; every failure reaches the caller.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The push channel is down; checked before any request is issued.
    #[error("Connection error: {0}")]
    Connection(String),

    /// The request could not be completed.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The body matched none of the expected schemas.
    #[error("Malformed response: {source}")]
    MalformedResponse {
        source: serde_json::Error,
        /// Raw response body for debugging.
        body: String,
    },

    /// The server refused the job.
    #[error("Job rejected ({kind}): {message}")]
    JobRejected {
        kind: String,
        message: String,
        /// Per-node validation errors, as sent by the server.
        node_errors: serde_json::Value,
    },

    /// The history payload broke its positional contract.
    #[error("History decode failed: {0}")]
    HistoryDecode(#[from] CoreError),

    /// A read or control endpoint answered with a non-2xx status.
    #[error("ComfyUI API error ({status}): {body}")]
    UnexpectedStatus { status: u16, body: String },

    /// The submission body could not be serialized.
    #[error("Failed to encode request: {0}")]
    Encode(serde_json::Error),

    /// The server handed out a prompt id that is still being tracked.
    #[error("Prompt id {0} is already tracked")]
    DuplicateJob(String),
}
