//! Server-level events emitted by the push dispatcher.
//!
//! Job-scoped notifications go to each job's own sink. These events cover
//! what belongs to no job: the push connection itself and the server's
//! queue depth.

use serde::Serialize;

/// A server-level event. Subscribe via `ComfyClient::subscribe`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ServerEvent {
    /// The push connection was established.
    Connected,

    /// The push connection was lost.
    Disconnected,

    /// The server reported its queue depth.
    QueueStatus { queue_remaining: i32 },
}
