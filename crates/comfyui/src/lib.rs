//! ComfyUI client: job submission, push notification routing and history.
//!
//! [`ComfyClient`] is the entry point. Submitted jobs come back as
//! [`QueuedJob`]s that receive their own push notifications; history is
//! reconstructed into typed records by `promptq-core`.

pub mod client;
pub mod config;
pub mod connection;
pub mod discriminate;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod job;
pub mod messages;
pub mod reconnect;
pub mod registry;
pub mod transport;

pub use client::ComfyClient;
pub use config::ClientConfig;
pub use error::ClientError;
pub use events::ServerEvent;
pub use job::{JobOutcome, QueuedJob};
pub use messages::Notification;
pub use transport::{ApiRequest, HttpTransport, RawResponse, Transport, TransportError};
