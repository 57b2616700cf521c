//! Domain types and pure decoding logic for the promptq ComfyUI client.
//!
//! Nothing in this crate performs I/O. The network layer lives in
//! `promptq-comfyui`; this crate owns the shapes it sends and the
//! reconstruction of what the server sends back.

pub mod error;
pub mod history;
pub mod output;
pub mod types;
pub mod workflow;

pub use error::CoreError;
pub use history::{order_by_ordinal, reconstruct_history, reconstruct_history_entry, HistoryRecord};
pub use output::DataOutput;
pub use workflow::{SubmitRequest, Workflow, WorkflowGraph};
