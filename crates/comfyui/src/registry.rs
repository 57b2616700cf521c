//! Shared map from prompt id to the sink of an in-flight job.
//!
//! Written by the submission path, read by the push dispatcher. Entries are
//! lookup-only associations: the caller owns the job and its receiver, the
//! registry only holds the sending half.

use std::collections::HashMap;

use tokio::sync::{mpsc, RwLock};

use crate::messages::Notification;

/// Sending half of a job's notification sink.
pub type JobSink = mpsc::UnboundedSender<Notification>;

/// Registry of jobs awaiting notifications.
///
/// Thread-safe via interior `RwLock`; designed to be wrapped in `Arc` and
/// shared between the client and the dispatcher.
#[derive(Default)]
pub struct JobRegistry {
    jobs: RwLock<HashMap<String, JobSink>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a sink under `prompt_id`.
    ///
    /// Returns `false` and keeps the existing entry if the id is already
    /// registered.
    pub(crate) async fn insert(&self, prompt_id: String, sink: JobSink) -> bool {
        let mut jobs = self.jobs.write().await;
        if jobs.contains_key(&prompt_id) {
            tracing::warn!(prompt_id = %prompt_id, "Prompt id already registered");
            return false;
        }
        jobs.insert(prompt_id, sink);
        true
    }

    /// Sink registered for `prompt_id`, if any.
    pub(crate) async fn lookup(&self, prompt_id: &str) -> Option<JobSink> {
        self.jobs.read().await.get(prompt_id).cloned()
    }

    /// Drop the entry for `prompt_id`. Used by the dispatcher once a job is
    /// finished or its receiver is gone.
    pub(crate) async fn remove(&self, prompt_id: &str) -> bool {
        self.jobs.write().await.remove(prompt_id).is_some()
    }

    /// Stop routing notifications for `prompt_id`.
    ///
    /// The job's receiver sees the end of its stream once any queued
    /// notifications are drained.
    pub async fn forget(&self, prompt_id: &str) -> bool {
        let removed = self.remove(prompt_id).await;
        if removed {
            tracing::debug!(prompt_id, "Job forgotten by caller");
        }
        removed
    }

    pub async fn contains(&self, prompt_id: &str) -> bool {
        self.jobs.read().await.contains_key(prompt_id)
    }

    /// Number of jobs currently tracked.
    pub async fn len(&self) -> usize {
        self.jobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.jobs.read().await.is_empty()
    }
}
