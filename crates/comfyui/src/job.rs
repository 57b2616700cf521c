//! The caller's handle on a submitted job.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use promptq_core::types::NodeId;
use promptq_core::{DataOutput, Workflow};
use tokio::sync::mpsc;

use crate::messages::Notification;
use crate::registry::JobSink;

/// A job the server accepted, with its notification stream.
///
/// Notifications for this job arrive in the order the server emitted them.
/// The stream ends after the job's terminal notification, or once the job
/// is forgotten through the registry.
#[derive(Debug)]
pub struct QueuedJob {
    prompt_id: String,
    number: i64,
    workflow: Workflow,
    submitted_at: DateTime<Utc>,
    notifications: mpsc::UnboundedReceiver<Notification>,
}

/// How a job ended, as reported by [`QueuedJob::wait_for_completion`].
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    /// Every node ran. `outputs` maps node id to its image outputs, keyed
    /// like [`HistoryRecord::outputs`](promptq_core::HistoryRecord::outputs).
    Completed {
        outputs: BTreeMap<NodeId, Vec<DataOutput>>,
    },
    /// A node raised an exception.
    Failed {
        node_id: String,
        exception_type: String,
        message: String,
    },
    /// A client interrupted the job.
    Interrupted { node_id: Option<String> },
    /// The stream ended without the server closing the job.
    Abandoned,
}

impl QueuedJob {
    /// Create a job and the sink that feeds it.
    pub(crate) fn new(prompt_id: String, number: i64, workflow: Workflow) -> (Self, JobSink) {
        let (sink, notifications) = mpsc::unbounded_channel();
        let job = Self {
            prompt_id,
            number,
            workflow,
            submitted_at: Utc::now(),
            notifications,
        };
        (job, sink)
    }

    pub fn prompt_id(&self) -> &str {
        &self.prompt_id
    }

    /// Queue position at submission time.
    pub fn number(&self) -> i64 {
        self.number
    }

    pub fn workflow(&self) -> &Workflow {
        &self.workflow
    }

    pub fn submitted_at(&self) -> DateTime<Utc> {
        self.submitted_at
    }

    /// Wait for the next notification; `None` once the stream has ended.
    pub async fn next_notification(&mut self) -> Option<Notification> {
        self.notifications.recv().await
    }

    /// Next notification if one is already buffered.
    pub fn try_next_notification(&mut self) -> Option<Notification> {
        self.notifications.try_recv().ok()
    }

    /// Drain the stream and summarize how the job ended.
    pub async fn wait_for_completion(mut self) -> JobOutcome {
        let mut outputs: BTreeMap<NodeId, Vec<DataOutput>> = BTreeMap::new();
        let mut failure = None;
        let mut interrupted = None;
        let mut finished = false;

        while let Some(notification) = self.notifications.recv().await {
            match notification {
                Notification::Executed(data) => match data.node.parse::<NodeId>() {
                    Ok(node) => outputs.entry(node).or_default().extend(data.images()),
                    Err(_) => tracing::warn!(
                        prompt_id = %self.prompt_id,
                        node = %data.node,
                        "Ignoring output of node with non-integer id",
                    ),
                },
                Notification::ExecutionError(data) => {
                    failure = Some(JobOutcome::Failed {
                        node_id: data.node_id,
                        exception_type: data.exception_type,
                        message: data.exception_message,
                    });
                }
                Notification::ExecutionInterrupted(data) => {
                    interrupted = Some(JobOutcome::Interrupted {
                        node_id: data.node_id,
                    });
                }
                ref n if n.is_terminal() => finished = true,
                _ => {}
            }
        }

        tracing::debug!(prompt_id = %self.prompt_id, finished, "Job stream ended");

        failure
            .or(interrupted)
            .unwrap_or(if finished {
                JobOutcome::Completed { outputs }
            } else {
                JobOutcome::Abandoned
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::parse_message;

    fn push(sink: &JobSink, json: &str) {
        sink.send(parse_message(json).unwrap()).unwrap();
    }

    fn job() -> (QueuedJob, JobSink) {
        QueuedJob::new("p".into(), 3, Workflow::new(Default::default()))
    }

    #[tokio::test]
    async fn completed_job_collects_outputs() {
        let (job, sink) = job();
        assert_eq!(job.prompt_id(), "p");
        assert_eq!(job.number(), 3);

        push(&sink, r#"{"type":"execution_start","data":{"prompt_id":"p"}}"#);
        push(&sink, r#"{"type":"executed","data":{"node":"9","output":{"images":[{"filename":"a.png","subfolder":"","type":"output"}]},"prompt_id":"p"}}"#);
        push(&sink, r#"{"type":"executing","data":{"node":null,"prompt_id":"p"}}"#);
        drop(sink);

        let outcome = job.wait_for_completion().await;
        let outputs = match outcome {
            JobOutcome::Completed { outputs } => outputs,
            other => panic!("Expected Completed, got {other:?}"),
        };
        assert_eq!(outputs[&9][0].filename, "a.png");
    }

    #[tokio::test]
    async fn outputs_share_history_node_keys() {
        let (job, sink) = job();
        push(&sink, r#"{"type":"executed","data":{"node":"12","output":{"images":[{"filename":"a.png","subfolder":"","type":"output"}]},"prompt_id":"p"}}"#);
        push(&sink, r#"{"type":"executed","data":{"node":"12","output":{"images":[{"filename":"b.png","subfolder":"","type":"output"}]},"prompt_id":"p"}}"#);
        push(&sink, r#"{"type":"executed","data":{"node":"not-a-node","output":{"images":[{"filename":"c.png","subfolder":"","type":"output"}]},"prompt_id":"p"}}"#);
        push(&sink, r#"{"type":"executing","data":{"node":null,"prompt_id":"p"}}"#);
        drop(sink);

        let outputs = match job.wait_for_completion().await {
            JobOutcome::Completed { outputs } => outputs,
            other => panic!("Expected Completed, got {other:?}"),
        };
        let keys: Vec<NodeId> = outputs.keys().copied().collect();
        assert_eq!(keys, vec![12]);
        assert_eq!(outputs[&12].len(), 2);
    }

    #[tokio::test]
    async fn error_takes_precedence() {
        let (job, sink) = job();
        push(&sink, r#"{"type":"execution_error","data":{"prompt_id":"p","node_id":"5","exception_message":"oom","exception_type":"RuntimeError"}}"#);
        push(&sink, r#"{"type":"executing","data":{"node":null,"prompt_id":"p"}}"#);
        drop(sink);

        assert_eq!(
            job.wait_for_completion().await,
            JobOutcome::Failed {
                node_id: "5".into(),
                exception_type: "RuntimeError".into(),
                message: "oom".into(),
            }
        );
    }

    #[tokio::test]
    async fn interrupted_job() {
        let (job, sink) = job();
        push(&sink, r#"{"type":"execution_interrupted","data":{"prompt_id":"p","node_id":"7"}}"#);
        push(&sink, r#"{"type":"executing","data":{"node":null,"prompt_id":"p"}}"#);
        drop(sink);

        assert_eq!(
            job.wait_for_completion().await,
            JobOutcome::Interrupted {
                node_id: Some("7".into())
            }
        );
    }

    #[tokio::test]
    async fn stream_closed_early_is_abandoned() {
        let (job, sink) = job();
        push(&sink, r#"{"type":"execution_start","data":{"prompt_id":"p"}}"#);
        drop(sink);

        assert_eq!(job.wait_for_completion().await, JobOutcome::Abandoned);
    }
}
