//! Push notification dispatcher.
//!
//! Frames read off the push connection enter through an [`Ingest`] handle
//! and are queued without ever blocking. A single dispatch task pops them
//! in arrival order, parses them, and forwards each one to the sink the
//! [`JobRegistry`] holds for its prompt id.
//!
//! Dispatch can be suspended with [`PushDispatcher::pause`]. While the
//! returned [`PauseGuard`] is alive, ingestion continues but nothing is
//! routed; dropping the guard resumes dispatch in the original order. The
//! submission path holds a guard from before the `POST /prompt` until the
//! new job is registered, so notifications the server emits before its
//! submission response arrives are not lost.

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, watch, Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::events::ServerEvent;
use crate::messages::{parse_message, Notification};
use crate::registry::JobRegistry;

/// Broadcast channel capacity for server events.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Routes push notifications to registered jobs.
pub struct PushDispatcher {
    gate: Arc<Mutex<()>>,
    ingest: Ingest,
    connected: watch::Receiver<bool>,
    cancel: CancellationToken,
    task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

/// Write side of the dispatcher, handed to the connection task.
///
/// Cheap to clone. Never blocks, including while dispatch is paused.
#[derive(Clone)]
pub struct Ingest {
    frames: mpsc::UnboundedSender<String>,
    connected: Arc<watch::Sender<bool>>,
    events: broadcast::Sender<ServerEvent>,
}

/// Holds dispatch suspended until dropped.
///
/// Only one guard exists at a time; concurrent `pause` calls wait their
/// turn.
pub struct PauseGuard {
    _held: OwnedMutexGuard<()>,
}

impl Drop for PauseGuard {
    fn drop(&mut self) {
        tracing::trace!("Push dispatch resumed");
    }
}

impl PushDispatcher {
    /// Spawn the dispatch task. Must be called within a Tokio runtime.
    pub fn start(registry: Arc<JobRegistry>) -> Self {
        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        let (connected_tx, connected_rx) = watch::channel(false);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let gate = Arc::new(Mutex::new(()));
        let cancel = CancellationToken::new();

        let ingest = Ingest {
            frames: frames_tx,
            connected: Arc::new(connected_tx),
            events: events.clone(),
        };

        let task = tokio::spawn(run_dispatch(
            frames_rx,
            registry,
            Arc::clone(&gate),
            events,
            cancel.clone(),
        ));

        Self {
            gate,
            ingest,
            connected: connected_rx,
            cancel,
            task: std::sync::Mutex::new(Some(task)),
        }
    }

    /// Suspend dispatch until the returned guard is dropped.
    pub async fn pause(&self) -> PauseGuard {
        let held = Arc::clone(&self.gate).lock_owned().await;
        tracing::trace!("Push dispatch paused");
        PauseGuard { _held: held }
    }

    pub fn ingest(&self) -> Ingest {
        self.ingest.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.ingest.events.subscribe()
    }

    /// Whether the push connection is currently up.
    pub fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    /// Wait until the push connection is up, or `timeout` elapses.
    pub async fn wait_connected(&self, timeout: std::time::Duration) -> bool {
        let mut connected = self.connected.clone();
        let up = matches!(
            tokio::time::timeout(timeout, connected.wait_for(|up| *up)).await,
            Ok(Ok(_))
        );
        up
    }

    /// Stop the dispatch task. Frames still queued are discarded.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let task = self.task.lock().ok().and_then(|mut t| t.take());
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

impl Drop for PushDispatcher {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl Ingest {
    /// Queue a raw text frame. Returns `false` if the dispatcher has stopped.
    pub fn push(&self, text: impl Into<String>) -> bool {
        self.frames.send(text.into()).is_ok()
    }

    /// Record the push connection state, emitting an event on change.
    pub fn set_connected(&self, up: bool) {
        let changed = self.connected.send_if_modified(|state| {
            if *state == up {
                return false;
            }
            *state = up;
            true
        });
        if changed {
            let event = if up {
                ServerEvent::Connected
            } else {
                ServerEvent::Disconnected
            };
            let _ = self.events.send(event);
        }
    }
}

/// Dispatch loop: one frame at a time, each under the gate.
async fn run_dispatch(
    mut frames: mpsc::UnboundedReceiver<String>,
    registry: Arc<JobRegistry>,
    gate: Arc<Mutex<()>>,
    events: broadcast::Sender<ServerEvent>,
    cancel: CancellationToken,
) {
    loop {
        let text = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = frames.recv() => match frame {
                Some(text) => text,
                None => break,
            },
        };

        let notification = match parse_message(&text) {
            Ok(notification) => notification,
            Err(e) => {
                tracing::debug!(error = %e, raw_message = %text, "Skipping unrecognised push message");
                continue;
            }
        };

        let _open = tokio::select! {
            _ = cancel.cancelled() => break,
            open = gate.lock() => open,
        };
        route(&registry, &events, notification).await;
    }
    tracing::debug!("Dispatch loop exited");
}

/// Deliver one notification to its job, or broadcast it if it has none.
async fn route(
    registry: &JobRegistry,
    events: &broadcast::Sender<ServerEvent>,
    notification: Notification,
) {
    let Some(prompt_id) = notification.prompt_id().map(str::to_owned) else {
        if let Notification::Status(data) = &notification {
            let _ = events.send(ServerEvent::QueueStatus {
                queue_remaining: data.status.exec_info.queue_remaining,
            });
        }
        return;
    };

    let Some(sink) = registry.lookup(&prompt_id).await else {
        tracing::debug!(prompt_id = %prompt_id, "No job registered for notification");
        return;
    };

    let terminal = notification.is_terminal();
    if sink.send(notification).is_err() {
        tracing::debug!(prompt_id = %prompt_id, "Job receiver dropped; untracking");
        registry.remove(&prompt_id).await;
    } else if terminal {
        tracing::debug!(prompt_id = %prompt_id, "Job finished; untracking");
        registry.remove(&prompt_id).await;
    }
}
