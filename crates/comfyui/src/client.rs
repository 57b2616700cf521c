//! High-level client for one ComfyUI instance.
//!
//! [`ComfyClient`] ties together the HTTP [`Transport`], the
//! [`JobRegistry`] and the [`PushDispatcher`]. Its central operation is
//! [`submit`](ComfyClient::submit), which registers each accepted job with
//! the dispatcher before any of the job's notifications can be routed.

use std::sync::Arc;
use std::time::Duration;

use indexmap::IndexMap;
use promptq_core::history::{order_by_ordinal, reconstruct_history, reconstruct_history_entry};
use promptq_core::{DataOutput, HistoryRecord, SubmitRequest, Workflow};
use serde::de::DeserializeOwned;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::ClientConfig;
use crate::connection::{run_connection_loop, PushConnector};
use crate::discriminate::{discriminate, Discriminated, PromptError, SubmitResponse};
use crate::dispatcher::{Ingest, PushDispatcher};
use crate::error::ClientError;
use crate::events::ServerEvent;
use crate::job::QueuedJob;
use crate::messages::QueueStatus;
use crate::registry::JobRegistry;
use crate::transport::{ApiRequest, HttpTransport, RawResponse, Transport};

/// How long [`ComfyClient::shutdown`] waits for the connection task.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Client for one ComfyUI instance.
pub struct ComfyClient {
    transport: Arc<dyn Transport>,
    registry: Arc<JobRegistry>,
    dispatcher: PushDispatcher,
    /// Session tag sent with submissions and on the push handshake.
    client_id: String,
    connection: std::sync::Mutex<Option<JoinHandle<()>>>,
    cancel: CancellationToken,
}

impl ComfyClient {
    /// Connect to the instance described by `config`.
    ///
    /// Starts the dispatcher and the push connection task, then waits up to
    /// `config.connect_timeout` for the push channel to come up.
    pub async fn connect(config: ClientConfig) -> Result<Self, ClientError> {
        let transport = HttpTransport::new(&config.api_url, config.request_timeout)?;
        let client_id = uuid::Uuid::new_v4().to_string();
        let client = Self::with_transport(Arc::new(transport), client_id);

        let connector = PushConnector::new(config.ws_url.clone(), client.client_id.clone());
        let task = tokio::spawn(run_connection_loop(
            connector,
            client.dispatcher.ingest(),
            config.reconnect.clone(),
            client.cancel.child_token(),
        ));
        if let Ok(mut slot) = client.connection.lock() {
            *slot = Some(task);
        }

        if !client.dispatcher.wait_connected(config.connect_timeout).await {
            client.shutdown().await;
            return Err(ClientError::Connection(format!(
                "No push connection to {} within {}s",
                config.ws_url,
                config.connect_timeout.as_secs()
            )));
        }

        tracing::info!(
            api_url = %config.api_url,
            client_id = %client.client_id,
            "ComfyUI client ready",
        );
        Ok(client)
    }

    /// Assemble a client over an arbitrary transport, without a push
    /// connection. Frames are fed through [`ingest`](Self::ingest).
    ///
    /// Must be called within a Tokio runtime.
    pub fn with_transport(transport: Arc<dyn Transport>, client_id: impl Into<String>) -> Self {
        let registry = Arc::new(JobRegistry::new());
        let dispatcher = PushDispatcher::start(Arc::clone(&registry));
        Self {
            transport,
            registry,
            dispatcher,
            client_id: client_id.into(),
            connection: std::sync::Mutex::new(None),
            cancel: CancellationToken::new(),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Jobs currently receiving notifications.
    pub fn registry(&self) -> &JobRegistry {
        &self.registry
    }

    /// Write side of the dispatcher.
    pub fn ingest(&self) -> Ingest {
        self.dispatcher.ingest()
    }

    /// Subscribe to server-level events (connection state, queue depth).
    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.dispatcher.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.dispatcher.is_connected()
    }

    /// Fail fast when the push channel is down.
    pub fn check_connection(&self) -> Result<(), ClientError> {
        if self.dispatcher.is_connected() {
            Ok(())
        } else {
            Err(ClientError::Connection(
                "Push channel is not connected".to_string(),
            ))
        }
    }

    // ---- submission ----

    /// Submit a workflow and start tracking its notifications.
    ///
    /// Dispatch is paused from before the request is sent until the job is
    /// registered, so notifications that beat the response are held and
    /// delivered to the returned job in order. Concurrent submissions are
    /// serialized on that pause.
    pub async fn submit(&self, workflow: Workflow) -> Result<QueuedJob, ClientError> {
        self.check_connection()?;

        let body = SubmitRequest::new(&workflow, &self.client_id)
            .to_json_bytes()
            .map_err(ClientError::Encode)?;

        let _paused = self.dispatcher.pause().await;
        let response = self
            .transport
            .send(ApiRequest::post_json("prompt", body))
            .await?;

        match discriminate::<SubmitResponse, PromptError>(&response.body) {
            Discriminated::Accepted(accepted) => {
                let (job, sink) = QueuedJob::new(accepted.prompt_id, accepted.number, workflow);
                if !self.registry.insert(job.prompt_id().to_string(), sink).await {
                    return Err(ClientError::DuplicateJob(job.prompt_id().to_string()));
                }
                tracing::info!(
                    prompt_id = %job.prompt_id(),
                    number = job.number(),
                    "Workflow submitted to ComfyUI",
                );
                Ok(job)
            }
            Discriminated::Rejected(rejection) => {
                tracing::warn!(
                    status = response.status,
                    kind = rejection.kind(),
                    message = rejection.message(),
                    "ComfyUI rejected workflow",
                );
                Err(ClientError::JobRejected {
                    kind: rejection.kind().to_string(),
                    message: rejection.message().to_string(),
                    node_errors: rejection.node_errors,
                })
            }
            Discriminated::Malformed { source, body } => {
                tracing::error!(
                    status = response.status,
                    error = %source,
                    body = %body,
                    "Unrecognised submission response",
                );
                Err(ClientError::MalformedResponse { source, body })
            }
        }
    }

    // ---- history ----

    /// All history entries, keyed by prompt id in server order.
    pub async fn history(&self) -> Result<IndexMap<String, HistoryRecord>, ClientError> {
        let response = self.fetch(ApiRequest::get("history")).await?;
        Ok(reconstruct_history(&response.body)?)
    }

    /// History as a timeline sorted by ordinal.
    pub async fn history_ordered(&self) -> Result<Vec<HistoryRecord>, ClientError> {
        Ok(order_by_ordinal(self.history().await?))
    }

    /// A single history entry; `None` if the server does not know the id.
    pub async fn history_entry(
        &self,
        prompt_id: &str,
    ) -> Result<Option<HistoryRecord>, ClientError> {
        let response = self
            .fetch(ApiRequest::get(format!("history/{prompt_id}")))
            .await?;
        Ok(reconstruct_history_entry(&response.body, prompt_id)?)
    }

    /// Remove every history entry on the server.
    pub async fn clear_history(&self) -> Result<(), ClientError> {
        self.fetch(ApiRequest::post_json("history", r#"{"clear": true}"#))
            .await?;
        Ok(())
    }

    /// Remove one history entry on the server.
    pub async fn delete_history_entry(&self, prompt_id: &str) -> Result<(), ClientError> {
        let body = serde_json::json!({ "delete": [prompt_id] }).to_string();
        self.fetch(ApiRequest::post_json("history", body)).await?;
        Ok(())
    }

    // ---- control ----

    /// Interrupt whatever is executing right now.
    pub async fn interrupt(&self) -> Result<(), ClientError> {
        self.fetch(ApiRequest::post_json("interrupt", "{}")).await?;
        Ok(())
    }

    // ---- artifacts and read-only endpoints ----

    /// Download the bytes of an artifact.
    pub async fn image(&self, output: &DataOutput) -> Result<Vec<u8>, ClientError> {
        let request = output
            .query_params()
            .into_iter()
            .fold(ApiRequest::get("view"), |request, (key, value)| {
                request.with_query(key, value)
            });
        Ok(self.fetch(request).await?.body)
    }

    /// Raw `__metadata__` block of a model file in `folder`.
    pub async fn view_metadata(&self, folder: &str, filename: &str) -> Result<String, ClientError> {
        let request =
            ApiRequest::get(format!("view_metadata/{folder}")).with_query("filename", filename);
        Ok(self.fetch(request).await?.text())
    }

    pub async fn system_stats(&self) -> Result<serde_json::Value, ClientError> {
        self.fetch_json(ApiRequest::get("system_stats")).await
    }

    pub async fn embeddings(&self) -> Result<Vec<String>, ClientError> {
        self.fetch_json(ApiRequest::get("embeddings")).await
    }

    pub async fn extensions(&self) -> Result<Vec<String>, ClientError> {
        self.fetch_json(ApiRequest::get("extensions")).await
    }

    /// Node class catalog, keyed by class name.
    pub async fn object_info(
        &self,
    ) -> Result<serde_json::Map<String, serde_json::Value>, ClientError> {
        self.fetch_json(ApiRequest::get("object_info")).await
    }

    /// Queue depth as reported by `GET /prompt`.
    pub async fn queue_info(&self) -> Result<QueueStatus, ClientError> {
        self.fetch_json(ApiRequest::get("prompt")).await
    }

    /// Running and pending queue items.
    pub async fn queue(&self) -> Result<serde_json::Value, ClientError> {
        self.fetch_json(ApiRequest::get("queue")).await
    }

    // ---- lifecycle ----

    /// Stop the push connection and the dispatcher.
    ///
    /// Waits up to 5 seconds for the connection task to exit. Jobs still
    /// tracked see the end of their notification streams.
    pub async fn shutdown(&self) {
        tracing::info!(client_id = %self.client_id, "Shutting down ComfyUI client");
        self.cancel.cancel();

        let task = self.connection.lock().ok().and_then(|mut slot| slot.take());
        if let Some(task) = task {
            if tokio::time::timeout(SHUTDOWN_GRACE, task).await.is_err() {
                tracing::warn!("Push connection task did not exit in time");
            }
        }
        self.dispatcher.shutdown().await;
    }

    // ---- private helpers ----

    /// Send a request and require a success status.
    async fn fetch(&self, request: ApiRequest) -> Result<RawResponse, ClientError> {
        let response = self.transport.send(request).await?;
        if !response.is_success() {
            return Err(ClientError::UnexpectedStatus {
                status: response.status,
                body: response.text(),
            });
        }
        Ok(response)
    }

    /// Send a request and decode its JSON body.
    async fn fetch_json<T: DeserializeOwned>(&self, request: ApiRequest) -> Result<T, ClientError> {
        let response = self.fetch(request).await?;
        serde_json::from_slice(&response.body).map_err(|source| ClientError::MalformedResponse {
            source,
            body: response.text(),
        })
    }
}

impl Drop for ComfyClient {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
