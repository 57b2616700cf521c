//! WebSocket push connection to a ComfyUI instance.
//!
//! [`PushConnector`] holds what is needed to open the socket; call
//! [`PushConnector::connect`] to get a live stream. [`run_connection_loop`]
//! keeps a connection up for the life of a client: connect, pump frames
//! into the dispatcher, reconnect with backoff when the socket drops.

use futures::StreamExt;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use crate::dispatcher::Ingest;
use crate::reconnect::{reconnect, ReconnectConfig};

/// Raw WebSocket stream type returned by [`PushConnector::connect`].
pub type PushStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Connection settings for one ComfyUI push endpoint.
pub struct PushConnector {
    ws_url: String,
    client_id: String,
}

impl PushConnector {
    /// * `ws_url`    - WebSocket base URL, e.g. `ws://host:8188`.
    /// * `client_id` - session tag; must match the one sent on submission.
    pub fn new(ws_url: impl Into<String>, client_id: impl Into<String>) -> Self {
        Self {
            ws_url: ws_url.into().trim_end_matches('/').to_string(),
            client_id: client_id.into(),
        }
    }

    pub fn ws_url(&self) -> &str {
        &self.ws_url
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Full endpoint URL including the `clientId` query parameter.
    pub fn endpoint(&self) -> String {
        format!("{}/ws?clientId={}", self.ws_url, self.client_id)
    }

    /// Open the push socket.
    pub async fn connect(&self) -> Result<PushStream, PushError> {
        let (ws_stream, _response) = connect_async(self.endpoint()).await.map_err(|e| {
            PushError::Connection(format!(
                "Failed to connect to ComfyUI at {}: {e}",
                self.ws_url
            ))
        })?;

        tracing::info!(
            client_id = %self.client_id,
            "Connected to ComfyUI push channel at {}",
            self.ws_url,
        );
        Ok(ws_stream)
    }
}

/// Errors from the push connection.
#[derive(Debug, thiserror::Error)]
pub enum PushError {
    /// Failed to establish the WebSocket connection.
    #[error("Connection error: {0}")]
    Connection(String),
}

/// Keep the push connection up until `cancel` fires.
pub async fn run_connection_loop(
    connector: PushConnector,
    ingest: Ingest,
    config: ReconnectConfig,
    cancel: CancellationToken,
) {
    let mut stream = tokio::select! {
        _ = cancel.cancelled() => None,
        first = connector.connect() => match first {
            Ok(ws_stream) => Some(ws_stream),
            Err(e) => {
                tracing::warn!(error = %e, "Connection failed, entering reconnect loop");
                reconnect(&connector, &config, &cancel).await
            }
        },
    };

    while let Some(mut ws_stream) = stream.take() {
        ingest.set_connected(true);
        pump_frames(&mut ws_stream, &ingest, &cancel).await;
        ingest.set_connected(false);

        if cancel.is_cancelled() {
            let _ = ws_stream.close(None).await;
            break;
        }

        tracing::info!("Push connection lost, entering reconnect loop");
        stream = reconnect(&connector, &config, &cancel).await;
    }
    tracing::info!(client_id = %connector.client_id(), "Push connection task exited");
}

/// Forward text frames into the dispatcher until the socket closes.
///
/// Binary frames (preview images) are ignored.
async fn pump_frames(ws_stream: &mut PushStream, ingest: &Ingest, cancel: &CancellationToken) {
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = ws_stream.next() => frame,
        };

        match frame {
            Some(Ok(Message::Text(text))) => {
                if !ingest.push(text) {
                    tracing::debug!("Dispatcher stopped; closing push connection");
                    break;
                }
            }
            Some(Ok(Message::Binary(_))) => {
                tracing::trace!("Ignoring binary message (preview image)");
            }
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => {
                // Handled automatically by tungstenite.
            }
            Some(Ok(Message::Close(frame))) => {
                tracing::info!(?frame, "ComfyUI WebSocket closed");
                break;
            }
            Some(Ok(Message::Frame(_))) => {}
            Some(Err(e)) => {
                tracing::error!(error = %e, "WebSocket receive error");
                break;
            }
            None => {
                tracing::info!("WebSocket stream exhausted");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_carries_client_id() {
        let connector = PushConnector::new("ws://host:8188/", "abc");
        assert_eq!(connector.ws_url(), "ws://host:8188");
        assert_eq!(connector.endpoint(), "ws://host:8188/ws?clientId=abc");
    }

    #[tokio::test]
    async fn connection_loop_exits_on_cancel_without_server() {
        use std::sync::Arc;
        use std::time::Duration;

        use crate::dispatcher::PushDispatcher;
        use crate::registry::JobRegistry;

        let dispatcher = PushDispatcher::start(Arc::new(JobRegistry::new()));
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_connection_loop(
            PushConnector::new("ws://127.0.0.1:1", "abc"),
            dispatcher.ingest(),
            ReconnectConfig::default(),
            cancel.clone(),
        ));

        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("loop should stop after cancel")
            .unwrap();
        assert!(!dispatcher.is_connected());
    }

    #[tokio::test]
    async fn connect_to_closed_port_fails() {
        let connector = PushConnector::new("ws://127.0.0.1:1", "abc");
        assert!(matches!(
            connector.connect().await,
            Err(PushError::Connection(_))
        ));
    }
}
