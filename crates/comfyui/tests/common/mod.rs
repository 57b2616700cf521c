//! Shared test fixtures: an in-memory [`Transport`] with scripted responses.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use promptq_comfyui::dispatcher::Ingest;
use promptq_comfyui::{ApiRequest, ComfyClient, RawResponse, Transport, TransportError};

/// Transport that answers from a route table and records every request.
///
/// Frames queued with [`during_submit`](Self::during_submit) are pushed into
/// the client's dispatcher while `POST prompt` is in flight, mimicking a
/// server whose notifications overtake its submission response. The number
/// of `POST prompt` calls in flight at once is tracked.
#[derive(Default)]
pub struct FakeTransport {
    routes: Mutex<HashMap<(String, String), RawResponse>>,
    requests: Mutex<Vec<ApiRequest>>,
    submit_frames: Mutex<Vec<String>>,
    ingest: OnceLock<Ingest>,
    fresh_ids: AtomicBool,
    issued: AtomicUsize,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl FakeTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn respond(&self, method: &str, path: &str, status: u16, body: impl Into<Vec<u8>>) {
        self.routes
            .lock()
            .unwrap()
            .insert((method.to_string(), path.to_string()), RawResponse::new(status, body));
    }

    pub fn during_submit(&self, frames: impl IntoIterator<Item = String>) {
        self.submit_frames.lock().unwrap().extend(frames);
    }

    /// Accept every submission under a new id, `job-0`, `job-1`, ...
    pub fn accept_with_fresh_ids(&self) {
        self.fresh_ids.store(true, Ordering::SeqCst);
    }

    /// Most `POST prompt` calls ever in flight at the same time.
    pub fn peak_submissions_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<ApiRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn last_request(&self) -> ApiRequest {
        self.requests().pop().expect("no request recorded")
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn send(&self, request: ApiRequest) -> Result<RawResponse, TransportError> {
        self.requests.lock().unwrap().push(request.clone());

        if request.path == "prompt" && request.method == "POST" {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak_in_flight.fetch_max(now, Ordering::SeqCst);

            let frames: Vec<String> = self.submit_frames.lock().unwrap().drain(..).collect();
            if let Some(ingest) = self.ingest.get() {
                for frame in frames {
                    ingest.push(frame);
                }
            }
            // Give the dispatcher every chance to route the frames early.
            tokio::time::sleep(Duration::from_millis(30)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            if self.fresh_ids.load(Ordering::SeqCst) {
                let n = self.issued.fetch_add(1, Ordering::SeqCst);
                let body = format!(r#"{{"prompt_id":"job-{n}","number":{n}}}"#);
                return Ok(RawResponse::new(200, body));
            }
        }

        let key = (request.method.to_string(), request.path.clone());
        let response = self.routes.lock().unwrap().get(&key).cloned();
        response.ok_or_else(|| TransportError::InvalidUrl(format!("no route for {key:?}")))
    }
}

/// A client over `transport` with the push channel marked connected.
pub fn connected_client(transport: &Arc<FakeTransport>) -> ComfyClient {
    let client = ComfyClient::with_transport(transport.clone(), "test-client");
    let ingest = client.ingest();
    ingest.set_connected(true);
    let _ = transport.ingest.set(ingest);
    client
}

pub fn frame(kind: &str, data: serde_json::Value) -> String {
    serde_json::json!({ "type": kind, "data": data }).to_string()
}
