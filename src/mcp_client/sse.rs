//! Legacy HTTP+SSE transport.
//!
//! The client opens a long-lived `GET` event stream. The server's first
//! `endpoint` event names the URL to `POST` requests to; responses come back
//! as `message` events on the stream.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::ACCEPT;
use reqwest::{Client as HttpClient, Url};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::channel::{cancel_params, resolve_wait, Connector, RpcChannel};
use super::config::{Endpoint, ServerSpec};
use super::errors::{FailureReason, McpError, Phase};
use super::framing::Framing;
use super::http::{apply_headers, status_error};
use super::pending::PendingTable;
use super::types::{error_codes, Incoming, JsonRpcNotification, JsonRpcReply, JsonRpcRequest};

// ─── SSE Parsing ─────────────────────────────────────────────────────────────

/// One dispatched server-sent event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
    pub id: Option<String>,
}

impl SseEvent {
    /// Event type, defaulting to `message`.
    pub fn kind(&self) -> &str {
        self.event.as_deref().unwrap_or("message")
    }
}

/// Incremental `text/event-stream` parser.
///
/// Accepts arbitrary byte chunks; lines may end in `\n` or `\r\n`.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
    id: Option<String>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and return every event it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim_end_matches(['\n', '\r']);
            if let Some(event) = self.process_line(line) {
                events.push(event);
            }
        }
        events
    }

    /// Flush whatever is buffered at end of stream.
    pub fn finish(&mut self) -> Option<SseEvent> {
        if !self.buffer.is_empty() {
            let raw = std::mem::take(&mut self.buffer);
            let line = String::from_utf8_lossy(&raw).trim_end_matches('\r').to_string();
            if let Some(event) = self.process_line(&line) {
                return Some(event);
            }
        }
        self.dispatch()
    }

    fn process_line(&mut self, line: &str) -> Option<SseEvent> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            "id" => self.id = Some(value.to_string()),
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseEvent> {
        if self.data.is_empty() && self.event.is_none() {
            return None;
        }
        let event = SseEvent {
            event: self.event.take(),
            data: std::mem::take(&mut self.data).join("\n"),
            id: self.id.take(),
        };
        Some(event)
    }
}

/// Parse a complete event-stream body.
pub fn parse_sse_body(body: &str) -> Vec<SseEvent> {
    let mut parser = SseParser::new();
    let mut events = parser.push(body.as_bytes());
    events.extend(parser.finish());
    events
}

// ─── Connector ───────────────────────────────────────────────────────────────

pub struct SseConnector {
    spec: ServerSpec,
    client: HttpClient,
}

impl SseConnector {
    pub fn new(spec: ServerSpec) -> Self {
        Self {
            spec,
            client: HttpClient::new(),
        }
    }

    fn startup_error(&self, reason: FailureReason, detail: String) -> McpError {
        McpError::new(reason, self.spec.name.clone(), "connect", Phase::Startup, detail)
    }
}

#[async_trait]
impl Connector for SseConnector {
    async fn connect(&self, _framing: Framing) -> Result<Arc<dyn RpcChannel>, McpError> {
        let Endpoint::Sse { url, headers } = &self.spec.endpoint else {
            return Err(self.startup_error(
                FailureReason::SpawnFailed,
                "not an SSE endpoint".into(),
            ));
        };
        let base = Url::parse(url)
            .map_err(|e| self.startup_error(FailureReason::SpawnFailed, format!("invalid url: {e}")))?;

        let request = apply_headers(self.client.get(base.clone()), headers)
            .header(ACCEPT, "text/event-stream");
        let response = tokio::time::timeout(self.spec.timeouts.startup, request.send())
            .await
            .map_err(|_| {
                self.startup_error(
                    FailureReason::Timeout,
                    format!("event stream not opened within {}ms", self.spec.timeouts.startup.as_millis()),
                )
            })?
            .map_err(|e| {
                self.startup_error(FailureReason::SpawnFailed, format!("failed to open event stream: {e}"))
            })?;

        if let Some(err) = status_error(&self.spec.name, "connect", response.status(), "") {
            return Err(err.in_phase(Phase::Startup));
        }

        let inner = Arc::new(SseInner {
            server: self.spec.name.clone(),
            client: self.client.clone(),
            headers: headers.clone(),
            post_url: std::sync::Mutex::new(None),
            pending: PendingTable::new(&self.spec.name),
            alive: AtomicBool::new(true),
            closing: AtomicBool::new(false),
        });

        let (endpoint_tx, endpoint_rx) = oneshot::channel();
        let listener = tokio::spawn(listen(Arc::clone(&inner), base, response, endpoint_tx));
        let channel = SseChannel { inner, listener };

        let endpoint = tokio::time::timeout(self.spec.timeouts.startup, endpoint_rx).await;
        match endpoint {
            Ok(Ok(post_url)) => {
                tracing::info!(server = %self.spec.name, endpoint = %post_url, "SSE endpoint received");
                *channel.inner.post_url() = Some(post_url);
                Ok(Arc::new(channel))
            }
            Ok(Err(_)) => Err(self.startup_error(
                FailureReason::BadResponse,
                "event stream ended before an endpoint event".into(),
            )),
            Err(_) => Err(self.startup_error(
                FailureReason::Timeout,
                format!(
                    "no endpoint event within {}ms",
                    self.spec.timeouts.startup.as_millis()
                ),
            )),
        }
    }
}

// ─── Channel ─────────────────────────────────────────────────────────────────

struct SseInner {
    server: String,
    client: HttpClient,
    headers: BTreeMap<String, String>,
    post_url: std::sync::Mutex<Option<Url>>,
    pending: Arc<PendingTable>,
    alive: AtomicBool,
    closing: AtomicBool,
}

pub struct SseChannel {
    inner: Arc<SseInner>,
    listener: JoinHandle<()>,
}

impl SseInner {
    fn post_url(&self) -> std::sync::MutexGuard<'_, Option<Url>> {
        self.post_url.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn post<T: Serialize>(&self, method: &str, message: &T) -> Result<(), McpError> {
        let url = self.post_url().clone().ok_or_else(|| {
            McpError::new(
                FailureReason::ServerCrash,
                self.server.clone(),
                method,
                Phase::Request,
                "no endpoint received",
            )
        })?;
        let request = apply_headers(self.client.post(url), &self.headers).json(message);
        let response = request.send().await.map_err(|e| {
            self.alive.store(false, Ordering::SeqCst);
            McpError::new(
                FailureReason::ServerCrash,
                self.server.clone(),
                method,
                Phase::Request,
                format!("failed to post message: {e}"),
            )
        })?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(status_error(&self.server, method, status, &body).unwrap_or_else(|| {
            McpError::new(
                FailureReason::BadResponse,
                self.server.clone(),
                method,
                Phase::Request,
                format!("unexpected status {status}"),
            )
        }))
    }

    async fn dispatch(&self, data: &str) {
        let message = match Incoming::parse(data) {
            Ok(message) => message,
            Err(e) => {
                tracing::debug!(server = %self.server, error = %e, "ignoring non-JSON-RPC event");
                return;
            }
        };
        match message {
            Incoming::Response { id: Some(id), outcome } => {
                self.pending.settle(id, outcome);
            }
            Incoming::Response { id: None, outcome: Err(err) } => {
                let detail = format!("server rejected message [{}]: {}", err.code, err.message);
                self.pending.reject_all(|method| {
                    McpError::new(
                        FailureReason::BadResponse,
                        self.server.clone(),
                        method,
                        Phase::Request,
                        detail.clone(),
                    )
                });
            }
            Incoming::Response { id: None, .. } => {}
            Incoming::Request { id, method, .. } => {
                let reply = if method == "ping" {
                    JsonRpcReply::result(id, serde_json::json!({}))
                } else {
                    JsonRpcReply::error(id, error_codes::METHOD_NOT_FOUND, "Method not found")
                };
                if let Err(e) = self.post(&method, &reply).await {
                    tracing::debug!(server = %self.server, error = %e, "failed to answer server request");
                }
            }
            Incoming::Notification { method, .. } => {
                tracing::debug!(server = %self.server, method = %method, "server notification");
            }
        }
    }

    fn stream_closed(&self, detail: &str) {
        self.alive.store(false, Ordering::SeqCst);
        if self.closing.load(Ordering::SeqCst) {
            return;
        }
        let rejected = self.pending.close(|method| {
            McpError::new(
                FailureReason::ServerCrash,
                self.server.clone(),
                method,
                Phase::Request,
                detail,
            )
        });
        tracing::warn!(server = %self.server, rejected, detail, "SSE stream closed");
    }
}

async fn listen(
    inner: Arc<SseInner>,
    base: Url,
    response: reqwest::Response,
    endpoint_tx: oneshot::Sender<Url>,
) {
    let mut endpoint_tx = Some(endpoint_tx);
    let mut parser = SseParser::new();
    let mut stream = response.bytes_stream();

    let detail = loop {
        let events = match stream.next().await {
            Some(Ok(bytes)) => parser.push(&bytes),
            Some(Err(e)) => break format!("event stream error: {e}"),
            None => {
                if let Some(event) = parser.finish() {
                    handle_event(&inner, &base, &mut endpoint_tx, event).await;
                }
                break "event stream ended".to_string();
            }
        };
        for event in events {
            handle_event(&inner, &base, &mut endpoint_tx, event).await;
        }
    };
    inner.stream_closed(&detail);
}

async fn handle_event(
    inner: &SseInner,
    base: &Url,
    endpoint_tx: &mut Option<oneshot::Sender<Url>>,
    event: SseEvent,
) {
    match event.kind() {
        "endpoint" => match base.join(event.data.trim()) {
            Ok(url) => {
                if let Some(tx) = endpoint_tx.take() {
                    let _ = tx.send(url);
                } else {
                    *inner.post_url() = Some(url);
                }
            }
            Err(e) => {
                tracing::warn!(server = %inner.server, error = %e, data = %event.data, "bad endpoint event");
            }
        },
        "message" => inner.dispatch(&event.data).await,
        other => {
            tracing::debug!(server = %inner.server, event = other, "ignoring SSE event");
        }
    }
}

#[async_trait]
impl RpcChannel for SseChannel {
    async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Value, McpError> {
        if cancel.is_cancelled() {
            return Err(McpError::cancelled(&self.inner.server, method));
        }
        if !self.is_alive() {
            return Err(McpError::new(
                FailureReason::ServerCrash,
                self.inner.server.clone(),
                method,
                Phase::Request,
                "connection is closed",
            ));
        }

        let call = self.inner.pending.register(method);
        let id = call.id();
        self.inner
            .post(method, &JsonRpcRequest::new(id, method, params))
            .await?;

        let outcome = call.wait(timeout, cancel).await;
        let (result, abandoned) = resolve_wait(&self.inner.server, method, timeout, outcome);
        if let Some(reason) = abandoned {
            let inner = Arc::clone(&self.inner);
            tokio::spawn(async move {
                let note = JsonRpcNotification::new(
                    "notifications/cancelled",
                    Some(cancel_params(id, reason)),
                );
                let _ = inner.post("notifications/cancelled", &note).await;
            });
        }
        result
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), McpError> {
        self.inner
            .post(method, &JsonRpcNotification::new(method, params))
            .await
    }

    fn is_alive(&self) -> bool {
        self.inner.alive.load(Ordering::SeqCst) && !self.inner.closing.load(Ordering::SeqCst)
    }

    async fn close(&self, _grace: Duration) {
        if self.inner.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        let server = self.inner.server.clone();
        self.inner.pending.close(|method| {
            McpError::new(
                FailureReason::ShuttingDown,
                server.clone(),
                method,
                Phase::Shutdown,
                "client is shutting down",
            )
        });
        self.inner.alive.store(false, Ordering::SeqCst);
        self.listener.abort();
    }
}

impl Drop for SseChannel {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
