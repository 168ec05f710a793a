//! Streamable HTTP transport.
//!
//! Every JSON-RPC message is a `POST` to the server URL. The response body is
//! either a JSON message (or batch) or a short `text/event-stream` carrying
//! the reply. A session id handed out by the server is echoed on every later
//! request.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::{Client as HttpClient, RequestBuilder, StatusCode};
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::channel::{cancel_params, resolve_wait, Connector, RpcChannel};
use super::config::{Endpoint, ServerSpec};
use super::errors::{FailureReason, McpError, Phase};
use super::framing::Framing;
use super::pending::{PendingTable, WaitOutcome};
use super::sse::parse_sse_body;
use super::types::{Incoming, JsonRpcNotification, JsonRpcRequest};

/// Session header assigned by the server.
const SESSION_HEADER: &str = "mcp-session-id";

/// Longest error body echoed into a failure detail.
const ERROR_BODY_MAX: usize = 300;

// ─── Shared Helpers ──────────────────────────────────────────────────────────

/// Add configured headers to a request.
pub fn apply_headers(mut builder: RequestBuilder, headers: &BTreeMap<String, String>) -> RequestBuilder {
    for (name, value) in headers {
        builder = builder.header(name.as_str(), value.as_str());
    }
    builder
}

/// Classify a non-success HTTP status. Returns `None` for 2xx.
pub fn status_error(server: &str, method: &str, status: StatusCode, body: &str) -> Option<McpError> {
    if status.is_success() {
        return None;
    }
    let mut snippet: String = body.trim().chars().take(ERROR_BODY_MAX).collect();
    if snippet.is_empty() {
        snippet = status.canonical_reason().unwrap_or("no body").to_string();
    }
    let reason = match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => FailureReason::SpawnFailed,
        StatusCode::NOT_FOUND | StatusCode::METHOD_NOT_ALLOWED => FailureReason::NotSupported,
        _ => FailureReason::BadResponse,
    };
    Some(McpError::new(
        reason,
        server,
        method,
        Phase::Request,
        format!("HTTP {}: {snippet}", status.as_u16()),
    ))
}

/// Find the response to request `id` in a POST response body.
pub fn response_from_body(
    server: &str,
    method: &str,
    id: u64,
    content_type: &str,
    body: &str,
) -> Result<Value, McpError> {
    let bad = |detail: String| {
        McpError::new(FailureReason::BadResponse, server, method, Phase::Request, detail)
    };

    let messages: Vec<Value> = if content_type.starts_with("text/event-stream") {
        parse_sse_body(body)
            .into_iter()
            .filter(|event| event.kind() == "message")
            .filter_map(|event| serde_json::from_str(&event.data).ok())
            .collect()
    } else {
        match serde_json::from_str::<Value>(body) {
            Ok(Value::Array(items)) => items,
            Ok(value) => vec![value],
            Err(e) => return Err(bad(format!("invalid JSON body: {e}"))),
        }
    };

    for message in messages {
        match Incoming::from_value(message) {
            Ok(Incoming::Response { id: Some(rid), outcome }) if rid == id => {
                return outcome
                    .map_err(|err| McpError::from_rpc_error(server, method, Phase::Request, &err));
            }
            Ok(Incoming::Response { id: None, outcome: Err(err) }) => {
                return Err(bad(format!(
                    "server rejected message [{}]: {}",
                    err.code, err.message
                )));
            }
            _ => {}
        }
    }
    Err(bad(format!("no response for request {id}")))
}

// ─── Connector ───────────────────────────────────────────────────────────────

pub struct HttpConnector {
    spec: ServerSpec,
    client: HttpClient,
}

impl HttpConnector {
    pub fn new(spec: ServerSpec) -> Self {
        Self {
            spec,
            client: HttpClient::new(),
        }
    }
}

#[async_trait]
impl Connector for HttpConnector {
    async fn connect(&self, _framing: Framing) -> Result<Arc<dyn RpcChannel>, McpError> {
        let Endpoint::Http { url, headers } = &self.spec.endpoint else {
            return Err(McpError::new(
                FailureReason::SpawnFailed,
                self.spec.name.clone(),
                "connect",
                Phase::Startup,
                "not an HTTP endpoint",
            ));
        };
        // Nothing to open up front; the initialize POST is the first contact.
        Ok(Arc::new(HttpChannel {
            inner: Arc::new(HttpInner {
                server: self.spec.name.clone(),
                client: self.client.clone(),
                url: url.clone(),
                headers: headers.clone(),
                session: Mutex::new(None),
                ids: PendingTable::new(&self.spec.name),
                alive: AtomicBool::new(true),
                closing: AtomicBool::new(false),
            }),
        }))
    }
}

// ─── Channel ─────────────────────────────────────────────────────────────────

struct HttpInner {
    server: String,
    client: HttpClient,
    url: String,
    headers: BTreeMap<String, String>,
    session: Mutex<Option<String>>,
    /// Id allocation only; replies arrive on the POST itself.
    ids: Arc<PendingTable>,
    alive: AtomicBool,
    closing: AtomicBool,
}

pub struct HttpChannel {
    inner: Arc<HttpInner>,
}

impl HttpInner {
    fn session(&self) -> Option<String> {
        self.session.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn builder(&self, builder: RequestBuilder) -> RequestBuilder {
        let mut builder = apply_headers(builder, &self.headers)
            .header(ACCEPT, "application/json, text/event-stream");
        if let Some(session) = self.session() {
            builder = builder.header(SESSION_HEADER, session);
        }
        builder
    }

    /// POST one message. Returns the response content type and body.
    async fn post<T: Serialize>(&self, method: &str, message: &T) -> Result<(String, String), McpError> {
        let response = self
            .builder(self.client.post(&self.url))
            .json(message)
            .send()
            .await
            .map_err(|e| {
                // Unreachable server: mark the channel dead so the client
                // reconnects through its circuit.
                self.alive.store(false, Ordering::SeqCst);
                McpError::new(
                    FailureReason::ServerCrash,
                    self.server.clone(),
                    method,
                    Phase::Request,
                    format!("HTTP request failed: {e}"),
                )
            })?;

        if let Some(session) = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            *self.session.lock().unwrap_or_else(|e| e.into_inner()) = Some(session.to_string());
        }

        let status = response.status();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_ascii_lowercase();
        let body = response.text().await.map_err(|e| {
            McpError::new(
                FailureReason::BadResponse,
                self.server.clone(),
                method,
                Phase::Request,
                format!("failed to read response body: {e}"),
            )
        })?;

        if let Some(err) = status_error(&self.server, method, status, &body) {
            return Err(err);
        }
        Ok((content_type, body))
    }

    async fn exchange(&self, id: u64, method: &str, params: Option<Value>) -> Result<Value, McpError> {
        let request = JsonRpcRequest::new(id, method, params);
        let (content_type, body) = self.post(method, &request).await?;
        if body.trim().is_empty() {
            return Ok(Value::Null);
        }
        response_from_body(&self.server, method, id, &content_type, &body)
    }
}

#[async_trait]
impl RpcChannel for HttpChannel {
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

        let id = self.inner.ids.next_id();
        let outcome = tokio::select! {
            result = tokio::time::timeout(timeout, self.inner.exchange(id, method, params)) => match result {
                Ok(settled) => WaitOutcome::Settled(settled),
                Err(_) => WaitOutcome::TimedOut,
            },
            _ = cancel.cancelled() => WaitOutcome::Cancelled,
        };

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
            .map(|_| ())
    }

    fn is_alive(&self) -> bool {
        self.inner.alive.load(Ordering::SeqCst) && !self.inner.closing.load(Ordering::SeqCst)
    }

    /// End the server-side session, if one was assigned.
    async fn close(&self, grace: Duration) {
        if self.inner.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        if self.inner.session().is_some() {
            let request = self.inner.builder(self.inner.client.delete(&self.inner.url));
            match tokio::time::timeout(grace, request.send()).await {
                Ok(Ok(response)) => {
                    tracing::debug!(server = %self.inner.server, status = %response.status(), "session closed");
                }
                Ok(Err(e)) => {
                    tracing::debug!(server = %self.inner.server, error = %e, "session close failed");
                }
                Err(_) => {}
            }
        }
        self.inner.alive.store(false, Ordering::SeqCst);
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    use serde_json::json;
    use tokio::net::TcpListener;

    use crate::mcp_client::config::{RegistryDefaults, ServerConfig};
    use crate::mcp_client::testing::{read_http_request, write_http_response, RawHttpRequest};

    fn http_spec(url: String) -> ServerSpec {
        let config = ServerConfig {
            url: Some(url),
            ..ServerConfig::default()
        };
        ServerSpec::resolve("remote", &config, &RegistryDefaults::default(), Path::new("/")).unwrap()
    }

    #[derive(Clone, Copy)]
    enum Body {
        Json,
        Sse,
        Empty,
    }

    fn echo_result(request: &Value) -> String {
        json!({"jsonrpc": "2.0", "id": request["id"], "result": {"method": request["method"]}})
            .to_string()
    }

    /// Serve `responses` in order, one connection each, recording requests.
    async fn serve(
        responses: Vec<(&'static str, Vec<(&'static str, &'static str)>, Body)>,
    ) -> (String, tokio::task::JoinHandle<Vec<RawHttpRequest>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/mcp", listener.local_addr().unwrap());
        let handle = tokio::spawn(async move {
            let mut seen = Vec::new();
            for (status, headers, body) in responses {
                let (mut stream, _) = listener.accept().await.unwrap();
                let request = read_http_request(&mut stream).await.unwrap();
                let reply = match body {
                    Body::Json => echo_result(&request.json()),
                    Body::Sse => format!("event: message\ndata: {}\n\n", echo_result(&request.json())),
                    Body::Empty => String::new(),
                };
                write_http_response(&mut stream, status, &headers, &reply).await;
                seen.push(request);
            }
            seen
        });
        (url, handle)
    }

    #[test]
    fn test_status_error_classification() {
        let auth = status_error("s", "initialize", StatusCode::UNAUTHORIZED, "").unwrap();
        assert_eq!(auth.reason, FailureReason::SpawnFailed);
        assert!(auth.detail.contains("401"));

        let boom = status_error("s", "tools/call", StatusCode::INTERNAL_SERVER_ERROR, "boom").unwrap();
        assert_eq!(boom.reason, FailureReason::BadResponse);
        assert!(boom.detail.ends_with("boom"));

        assert!(status_error("s", "ping", StatusCode::ACCEPTED, "").is_none());
    }

    #[test]
    fn test_response_from_batch_and_sse_bodies() {
        let batch = r#"[{"jsonrpc":"2.0","method":"notifications/progress"},{"jsonrpc":"2.0","id":4,"result":{"ok":true}}]"#;
        let value = response_from_body("s", "m", 4, "application/json", batch).unwrap();
        assert_eq!(value["ok"], true);

        let sse = "event: message\ndata: {\"jsonrpc\":\"2.0\",\"id\":9,\"error\":{\"code\":-32601,\"message\":\"nope\"}}\n\n";
        let err = response_from_body("s", "m", 9, "text/event-stream", sse).unwrap_err();
        assert_eq!(err.reason, FailureReason::NotSupported);

        let err = response_from_body("s", "m", 1, "application/json", "{\"jsonrpc\":\"2.0\",\"id\":2,\"result\":{}}").unwrap_err();
        assert!(err.detail.contains("no response for request 1"));
    }

    #[tokio::test]
    async fn test_json_response_and_session_echo() {
        let (url, server) = serve(vec![
            ("200 OK", vec![("Content-Type", "application/json"), ("Mcp-Session-Id", "sess-1")], Body::Json),
            ("200 OK", vec![("Content-Type", "application/json")], Body::Json),
        ])
        .await;

        let channel = HttpConnector::new(http_spec(url)).connect(Framing::Auto).await.unwrap();
        let token = CancellationToken::new();
        let first = channel.request("initialize", None, Duration::from_secs(2), &token).await.unwrap();
        assert_eq!(first["method"], "initialize");
        let second = channel.request("tools/list", None, Duration::from_secs(2), &token).await.unwrap();
        assert_eq!(second["method"], "tools/list");

        let seen = server.await.unwrap();
        assert_eq!(seen[0].method, "POST");
        assert_eq!(seen[0].header("mcp-session-id"), None);
        assert_eq!(seen[1].header("mcp-session-id"), Some("sess-1"));
        assert!(seen[1].header("accept").unwrap().contains("text/event-stream"));
    }

    #[tokio::test]
    async fn test_sse_response_body() {
        let (url, _server) = serve(vec![(
            "200 OK",
            vec![("Content-Type", "text/event-stream")],
            Body::Sse,
        )])
        .await;

        let channel = HttpConnector::new(http_spec(url)).connect(Framing::Auto).await.unwrap();
        let value = channel
            .request("ping", None, Duration::from_secs(2), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(value["method"], "ping");
    }

    #[tokio::test]
    async fn test_unauthorized_is_spawn_failed() {
        let (url, _server) = serve(vec![("401 Unauthorized", vec![], Body::Empty)]).await;

        let channel = HttpConnector::new(http_spec(url)).connect(Framing::Auto).await.unwrap();
        let err = channel
            .request("initialize", None, Duration::from_secs(2), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.reason, FailureReason::SpawnFailed);
    }

    #[tokio::test]
    async fn test_unreachable_server_marks_channel_dead() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/mcp", listener.local_addr().unwrap());
        drop(listener);

        let channel = HttpConnector::new(http_spec(url)).connect(Framing::Auto).await.unwrap();
        let err = channel
            .request("initialize", None, Duration::from_secs(2), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.reason, FailureReason::ServerCrash);
        assert!(!channel.is_alive());
    }
}
