//! Test doubles: scripted in-memory servers and a raw HTTP fixture.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use super::channel::{Connector, ConnectorFactory, RpcChannel};
use super::config::ServerSpec;
use super::errors::{FailureReason, McpError, Phase};
use super::framing::Framing;
use super::types::PROTOCOL_VERSION;

// ─── Scripted Servers ────────────────────────────────────────────────────────

/// One request as seen by a scripted server.
#[derive(Debug, Clone)]
pub struct MockCall {
    pub connection: usize,
    pub framing: Framing,
    pub method: String,
    pub params: Option<Value>,
}

/// How a scripted server answers.
#[derive(Debug, Clone)]
pub enum Reply {
    Result(Value),
    Error(McpError),
    /// Never answer; the caller hits its deadline or cancellation.
    Hang,
    /// The process dies mid-request.
    Crash,
}

type Script = dyn Fn(&MockCall) -> Option<Reply> + Send + Sync;
type ConnectScript = dyn Fn(usize, Framing) -> Option<McpError> + Send + Sync;

/// Shared state of one scripted server across all of its connections.
pub struct MockServer {
    pub name: String,
    tools: Vec<Value>,
    capabilities: Value,
    script: Mutex<Option<Arc<Script>>>,
    connect_script: Mutex<Option<Arc<ConnectScript>>>,
    negotiates: bool,
    connects: AtomicUsize,
    calls: Mutex<Vec<MockCall>>,
    notifications: Mutex<Vec<String>>,
}

impl MockServer {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            tools: Vec::new(),
            capabilities: json!({"tools": {}, "prompts": {}}),
            script: Mutex::new(None),
            connect_script: Mutex::new(None),
            negotiates: false,
            connects: AtomicUsize::new(0),
            calls: Mutex::new(Vec::new()),
            notifications: Mutex::new(Vec::new()),
        }
    }

    pub fn with_tool(mut self, name: &str, description: &str) -> Self {
        self.tools.push(json!({
            "name": name,
            "description": description,
            "inputSchema": {"type": "object"}
        }));
        self
    }

    pub fn with_capabilities(mut self, capabilities: Value) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Behave like a stdio server whose framing must be negotiated.
    pub fn negotiating(mut self) -> Self {
        self.negotiates = true;
        self
    }

    /// Override replies; returning `None` falls back to the default script.
    pub fn with_script(
        self,
        script: impl Fn(&MockCall) -> Option<Reply> + Send + Sync + 'static,
    ) -> Self {
        *self.script.lock().unwrap() = Some(Arc::new(script));
        self
    }

    /// Fail connection attempts; receives the attempt index and framing.
    pub fn with_connect_script(
        self,
        script: impl Fn(usize, Framing) -> Option<McpError> + Send + Sync + 'static,
    ) -> Self {
        *self.connect_script.lock().unwrap() = Some(Arc::new(script));
        self
    }

    pub fn into_arc(self) -> Arc<Self> {
        Arc::new(self)
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn methods(&self) -> Vec<String> {
        self.calls().into_iter().map(|c| c.method).collect()
    }

    pub fn count(&self, method: &str) -> usize {
        self.calls().iter().filter(|c| c.method == method).count()
    }

    pub fn notifications(&self) -> Vec<String> {
        self.notifications.lock().unwrap().clone()
    }

    fn default_reply(&self, call: &MockCall) -> Reply {
        match call.method.as_str() {
            "initialize" => Reply::Result(json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": self.capabilities,
                "serverInfo": {"name": self.name, "version": "1.0.0"}
            })),
            "ping" => Reply::Result(json!({})),
            "tools/list" => Reply::Result(json!({"tools": self.tools})),
            "prompts/list" => Reply::Result(json!({"prompts": []})),
            "resources/list" => Reply::Result(json!({"resources": []})),
            "resources/templates/list" => Reply::Result(json!({"resourceTemplates": []})),
            "tools/call" => {
                let name = call
                    .params
                    .as_ref()
                    .and_then(|p| p.get("name"))
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                Reply::Result(json!({
                    "content": [{"type": "text", "text": format!("{name} ok")}]
                }))
            }
            other => Reply::Error(McpError::new(
                FailureReason::NotSupported,
                self.name.clone(),
                other,
                Phase::Request,
                "server error [-32601]: Method not found",
            )),
        }
    }

    fn reply(&self, call: &MockCall) -> Reply {
        let script = self.script.lock().unwrap().clone();
        script
            .and_then(|s| s(call))
            .unwrap_or_else(|| self.default_reply(call))
    }
}

pub struct MockConnector {
    server: Arc<MockServer>,
}

impl MockConnector {
    pub fn new(server: Arc<MockServer>) -> Self {
        Self { server }
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, framing: Framing) -> Result<Arc<dyn RpcChannel>, McpError> {
        let connection = self.server.connects.fetch_add(1, Ordering::SeqCst);
        let script = self.server.connect_script.lock().unwrap().clone();
        if let Some(err) = script.and_then(|s| s(connection, framing)) {
            return Err(err);
        }
        Ok(Arc::new(MockChannel {
            server: Arc::clone(&self.server),
            connection,
            framing,
            alive: AtomicBool::new(true),
        }))
    }

    fn negotiates_framing(&self) -> bool {
        self.server.negotiates
    }
}

pub struct MockChannel {
    server: Arc<MockServer>,
    connection: usize,
    framing: Framing,
    alive: AtomicBool,
}

#[async_trait]
impl RpcChannel for MockChannel {
    async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Value, McpError> {
        if cancel.is_cancelled() {
            return Err(McpError::cancelled(&self.server.name, method));
        }
        if !self.alive.load(Ordering::SeqCst) {
            return Err(McpError::new(
                FailureReason::ServerCrash,
                self.server.name.clone(),
                method,
                Phase::Request,
                "connection is closed",
            ));
        }
        let call = MockCall {
            connection: self.connection,
            framing: self.framing,
            method: method.to_string(),
            params,
        };
        self.server.calls.lock().unwrap().push(call.clone());

        match self.server.reply(&call) {
            Reply::Result(value) => Ok(value),
            Reply::Error(err) => Err(err),
            Reply::Hang => {
                tokio::select! {
                    _ = tokio::time::sleep(timeout) => Err(McpError::new(
                        FailureReason::Timeout,
                        self.server.name.clone(),
                        method,
                        Phase::Request,
                        format!("no response after {}ms", timeout.as_millis()),
                    )),
                    _ = cancel.cancelled() => Err(McpError::cancelled(&self.server.name, method)),
                }
            }
            Reply::Crash => {
                self.alive.store(false, Ordering::SeqCst);
                Err(McpError::new(
                    FailureReason::ServerCrash,
                    self.server.name.clone(),
                    method,
                    Phase::Request,
                    "process exited (signal: 9)",
                ))
            }
        }
    }

    async fn notify(&self, method: &str, _params: Option<Value>) -> Result<(), McpError> {
        self.server
            .notifications
            .lock()
            .unwrap()
            .push(method.to_string());
        Ok(())
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    fn framing(&self) -> Option<Framing> {
        Some(self.framing)
    }

    async fn close(&self, _grace: Duration) {
        self.alive.store(false, Ordering::SeqCst);
    }
}

/// Routes server names to scripted servers.
#[derive(Default)]
pub struct MockFactory {
    servers: Mutex<HashMap<String, Arc<MockServer>>>,
}

impl MockFactory {
    pub fn new(servers: impl IntoIterator<Item = Arc<MockServer>>) -> Arc<Self> {
        let map = servers
            .into_iter()
            .map(|s| (s.name.clone(), s))
            .collect::<HashMap<_, _>>();
        Arc::new(Self {
            servers: Mutex::new(map),
        })
    }
}

impl ConnectorFactory for MockFactory {
    fn connector(&self, spec: &ServerSpec) -> Arc<dyn Connector> {
        let server = self
            .servers
            .lock()
            .unwrap()
            .get(&spec.name)
            .cloned()
            .unwrap_or_else(|| {
                MockServer::new(&spec.name)
                    .with_connect_script(|_, _| {
                        Some(McpError::new(
                            FailureReason::SpawnFailed,
                            "",
                            "spawn",
                            Phase::Startup,
                            "no scripted server",
                        ))
                    })
                    .into_arc()
            });
        Arc::new(MockConnector::new(server))
    }
}

// ─── Raw HTTP Fixture ────────────────────────────────────────────────────────

/// A request read off a raw socket.
#[derive(Debug, Clone)]
pub struct RawHttpRequest {
    pub method: String,
    pub path: String,
    pub headers: HashMap<String, String>,
    pub body: String,
}

impl RawHttpRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn json(&self) -> Value {
        serde_json::from_str(&self.body).unwrap_or(Value::Null)
    }
}

/// Read one HTTP/1.1 request (headers plus a `Content-Length` body).
pub async fn read_http_request(stream: &mut TcpStream) -> Option<RawHttpRequest> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    let header_end = loop {
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos;
        }
        let n = stream.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);
    };

    let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
    let mut lines = head.split("\r\n");
    let mut request_line = lines.next()?.split_whitespace();
    let method = request_line.next()?.to_string();
    let path = request_line.next()?.to_string();
    let headers: HashMap<String, String> = lines
        .filter_map(|line| line.split_once(':'))
        .map(|(k, v)| (k.trim().to_ascii_lowercase(), v.trim().to_string()))
        .collect();

    let length: usize = headers
        .get("content-length")
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    let mut body = buf[header_end + 4..].to_vec();
    while body.len() < length {
        let n = stream.read(&mut chunk).await.ok()?;
        if n == 0 {
            break;
        }
        body.extend_from_slice(&chunk[..n]);
    }

    Some(RawHttpRequest {
        method,
        path,
        headers,
        body: String::from_utf8_lossy(&body).to_string(),
    })
}

/// Write a complete response and close the connection.
pub async fn write_http_response(
    stream: &mut TcpStream,
    status: &str,
    headers: &[(&str, &str)],
    body: &str,
) {
    let mut head = format!("HTTP/1.1 {status}\r\nContent-Length: {}\r\nConnection: close\r\n", body.len());
    for (name, value) in headers {
        head.push_str(&format!("{name}: {value}\r\n"));
    }
    head.push_str("\r\n");
    let _ = stream.write_all(head.as_bytes()).await;
    let _ = stream.write_all(body.as_bytes()).await;
    let _ = stream.flush().await;
    let _ = stream.shutdown().await;
}
