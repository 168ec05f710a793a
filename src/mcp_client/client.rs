//! MCP Client: one connection-managing client per configured server.
//!
//! Owns the server's channel, runs the `initialize` handshake (negotiating
//! framing for `auto` stdio servers), reconnects with backoff behind a
//! circuit breaker, and exposes the MCP operations the registry routes to.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use super::channel::{Connector, RpcChannel};
use super::circuit::{Admission, CircuitBreaker, CircuitState};
use super::config::{HealthCheckMethod, ServerSpec};
use super::errors::{FailureReason, McpError, Phase};
use super::events::{EventBus, RegistryEvent};
use super::framing::Framing;
use super::health::HealthStatus;
use super::lifecycle::LifecycleState;
use super::negotiation::{Negotiation, NextStep};
use super::types::{
    InitializeResult, McpPromptDefinition, McpResource, McpResourceTemplate, McpToolDefinition,
    ToolOutput, PROTOCOL_VERSION,
};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Client identity sent in `initialize`.
const CLIENT_NAME: &str = "mcphub";

/// Upper bound on `tools/list` pages followed.
const MAX_LIST_PAGES: usize = 100;

// ─── Wire Pages ──────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ToolsPage {
    #[serde(default)]
    tools: Vec<McpToolDefinition>,
    #[serde(default)]
    next_cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PromptsPage {
    #[serde(default)]
    prompts: Vec<McpPromptDefinition>,
}

#[derive(Debug, Deserialize)]
struct ResourcesPage {
    #[serde(default)]
    resources: Vec<McpResource>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TemplatesPage {
    #[serde(default)]
    resource_templates: Vec<McpResourceTemplate>,
}

// ─── McpClient ───────────────────────────────────────────────────────────────

struct ClientState {
    lifecycle: LifecycleState,
    channel: Option<Arc<dyn RpcChannel>>,
    /// Set after the first successful handshake; enables reconnection.
    ever_initialized: bool,
    /// Framing that completed the last handshake.
    framing: Option<Framing>,
    circuit: CircuitBreaker,
    init: Option<InitializeResult>,
}

/// Point-in-time view of a client, for summaries.
#[derive(Debug, Clone)]
pub struct ClientSnapshot {
    pub lifecycle: LifecycleState,
    pub circuit: CircuitState,
    pub reconnect_attempts: u32,
    pub framing: Option<Framing>,
    pub init: Option<InitializeResult>,
}

pub struct McpClient {
    spec: Arc<ServerSpec>,
    connector: Arc<dyn Connector>,
    events: Option<EventBus>,
    state: Mutex<ClientState>,
    shutdown: CancellationToken,
}

impl McpClient {
    pub fn new(spec: Arc<ServerSpec>, connector: Arc<dyn Connector>) -> Self {
        let circuit = CircuitBreaker::new(spec.max_reconnect_attempts, spec.circuit_reset);
        Self {
            spec,
            connector,
            events: None,
            state: Mutex::new(ClientState {
                lifecycle: LifecycleState::Closed,
                channel: None,
                ever_initialized: false,
                framing: None,
                circuit,
                init: None,
            }),
            shutdown: CancellationToken::new(),
        }
    }

    /// Publish `RequestCompleted` events on `events`.
    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn spec(&self) -> &ServerSpec {
        &self.spec
    }

    pub async fn snapshot(&self) -> ClientSnapshot {
        let state = self.state.lock().await;
        ClientSnapshot {
            lifecycle: state.lifecycle,
            circuit: state.circuit.state(),
            reconnect_attempts: state.circuit.attempts(),
            framing: state.framing,
            init: state.init.clone(),
        }
    }

    // ─── Connection ──────────────────────────────────────────────────────

    /// Return a live, initialized channel, connecting or reconnecting first.
    ///
    /// `cancel` aborts waiting for the connection lock, the backoff delay and
    /// the handshake. An aborted attempt is not counted against the circuit.
    async fn ensure_ready(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Arc<dyn RpcChannel>, McpError> {
        if self.shutdown.is_cancelled() {
            return Err(self.shutting_down("connect"));
        }

        let mut state = tokio::select! {
            state = self.state.lock() => state,
            _ = cancel.cancelled() => return Err(McpError::cancelled(&self.spec.name, "connect")),
        };
        if let Some(channel) = &state.channel {
            if channel.is_alive() {
                return Ok(Arc::clone(channel));
            }
        }

        if let Some(dead) = state.channel.take() {
            tracing::info!(server = %self.spec.name, "connection lost, will reconnect");
            dead.close(Duration::ZERO).await;
            state.lifecycle = LifecycleState::Closed;
        }

        // A server that never came up is not retried here; the registry
        // decides when to try again.
        if !state.ever_initialized {
            return self.connect_locked(&mut state, cancel).await;
        }

        loop {
            if self.shutdown.is_cancelled() {
                return Err(self.shutting_down("connect"));
            }
            let now = tokio::time::Instant::now().into_std();
            match state.circuit.admit(now) {
                Admission::Rejected { retry_in } => {
                    return Err(McpError::new(
                        FailureReason::ServerCrash,
                        self.spec.name.clone(),
                        "connect",
                        Phase::Startup,
                        format!("circuit open; next attempt in {}ms", retry_in.as_millis()),
                    ));
                }
                Admission::Trial => {
                    tracing::info!(server = %self.spec.name, "circuit half-open, trying once");
                    return match self.connect_locked(&mut state, cancel).await {
                        Ok(channel) => {
                            state.circuit.record_success();
                            Ok(channel)
                        }
                        Err(e) if cancel.is_cancelled() => {
                            state.circuit.release_trial();
                            Err(e)
                        }
                        Err(e) => {
                            state.circuit.record_failure(tokio::time::Instant::now().into_std());
                            tracing::warn!(server = %self.spec.name, error = %e, "half-open trial failed");
                            Err(e)
                        }
                    };
                }
                Admission::Attempt { delay } => {
                    tracing::info!(
                        server = %self.spec.name,
                        attempt = state.circuit.attempts() + 1,
                        delay_ms = delay.as_millis() as u64,
                        "reconnecting"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.shutdown.cancelled() => return Err(self.shutting_down("connect")),
                        _ = cancel.cancelled() => {
                            return Err(McpError::cancelled(&self.spec.name, "connect"));
                        }
                    }
                    match self.connect_locked(&mut state, cancel).await {
                        Ok(channel) => {
                            state.circuit.record_success();
                            return Ok(channel);
                        }
                        Err(e) if cancel.is_cancelled() => return Err(e),
                        Err(e) => {
                            let now = tokio::time::Instant::now().into_std();
                            if state.circuit.record_failure(now) == CircuitState::Open {
                                tracing::warn!(
                                    server = %self.spec.name,
                                    error = %e,
                                    "reconnect attempts exhausted, circuit open"
                                );
                                return Err(e);
                            }
                        }
                    }
                }
            }
        }
    }

    /// Drop the current connection and connect again.
    ///
    /// Reconnects of a server that has initialized before go through the
    /// circuit breaker, so an open circuit fails fast here too.
    pub async fn reconnect(&self, cancel: &CancellationToken) -> Result<(), McpError> {
        {
            let mut state = self.state.lock().await;
            if let Some(old) = state.channel.take() {
                old.close(Duration::ZERO).await;
            }
            state.lifecycle = LifecycleState::Closed;
        }
        self.ensure_ready(cancel).await.map(|_| ())
    }

    /// Connect and handshake, walking framing candidates when negotiating.
    async fn connect_locked(
        &self,
        state: &mut ClientState,
        cancel: &CancellationToken,
    ) -> Result<Arc<dyn RpcChannel>, McpError> {
        state.lifecycle = LifecycleState::Starting;

        // Once a framing has worked, later reconnects skip negotiation.
        let negotiates = self.connector.negotiates_framing();
        let first = if negotiates {
            state.framing.unwrap_or(self.spec.framing)
        } else {
            Framing::Newline
        };
        let mut negotiation = Negotiation::new(first);

        let mut last_error = None;
        while let Some(framing) = negotiation.current() {
            let attempt = tokio::select! {
                result = tokio::time::timeout(self.spec.timeouts.startup, self.open_and_initialize(framing)) => result,
                _ = self.shutdown.cancelled() => {
                    state.lifecycle = LifecycleState::Closed;
                    return Err(self.shutting_down("initialize"));
                }
                _ = cancel.cancelled() => {
                    state.lifecycle = LifecycleState::Closed;
                    return Err(McpError::cancelled(&self.spec.name, "initialize"));
                }
            };
            let result = attempt.unwrap_or_else(|_| {
                Err(McpError::new(
                    FailureReason::Timeout,
                    self.spec.name.clone(),
                    "initialize",
                    Phase::Initialize,
                    format!(
                        "no handshake within {}ms",
                        self.spec.timeouts.startup.as_millis()
                    ),
                ))
            });

            match result {
                Ok((channel, init)) => {
                    if negotiates {
                        state.framing = Some(framing);
                    }
                    tracing::info!(
                        server = %self.spec.name,
                        framing = %framing,
                        protocol = init.protocol_version.as_deref().unwrap_or("unknown"),
                        "MCP server initialized"
                    );
                    state.channel = Some(Arc::clone(&channel));
                    state.init = Some(init);
                    state.ever_initialized = true;
                    state.lifecycle = LifecycleState::Running;
                    return Ok(channel);
                }
                Err(e) => {
                    let reason = e.reason;
                    last_error = Some(e);
                    match negotiation.fail(reason) {
                        NextStep::Retry(next) => {
                            tracing::debug!(
                                server = %self.spec.name,
                                failed = %framing,
                                next = %next,
                                reason = %reason,
                                "framing candidate failed, restarting"
                            );
                        }
                        NextStep::GiveUp => break,
                    }
                }
            }
        }

        state.lifecycle = LifecycleState::Closed;
        Err(last_error.unwrap_or_else(|| {
            McpError::new(
                FailureReason::Unknown,
                self.spec.name.clone(),
                "initialize",
                Phase::Initialize,
                "no framing candidates",
            )
        }))
    }

    async fn open_and_initialize(
        &self,
        framing: Framing,
    ) -> Result<(Arc<dyn RpcChannel>, InitializeResult), McpError> {
        let channel = self.connector.connect(framing).await?;

        let params = json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {"name": CLIENT_NAME, "version": env!("CARGO_PKG_VERSION")}
        });
        let response = channel
            .request(
                "initialize",
                Some(params),
                self.spec.timeouts.startup,
                &CancellationToken::new(),
            )
            .await;

        let init = response.and_then(|value| {
            serde_json::from_value::<InitializeResult>(value).map_err(|e| {
                McpError::new(
                    FailureReason::BadResponse,
                    self.spec.name.clone(),
                    "initialize",
                    Phase::Initialize,
                    format!("failed to parse initialize response: {e}"),
                )
            })
        });

        match init {
            Ok(init) => {
                if let Err(e) = channel.notify("notifications/initialized", None).await {
                    tracing::debug!(server = %self.spec.name, error = %e, "initialized notification failed");
                }
                Ok((channel, init))
            }
            Err(e) => {
                let stderr = e.stderr.clone().or_else(|| channel.stderr_tail());
                channel.close(Duration::ZERO).await;
                Err(e.in_phase(Phase::Initialize).with_stderr(stderr))
            }
        }
    }

    /// Handshake once per connection and return the server's answer.
    pub async fn initialize_once(&self) -> Result<InitializeResult, McpError> {
        self.ensure_ready(&CancellationToken::new()).await?;
        let state = self.state.lock().await;
        Ok(state.init.clone().unwrap_or_default())
    }

    // ─── Requests ────────────────────────────────────────────────────────

    async fn call(
        &self,
        method: &str,
        params: Option<Value>,
        cancel: &CancellationToken,
    ) -> Result<Value, McpError> {
        if cancel.is_cancelled() {
            return Err(McpError::cancelled(&self.spec.name, method));
        }
        let channel = self.ensure_ready(cancel).await?;
        let started = Instant::now();
        let result = channel
            .request(method, params, self.spec.timeouts.request, cancel)
            .await;
        self.record_completion(method, &result, started.elapsed());
        result
    }

    fn record_completion(&self, method: &str, result: &Result<Value, McpError>, elapsed: Duration) {
        let reason = result.as_ref().err().map(|e| e.reason);
        if let Some(reason) = reason {
            tracing::debug!(server = %self.spec.name, method, reason = %reason, "request failed");
        }
        if let Some(events) = &self.events {
            events.emit(RegistryEvent::RequestCompleted {
                server: self.spec.name.clone(),
                method: method.to_string(),
                ok: result.is_ok(),
                reason,
                duration_ms: elapsed.as_millis() as u64,
            });
        }
    }

    async fn advertises(&self, capability: &str) -> bool {
        let state = self.state.lock().await;
        state
            .init
            .as_ref()
            .map(|init| init.advertises(capability))
            .unwrap_or(true)
    }

    /// Probe liveness. Never fails; problems are reported in the status.
    pub async fn health(&self) -> HealthStatus {
        let token = CancellationToken::new();
        let framing = match self.ensure_ready(&token).await {
            Ok(channel) => channel.framing(),
            Err(e) => return HealthStatus::failed(&e, self.snapshot().await.framing),
        };

        let probe = match self.spec.health_check {
            HealthCheckMethod::Ping => self.call("ping", None, &token).await.map(|_| ()),
            HealthCheckMethod::ToolsList => self.call("tools/list", None, &token).await.map(|_| ()),
            HealthCheckMethod::Auto => match self.call("ping", None, &token).await {
                Ok(_) => Ok(()),
                Err(e) if e.reason.is_protocol_level() => {
                    tracing::debug!(server = %self.spec.name, error = %e, "ping unsupported, probing tools/list");
                    self.call("tools/list", None, &token).await.map(|_| ())
                }
                Err(e) => Err(e),
            },
        };

        match probe {
            Ok(()) => HealthStatus::healthy(framing),
            Err(e) => HealthStatus::failed(&e, framing),
        }
    }

    /// All tools, following `nextCursor` pagination.
    pub async fn list_tools(&self) -> Result<Vec<McpToolDefinition>, McpError> {
        let token = CancellationToken::new();
        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;

        for _ in 0..MAX_LIST_PAGES {
            let params = cursor.take().map(|c| json!({ "cursor": c }));
            let result = self.call("tools/list", params, &token).await?;
            let page: ToolsPage = self.parse("tools/list", result)?;
            tools.extend(page.tools);
            match page.next_cursor {
                Some(next) if !next.is_empty() => cursor = Some(next),
                _ => return Ok(tools),
            }
        }

        tracing::warn!(server = %self.spec.name, "tools/list pagination limit reached");
        Ok(tools)
    }

    /// Prompts, or empty when the server lacks them or the call fails.
    pub async fn list_prompts(&self) -> Vec<McpPromptDefinition> {
        self.optional_list("prompts", "prompts/list", |page: PromptsPage| page.prompts)
            .await
    }

    /// Resources, or empty when the server lacks them or the call fails.
    pub async fn list_resources(&self) -> Vec<McpResource> {
        self.optional_list("resources", "resources/list", |page: ResourcesPage| {
            page.resources
        })
        .await
    }

    /// Resource templates, or empty when unavailable.
    pub async fn list_templates(&self) -> Vec<McpResourceTemplate> {
        self.optional_list(
            "resources",
            "resources/templates/list",
            |page: TemplatesPage| page.resource_templates,
        )
        .await
    }

    async fn optional_list<P, T>(
        &self,
        capability: &str,
        method: &str,
        extract: impl FnOnce(P) -> Vec<T>,
    ) -> Vec<T>
    where
        P: DeserializeOwned,
    {
        let token = CancellationToken::new();
        if let Err(e) = self.ensure_ready(&token).await {
            tracing::debug!(server = %self.spec.name, method, error = %e, "skipping optional list");
            return Vec::new();
        }
        if !self.advertises(capability).await {
            return Vec::new();
        }
        let result = self
            .call(method, None, &token)
            .await
            .and_then(|value| self.parse::<P>(method, value));
        match result {
            Ok(page) => extract(page),
            Err(e) => {
                tracing::debug!(server = %self.spec.name, method, error = %e, "optional list failed");
                Vec::new()
            }
        }
    }

    /// Render a prompt.
    pub async fn get_prompt(&self, name: &str, arguments: Value) -> Result<Value, McpError> {
        let token = CancellationToken::new();
        self.ensure_ready(&token).await?;
        if !self.advertises("prompts").await {
            return Err(McpError::new(
                FailureReason::NotSupported,
                self.spec.name.clone(),
                "prompts/get",
                Phase::Request,
                "server does not advertise prompts",
            ));
        }
        let params = json!({ "name": name, "arguments": object_or_empty(arguments) });
        self.call("prompts/get", Some(params), &token).await
    }

    /// Invoke a tool by its server-local name.
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Value,
        cancel: Option<&CancellationToken>,
    ) -> Result<ToolOutput, McpError> {
        let token = cancel.cloned().unwrap_or_default();
        let params = json!({ "name": name, "arguments": object_or_empty(arguments) });
        let result = self.call("tools/call", Some(params), &token).await?;

        if result.get("isError").and_then(Value::as_bool) == Some(true) {
            let text = ToolOutput::content_text(&result);
            let detail = if text.is_empty() {
                format!("tool '{name}' reported an error")
            } else {
                format!("tool '{name}' failed: {text}")
            };
            return Err(McpError::new(
                FailureReason::BadResponse,
                self.spec.name.clone(),
                "tools/call",
                Phase::Request,
                detail,
            ));
        }

        Ok(ToolOutput::from_result(result))
    }

    /// Reject outstanding work and stop the server. Later calls fail with
    /// `shutting_down`.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let mut state = self.state.lock().await;
        if let Some(channel) = state.channel.take() {
            state.lifecycle = LifecycleState::Stopping;
            channel.close(self.spec.timeouts.shutdown).await;
            tracing::info!(server = %self.spec.name, "MCP server shut down");
        }
        state.lifecycle = LifecycleState::Closed;
    }

    fn parse<T: DeserializeOwned>(&self, method: &str, value: Value) -> Result<T, McpError> {
        serde_json::from_value(value).map_err(|e| {
            McpError::new(
                FailureReason::BadResponse,
                self.spec.name.clone(),
                method,
                Phase::Request,
                format!("unexpected result shape: {e}"),
            )
        })
    }

    fn shutting_down(&self, action: &str) -> McpError {
        McpError::new(
            FailureReason::ShuttingDown,
            self.spec.name.clone(),
            action,
            Phase::Shutdown,
            "client is shutting down",
        )
    }
}

fn object_or_empty(arguments: Value) -> Value {
    match arguments {
        Value::Null => json!({}),
        other => other,
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
