//! Server registry: owns every configured MCP client.
//!
//! Sources and merges configuration, connects all servers concurrently and in
//! isolation, aggregates their tools and prompts into one catalog, and routes
//! calls with a single refresh-and-retry when a server has gone away.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::{join_all, BoxFuture, FutureExt, Shared};
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::sync::{broadcast, RwLock};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::catalog::{Catalog, PromptDescriptor, ToolDescriptor};
use super::channel::{ConnectorFactory, DefaultConnectorFactory};
use super::circuit::CircuitState;
use super::client::McpClient;
use super::config::{McpServersConfig, RegistryDefaults, ServerConfig, ServerSpec, TransportKind};
use super::discovery::{discover_servers, merge_sources, resolve_project_root};
use super::errors::{FailureReason, McpError, Phase};
use super::events::{EventBus, RegistryEvent, DEFAULT_EVENT_CAPACITY};
use super::framing::Framing;
use super::health::{HealthRecord, HealthStatus};
use super::lifecycle::LifecycleState;
use super::types::{
    McpPromptDefinition, McpResource, McpResourceTemplate, McpToolDefinition, ServerInfo,
    ToolOutput,
};

/// How long an unchanged configuration is trusted.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(60);

/// Suggestions offered for an unknown id.
const MAX_SUGGESTIONS: usize = 3;

type InitFuture = Shared<BoxFuture<'static, Result<(), McpError>>>;

// ─── Options ─────────────────────────────────────────────────────────────────

/// Construction-time settings for a [`Registry`].
#[derive(Debug, Clone)]
pub struct RegistryOptions {
    /// Lowest-precedence servers, shipped with the application.
    pub builtin: BTreeMap<String, ServerConfig>,
    /// Highest-precedence servers, plus optional defaults and cache TTL.
    pub explicit: McpServersConfig,
    /// Whether to read project and user config files.
    pub discovery: bool,
    pub cwd: PathBuf,
    pub user_config_dir: Option<PathBuf>,
    pub event_capacity: usize,
}

impl Default for RegistryOptions {
    fn default() -> Self {
        Self {
            builtin: BTreeMap::new(),
            explicit: McpServersConfig::default(),
            discovery: true,
            cwd: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            user_config_dir: dirs::config_dir(),
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

impl RegistryOptions {
    fn cache_ttl(&self) -> Duration {
        self.explicit
            .cache_ttl_ms
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_CACHE_TTL)
    }

    fn defaults(&self) -> RegistryDefaults {
        self.explicit.defaults.clone().unwrap_or_default()
    }
}

// ─── Summaries ───────────────────────────────────────────────────────────────

/// Everything known about one configured server.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerSummary {
    pub name: String,
    pub transport: TransportKind,
    pub target: String,
    pub enabled: bool,
    pub framing: Framing,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_framing: Option<Framing>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lifecycle: Option<LifecycleState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub circuit: Option<CircuitState>,
    pub reconnect_attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub health: Option<HealthRecord>,
    pub tool_count: usize,
    pub prompt_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocol_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_info: Option<ServerInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
}

// ─── State ───────────────────────────────────────────────────────────────────

#[derive(Default)]
struct RegistryState {
    /// Explicit servers, as amended by `add_server`/`remove_server`.
    explicit: BTreeMap<String, ServerConfig>,
    /// Names removed at runtime; excluded from discovered/built-in sources.
    removed: BTreeSet<String>,
    specs: BTreeMap<String, Arc<ServerSpec>>,
    clients: BTreeMap<String, Arc<McpClient>>,
    health: BTreeMap<String, HealthRecord>,
    catalog: Catalog,
    signature: Option<String>,
    initialized_at: Option<Instant>,
}

struct RegistryInner {
    options: RegistryOptions,
    factory: Arc<dyn ConnectorFactory>,
    events: EventBus,
    state: RwLock<RegistryState>,
    in_flight: Mutex<Option<InitFuture>>,
    shutting_down: AtomicBool,
}

/// Outcome of connecting one server.
struct Connected {
    name: String,
    client: Option<Arc<McpClient>>,
    record: HealthRecord,
    error: Option<McpError>,
    tools: Vec<McpToolDefinition>,
    prompts: Vec<McpPromptDefinition>,
}

// ─── Registry ────────────────────────────────────────────────────────────────

/// Cheaply cloneable handle to the shared registry.
#[derive(Clone)]
pub struct Registry {
    inner: Arc<RegistryInner>,
}

impl Registry {
    /// Registry over the real stdio/HTTP/SSE transports.
    pub fn new(options: RegistryOptions) -> Self {
        Self::with_factory(options, Arc::new(DefaultConnectorFactory))
    }

    pub fn with_factory(options: RegistryOptions, factory: Arc<dyn ConnectorFactory>) -> Self {
        let state = RegistryState {
            explicit: options.explicit.servers.clone(),
            ..RegistryState::default()
        };
        Self {
            inner: Arc::new(RegistryInner {
                events: EventBus::new(options.event_capacity),
                options,
                factory,
                state: RwLock::new(state),
                in_flight: Mutex::new(None),
                shutting_down: AtomicBool::new(false),
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.inner.events.subscribe()
    }

    fn ensure_running(&self, action: &str) -> Result<(), McpError> {
        if self.inner.shutting_down.load(Ordering::SeqCst) {
            return Err(McpError::new(
                FailureReason::ShuttingDown,
                "registry",
                action,
                Phase::Shutdown,
                "registry is shutting down",
            ));
        }
        Ok(())
    }

    fn project_root(&self) -> PathBuf {
        resolve_project_root(&self.inner.options.cwd)
    }

    // ─── Initialization ──────────────────────────────────────────────────

    /// Connect every configured server.
    ///
    /// A no-op when the merged configuration is unchanged and younger than the
    /// cache TTL, unless `force` is set. Concurrent callers share one run.
    pub async fn initialize(&self, force: bool) -> Result<(), McpError> {
        self.ensure_running("initialize")?;

        let run = {
            let mut slot = self.inner.in_flight.lock().unwrap_or_else(|e| e.into_inner());
            match slot.as_ref() {
                Some(run) => run.clone(),
                None => {
                    let this = self.clone();
                    let run = async move { this.run_initialize(force).await }
                        .boxed()
                        .shared();
                    *slot = Some(run.clone());
                    run
                }
            }
        };

        let result = run.clone().await;

        let mut slot = self.inner.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        if slot.as_ref().is_some_and(|current| current.ptr_eq(&run)) {
            *slot = None;
        }
        result
    }

    async fn run_initialize(&self, force: bool) -> Result<(), McpError> {
        let options = &self.inner.options;
        let root = self.project_root();
        let defaults = options.defaults();

        let (merged, previous_signature, fresh) = {
            let state = self.inner.state.read().await;
            let discovered = if options.discovery {
                discover_servers(&root, options.user_config_dir.as_deref())
            } else {
                BTreeMap::new()
            };
            let mut merged =
                merge_sources(options.builtin.clone(), discovered, state.explicit.clone());
            merged.retain(|name, _| !state.removed.contains(name));
            let fresh = state
                .initialized_at
                .is_some_and(|at| at.elapsed() < options.cache_ttl());
            (merged, state.signature.clone(), fresh)
        };

        let signature = config_signature(&merged, &defaults, &options.cwd);
        if !force && fresh && previous_signature.as_deref() == Some(signature.as_str()) {
            tracing::debug!("MCP configuration unchanged, reusing connections");
            return Ok(());
        }

        tracing::info!(servers = merged.len(), force, "initializing MCP servers");
        self.teardown_all().await;

        let mut specs = BTreeMap::new();
        let mut records = Vec::new();
        for (name, config) in &merged {
            if !config.is_enabled() {
                records.push(HealthRecord::disabled(name, config.transport_kind()));
                continue;
            }
            match ServerSpec::resolve(name, config, &defaults, &root) {
                Ok(spec) => {
                    specs.insert(name.clone(), Arc::new(spec));
                }
                Err(e) => {
                    tracing::warn!(server = %name, error = %e, "invalid MCP server config");
                    let err = McpError::new(
                        FailureReason::Unknown,
                        name.clone(),
                        "configure",
                        Phase::Startup,
                        e.to_string(),
                    );
                    records.push(HealthRecord::from_error(name, config.transport_kind(), &err));
                }
            }
        }

        // Connect concurrently; one server's failure never blocks another.
        let mut handles = Vec::new();
        for spec in specs.values() {
            let client = Arc::new(self.build_client(Arc::clone(spec)));
            handles.push((spec.name.clone(), spec.transport(), tokio::spawn(connect_server(client))));
        }
        let mut outcomes = Vec::new();
        for (name, transport, handle) in handles {
            match handle.await {
                Ok(connected) => outcomes.push(connected),
                Err(e) => {
                    let err = McpError::new(
                        FailureReason::Unknown,
                        name.clone(),
                        "connect",
                        Phase::Startup,
                        format!("connect task failed: {e}"),
                    );
                    records.push(HealthRecord::from_error(&name, transport, &err));
                }
            }
        }

        {
            let mut state = self.inner.state.write().await;
            state.specs = specs;
            for record in records {
                self.record_health(&mut state, record);
            }
            for connected in outcomes {
                self.install(&mut state, connected);
            }
            state.signature = Some(signature);
            state.initialized_at = Some(Instant::now());
            tracing::info!(
                connected = state.clients.len(),
                tools = state.catalog.total_tools(),
                "MCP registry initialized"
            );
        }
        Ok(())
    }

    fn build_client(&self, spec: Arc<ServerSpec>) -> McpClient {
        let connector = self.inner.factory.connector(&spec);
        McpClient::new(spec, connector).with_events(self.inner.events.clone())
    }

    /// Shut down every client and clear derived state.
    async fn teardown_all(&self) {
        let clients: Vec<Arc<McpClient>> = {
            let mut state = self.inner.state.write().await;
            state.catalog.clear();
            state.specs.clear();
            state.health.clear();
            std::mem::take(&mut state.clients).into_values().collect()
        };
        join_all(clients.iter().map(|c| c.shutdown())).await;
    }

    fn record_health(&self, state: &mut RegistryState, record: HealthRecord) {
        if record.is_transition_from(state.health.get(&record.name)) {
            self.inner.events.emit(RegistryEvent::HealthChanged {
                server: record.name.clone(),
                ok: record.ok,
                reason: record.reason,
                phase: record.phase,
                at: record.last_checked_at,
            });
        }
        state.health.insert(record.name.clone(), record);
    }

    fn install(&self, state: &mut RegistryState, connected: Connected) {
        let Connected {
            name,
            client,
            record,
            tools,
            prompts,
            ..
        } = connected;
        state.catalog.register_server(&name, tools, prompts);
        match client {
            Some(client) => {
                state.clients.insert(name, client);
            }
            None => {
                state.clients.remove(&name);
            }
        }
        self.record_health(state, record);
    }

    // ─── Queries ─────────────────────────────────────────────────────────

    /// Connected servers whose last health record is ok, sorted by name.
    pub async fn list_servers(&self) -> Vec<String> {
        let state = self.inner.state.read().await;
        state
            .clients
            .keys()
            .filter(|name| state.health.get(*name).is_some_and(|record| record.ok))
            .cloned()
            .collect()
    }

    pub async fn list_tools(&self) -> Vec<ToolDescriptor> {
        self.inner.state.read().await.catalog.tools()
    }

    pub async fn list_prompts(&self) -> Vec<PromptDescriptor> {
        self.inner.state.read().await.catalog.prompts()
    }

    /// Latest health record of every configured server, sorted by name.
    pub async fn health_snapshot(&self) -> Vec<HealthRecord> {
        self.inner.state.read().await.health.values().cloned().collect()
    }

    async fn client(&self, server: &str, action: &str) -> Result<Arc<McpClient>, McpError> {
        self.inner
            .state
            .read()
            .await
            .clients
            .get(server)
            .cloned()
            .ok_or_else(|| {
                McpError::new(
                    FailureReason::NotFound,
                    server,
                    action,
                    Phase::Request,
                    format!("server '{server}' is not connected"),
                )
            })
    }

    /// Re-probe every connected client and replace their health records.
    pub async fn probe_health(&self) -> Result<Vec<HealthRecord>, McpError> {
        self.ensure_running("health")?;
        let clients: Vec<Arc<McpClient>> =
            self.inner.state.read().await.clients.values().cloned().collect();

        let statuses = join_all(clients.iter().map(|c| c.health())).await;

        let mut state = self.inner.state.write().await;
        for (client, status) in clients.iter().zip(statuses) {
            let record = HealthRecord::from_status(client.name(), client.spec().transport(), status);
            self.record_health(&mut state, record);
        }
        Ok(state.health.values().cloned().collect())
    }

    /// Config summary, health, counts and server-reported identity.
    pub async fn server_info(&self, name: &str) -> Result<ServerSummary, McpError> {
        let (spec, client, health, tool_count, prompt_count) = {
            let state = self.inner.state.read().await;
            let spec = state.specs.get(name).cloned().ok_or_else(|| {
                McpError::new(
                    FailureReason::NotFound,
                    name,
                    "server_info",
                    Phase::Request,
                    format!("unknown server '{name}'"),
                )
            })?;
            (
                spec,
                state.clients.get(name).cloned(),
                state.health.get(name).cloned(),
                state.catalog.tool_count(name),
                state.catalog.prompt_count(name),
            )
        };

        let snapshot = match &client {
            Some(client) => Some(client.snapshot().await),
            None => None,
        };
        let init = snapshot.as_ref().and_then(|s| s.init.clone());

        Ok(ServerSummary {
            name: spec.name.clone(),
            transport: spec.transport(),
            target: spec.target(),
            enabled: spec.enabled,
            framing: spec.framing,
            active_framing: snapshot.as_ref().and_then(|s| s.framing),
            lifecycle: snapshot.as_ref().map(|s| s.lifecycle),
            circuit: snapshot.as_ref().map(|s| s.circuit),
            reconnect_attempts: snapshot.as_ref().map(|s| s.reconnect_attempts).unwrap_or(0),
            health,
            tool_count,
            prompt_count,
            protocol_version: init.as_ref().and_then(|i| i.protocol_version.clone()),
            server_info: init.as_ref().and_then(|i| i.server_info.clone()),
            instructions: init.and_then(|i| i.instructions),
        })
    }

    // ─── Routing ─────────────────────────────────────────────────────────

    /// Invoke a tool by catalog id.
    ///
    /// Without a token, the server's request timeout bounds the whole call,
    /// reconnects included. A crashed or unstartable server is refreshed once
    /// and the call retried, unless its circuit is open.
    pub async fn call_tool(
        &self,
        id: &str,
        arguments: Value,
        cancel: Option<&CancellationToken>,
    ) -> Result<ToolOutput, McpError> {
        self.ensure_running("tools/call")?;

        let (server, name) = {
            let state = self.inner.state.read().await;
            match state.catalog.tool(id) {
                Some(tool) => (tool.server.clone(), tool.name.clone()),
                None => {
                    return Err(unknown_id(
                        "tools/call",
                        "tool",
                        id,
                        state.catalog.similar_tools(id, MAX_SUGGESTIONS),
                    ))
                }
            }
        };
        let client = self.client(&server, "tools/call").await?;

        let token = cancel.cloned().unwrap_or_default();
        let deadline = cancel.is_none().then(|| {
            let token = token.clone();
            let after = client.spec().timeouts.request;
            tokio::spawn(async move {
                tokio::time::sleep(after).await;
                token.cancel();
            })
        });

        let result = match client.call_tool(&name, arguments.clone(), Some(&token)).await {
            Err(e) if e.reason.is_connection_loss() && !token.is_cancelled() => {
                {
                    let mut state = self.inner.state.write().await;
                    let record = HealthRecord::from_error(&server, client.spec().transport(), &e);
                    self.record_health(&mut state, record);
                }
                // An open circuit fails fast; a refresh would not wait for its reset.
                if client.snapshot().await.circuit != CircuitState::Closed {
                    tracing::warn!(server = %server, tool = %name, error = %e, "circuit open, not refreshing");
                    Err(e)
                } else {
                    tracing::warn!(server = %server, tool = %name, error = %e, "server lost during call, refreshing");
                    match self.refresh(&server, &token).await {
                        Ok(()) => client.call_tool(&name, arguments, Some(&token)).await,
                        Err(refresh_err) if refresh_err.is_cancelled() => Err(refresh_err),
                        Err(refresh_err) => {
                            tracing::warn!(server = %server, error = %refresh_err, "refresh failed");
                            Err(e)
                        }
                    }
                }
            }
            other => other,
        };

        if let Some(handle) = deadline {
            handle.abort();
        }
        result
    }

    /// Render a prompt by catalog id.
    pub async fn get_prompt(&self, id: &str, arguments: Value) -> Result<Value, McpError> {
        self.ensure_running("prompts/get")?;
        let (server, name) = {
            let state = self.inner.state.read().await;
            match state.catalog.prompt(id) {
                Some(prompt) => (prompt.server.clone(), prompt.name.clone()),
                None => {
                    return Err(unknown_id(
                        "prompts/get",
                        "prompt",
                        id,
                        state.catalog.similar_prompts(id, MAX_SUGGESTIONS),
                    ))
                }
            }
        };
        self.client(&server, "prompts/get")
            .await?
            .get_prompt(&name, arguments)
            .await
    }

    /// Resources of one connected server; empty when it has none.
    pub async fn list_resources(&self, server: &str) -> Result<Vec<McpResource>, McpError> {
        self.ensure_running("resources/list")?;
        Ok(self.client(server, "resources/list").await?.list_resources().await)
    }

    pub async fn list_resource_templates(
        &self,
        server: &str,
    ) -> Result<Vec<McpResourceTemplate>, McpError> {
        self.ensure_running("resources/templates/list")?;
        Ok(self
            .client(server, "resources/templates/list")
            .await?
            .list_templates()
            .await)
    }

    // ─── Mutation ────────────────────────────────────────────────────────

    /// Drop one server's connection and catalog entries, then reconnect it
    /// from the same spec.
    ///
    /// A server that has a client keeps it, so its circuit breaker carries
    /// over: an open circuit fails the refresh without spawning anything.
    pub async fn refresh_server(&self, name: &str) -> Result<(), McpError> {
        self.ensure_running("refresh")?;
        self.refresh(name, &CancellationToken::new()).await
    }

    async fn refresh(&self, name: &str, cancel: &CancellationToken) -> Result<(), McpError> {
        let (spec, existing) = {
            let mut state = self.inner.state.write().await;
            let spec = state.specs.get(name).cloned().ok_or_else(|| {
                McpError::new(
                    FailureReason::NotFound,
                    name,
                    "refresh",
                    Phase::Startup,
                    format!("unknown server '{name}'"),
                )
            })?;
            state.catalog.unregister_server(name);
            (spec, state.clients.get(name).cloned())
        };

        tracing::info!(server = %name, "refreshing MCP server");
        let connected = match existing {
            Some(client) => reconnect_server(client, cancel).await,
            None => connect_server(Arc::new(self.build_client(spec))).await,
        };
        self.install_outcome(connected).await
    }

    async fn connect_and_install(&self, spec: Arc<ServerSpec>) -> Result<(), McpError> {
        let connected = connect_server(Arc::new(self.build_client(spec))).await;
        self.install_outcome(connected).await
    }

    async fn install_outcome(&self, connected: Connected) -> Result<(), McpError> {
        let error = connected.error.clone();
        let mut state = self.inner.state.write().await;
        self.install(&mut state, connected);
        match error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Insert or replace an explicit server config and connect it.
    pub async fn add_server(&self, name: &str, config: ServerConfig) -> Result<(), McpError> {
        self.ensure_running("add_server")?;
        let defaults = self.inner.options.defaults();
        let resolved = ServerSpec::resolve(name, &config, &defaults, &self.project_root());

        let old = {
            let mut state = self.inner.state.write().await;
            state.explicit.insert(name.to_string(), config.clone());
            state.removed.remove(name);
            state.catalog.unregister_server(name);
            state.specs.remove(name);
            state.clients.remove(name)
        };
        if let Some(old) = old {
            old.shutdown().await;
        }

        let spec = match resolved {
            Ok(spec) => Arc::new(spec),
            Err(e) => {
                let err = McpError::new(
                    FailureReason::Unknown,
                    name,
                    "configure",
                    Phase::Startup,
                    e.to_string(),
                );
                let mut state = self.inner.state.write().await;
                let record = HealthRecord::from_error(name, config.transport_kind(), &err);
                self.record_health(&mut state, record);
                return Err(err);
            }
        };

        if !spec.enabled {
            let mut state = self.inner.state.write().await;
            state.specs.insert(name.to_string(), spec);
            let record = HealthRecord::disabled(name, config.transport_kind());
            self.record_health(&mut state, record);
            return Ok(());
        }

        self.inner
            .state
            .write()
            .await
            .specs
            .insert(name.to_string(), Arc::clone(&spec));
        tracing::info!(server = %name, "adding MCP server");
        self.connect_and_install(spec).await
    }

    /// Disconnect a server and forget its configuration and health.
    pub async fn remove_server(&self, name: &str) -> Result<(), McpError> {
        self.ensure_running("remove_server")?;
        let old = {
            let mut state = self.inner.state.write().await;
            let known = state.specs.remove(name).is_some()
                | state.health.remove(name).is_some()
                | state.explicit.remove(name).is_some();
            if !known {
                return Err(McpError::new(
                    FailureReason::NotFound,
                    name,
                    "remove_server",
                    Phase::Shutdown,
                    format!("unknown server '{name}'"),
                ));
            }
            state.removed.insert(name.to_string());
            state.catalog.unregister_server(name);
            state.clients.remove(name)
        };
        if let Some(old) = old {
            old.shutdown().await;
        }
        tracing::info!(server = %name, "removed MCP server");
        Ok(())
    }

    /// Stop every server. Later calls fail with `shutting_down`.
    pub async fn shutdown(&self) {
        if self.inner.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let clients: Vec<Arc<McpClient>> = {
            let mut state = self.inner.state.write().await;
            state.catalog.clear();
            state.specs.clear();
            state.health.clear();
            state.signature = None;
            state.initialized_at = None;
            std::mem::take(&mut state.clients).into_values().collect()
        };
        tracing::info!(servers = clients.len(), "shutting down MCP servers");
        join_all(clients.iter().map(|c| c.shutdown())).await;
    }
}

// ─── Helpers ─────────────────────────────────────────────────────────────────

/// Health probe, then tool and prompt discovery, for one fresh client.
///
/// A client that fails either step is shut down and left out.
async fn connect_server(client: Arc<McpClient>) -> Connected {
    let name = client.name().to_string();
    let transport = client.spec().transport();

    let status = client.health().await;
    if !status.ok {
        let error = status_error(&name, &status);
        tracing::warn!(server = %name, error = %error, "MCP server failed health check");
        client.shutdown().await;
        return Connected {
            record: HealthRecord::from_status(&name, transport, status),
            name,
            client: None,
            error: Some(error),
            tools: Vec::new(),
            prompts: Vec::new(),
        };
    }

    match list_catalog(&client).await {
        Ok((tools, prompts)) => Connected {
            record: HealthRecord::from_status(&name, transport, status),
            name,
            client: Some(client),
            error: None,
            tools,
            prompts,
        },
        Err(e) => {
            tracing::warn!(server = %name, error = %e, "tools/list failed, dropping server");
            client.shutdown().await;
            Connected {
                record: HealthRecord::from_error(&name, transport, &e),
                name,
                client: None,
                error: Some(e),
                tools: Vec::new(),
                prompts: Vec::new(),
            }
        }
    }
}

/// Reconnect an existing client, then rediscover its tools and prompts.
///
/// The client is kept on failure so its reconnect history survives.
async fn reconnect_server(client: Arc<McpClient>, cancel: &CancellationToken) -> Connected {
    let name = client.name().to_string();
    let transport = client.spec().transport();

    let outcome = match client.reconnect(cancel).await {
        Ok(()) => {
            let status = client.health().await;
            if status.ok {
                list_catalog(&client).await.map(|listed| (status, listed))
            } else {
                Err(status_error(&name, &status))
            }
        }
        Err(e) => Err(e),
    };

    match outcome {
        Ok((status, (tools, prompts))) => Connected {
            record: HealthRecord::from_status(&name, transport, status),
            name,
            client: Some(client),
            error: None,
            tools,
            prompts,
        },
        Err(e) => {
            tracing::warn!(server = %name, error = %e, "MCP server reconnect failed");
            Connected {
                record: HealthRecord::from_error(&name, transport, &e),
                name,
                client: Some(client),
                error: Some(e),
                tools: Vec::new(),
                prompts: Vec::new(),
            }
        }
    }
}

async fn list_catalog(
    client: &McpClient,
) -> Result<(Vec<McpToolDefinition>, Vec<McpPromptDefinition>), McpError> {
    let tools = client.list_tools().await?;
    let prompts = client.list_prompts().await;
    tracing::info!(
        server = %client.name(),
        tools = tools.len(),
        prompts = prompts.len(),
        "MCP server connected"
    );
    Ok((tools, prompts))
}

fn status_error(server: &str, status: &HealthStatus) -> McpError {
    McpError::new(
        status.reason.unwrap_or(FailureReason::Unknown),
        server,
        "health",
        status.phase.unwrap_or(Phase::Startup),
        status.error.clone().unwrap_or_default(),
    )
}

fn unknown_id(action: &str, kind: &str, id: &str, suggestions: Vec<String>) -> McpError {
    let mut detail = format!("unknown {kind} id '{id}'");
    if !suggestions.is_empty() {
        detail.push_str(&format!("; did you mean: {}", suggestions.join(", ")));
    }
    McpError::new(FailureReason::NotFound, "registry", action, Phase::Request, detail)
}

/// SHA-256 over the merged servers, defaults, and working directory.
fn config_signature(
    servers: &BTreeMap<String, ServerConfig>,
    defaults: &RegistryDefaults,
    cwd: &Path,
) -> String {
    let document = serde_json::json!({
        "servers": servers,
        "defaults": defaults,
        "cwd": cwd.to_string_lossy(),
    });
    let hash = Sha256::digest(document.to_string().as_bytes());
    format!("{hash:x}")
}

// ─── Tests ───────────────────────────────────────────────────────────────────
