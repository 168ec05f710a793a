//! Server configuration.
//!
//! [`ServerConfig`] is the shape written in config files: every field is
//! optional so registry-wide [`RegistryDefaults`] can fill the gaps.
//! [`ServerSpec::resolve`] validates the merged result into the immutable
//! spec a client is built from.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use super::framing::{FrameLimits, Framing, DEFAULT_MAX_BUFFER_BYTES, DEFAULT_MAX_FRAME_BYTES};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Timeout for spawn + initialize handshake.
///
/// Generous because some servers import large frameworks at startup.
pub const DEFAULT_STARTUP_TIMEOUT_MS: u64 = 30_000;

/// Default per-request timeout.
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;

/// Grace period before a stopping process is force-killed.
pub const DEFAULT_SHUTDOWN_TIMEOUT_MS: u64 = 5_000;

/// Failed reconnects before the circuit opens.
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 3;

/// How long an open circuit stays open.
pub const DEFAULT_CIRCUIT_RESET_MS: u64 = 60_000;

// ─── Errors ──────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid config for server '{server}': {reason}")]
    Invalid { server: String, reason: String },
}

// ─── Enums ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    #[default]
    Stdio,
    #[serde(alias = "streamable-http", alias = "streamableHttp")]
    Http,
    Sse,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Stdio => "stdio",
            Self::Http => "http",
            Self::Sse => "sse",
        })
    }
}

/// Probe used by `health()`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthCheckMethod {
    /// `ping`, falling back to `tools/list` on protocol-level failures.
    #[default]
    Auto,
    Ping,
    #[serde(alias = "tools/list", alias = "tools-list")]
    ToolsList,
}

// ─── File Shapes ─────────────────────────────────────────────────────────────

/// One server entry as written in a config file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    #[serde(default, rename = "type", alias = "transport", skip_serializing_if = "Option::is_none")]
    pub transport: Option<TransportKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub framing: Option<Framing>,
    #[serde(default, alias = "startup_timeout_ms", skip_serializing_if = "Option::is_none")]
    pub startup_timeout_ms: Option<u64>,
    #[serde(default, alias = "request_timeout_ms", skip_serializing_if = "Option::is_none")]
    pub request_timeout_ms: Option<u64>,
    #[serde(default, alias = "shutdown_timeout_ms", skip_serializing_if = "Option::is_none")]
    pub shutdown_timeout_ms: Option<u64>,
    #[serde(default, alias = "health_check_method", skip_serializing_if = "Option::is_none")]
    pub health_check_method: Option<HealthCheckMethod>,
    #[serde(default, alias = "max_reconnect_attempts", skip_serializing_if = "Option::is_none")]
    pub max_reconnect_attempts: Option<u32>,
    #[serde(default, alias = "circuit_reset_ms", skip_serializing_if = "Option::is_none")]
    pub circuit_reset_ms: Option<u64>,
    #[serde(default, alias = "max_frame_bytes", skip_serializing_if = "Option::is_none")]
    pub max_frame_bytes: Option<usize>,
    #[serde(default, alias = "max_buffer_bytes", skip_serializing_if = "Option::is_none")]
    pub max_buffer_bytes: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
}

/// Registry-wide defaults merged into every server's config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RegistryDefaults {
    pub framing: Framing,
    pub startup_timeout_ms: u64,
    pub request_timeout_ms: u64,
    pub shutdown_timeout_ms: u64,
    pub health_check_method: HealthCheckMethod,
    pub max_reconnect_attempts: u32,
    pub circuit_reset_ms: u64,
    pub max_frame_bytes: usize,
    pub max_buffer_bytes: usize,
}

impl Default for RegistryDefaults {
    fn default() -> Self {
        Self {
            framing: Framing::Auto,
            startup_timeout_ms: DEFAULT_STARTUP_TIMEOUT_MS,
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            shutdown_timeout_ms: DEFAULT_SHUTDOWN_TIMEOUT_MS,
            health_check_method: HealthCheckMethod::Auto,
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            circuit_reset_ms: DEFAULT_CIRCUIT_RESET_MS,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            max_buffer_bytes: DEFAULT_MAX_BUFFER_BYTES,
        }
    }
}

/// A config document: `{"servers": {...}}` or `{"mcpServers": {...}}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct McpServersConfig {
    #[serde(default, alias = "mcpServers")]
    pub servers: BTreeMap<String, ServerConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub defaults: Option<RegistryDefaults>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_ttl_ms: Option<u64>,
}

impl ServerConfig {
    /// Stdio server shorthand.
    pub fn stdio(command: &str, args: &[&str]) -> Self {
        Self {
            transport: Some(TransportKind::Stdio),
            command: Some(command.to_string()),
            args: args.iter().map(|a| a.to_string()).collect(),
            ..Self::default()
        }
    }

    /// The transport this entry will use. A `url` with no `command` means http.
    pub fn transport_kind(&self) -> TransportKind {
        match self.transport {
            Some(kind) => kind,
            None if self.url.is_some() && self.command.is_none() => TransportKind::Http,
            None => TransportKind::Stdio,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.unwrap_or(true)
    }

    /// Fill unset fields from `defaults`. Server-specific values win.
    pub fn with_defaults(&self, defaults: &RegistryDefaults) -> ServerConfig {
        let mut merged = self.clone();
        merged.transport = Some(self.transport_kind());
        merged.framing = merged.framing.or(Some(defaults.framing));
        merged.startup_timeout_ms = merged.startup_timeout_ms.or(Some(defaults.startup_timeout_ms));
        merged.request_timeout_ms = merged.request_timeout_ms.or(Some(defaults.request_timeout_ms));
        merged.shutdown_timeout_ms = merged.shutdown_timeout_ms.or(Some(defaults.shutdown_timeout_ms));
        merged.health_check_method = merged.health_check_method.or(Some(defaults.health_check_method));
        merged.max_reconnect_attempts = merged.max_reconnect_attempts.or(Some(defaults.max_reconnect_attempts));
        merged.circuit_reset_ms = merged.circuit_reset_ms.or(Some(defaults.circuit_reset_ms));
        merged.max_frame_bytes = merged.max_frame_bytes.or(Some(defaults.max_frame_bytes));
        merged.max_buffer_bytes = merged.max_buffer_bytes.or(Some(defaults.max_buffer_bytes));
        merged
    }
}

// ─── Resolved Spec ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Stdio {
        command: String,
        args: Vec<String>,
        env: BTreeMap<String, String>,
        cwd: Option<PathBuf>,
    },
    Http {
        url: String,
        headers: BTreeMap<String, String>,
    },
    Sse {
        url: String,
        headers: BTreeMap<String, String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub startup: Duration,
    pub request: Duration,
    pub shutdown: Duration,
}

/// Validated, immutable configuration for one client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerSpec {
    pub name: String,
    pub endpoint: Endpoint,
    pub framing: Framing,
    pub timeouts: Timeouts,
    pub health_check: HealthCheckMethod,
    pub max_reconnect_attempts: u32,
    pub circuit_reset: Duration,
    pub limits: FrameLimits,
    pub enabled: bool,
}

impl ServerSpec {
    /// Merge `defaults` into `config` and validate the result.
    ///
    /// A relative `cwd` is resolved against `base_dir`.
    pub fn resolve(
        name: &str,
        config: &ServerConfig,
        defaults: &RegistryDefaults,
        base_dir: &Path,
    ) -> Result<Self, ConfigError> {
        let merged = config.with_defaults(defaults);
        let invalid = |reason: &str| ConfigError::Invalid {
            server: name.to_string(),
            reason: reason.to_string(),
        };

        let endpoint = match merged.transport_kind() {
            TransportKind::Stdio => {
                let command = merged
                    .command
                    .clone()
                    .filter(|c| !c.trim().is_empty())
                    .ok_or_else(|| invalid("stdio server requires a command"))?;
                let cwd = merged.cwd.as_deref().map(|dir| {
                    let dir = Path::new(dir);
                    if dir.is_absolute() {
                        dir.to_path_buf()
                    } else {
                        base_dir.join(dir)
                    }
                });
                Endpoint::Stdio {
                    command,
                    args: merged.args.clone(),
                    env: merged.env.clone(),
                    cwd,
                }
            }
            kind @ (TransportKind::Http | TransportKind::Sse) => {
                let url = merged
                    .url
                    .clone()
                    .filter(|u| !u.trim().is_empty())
                    .ok_or_else(|| invalid(&format!("{kind} server requires a url")))?;
                if !(url.starts_with("http://") || url.starts_with("https://")) {
                    return Err(invalid(&format!("unsupported url scheme: {url}")));
                }
                let headers = merged.headers.clone();
                if kind == TransportKind::Http {
                    Endpoint::Http { url, headers }
                } else {
                    Endpoint::Sse { url, headers }
                }
            }
        };

        let limits = FrameLimits {
            max_frame_bytes: merged.max_frame_bytes.unwrap_or(defaults.max_frame_bytes),
            max_buffer_bytes: merged.max_buffer_bytes.unwrap_or(defaults.max_buffer_bytes),
        };
        if limits.max_frame_bytes == 0 || limits.max_buffer_bytes < limits.max_frame_bytes {
            return Err(invalid("maxBufferBytes must be at least maxFrameBytes, both non-zero"));
        }

        let ms = |v: Option<u64>, fallback: u64| Duration::from_millis(v.unwrap_or(fallback));

        Ok(Self {
            name: name.to_string(),
            endpoint,
            framing: merged.framing.unwrap_or(defaults.framing),
            timeouts: Timeouts {
                startup: ms(merged.startup_timeout_ms, defaults.startup_timeout_ms),
                request: ms(merged.request_timeout_ms, defaults.request_timeout_ms),
                shutdown: ms(merged.shutdown_timeout_ms, defaults.shutdown_timeout_ms),
            },
            health_check: merged
                .health_check_method
                .unwrap_or(defaults.health_check_method),
            max_reconnect_attempts: merged
                .max_reconnect_attempts
                .unwrap_or(defaults.max_reconnect_attempts),
            circuit_reset: ms(merged.circuit_reset_ms, defaults.circuit_reset_ms),
            limits,
            enabled: merged.is_enabled(),
        })
    }

    pub fn transport(&self) -> TransportKind {
        match self.endpoint {
            Endpoint::Stdio { .. } => TransportKind::Stdio,
            Endpoint::Http { .. } => TransportKind::Http,
            Endpoint::Sse { .. } => TransportKind::Sse,
        }
    }

    /// Command line or URL, for summaries and logs.
    pub fn target(&self) -> String {
        match &self.endpoint {
            Endpoint::Stdio { command, args, .. } if args.is_empty() => command.clone(),
            Endpoint::Stdio { command, args, .. } => format!("{command} {}", args.join(" ")),
            Endpoint::Http { url, .. } | Endpoint::Sse { url, .. } => url.clone(),
        }
    }
}

// ─── Loading ─────────────────────────────────────────────────────────────────

/// Read a JSON config document, interpolating `${VAR}` in string values.
pub fn load_config_file(path: &Path) -> Result<McpServersConfig, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_config(&content).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Parse a config document from a string.
pub fn parse_config(content: &str) -> Result<McpServersConfig, serde_json::Error> {
    let mut value: Value = serde_json::from_str(content)?;
    interpolate_value(&mut value);
    serde_json::from_value(value)
}

fn interpolate_value(value: &mut Value) {
    match value {
        Value::String(s) if s.contains("${") => *s = interpolate_env_vars(s),
        Value::Array(items) => items.iter_mut().for_each(interpolate_value),
        Value::Object(map) => map.values_mut().for_each(interpolate_value),
        _ => {}
    }
}

/// Replace `${VAR}` and `${VAR:-default}` with environment values.
///
/// Unset variables without a default become empty strings.
pub fn interpolate_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && chars.peek() == Some(&'{') {
            chars.next();
            let mut expr = String::new();
            let mut closed = false;
            for c in chars.by_ref() {
                if c == '}' {
                    closed = true;
                    break;
                }
                expr.push(c);
            }
            if closed {
                result.push_str(&resolve_var_expr(&expr));
            } else {
                // Unterminated: keep the text as written.
                result.push_str("${");
                result.push_str(&expr);
            }
        } else {
            result.push(ch);
        }
    }

    result
}

fn resolve_var_expr(expr: &str) -> String {
    match expr.split_once(":-") {
        Some((name, default)) => std::env::var(name).unwrap_or_else(|_| expand_tilde(default)),
        None => std::env::var(expr).unwrap_or_default(),
    }
}

/// Expand a leading `~` to the user's home directory.
pub fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix('~') {
        if let Some(home) = dirs::home_dir() {
            return format!("{}{rest}", home.display());
        }
    }
    path.to_string()
}

// ─── Tests ───────────────────────────────────────────────────────────────────
