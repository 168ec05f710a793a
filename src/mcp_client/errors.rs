//! MCP Client error types.
//!
//! Every failure surfaced by a transport client or the registry is an
//! [`McpError`]: one tagged type with a fixed field set. The `reason` code is
//! what callers branch on (retry, reconfigure, give up); the remaining fields
//! carry the context needed to build a meaningful log entry.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::types::{error_codes, JsonRpcError};

// ─── Reason Codes ───────────────────────────────────────────────────────────

/// Failure classification shared by every transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// Executable missing, not runnable, or endpoint refused authorization.
    SpawnFailed,
    /// Startup, request, or cancellation-induced deadline.
    Timeout,
    /// Malformed frame, unparseable payload, or application-level tool error.
    BadResponse,
    /// Unexpected process exit, lost connection, or open circuit.
    ServerCrash,
    /// Unknown tool, prompt, or server id.
    NotFound,
    /// Optional capability missing on the server.
    NotSupported,
    /// The registry or client is shutting down.
    ShuttingDown,
    /// Classification fallback.
    Unknown,
}

impl FailureReason {
    /// Stable snake_case code, as used on the wire and in logs.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SpawnFailed => "spawn_failed",
            Self::Timeout => "timeout",
            Self::BadResponse => "bad_response",
            Self::ServerCrash => "server_crash",
            Self::NotFound => "not_found",
            Self::NotSupported => "not_supported",
            Self::ShuttingDown => "shutting_down",
            Self::Unknown => "unknown",
        }
    }

    /// The server process died or could not be started.
    ///
    /// These are the failures the registry answers with a refresh-and-retry.
    pub fn is_connection_loss(self) -> bool {
        matches!(self, Self::ServerCrash | Self::SpawnFailed)
    }

    /// The peer answered, but not in a way we understood.
    ///
    /// Used by the `auto` health probe to decide whether `tools/list` is worth
    /// trying after a failed `ping`.
    pub fn is_protocol_level(self) -> bool {
        matches!(self, Self::BadResponse | Self::NotSupported | Self::Unknown)
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─── Phases ─────────────────────────────────────────────────────────────────

/// Where in a connection's life an error occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Startup,
    Initialize,
    Request,
    Shutdown,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Startup => "startup",
            Self::Initialize => "initialize",
            Self::Request => "request",
            Self::Shutdown => "shutdown",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─── McpError ───────────────────────────────────────────────────────────────

/// Errors that can occur during MCP client and registry operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("[{reason}] server '{server}' {action} ({phase}): {detail}{}", stderr_suffix(.stderr))]
pub struct McpError {
    pub reason: FailureReason,
    /// Server name, or empty when the failure is not tied to one server.
    pub server: String,
    /// The operation or JSON-RPC method that failed.
    pub action: String,
    pub phase: Phase,
    pub detail: String,
    /// Tail of the server's stderr, when one was captured.
    pub stderr: Option<String>,
}

impl McpError {
    pub fn new(
        reason: FailureReason,
        server: impl Into<String>,
        action: impl Into<String>,
        phase: Phase,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            reason,
            server: server.into(),
            action: action.into(),
            phase,
            detail: detail.into(),
            stderr: None,
        }
    }

    /// Attach a captured stderr snippet. Empty snippets are ignored.
    pub fn with_stderr(mut self, stderr: Option<String>) -> Self {
        self.stderr = stderr.filter(|s| !s.trim().is_empty());
        self
    }

    /// Re-tag the phase (e.g. a request error raised during the handshake).
    pub fn in_phase(mut self, phase: Phase) -> Self {
        self.phase = phase;
        self
    }

    /// Translate a JSON-RPC error object returned by a server.
    pub fn from_rpc_error(server: &str, method: &str, phase: Phase, err: &JsonRpcError) -> Self {
        let reason = if err.code == error_codes::METHOD_NOT_FOUND {
            FailureReason::NotSupported
        } else {
            FailureReason::BadResponse
        };
        Self::new(
            reason,
            server,
            method,
            phase,
            format!("server error [{}]: {}", err.code, err.message),
        )
    }

    /// Shorthand for the cancellation failure.
    pub fn cancelled(server: &str, method: &str) -> Self {
        Self::new(
            FailureReason::Timeout,
            server,
            method,
            Phase::Request,
            "cancelled",
        )
    }

    pub fn is_cancelled(&self) -> bool {
        self.reason == FailureReason::Timeout && self.detail == "cancelled"
    }
}

fn stderr_suffix(stderr: &Option<String>) -> String {
    match stderr {
        Some(s) => format!(" | stderr: {}", s.trim()),
        None => String::new(),
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_includes_context() {
        let err = McpError::new(
            FailureReason::ServerCrash,
            "filesystem",
            "tools/call",
            Phase::Request,
            "process exited with status 1",
        );
        let text = err.to_string();
        assert!(text.contains("server_crash"));
        assert!(text.contains("filesystem"));
        assert!(text.contains("tools/call"));
        assert!(text.contains("request"));
        assert!(!text.contains("stderr"));
    }

    #[test]
    fn test_with_stderr_suffix() {
        let err = McpError::new(
            FailureReason::SpawnFailed,
            "git",
            "spawn",
            Phase::Startup,
            "not found",
        )
        .with_stderr(Some("boom\n".into()));
        assert!(err.to_string().ends_with("| stderr: boom"));

        let blank = err.clone().with_stderr(Some("   ".into()));
        assert!(blank.stderr.is_none());
    }

    #[test]
    fn test_from_rpc_error_method_not_found() {
        let rpc = JsonRpcError {
            code: error_codes::METHOD_NOT_FOUND,
            message: "Method not found".into(),
            data: None,
        };
        let err = McpError::from_rpc_error("s", "prompts/get", Phase::Request, &rpc);
        assert_eq!(err.reason, FailureReason::NotSupported);

        let rpc = JsonRpcError {
            code: error_codes::INTERNAL_ERROR,
            message: "kaboom".into(),
            data: None,
        };
        let err = McpError::from_rpc_error("s", "tools/call", Phase::Request, &rpc);
        assert_eq!(err.reason, FailureReason::BadResponse);
        assert!(err.detail.contains("-32603"));
    }

    #[test]
    fn test_reason_predicates() {
        assert!(FailureReason::ServerCrash.is_connection_loss());
        assert!(FailureReason::SpawnFailed.is_connection_loss());
        assert!(!FailureReason::Timeout.is_connection_loss());
        assert!(FailureReason::BadResponse.is_protocol_level());
        assert!(!FailureReason::Timeout.is_protocol_level());
        assert!(!FailureReason::ServerCrash.is_protocol_level());
    }

    #[test]
    fn test_reason_serializes_snake_case() {
        let json = serde_json::to_string(&FailureReason::ShuttingDown).unwrap();
        assert_eq!(json, "\"shutting_down\"");
    }

    #[test]
    fn test_cancelled() {
        let err = McpError::cancelled("s", "tools/call");
        assert!(err.is_cancelled());
        assert_eq!(err.reason, FailureReason::Timeout);
    }
}
