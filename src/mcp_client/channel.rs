//! Connector and channel seams.
//!
//! A [`Connector`] knows how to reach one server; each call to
//! [`Connector::connect`] yields a fresh [`RpcChannel`] (for stdio, a fresh
//! process). The client drives handshakes, health, and reconnection purely
//! through these traits, which is also how tests substitute scripted servers.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::config::{Endpoint, ServerSpec};
use super::errors::{FailureReason, McpError, Phase};
use super::framing::Framing;
use super::http::HttpConnector;
use super::pending::WaitOutcome;
use super::sse::SseConnector;
use super::transport::StdioConnector;

/// A live JSON-RPC connection to one server.
#[async_trait]
pub trait RpcChannel: Send + Sync {
    /// Send a request and wait for its response, the deadline, or `cancel`.
    async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Value, McpError>;

    /// Fire-and-forget notification.
    async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), McpError>;

    fn is_alive(&self) -> bool;

    /// Outgoing framing, for byte-stream channels.
    fn framing(&self) -> Option<Framing> {
        None
    }

    /// Recent stderr output, for process-backed channels.
    fn stderr_tail(&self) -> Option<String> {
        None
    }

    /// Reject outstanding requests and release the connection. A process is
    /// given `grace` to exit before it is killed.
    async fn close(&self, grace: Duration);
}

/// Opens channels to one configured server.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, framing: Framing) -> Result<Arc<dyn RpcChannel>, McpError>;

    /// Whether `auto` framing must be negotiated across connection attempts.
    fn negotiates_framing(&self) -> bool {
        false
    }
}

/// Builds a connector for a resolved server spec.
pub trait ConnectorFactory: Send + Sync {
    fn connector(&self, spec: &ServerSpec) -> Arc<dyn Connector>;
}

/// Real transports: stdio processes, HTTP, and SSE.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultConnectorFactory;

impl ConnectorFactory for DefaultConnectorFactory {
    fn connector(&self, spec: &ServerSpec) -> Arc<dyn Connector> {
        match &spec.endpoint {
            Endpoint::Stdio { .. } => Arc::new(StdioConnector::new(spec.clone())),
            Endpoint::Http { .. } => Arc::new(HttpConnector::new(spec.clone())),
            Endpoint::Sse { .. } => Arc::new(SseConnector::new(spec.clone())),
        }
    }
}

// ─── Shared Helpers ──────────────────────────────────────────────────────────

/// Params for `notifications/cancelled`.
pub fn cancel_params(request_id: u64, reason: &str) -> Value {
    serde_json::json!({ "requestId": request_id, "reason": reason })
}

/// Turn a pending-call outcome into the caller-facing result.
///
/// Returns the cancellation reason to report to the server alongside the
/// error when the request was abandoned.
pub fn resolve_wait(
    server: &str,
    method: &str,
    timeout: Duration,
    outcome: WaitOutcome,
) -> (Result<Value, McpError>, Option<&'static str>) {
    match outcome {
        WaitOutcome::Settled(result) => (result, None),
        WaitOutcome::TimedOut => (
            Err(McpError::new(
                FailureReason::Timeout,
                server,
                method,
                Phase::Request,
                format!("no response after {}ms", timeout.as_millis()),
            )),
            Some("timeout"),
        ),
        WaitOutcome::Cancelled => (Err(McpError::cancelled(server, method)), Some("cancelled")),
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
