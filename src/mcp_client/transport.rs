//! JSON-RPC over stdio transport.
//!
//! Handles low-level communication with MCP server child processes:
//! - Writing framed JSON-RPC messages to stdin
//! - A reader task that decodes stdout and settles pending requests
//! - Answering server-initiated requests (`ping`)
//! - Rejecting every pending request when the process goes away

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::channel::{cancel_params, resolve_wait, Connector, RpcChannel};
use super::config::{Endpoint, ServerSpec};
use super::errors::{FailureReason, McpError, Phase};
use super::framing::{encode_message, FrameDecoder, FrameLimits, Framing, FramingError};
use super::lifecycle::{capture_stderr, spawn_process, ProcessHandle, StderrRing};
use super::pending::PendingTable;
use super::types::{error_codes, Incoming, JsonRpcNotification, JsonRpcReply, JsonRpcRequest};

/// Read buffer size for stdout.
const READ_CHUNK_BYTES: usize = 16 * 1024;

/// How long to wait for an exit status after stdout closes.
const EXIT_SETTLE: Duration = Duration::from_millis(250);

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

// ─── Connector ───────────────────────────────────────────────────────────────

/// Spawns a fresh server process per connection.
pub struct StdioConnector {
    spec: ServerSpec,
}

impl StdioConnector {
    pub fn new(spec: ServerSpec) -> Self {
        Self { spec }
    }
}

#[async_trait]
impl Connector for StdioConnector {
    async fn connect(&self, framing: Framing) -> Result<Arc<dyn RpcChannel>, McpError> {
        let Endpoint::Stdio {
            command,
            args,
            env,
            cwd,
        } = &self.spec.endpoint
        else {
            return Err(McpError::new(
                FailureReason::Unknown,
                self.spec.name.clone(),
                "spawn",
                Phase::Startup,
                "not a stdio endpoint",
            ));
        };

        let name = self.spec.name.as_str();
        let spawned = spawn_process(name, command, args, env, cwd.as_ref())?;

        let stderr = Arc::new(StderrRing::default());
        if let Some(pipe) = spawned.stderr {
            capture_stderr(name, pipe, Arc::clone(&stderr));
        }
        let process = ProcessHandle::supervise(name, spawned.child);

        let wire = WireConfig {
            outgoing: framing,
            incoming: self.spec.framing,
            limits: self.spec.limits,
        };
        let transport = StdioTransport::start(
            name,
            wire,
            spawned.stdout,
            spawned.stdin,
            Some(process),
            stderr,
        );
        Ok(transport)
    }

    fn negotiates_framing(&self) -> bool {
        true
    }
}

// ─── Transport ───────────────────────────────────────────────────────────────

/// Framing used in each direction.
#[derive(Debug, Clone, Copy)]
pub struct WireConfig {
    /// Framing for what we write. `Auto` writes length-prefixed.
    pub outgoing: Framing,
    /// Framing the decoder expects. `Auto` detects per frame.
    pub incoming: Framing,
    pub limits: FrameLimits,
}

/// Bi-directional JSON-RPC transport over a byte stream pair.
pub struct StdioTransport {
    inner: Arc<Inner>,
    reader_task: JoinHandle<()>,
}

struct Inner {
    server: String,
    outgoing: Framing,
    writer: Mutex<Option<BoxedWriter>>,
    pending: Arc<PendingTable>,
    stderr: Arc<StderrRing>,
    process: Option<ProcessHandle>,
    alive: AtomicBool,
    malformed: AtomicBool,
    closing: AtomicBool,
}

impl StdioTransport {
    /// Start the reader (and, with a process, the exit supervisor) over
    /// `reader`/`writer`.
    pub fn start<R, W>(
        server: &str,
        wire: WireConfig,
        reader: R,
        writer: W,
        process: Option<ProcessHandle>,
        stderr: Arc<StderrRing>,
    ) -> Arc<Self>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let inner = Arc::new(Inner {
            server: server.to_string(),
            outgoing: wire.outgoing,
            writer: Mutex::new(Some(Box::new(writer))),
            pending: PendingTable::new(server),
            stderr,
            process,
            alive: AtomicBool::new(true),
            malformed: AtomicBool::new(false),
            closing: AtomicBool::new(false),
        });

        let decoder = FrameDecoder::new(wire.incoming, wire.limits);
        let reader_task = tokio::spawn(read_loop(Arc::clone(&inner), reader, decoder));

        if let Some(process) = inner.process.clone() {
            let watcher = Arc::clone(&inner);
            tokio::spawn(async move {
                let exit = process.wait_exit().await;
                watcher.connection_lost(&exit.description);
            });
        }

        Arc::new(Self { inner, reader_task })
    }

    fn closed_error(&self, method: &str) -> McpError {
        let reason = if self.inner.closing.load(Ordering::SeqCst) {
            FailureReason::ShuttingDown
        } else {
            self.inner.loss_reason()
        };
        McpError::new(
            reason,
            self.inner.server.clone(),
            method,
            Phase::Request,
            "connection is closed",
        )
        .with_stderr(self.inner.stderr.snapshot())
    }
}

#[async_trait]
impl RpcChannel for StdioTransport {
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
            return Err(self.closed_error(method));
        }

        let call = self.inner.pending.register(method);
        let id = call.id();
        let request = JsonRpcRequest::new(id, method, params);
        if let Err(e) = self.inner.send(&request).await {
            let mut err = self.closed_error(method);
            err.detail = format!("failed to write request: {e}");
            return Err(err);
        }
        tracing::trace!(server = %self.inner.server, id, method, "request sent");

        let outcome = call.wait(timeout, cancel).await;
        let (result, abandoned) = resolve_wait(&self.inner.server, method, timeout, outcome);
        if let Some(reason) = abandoned {
            tracing::debug!(server = %self.inner.server, id, method, reason, "request abandoned");
            let inner = Arc::clone(&self.inner);
            tokio::spawn(async move {
                let note = JsonRpcNotification::new(
                    "notifications/cancelled",
                    Some(cancel_params(id, reason)),
                );
                let _ = inner.send(&note).await;
            });
        }
        result
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), McpError> {
        let note = JsonRpcNotification::new(method, params);
        self.inner.send(&note).await.map_err(|e| {
            McpError::new(
                self.inner.loss_reason(),
                self.inner.server.clone(),
                method,
                Phase::Request,
                format!("failed to write notification: {e}"),
            )
        })
    }

    fn is_alive(&self) -> bool {
        self.inner.alive.load(Ordering::SeqCst)
            && !self.inner.closing.load(Ordering::SeqCst)
            && !self.inner.process.as_ref().is_some_and(|p| p.has_exited())
    }

    fn framing(&self) -> Option<Framing> {
        Some(self.inner.outgoing)
    }

    fn stderr_tail(&self) -> Option<String> {
        self.inner.stderr.snapshot()
    }

    async fn close(&self, grace: Duration) {
        if self.inner.closing.swap(true, Ordering::SeqCst) {
            return;
        }

        for id in self.inner.pending.ids() {
            let note = JsonRpcNotification::new(
                "notifications/cancelled",
                Some(cancel_params(id, "shutdown")),
            );
            let _ = self.inner.send(&note).await;
        }
        let server = self.inner.server.clone();
        let rejected = self.inner.pending.close(|method| {
            McpError::new(
                FailureReason::ShuttingDown,
                server.clone(),
                method,
                Phase::Shutdown,
                "client is shutting down",
            )
        });
        if rejected > 0 {
            tracing::debug!(server = %server, rejected, "rejected pending requests on close");
        }

        // Dropping stdin is the graceful stop signal for stdio servers.
        if let Some(mut writer) = self.inner.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
        if let Some(process) = &self.inner.process {
            let exit = process.terminate(grace).await;
            tracing::debug!(server = %server, code = ?exit.code, "server stopped");
        }
        self.inner.alive.store(false, Ordering::SeqCst);
        self.reader_task.abort();
    }
}

impl Drop for StdioTransport {
    fn drop(&mut self) {
        if let Some(process) = &self.inner.process {
            if !process.has_exited() {
                process.kill();
            }
        }
        self.reader_task.abort();
    }
}

// ─── Shared State ────────────────────────────────────────────────────────────

impl Inner {
    async fn send<T: Serialize>(&self, message: &T) -> std::io::Result<()> {
        let frame = encode_message(message, self.outgoing)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
        let mut guard = self.writer.lock().await;
        let writer = guard
            .as_mut()
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::BrokenPipe, "stdin closed"))?;
        writer.write_all(&frame).await?;
        writer.flush().await
    }

    fn loss_reason(&self) -> FailureReason {
        if self.malformed.load(Ordering::SeqCst) {
            FailureReason::BadResponse
        } else {
            FailureReason::ServerCrash
        }
    }

    /// Mark the connection dead and reject everything outstanding.
    fn connection_lost(&self, detail: &str) {
        self.alive.store(false, Ordering::SeqCst);
        if self.closing.load(Ordering::SeqCst) {
            return;
        }
        let reason = self.loss_reason();
        let stderr = self.stderr.snapshot();
        let rejected = self.pending.close(|method| {
            McpError::new(reason, self.server.clone(), method, Phase::Request, detail)
                .with_stderr(stderr.clone())
        });
        if rejected > 0 {
            tracing::warn!(
                server = %self.server,
                reason = %reason,
                rejected,
                detail,
                "connection lost with requests in flight"
            );
        }
    }

    async fn dispatch(&self, frame: &str) {
        let message = match Incoming::parse(frame) {
            Ok(message) => message,
            Err(e) => {
                tracing::debug!(server = %self.server, error = %e, "ignoring non-JSON-RPC output");
                return;
            }
        };

        match message {
            Incoming::Response { id: Some(id), outcome } => {
                self.pending.settle(id, outcome);
            }
            Incoming::Response { id: None, outcome: Err(err) } => {
                // The peer could not parse what we sent; nothing will answer
                // the requests it failed to read.
                let detail = format!("server rejected frame [{}]: {}", err.code, err.message);
                let rejected = self.pending.reject_all(|method| {
                    McpError::new(
                        FailureReason::BadResponse,
                        self.server.clone(),
                        method,
                        Phase::Request,
                        detail.clone(),
                    )
                });
                tracing::debug!(server = %self.server, rejected, %detail, "error response without id");
            }
            Incoming::Response { id: None, .. } => {
                tracing::debug!(server = %self.server, "ignoring response without id");
            }
            Incoming::Request { id, method, .. } => {
                let reply = if method == "ping" {
                    JsonRpcReply::result(id, serde_json::json!({}))
                } else {
                    JsonRpcReply::error(id, error_codes::METHOD_NOT_FOUND, "Method not found")
                };
                if let Err(e) = self.send(&reply).await {
                    tracing::debug!(
                        server = %self.server,
                        method = %method,
                        error = %e,
                        "failed to answer server request"
                    );
                }
            }
            Incoming::Notification { method, .. } => {
                tracing::debug!(server = %self.server, method = %method, "server notification");
            }
        }
    }
}

enum ReadEnd {
    Eof,
    Io(std::io::Error),
    Malformed(FramingError),
}

async fn read_loop<R>(inner: Arc<Inner>, mut reader: R, mut decoder: FrameDecoder)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; READ_CHUNK_BYTES];
    let end = 'read: loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break ReadEnd::Eof,
            Ok(n) => n,
            Err(e) => break ReadEnd::Io(e),
        };
        if let Err(e) = decoder.feed(&buf[..n]) {
            break ReadEnd::Malformed(e);
        }
        loop {
            match decoder.next_frame() {
                Ok(Some(frame)) => inner.dispatch(&frame).await,
                Ok(None) => break,
                Err(e) => break 'read ReadEnd::Malformed(e),
            }
        }
    };

    let detail = match end {
        ReadEnd::Malformed(e) => {
            inner.malformed.store(true, Ordering::SeqCst);
            tracing::warn!(server = %inner.server, error = %e, "malformed frame from server");
            if let Some(process) = &inner.process {
                process.kill();
            }
            format!("malformed frame: {e}")
        }
        ReadEnd::Io(e) => format!("failed to read from stdout: {e}"),
        ReadEnd::Eof => match &inner.process {
            Some(process) => match tokio::time::timeout(EXIT_SETTLE, process.wait_exit()).await {
                Ok(exit) => exit.description,
                Err(_) => "server closed stdout".to_string(),
            },
            None => "connection closed".to_string(),
        },
    };
    inner.connection_lost(&detail);
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::{DuplexStream, ReadHalf, WriteHalf};

    use crate::mcp_client::framing::encode;
    use crate::mcp_client::pending::WaitOutcome;

    /// Scripted peer on the far side of an in-memory pipe.
    struct FakePeer {
        reader: ReadHalf<DuplexStream>,
        writer: WriteHalf<DuplexStream>,
        decoder: FrameDecoder,
        framing: Framing,
    }

    impl FakePeer {
        async fn recv(&mut self) -> Value {
            let mut buf = [0u8; 4096];
            loop {
                if let Some(frame) = self.decoder.next_frame().unwrap() {
                    return serde_json::from_str(&frame).unwrap();
                }
                let n = self.reader.read(&mut buf).await.unwrap();
                assert!(n > 0, "transport closed its end");
                self.decoder.feed(&buf[..n]).unwrap();
            }
        }

        async fn send(&mut self, message: Value) {
            self.send_raw(&encode(&message.to_string(), self.framing)).await;
        }

        async fn send_raw(&mut self, bytes: &[u8]) {
            self.writer.write_all(bytes).await.unwrap();
            self.writer.flush().await.unwrap();
        }
    }

    fn connect(framing: Framing, limits: FrameLimits) -> (Arc<StdioTransport>, FakePeer) {
        let (ours, theirs) = tokio::io::duplex(64 * 1024);
        let (read_half, write_half) = tokio::io::split(ours);
        let wire = WireConfig {
            outgoing: framing,
            incoming: Framing::Auto,
            limits,
        };
        let transport = StdioTransport::start(
            "fake",
            wire,
            read_half,
            write_half,
            None,
            Arc::new(StderrRing::default()),
        );
        let (reader, writer) = tokio::io::split(theirs);
        let peer = FakePeer {
            reader,
            writer,
            decoder: FrameDecoder::new(Framing::Auto, FrameLimits::default()),
            framing,
        };
        (transport, peer)
    }

    const SECOND: Duration = Duration::from_secs(1);

    #[tokio::test]
    async fn test_request_response_newline() {
        let (transport, mut peer) = connect(Framing::Newline, FrameLimits::default());
        let call = {
            let transport = Arc::clone(&transport);
            tokio::spawn(async move {
                transport
                    .request("tools/list", None, SECOND, &CancellationToken::new())
                    .await
            })
        };

        let request = peer.recv().await;
        assert_eq!(request["method"], "tools/list");
        peer.send(json!({"jsonrpc": "2.0", "id": request["id"], "result": {"tools": []}}))
            .await;

        let result = call.await.unwrap().unwrap();
        assert!(result["tools"].is_array());
        assert!(transport.inner.pending.ids().is_empty());
    }

    #[tokio::test]
    async fn test_length_prefixed_outgoing_frames() {
        let (transport, mut peer) = connect(Framing::LengthPrefixed, FrameLimits::default());
        transport.notify("notifications/initialized", None).await.unwrap();

        let mut buf = [0u8; 256];
        let n = peer.reader.read(&mut buf).await.unwrap();
        let text = String::from_utf8_lossy(&buf[..n]);
        assert!(text.starts_with("Content-Length: "));
        assert!(text.contains("notifications/initialized"));
    }

    #[tokio::test]
    async fn test_out_of_order_responses() {
        let (transport, mut peer) = connect(Framing::Newline, FrameLimits::default());
        let spawn_call = |method: &'static str| {
            let transport = Arc::clone(&transport);
            tokio::spawn(async move {
                transport
                    .request(method, None, SECOND, &CancellationToken::new())
                    .await
            })
        };
        let first = spawn_call("a");
        let first_req = peer.recv().await;
        let second = spawn_call("b");
        let second_req = peer.recv().await;

        peer.send(json!({"jsonrpc": "2.0", "id": second_req["id"], "result": "b"}))
            .await;
        peer.send(json!({"jsonrpc": "2.0", "id": first_req["id"], "result": "a"}))
            .await;

        assert_eq!(second.await.unwrap().unwrap(), json!("b"));
        assert_eq!(first.await.unwrap().unwrap(), json!("a"));
    }

    #[tokio::test]
    async fn test_server_ping_is_answered() {
        let (_transport, mut peer) = connect(Framing::Newline, FrameLimits::default());
        peer.send(json!({"jsonrpc": "2.0", "id": "srv-1", "method": "ping"}))
            .await;
        let reply = peer.recv().await;
        assert_eq!(reply["id"], "srv-1");
        assert_eq!(reply["result"], json!({}));

        peer.send(json!({"jsonrpc": "2.0", "id": 9, "method": "sampling/createMessage"}))
            .await;
        let reply = peer.recv().await;
        assert_eq!(reply["error"]["code"], error_codes::METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn test_non_json_output_is_skipped() {
        let (transport, mut peer) = connect(Framing::Newline, FrameLimits::default());
        let call = {
            let transport = Arc::clone(&transport);
            tokio::spawn(async move {
                transport
                    .request("ping", None, SECOND, &CancellationToken::new())
                    .await
            })
        };
        let request = peer.recv().await;
        peer.send_raw(b"starting up...\n").await;
        peer.send(json!({"jsonrpc": "2.0", "id": request["id"], "result": {}}))
            .await;
        assert!(call.await.unwrap().is_ok());
        assert!(transport.is_alive());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_sends_cancellation() {
        let (transport, mut peer) = connect(Framing::Newline, FrameLimits::default());
        let call = {
            let transport = Arc::clone(&transport);
            tokio::spawn(async move {
                transport
                    .request("tools/call", None, Duration::from_millis(100), &CancellationToken::new())
                    .await
            })
        };
        let request = peer.recv().await;
        let err = call.await.unwrap().unwrap_err();
        assert_eq!(err.reason, FailureReason::Timeout);
        assert!(!err.is_cancelled());

        let note = peer.recv().await;
        assert_eq!(note["method"], "notifications/cancelled");
        assert_eq!(note["params"]["requestId"], request["id"]);
        assert!(transport.inner.pending.ids().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_in_flight() {
        let (transport, mut peer) = connect(Framing::Newline, FrameLimits::default());
        let token = CancellationToken::new();
        let call = {
            let transport = Arc::clone(&transport);
            let token = token.clone();
            tokio::spawn(async move { transport.request("tools/call", None, SECOND * 30, &token).await })
        };
        let request = peer.recv().await;
        token.cancel();
        let err = call.await.unwrap().unwrap_err();
        assert!(err.is_cancelled());

        let note = peer.recv().await;
        assert_eq!(note["params"]["requestId"], request["id"]);
        assert_eq!(note["params"]["reason"], "cancelled");
    }

    #[tokio::test]
    async fn test_cancel_before_send() {
        let (transport, _peer) = connect(Framing::Newline, FrameLimits::default());
        let token = CancellationToken::new();
        token.cancel();
        let err = transport.request("ping", None, SECOND, &token).await.unwrap_err();
        assert!(err.is_cancelled());
        assert!(transport.inner.pending.ids().is_empty());
    }

    #[tokio::test]
    async fn test_peer_disconnect_rejects_pending_as_crash() {
        let (transport, mut peer) = connect(Framing::Newline, FrameLimits::default());
        let call = {
            let transport = Arc::clone(&transport);
            tokio::spawn(async move {
                transport
                    .request("tools/list", None, SECOND * 30, &CancellationToken::new())
                    .await
            })
        };
        peer.recv().await;
        drop(peer);

        let err = call.await.unwrap().unwrap_err();
        assert_eq!(err.reason, FailureReason::ServerCrash);
        assert!(!transport.is_alive());
    }

    #[tokio::test]
    async fn test_registration_racing_disconnect_is_rejected() {
        let (transport, mut peer) = connect(Framing::Newline, FrameLimits::default());
        let call = {
            let transport = Arc::clone(&transport);
            tokio::spawn(async move {
                transport
                    .request("tools/list", None, SECOND * 30, &CancellationToken::new())
                    .await
            })
        };
        peer.recv().await;
        drop(peer);
        call.await.unwrap().unwrap_err();

        // A request that passed the liveness check just before the loss.
        let late = transport.inner.pending.register("tools/call");
        assert!(transport.inner.pending.ids().is_empty());
        match late.wait(SECOND * 30, &CancellationToken::new()).await {
            WaitOutcome::Settled(Err(e)) => {
                assert_eq!(e.reason, FailureReason::ServerCrash);
                assert_eq!(e.action, "tools/call");
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_oversized_frame_rejects_pending_as_bad_response() {
        let limits = FrameLimits {
            max_frame_bytes: 64,
            max_buffer_bytes: 128,
        };
        let (transport, mut peer) = connect(Framing::Newline, limits);
        let call = {
            let transport = Arc::clone(&transport);
            tokio::spawn(async move {
                transport
                    .request("tools/list", None, SECOND * 30, &CancellationToken::new())
                    .await
            })
        };
        peer.recv().await;
        peer.send_raw(b"Content-Length: 4096\r\n\r\n").await;

        let err = call.await.unwrap().unwrap_err();
        assert_eq!(err.reason, FailureReason::BadResponse);
        assert!(err.detail.contains("malformed frame"));
        assert!(!transport.is_alive());
    }

    #[tokio::test]
    async fn test_null_id_error_rejects_pending() {
        let (transport, mut peer) = connect(Framing::LengthPrefixed, FrameLimits::default());
        let call = {
            let transport = Arc::clone(&transport);
            tokio::spawn(async move {
                transport
                    .request("initialize", None, SECOND * 30, &CancellationToken::new())
                    .await
            })
        };
        peer.recv().await;
        peer.send(json!({"jsonrpc": "2.0", "id": null, "error": {"code": -32700, "message": "Parse error"}}))
            .await;

        let err = call.await.unwrap().unwrap_err();
        assert_eq!(err.reason, FailureReason::BadResponse);
        assert!(err.detail.contains("-32700"));
    }

    #[tokio::test]
    async fn test_close_rejects_pending_with_shutting_down() {
        let (transport, mut peer) = connect(Framing::Newline, FrameLimits::default());
        let call = {
            let transport = Arc::clone(&transport);
            tokio::spawn(async move {
                transport
                    .request("tools/call", None, SECOND * 30, &CancellationToken::new())
                    .await
            })
        };
        let request = peer.recv().await;
        transport.close(Duration::ZERO).await;

        let err = call.await.unwrap().unwrap_err();
        assert_eq!(err.reason, FailureReason::ShuttingDown);
        assert_eq!(err.phase, Phase::Shutdown);

        let note = peer.recv().await;
        assert_eq!(note["method"], "notifications/cancelled");
        assert_eq!(note["params"]["requestId"], request["id"]);
        assert!(!transport.is_alive());

        let err = transport
            .request("ping", None, SECOND, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.reason, FailureReason::ShuttingDown);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_exit_rejects_with_stderr() {
        let spec = ServerSpec::resolve(
            "crasher",
            &crate::mcp_client::config::ServerConfig::stdio(
                "sh",
                &["-c", "read line; echo 'fatal: bad config' >&2; exit 2"],
            ),
            &Default::default(),
            std::path::Path::new("/"),
        )
        .unwrap();
        let channel = StdioConnector::new(spec)
            .connect(Framing::Newline)
            .await
            .unwrap();

        let err = channel
            .request("initialize", None, SECOND * 10, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.reason, FailureReason::ServerCrash);
        assert!(!channel.is_alive());
        // stderr capture races the exit; when it lands first it is attached.
        if let Some(stderr) = &err.stderr {
            assert!(stderr.contains("fatal: bad config"));
        }
    }
}
