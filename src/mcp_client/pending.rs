//! Pending-request table: id allocation and request/response correlation.
//!
//! Each outstanding request owns a [`PendingCall`]. The table entry is removed
//! *before* the waiter is settled, so a response, a deadline, a cancellation,
//! and a connection loss can race without ever settling a request twice.
//! Dropping a `PendingCall` releases its entry.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use super::errors::{FailureReason, McpError, Phase};
use super::types::{JsonRpcError, MAX_SAFE_ID};

/// What a waiter eventually receives.
pub type Settlement = Result<Value, McpError>;

/// An in-flight request.
#[derive(Debug)]
pub struct PendingRequest {
    pub method: String,
    pub started_at: Instant,
    sender: oneshot::Sender<Settlement>,
}

#[derive(Debug, Default)]
struct Slots {
    entries: HashMap<u64, PendingRequest>,
    /// Set once the connection is gone; later registrations settle with it.
    closed: Option<McpError>,
}

#[derive(Debug)]
pub struct PendingTable {
    server: String,
    next_id: Mutex<u64>,
    slots: Mutex<Slots>,
}

/// How a wait ended.
#[derive(Debug)]
pub enum WaitOutcome {
    Settled(Settlement),
    TimedOut,
    Cancelled,
}

impl PendingTable {
    pub fn new(server: &str) -> Arc<Self> {
        Self::starting_at(server, 1)
    }

    fn starting_at(server: &str, first_id: u64) -> Arc<Self> {
        Arc::new(Self {
            server: server.to_string(),
            next_id: Mutex::new(first_id),
            slots: Mutex::new(Slots::default()),
        })
    }

    /// Allocate the next request id, wrapping back to 1 past 2^53 - 1.
    pub fn next_id(&self) -> u64 {
        let mut next = self.next_id.lock().unwrap_or_else(|e| e.into_inner());
        let id = *next;
        *next = if id >= MAX_SAFE_ID { 1 } else { id + 1 };
        id
    }

    /// Register a new request and return its waiter.
    ///
    /// On a closed table the waiter is settled at once with the close error.
    pub fn register(self: &Arc<Self>, method: &str) -> PendingCall {
        let id = self.next_id();
        let (sender, receiver) = oneshot::channel();
        {
            let mut slots = self.lock();
            if let Some(mut err) = slots.closed.clone() {
                err.action = method.to_string();
                let _ = sender.send(Err(err));
            } else {
                slots.entries.insert(
                    id,
                    PendingRequest {
                        method: method.to_string(),
                        started_at: Instant::now(),
                        sender,
                    },
                );
            }
        }
        PendingCall {
            id,
            method: method.to_string(),
            table: Arc::clone(self),
            receiver: Some(receiver),
        }
    }

    /// Settle a request from a server response. Returns `false` for unknown
    /// or already-settled ids.
    pub fn settle(&self, id: u64, outcome: Result<Value, JsonRpcError>) -> bool {
        let Some(entry) = self.remove(id) else {
            tracing::debug!(server = %self.server, id, "response for unknown request id");
            return false;
        };
        let settlement = outcome.map_err(|err| {
            McpError::from_rpc_error(&self.server, &entry.method, Phase::Request, &err)
        });
        let _ = entry.sender.send(settlement);
        true
    }

    /// Remove an entry without settling it.
    pub fn remove(&self, id: u64) -> Option<PendingRequest> {
        self.lock().entries.remove(&id)
    }

    /// Reject every outstanding request. `make_error` receives the method name.
    pub fn reject_all(&self, make_error: impl Fn(&str) -> McpError) -> usize {
        let drained: Vec<PendingRequest> = self.lock().entries.drain().map(|(_, entry)| entry).collect();
        Self::reject(drained, make_error)
    }

    /// Reject everything outstanding and refuse later registrations.
    ///
    /// Draining and closing happen under one lock, so a request registered
    /// concurrently with a connection loss is either drained or refused.
    pub fn close(&self, make_error: impl Fn(&str) -> McpError) -> usize {
        let drained: Vec<PendingRequest> = {
            let mut slots = self.lock();
            if slots.closed.is_none() {
                slots.closed = Some(make_error(""));
            }
            slots.entries.drain().map(|(_, entry)| entry).collect()
        };
        Self::reject(drained, make_error)
    }

    fn reject(drained: Vec<PendingRequest>, make_error: impl Fn(&str) -> McpError) -> usize {
        let count = drained.len();
        for entry in drained {
            let _ = entry.sender.send(Err(make_error(&entry.method)));
        }
        count
    }

    pub fn ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.lock().entries.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Slots> {
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Waiter half of a registered request.
#[derive(Debug)]
pub struct PendingCall {
    id: u64,
    method: String,
    table: Arc<PendingTable>,
    receiver: Option<oneshot::Receiver<Settlement>>,
}

impl PendingCall {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Wait for the response, the deadline, or the cancellation token;
    /// whichever comes first. The table entry is gone when this returns.
    pub async fn wait(mut self, timeout: Duration, cancel: &CancellationToken) -> WaitOutcome {
        let Some(receiver) = self.receiver.take() else {
            return WaitOutcome::Cancelled;
        };

        let outcome = tokio::select! {
            settled = receiver => match settled {
                Ok(settlement) => WaitOutcome::Settled(settlement),
                Err(_) => WaitOutcome::Settled(Err(McpError::new(
                    FailureReason::ServerCrash,
                    self.table.server.clone(),
                    self.method.clone(),
                    Phase::Request,
                    "connection dropped before a response arrived",
                ))),
            },
            _ = tokio::time::sleep(timeout) => WaitOutcome::TimedOut,
            _ = cancel.cancelled() => WaitOutcome::Cancelled,
        };

        self.table.remove(self.id);
        outcome
    }
}

impl Drop for PendingCall {
    fn drop(&mut self) {
        self.table.remove(self.id);
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
