//! MCP Client: JSON-RPC 2.0 over stdio, HTTP and SSE for MCP server management.
//!
//! This module handles:
//! - Message framing (`Content-Length` and newline-delimited) with negotiation
//! - Spawning and supervising stdio server processes
//! - Per-server request correlation, deadlines and cancellation
//! - Reconnect with backoff behind a circuit breaker
//! - Config discovery, merging and a catalog of tools and prompts
//! - Routing calls across all servers through one [`Registry`]

pub mod catalog;
pub mod channel;
pub mod circuit;
pub mod client;
pub mod config;
pub mod discovery;
pub mod errors;
pub mod events;
pub mod framing;
pub mod health;
pub mod http;
pub mod lifecycle;
pub mod negotiation;
pub mod pending;
pub mod registry;
pub mod sse;
pub mod transport;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

// Re-exports for convenience
pub use catalog::{PromptDescriptor, ToolDescriptor};
pub use client::McpClient;
pub use config::{McpServersConfig, ServerConfig, TransportKind};
pub use errors::{FailureReason, McpError, Phase};
pub use events::RegistryEvent;
pub use framing::Framing;
pub use health::HealthRecord;
pub use registry::{Registry, RegistryOptions, ServerSummary};
pub use types::ToolOutput;
