//! Capability catalog: aggregates tools and prompts across all servers.
//!
//! Provides:
//! - One namespace of ids, `"<server>_<name>"`
//! - Resolution of an id back to `(server, local name)`
//! - Per-server purge on refresh or removal
//! - Similar-id suggestions for unknown ids

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::Value;

use super::types::{McpPromptDefinition, McpToolDefinition, PromptArgument};

/// Suggestions scoring at or below this are not offered.
const SIMILARITY_FLOOR: f64 = 0.3;

// ─── Descriptors ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDescriptor {
    pub id: String,
    pub server: String,
    pub name: String,
    pub description: String,
    pub input_schema: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub annotations: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PromptDescriptor {
    pub id: String,
    pub server: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub arguments: Vec<PromptArgument>,
}

/// Catalog id for a server-local capability name.
pub fn qualified_id(server: &str, name: &str) -> String {
    format!("{server}_{name}")
}

// ─── Catalog ─────────────────────────────────────────────────────────────────

/// Tools and prompts of every connected server, keyed by id.
///
/// Ids are looked up, never parsed: server names may themselves contain `_`.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    tools: BTreeMap<String, ToolDescriptor>,
    prompts: BTreeMap<String, PromptDescriptor>,
}

impl Catalog {
    /// Replace everything registered for `server`.
    pub fn register_server(
        &mut self,
        server: &str,
        tools: Vec<McpToolDefinition>,
        prompts: Vec<McpPromptDefinition>,
    ) {
        self.unregister_server(server);

        for tool in tools {
            let id = qualified_id(server, &tool.name);
            if let Some(existing) = self.tools.get(&id) {
                if existing.server != server {
                    tracing::warn!(id = %id, owner = %existing.server, server, "tool id collision, keeping first");
                    continue;
                }
            }
            self.tools.insert(
                id.clone(),
                ToolDescriptor {
                    id,
                    server: server.to_string(),
                    name: tool.name,
                    description: tool.description,
                    input_schema: tool.input_schema,
                    annotations: tool.annotations,
                },
            );
        }

        for prompt in prompts {
            let id = qualified_id(server, &prompt.name);
            if self.prompts.get(&id).is_some_and(|p| p.server != server) {
                tracing::warn!(id = %id, server, "prompt id collision, keeping first");
                continue;
            }
            self.prompts.insert(
                id.clone(),
                PromptDescriptor {
                    id,
                    server: server.to_string(),
                    name: prompt.name,
                    description: prompt.description,
                    arguments: prompt.arguments,
                },
            );
        }
    }

    /// Remove all tools and prompts belonging to a server.
    pub fn unregister_server(&mut self, server: &str) {
        self.tools.retain(|_, t| t.server != server);
        self.prompts.retain(|_, p| p.server != server);
    }

    pub fn clear(&mut self) {
        self.tools.clear();
        self.prompts.clear();
    }

    pub fn tool(&self, id: &str) -> Option<&ToolDescriptor> {
        self.tools.get(id)
    }

    pub fn prompt(&self, id: &str) -> Option<&PromptDescriptor> {
        self.prompts.get(id)
    }

    /// All tools, sorted by id.
    pub fn tools(&self) -> Vec<ToolDescriptor> {
        self.tools.values().cloned().collect()
    }

    /// All prompts, sorted by id.
    pub fn prompts(&self) -> Vec<PromptDescriptor> {
        self.prompts.values().cloned().collect()
    }

    pub fn tool_count(&self, server: &str) -> usize {
        self.tools.values().filter(|t| t.server == server).count()
    }

    pub fn prompt_count(&self, server: &str) -> usize {
        self.prompts.values().filter(|p| p.server == server).count()
    }

    /// Tools across every server.
    pub fn total_tools(&self) -> usize {
        self.tools.len()
    }

    /// Up to `max_results` tool ids most similar to `id`, best first.
    pub fn similar_tools(&self, id: &str, max_results: usize) -> Vec<String> {
        rank_similar(id, self.tools.keys(), max_results)
    }

    pub fn similar_prompts(&self, id: &str, max_results: usize) -> Vec<String> {
        rank_similar(id, self.prompts.keys(), max_results)
    }
}

fn rank_similar<'a>(
    query: &str,
    ids: impl Iterator<Item = &'a String>,
    max_results: usize,
) -> Vec<String> {
    let mut scored: Vec<(String, f64)> = ids
        .map(|id| (id.clone(), similarity(query, id)))
        .filter(|(_, score)| *score > SIMILARITY_FLOOR)
        .collect();

    scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    scored.truncate(max_results);
    scored.into_iter().map(|(id, _)| id).collect()
}

// ─── Edit Distance ──────────────────────────────────────────────────────────

/// Levenshtein edit distance over bytes.
fn levenshtein(a: &str, b: &str) -> usize {
    let a_bytes = a.as_bytes();
    let b_bytes = b.as_bytes();
    let n = b_bytes.len();

    let mut prev: Vec<usize> = (0..=n).collect();
    let mut curr = vec![0usize; n + 1];

    for (i, &ca) in a_bytes.iter().enumerate() {
        curr[0] = i + 1;
        for (j, &cb) in b_bytes.iter().enumerate() {
            let cost = usize::from(ca != cb);
            curr[j + 1] = (prev[j + 1] + 1).min(curr[j] + 1).min(prev[j] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    prev[n]
}

/// 1.0 for identical strings, 0.0 for nothing in common.
fn similarity(a: &str, b: &str) -> f64 {
    let max_len = a.len().max(b.len());
    if max_len == 0 {
        return 1.0;
    }
    1.0 - (levenshtein(a, b) as f64 / max_len as f64)
}

// ─── Tests ───────────────────────────────────────────────────────────────────
