//! Tool discovery and invocation.
//!
//! The [`ToolGateway`] is the single capability boundary the run executor
//! talks to. It aggregates one or more [`ToolBackend`]s:
//!
//! - [`builtin::BuiltinTools`]: the reference catalog, always present
//! - [`registry::McpRegistry`]: tools from external MCP servers
//!
//! # Configuration
//!
//! MCP servers are configured via `mcp.json`:
//!
//! ```json
//! {
//!   "mcpServers": {
//!     "time": {
//!       "command": "npx",
//!       "args": ["-y", "@mcpcentral/mcp-time"]
//!     },
//!     "search": {
//!       "url": "https://mcp.example.com/mcp/?key=${SEARCH_API_KEY}"
//!     }
//!   }
//! }
//! ```
//!
//! MCP tools are namespaced by server name: `server__tool`.

pub mod builtin;
pub mod config;
pub mod registry;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::orchestrator::catalog::AgentCatalog;

/// A discoverable tool and its JSON-schema parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

#[async_trait]
pub trait ToolBackend: Send + Sync + std::fmt::Debug {
    fn tools(&self) -> Vec<ToolSpec>;

    async fn call(
        &self,
        name: &str,
        arguments: serde_json::Value,
    ) -> anyhow::Result<serde_json::Value>;
}

#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("Unknown tool: {0}")]
    Unknown(String),
    #[error("Tool '{tool}' is not allowed for agent '{agent_id}'")]
    NotAllowed { agent_id: String, tool: String },
    #[error("Tool '{tool}' failed: {message}")]
    Failed { tool: String, message: String },
}

#[derive(Debug, Clone)]
pub struct ToolGateway {
    catalog: Arc<AgentCatalog>,
    backends: Vec<Arc<dyn ToolBackend>>,
}

impl ToolGateway {
    pub fn new(catalog: Arc<AgentCatalog>) -> Self {
        Self {
            catalog,
            backends: Vec::new(),
        }
    }

    /// Gateway over the built-in catalog only.
    pub fn with_builtin(catalog: Arc<AgentCatalog>) -> Self {
        Self::new(catalog).with_backend(Arc::new(builtin::BuiltinTools))
    }

    #[must_use]
    pub fn with_backend(mut self, backend: Arc<dyn ToolBackend>) -> Self {
        self.backends.push(backend);
        self
    }

    /// All tools, earlier backends shadowing later ones on name clashes.
    pub fn discover(&self) -> Vec<ToolSpec> {
        let mut seen = std::collections::HashSet::new();
        self.backends
            .iter()
            .flat_map(|b| b.tools())
            .filter(|t| seen.insert(t.name.clone()))
            .collect()
    }

    pub fn get(&self, name: &str) -> Option<ToolSpec> {
        self.backends
            .iter()
            .flat_map(|b| b.tools())
            .find(|t| t.name == name)
    }

    pub fn is_allowed(&self, agent_id: &str, tool_name: &str) -> bool {
        self.catalog.is_tool_allowed(agent_id, tool_name)
    }

    pub async fn invoke(
        &self,
        tool_name: &str,
        arguments: serde_json::Value,
    ) -> Result<serde_json::Value, ToolError> {
        let backend = self
            .backends
            .iter()
            .find(|b| b.tools().iter().any(|t| t.name == tool_name))
            .ok_or_else(|| ToolError::Unknown(tool_name.to_string()))?;

        backend
            .call(tool_name, arguments)
            .await
            .map_err(|e| ToolError::Failed {
                tool: tool_name.to_string(),
                message: format!("{e:#}"),
            })
    }
}
