//! Reference tool catalog.
//!
//! Each tool echoes its name and arguments back. Real capabilities are
//! attached through MCP servers.

use async_trait::async_trait;
use serde_json::json;

use super::{ToolBackend, ToolSpec};

#[derive(Debug, Clone, Copy, Default)]
pub struct BuiltinTools;

fn spec(name: &str, description: &str, parameters: serde_json::Value) -> ToolSpec {
    ToolSpec {
        name: name.to_string(),
        description: description.to_string(),
        parameters,
    }
}

fn object(properties: serde_json::Value, required: &[&str]) -> serde_json::Value {
    json!({ "type": "object", "properties": properties, "required": required })
}

#[async_trait]
impl ToolBackend for BuiltinTools {
    fn tools(&self) -> Vec<ToolSpec> {
        vec![
            spec(
                "db_query",
                "Execute a read-only SQL query against the database",
                object(
                    json!({ "query": { "type": "string", "description": "SQL query to run" } }),
                    &["query"],
                ),
            ),
            spec(
                "db_schema",
                "Describe the database schema",
                object(
                    json!({ "table": { "type": "string", "description": "Optional table name" } }),
                    &[],
                ),
            ),
            spec(
                "search_docs",
                "Search the documentation index",
                object(
                    json!({
                        "query": { "type": "string" },
                        "limit": { "type": "integer", "default": 5 }
                    }),
                    &["query"],
                ),
            ),
            spec(
                "read_file",
                "Read a file from the workspace",
                object(json!({ "path": { "type": "string" } }), &["path"]),
            ),
            spec(
                "write_file",
                "Write content to a file in the workspace",
                object(
                    json!({ "path": { "type": "string" }, "content": { "type": "string" } }),
                    &["path", "content"],
                ),
            ),
        ]
    }

    async fn call(
        &self,
        name: &str,
        arguments: serde_json::Value,
    ) -> anyhow::Result<serde_json::Value> {
        if !self.tools().iter().any(|t| t.name == name) {
            anyhow::bail!("Unknown tool: {name}");
        }
        Ok(json!({
            "success": true,
            "result": format!("Mock result for {name} with args {arguments}"),
        }))
    }
}
