use crate::mcp::config::{
    McpConfig, McpServerEntry, expand_env_map, expand_env_placeholders, load_mcp_config,
};
use crate::mcp::{ToolBackend, ToolSpec};
use anyhow::{Context, anyhow};
use async_trait::async_trait;
use rmcp::{
    model::CallToolRequestParam,
    service::ServiceExt,
    transport::{StreamableHttpClientTransport, TokioChildProcess},
};
use std::{collections::HashMap, sync::Arc};
use tokio::process::Command;

type DynClientService = rmcp::service::RunningService<
    rmcp::service::RoleClient,
    Box<dyn rmcp::service::DynService<rmcp::service::RoleClient>>,
>;

/// Tools served by connected MCP servers.
#[derive(Clone)]
pub struct McpRegistry {
    services: Arc<HashMap<String, Arc<DynClientService>>>,
    // namespaced_tool_name -> (server_name, tool_name)
    tool_index: Arc<HashMap<String, (String, String)>>,
    tools: Arc<Vec<ToolSpec>>,
}

impl std::fmt::Debug for McpRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("McpRegistry")
            .field("tool_count", &self.tools.len())
            .field("service_count", &self.services.len())
            .finish()
    }
}

impl McpRegistry {
    pub async fn load_from_file(path: &str) -> anyhow::Result<Self> {
        let cfg = load_mcp_config(path)?;
        Self::from_config(&cfg).await
    }

    pub async fn from_config(cfg: &McpConfig) -> anyhow::Result<Self> {
        // 1) connect all servers
        let mut services: HashMap<String, Arc<DynClientService>> = HashMap::new();

        for (name, entry) in &cfg.mcp_servers {
            let svc = match entry {
                McpServerEntry::Stdio { command, args, env } => {
                    let mut cmd = Command::new(command);
                    cmd.args(args);
                    for (k, v) in expand_env_map(env) {
                        cmd.env(k, v);
                    }

                    let transport = TokioChildProcess::new(cmd)?;
                    ().into_dyn()
                        .serve(transport)
                        .await
                        .with_context(|| format!("failed to connect stdio MCP server '{name}'"))?
                }

                McpServerEntry::RemoteHttp { url } => {
                    let url = expand_env_placeholders(url);
                    url::Url::parse(&url)
                        .with_context(|| format!("invalid url for remote MCP '{name}'"))?;

                    let transport = StreamableHttpClientTransport::from_uri(url);
                    ().into_dyn()
                        .serve(transport)
                        .await
                        .with_context(|| format!("failed to connect remote MCP server '{name}'"))?
                }
            };

            tracing::info!(name: "mcp.connected", server = %name, "MCP server connected");
            services.insert(name.clone(), Arc::new(svc));
        }

        // 2) list tools + build index
        let mut tools = Vec::new();
        let mut tool_index = HashMap::new();

        for (server_name, svc) in &services {
            let result = svc
                .list_tools(Default::default())
                .await
                .with_context(|| format!("tools/list failed for MCP server '{server_name}'"))?;

            for t in result.tools {
                let tool_name = t.name.to_string();
                let ns_name = Self::sanitize_tool_name(&format!("{server_name}__{tool_name}"));
                let parameters = serde_json::to_value(&*t.input_schema)
                    .unwrap_or_else(|_| serde_json::json!({"type": "object", "properties": {}}));

                tools.push(ToolSpec {
                    name: ns_name.clone(),
                    description: t.description.as_deref().unwrap_or_default().to_string(),
                    parameters,
                });
                tool_index.insert(ns_name, (server_name.clone(), tool_name));
            }
        }

        Ok(Self {
            services: Arc::new(services),
            tool_index: Arc::new(tool_index),
            tools: Arc::new(tools),
        })
    }

    pub fn new_empty() -> Self {
        Self {
            services: Arc::new(HashMap::new()),
            tool_index: Arc::new(HashMap::new()),
            tools: Arc::new(Vec::new()),
        }
    }

    /// Keep namespaced names to `[A-Za-z0-9_-]`.
    fn sanitize_tool_name(name: &str) -> String {
        name.chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                    c
                } else {
                    '_'
                }
            })
            .collect()
    }
}

#[async_trait]
impl ToolBackend for McpRegistry {
    fn tools(&self) -> Vec<ToolSpec> {
        self.tools.as_ref().clone()
    }

    /// Execute a namespaced tool, e.g. `time__now`.
    async fn call(
        &self,
        namespaced_tool: &str,
        arguments: serde_json::Value,
    ) -> anyhow::Result<serde_json::Value> {
        let (server_name, raw_tool_name) = self
            .tool_index
            .get(namespaced_tool)
            .ok_or_else(|| anyhow!("unknown tool: {namespaced_tool}"))?;

        let service = self
            .services
            .get(server_name)
            .ok_or_else(|| anyhow!("missing server handle: {server_name}"))?;

        let res = service
            .call_tool(CallToolRequestParam {
                name: raw_tool_name.clone().into(),
                arguments: arguments.as_object().cloned(),
            })
            .await
            .with_context(|| format!("tools/call failed for {server_name}::{raw_tool_name}"))?;

        let value = serde_json::to_value(res)?;
        if value.get("isError").and_then(serde_json::Value::as_bool) == Some(true) {
            return Err(anyhow!("{server_name}::{raw_tool_name} reported an error: {value}"));
        }
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitizes_namespaced_names() {
        assert_eq!(McpRegistry::sanitize_tool_name("time__now"), "time__now");
        assert_eq!(
            McpRegistry::sanitize_tool_name("docs.v2__search:all"),
            "docs_v2__search_all"
        );
    }

    #[tokio::test]
    async fn empty_registry_has_no_tools() {
        let registry = McpRegistry::new_empty();
        assert!(registry.tools().is_empty());
        let err = registry
            .call("time__now", serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("unknown tool"));
    }

    #[tokio::test]
    async fn empty_config_connects_nothing() {
        let registry = McpRegistry::from_config(&McpConfig::default()).await.unwrap();
        assert!(registry.tools().is_empty());
    }
}
