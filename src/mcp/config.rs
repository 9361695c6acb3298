use serde::{Deserialize, Serialize};
use std::{collections::HashMap, fs, path::Path};

use anyhow::Context;

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct McpConfig {
    #[serde(rename = "mcpServers", default)]
    pub mcp_servers: HashMap<String, McpServerEntry>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(untagged)]
pub enum McpServerEntry {
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: HashMap<String, String>,
    },
    RemoteHttp {
        url: String,
    },
}

pub fn load_mcp_config(path: impl AsRef<Path>) -> anyhow::Result<McpConfig> {
    let path = path.as_ref();
    let txt = fs::read_to_string(path)
        .with_context(|| format!("failed to read MCP config {}", path.display()))?;
    serde_json::from_str(&txt).with_context(|| format!("invalid MCP config {}", path.display()))
}

/// Expand `${VAR}` placeholders from the process environment. Unknown
/// variables are left as-is.
pub fn expand_env_placeholders(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                let name = &after[..end];
                match std::env::var(name) {
                    Ok(v) => out.push_str(&v),
                    Err(_) => out.push_str(&rest[start..start + 2 + end + 1]),
                }
                rest = &after[end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

pub fn expand_env_map(map: &HashMap<String, String>) -> HashMap<String, String> {
    map.iter()
        .map(|(k, v)| (k.clone(), expand_env_placeholders(v)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_both_server_kinds() {
        let cfg: McpConfig = serde_json::from_str(
            r#"{"mcpServers": {
                "time": {"command": "npx", "args": ["-y", "mcp-time"]},
                "search": {"url": "https://mcp.example.com/mcp"}
            }}"#,
        )
        .unwrap();
        assert!(matches!(cfg.mcp_servers["time"], McpServerEntry::Stdio { .. }));
        assert!(matches!(
            cfg.mcp_servers["search"],
            McpServerEntry::RemoteHttp { .. }
        ));
    }

    #[test]
    fn unknown_placeholders_survive() {
        assert_eq!(
            expand_env_placeholders("key=${AGENT_ORCH_SURELY_UNSET_VAR}&x=1"),
            "key=${AGENT_ORCH_SURELY_UNSET_VAR}&x=1"
        );
        assert_eq!(expand_env_placeholders("no placeholders"), "no placeholders");
        assert_eq!(expand_env_placeholders("dangling ${OPEN"), "dangling ${OPEN");
    }

    #[test]
    fn expands_known_variables() {
        let path = std::env::var("PATH").unwrap_or_default();
        assert_eq!(expand_env_placeholders("${PATH}"), path);
    }
}
