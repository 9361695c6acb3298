//! Agent catalog loaded from a static YAML file.

use anyhow::{Context, bail};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

use crate::orchestrator::domain::AgentConfig;

const DEFAULT_MODEL_PLACEHOLDER: &str = "${DEFAULT_MODEL}";

#[derive(Debug, Deserialize)]
struct CatalogFile {
    #[serde(default)]
    agents: Vec<AgentConfig>,
}

/// Resolves agent ids to their configuration. Listing keeps file order.
#[derive(Debug, Clone, Default)]
pub struct AgentCatalog {
    agents: Vec<AgentConfig>,
    index: HashMap<String, usize>,
}

impl AgentCatalog {
    pub fn from_agents(
        agents: impl IntoIterator<Item = AgentConfig>,
        default_model: &str,
    ) -> anyhow::Result<Self> {
        let mut catalog = Self::default();
        for mut agent in agents {
            if agent.model.trim().is_empty() {
                agent.model = default_model.to_string();
            } else if agent.model.contains(DEFAULT_MODEL_PLACEHOLDER) {
                agent.model = agent.model.replace(DEFAULT_MODEL_PLACEHOLDER, default_model);
            }
            if catalog.index.contains_key(&agent.id) {
                bail!("duplicate agent id '{}'", agent.id);
            }
            catalog.index.insert(agent.id.clone(), catalog.agents.len());
            catalog.agents.push(agent);
        }
        Ok(catalog)
    }

    pub fn from_yaml_str(yaml: &str, default_model: &str) -> anyhow::Result<Self> {
        let file: CatalogFile = serde_yaml::from_str(yaml).context("invalid agent catalog")?;
        Self::from_agents(file.agents, default_model)
    }

    pub fn load_from_file(path: impl AsRef<Path>, default_model: &str) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read agent catalog {}", path.display()))?;
        Self::from_yaml_str(&raw, default_model)
            .with_context(|| format!("failed to load agent catalog {}", path.display()))
    }

    /// Loads `path`, or the built-in agents when the file does not exist.
    pub fn load_or_default(path: impl AsRef<Path>, default_model: &str) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            return Self::load_from_file(path, default_model);
        }
        tracing::warn!(
            name: "catalog.fallback",
            path = %path.display(),
            "Agent catalog not found; using built-in agents"
        );
        Self::from_agents(crate::orchestrator::defaults::default_agents(), default_model)
    }

    pub fn resolve(&self, agent_id: &str) -> Option<&AgentConfig> {
        self.index.get(agent_id).map(|&i| &self.agents[i])
    }

    pub fn list(&self) -> &[AgentConfig] {
        &self.agents
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    /// Unknown agents are denied everything.
    pub fn is_tool_allowed(&self, agent_id: &str, tool_name: &str) -> bool {
        self.resolve(agent_id)
            .is_some_and(|agent| agent.allows_tool(tool_name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::domain::AgentRole;

    const YAML: &str = r#"
agents:
  - id: router
    name: Router
    role: routing
    system_prompt: Route requests.
    model: ${DEFAULT_MODEL}
    allowed_tools: []
  - id: coder
    name: Coder
    role: specialist
    system_prompt: Write code.
    model: gpt-4o-mini
    allowed_tools: ["read_file", "write_file"]
  - id: ops
    name: Ops
    role: tool_executor
    allowed_tools: ["*"]
"#;

    #[test]
    fn expands_default_model_and_keeps_order() {
        let catalog = AgentCatalog::from_yaml_str(YAML, "gpt-4").unwrap();
        let ids: Vec<_> = catalog.list().iter().map(|a| a.id.as_str()).collect();
        assert_eq!(ids, ["router", "coder", "ops"]);

        assert_eq!(catalog.resolve("router").unwrap().model, "gpt-4");
        assert_eq!(catalog.resolve("coder").unwrap().model, "gpt-4o-mini");
        assert_eq!(catalog.resolve("ops").unwrap().model, "gpt-4");
        assert_eq!(catalog.resolve("ops").unwrap().role, AgentRole::ToolExecutor);
        assert!(catalog.resolve("missing").is_none());
    }

    #[test]
    fn tool_permissions() {
        let catalog = AgentCatalog::from_yaml_str(YAML, "gpt-4").unwrap();
        assert!(catalog.is_tool_allowed("coder", "read_file"));
        assert!(!catalog.is_tool_allowed("coder", "db_query"));
        assert!(catalog.is_tool_allowed("ops", "anything"));
        assert!(!catalog.is_tool_allowed("router", "read_file"));
        assert!(!catalog.is_tool_allowed("ghost", "read_file"));
    }

    #[test]
    fn placeholder_expands_inside_model_names() {
        let yaml = "agents:\n  - {id: a, name: A, role: assistant, model: \"openai/${DEFAULT_MODEL}\"}\n";
        let catalog = AgentCatalog::from_yaml_str(yaml, "gpt-4o").unwrap();
        assert_eq!(catalog.resolve("a").unwrap().model, "openai/gpt-4o");
    }

    #[test]
    fn rejects_duplicate_ids() {
        let yaml = "agents:\n  - {id: a, name: A, role: assistant}\n  - {id: a, name: B, role: assistant}\n";
        let err = AgentCatalog::from_yaml_str(yaml, "gpt-4").unwrap_err();
        assert!(err.to_string().contains("duplicate agent id 'a'"));
    }

    #[test]
    fn missing_file_falls_back_to_builtin_agents() {
        let dir = tempfile::tempdir().unwrap();
        let catalog =
            AgentCatalog::load_or_default(dir.path().join("absent.yaml"), "gpt-4").unwrap();
        assert!(catalog.resolve("router").is_some());
        assert!(catalog.resolve("assistant").is_some());
    }

    #[test]
    fn loads_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agents.yaml");
        std::fs::write(&path, YAML).unwrap();
        let catalog = AgentCatalog::load_from_file(&path, "claude").unwrap();
        assert_eq!(catalog.len(), 3);
        assert_eq!(catalog.resolve("router").unwrap().model, "claude");
    }
}
