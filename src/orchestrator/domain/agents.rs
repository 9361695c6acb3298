use serde::{Deserialize, Serialize};

/// Agent roles with a dedicated offline reply. Anything else is `Other`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    Routing,
    Assistant,
    ToolExecutor,
    Specialist,
    #[serde(untagged)]
    Other(String),
}

impl AgentRole {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Routing => "routing",
            Self::Assistant => "assistant",
            Self::ToolExecutor => "tool_executor",
            Self::Specialist => "specialist",
            Self::Other(s) => s,
        }
    }
}

/// Static agent definition: prompt, model and tool allowlist.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    pub id: String,
    pub name: String,
    pub role: AgentRole,
    #[serde(default)]
    pub system_prompt: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub allowed_tools: Vec<String>,
}

impl AgentConfig {
    /// `"*"` in the allowlist grants every tool.
    pub fn allows_tool(&self, tool_name: &str) -> bool {
        self.allowed_tools
            .iter()
            .any(|t| t == "*" || t == tool_name)
    }
}
