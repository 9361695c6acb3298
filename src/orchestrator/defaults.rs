use crate::orchestrator::domain::{AgentConfig, AgentRole};

fn agent(
    id: &str,
    name: &str,
    role: AgentRole,
    system_prompt: &str,
    allowed_tools: &[&str],
) -> AgentConfig {
    AgentConfig {
        id: id.to_string(),
        name: name.to_string(),
        role,
        system_prompt: system_prompt.to_string(),
        // Filled with the configured default model by the catalog.
        model: String::new(),
        allowed_tools: allowed_tools.iter().map(ToString::to_string).collect(),
    }
}

/// Built-in agents used when no catalog file is present.
pub fn default_agents() -> Vec<AgentConfig> {
    vec![
        agent(
            "router",
            "Router",
            AgentRole::Routing,
            "You are a routing agent. Decide which specialist agent should handle \
             the user's request and explain the delegation briefly.",
            &[],
        ),
        agent(
            "assistant",
            "General Assistant",
            AgentRole::Assistant,
            "You are a helpful, accurate and concise general assistant.",
            &["search_docs"],
        ),
        agent(
            "tool_executor",
            "Tool Executor",
            AgentRole::ToolExecutor,
            "You execute tools on behalf of the user and report their results.",
            &["*"],
        ),
        agent(
            "researcher",
            "Research",
            AgentRole::Specialist,
            "You are a research specialist. Find and summarize relevant documentation.",
            &["search_docs", "read_file"],
        ),
    ]
}
