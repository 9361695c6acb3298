//! Deterministic offline strategy.

use async_trait::async_trait;

use super::{CompletionProvider, CompletionRequest, Fragment, FragmentStream, ProviderError};
use crate::orchestrator::domain::{AgentConfig, AgentRole};

/// Role-keyed canned replies. Used when no remote credential is present and
/// as the fallback after a remote failure.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalProvider;

impl LocalProvider {
    pub fn reply_for(agent: &AgentConfig) -> String {
        match &agent.role {
            AgentRole::Routing => {
                "I am the router agent. Based on your request, I'll delegate to the general assistant."
                    .to_string()
            }
            AgentRole::Assistant => {
                format!("Hello! I'm the {}. How can I help you today?", agent.name)
            }
            AgentRole::ToolExecutor => {
                "I can execute tools for you. What tool would you like to use?".to_string()
            }
            AgentRole::Specialist => format!(
                "I'm a {} specialist. I'm here to help with {}-related tasks.",
                agent.name,
                agent.role.as_str()
            ),
            AgentRole::Other(_) => "I'm an agent ready to assist you.".to_string(),
        }
    }

    /// Word fragments that concatenate back to `text` exactly. Every
    /// fragment but the last carries its trailing space.
    pub fn word_fragments(text: &str) -> Vec<String> {
        let words: Vec<&str> = text.split_whitespace().collect();
        let last = words.len().saturating_sub(1);
        words
            .iter()
            .enumerate()
            .map(|(i, w)| if i == last { (*w).to_string() } else { format!("{w} ") })
            .collect()
    }

    pub fn fragments(agent: &AgentConfig, stream: bool) -> Vec<String> {
        let reply = Self::reply_for(agent);
        if stream {
            Self::word_fragments(&reply)
        } else {
            vec![reply]
        }
    }
}

#[async_trait]
impl CompletionProvider for LocalProvider {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn complete(&self, req: CompletionRequest) -> Result<FragmentStream, ProviderError> {
        let fragments = Self::fragments(&req.agent, req.stream);
        Ok(Box::pin(futures::stream::iter(
            fragments
                .into_iter()
                .map(|f| Ok::<_, ProviderError>(Fragment::Text(f))),
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;

    fn agent(name: &str, role: AgentRole) -> AgentConfig {
        AgentConfig {
            id: "a".into(),
            name: name.into(),
            role,
            system_prompt: String::new(),
            model: "gpt-4".into(),
            allowed_tools: vec![],
        }
    }

    #[test]
    fn replies_are_keyed_by_role() {
        assert_eq!(
            LocalProvider::reply_for(&agent("General Assistant", AgentRole::Assistant)),
            "Hello! I'm the General Assistant. How can I help you today?"
        );
        assert!(LocalProvider::reply_for(&agent("Router", AgentRole::Routing)).contains("delegate"));
        assert!(
            LocalProvider::reply_for(&agent("Ops", AgentRole::ToolExecutor))
                .contains("execute tools")
        );
        assert_eq!(
            LocalProvider::reply_for(&agent("Research", AgentRole::Specialist)),
            "I'm a Research specialist. I'm here to help with specialist-related tasks."
        );
        assert_eq!(
            LocalProvider::reply_for(&agent("X", AgentRole::Other("planner".into()))),
            "I'm an agent ready to assist you."
        );
    }

    #[test]
    fn streamed_words_rebuild_the_sentence() {
        let a = agent("General Assistant", AgentRole::Assistant);
        let words = LocalProvider::fragments(&a, true);
        assert_eq!(words.len(), 11);
        assert_eq!(words[0], "Hello! ");
        assert_eq!(words.concat(), LocalProvider::reply_for(&a));
        assert_eq!(LocalProvider::fragments(&a, false), [LocalProvider::reply_for(&a)]);
    }

    #[tokio::test]
    async fn provider_streams_fragments() {
        let a = agent("General Assistant", AgentRole::Assistant);
        let req = CompletionRequest {
            agent: a,
            messages: vec![],
            stream: true,
        };
        let out: Vec<Fragment> = LocalProvider.complete(req).await.unwrap().try_collect().await.unwrap();
        assert_eq!(out.len(), 11);
        assert!(out.iter().all(|f| matches!(f, Fragment::Text(_))));
    }
}
