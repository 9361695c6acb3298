use std::time::Duration;

use crate::orchestrator::domain::RunStatus;

/// Run-level failures. Provider errors never show up here; they are
/// absorbed by the fallback provider.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RunError {
    #[error("Agent not found: {0}")]
    AgentNotFound(String),
    #[error("Conversation not found: {0}")]
    ConversationNotFound(String),
    #[error("Run not found: {0}")]
    RunNotFound(String),
    #[error("Run {run_id} is {status}")]
    InvalidState { run_id: String, status: RunStatus },
    #[error("Provider exceeded the {}s execution budget", .0.as_secs())]
    BudgetExceeded(Duration),
    #[error("{0}")]
    Execution(String),
}

impl RunError {
    /// Keep the whole context chain of a store error.
    pub fn execution(err: &anyhow::Error) -> Self {
        Self::Execution(format!("{err:#}"))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::AgentNotFound(_) | Self::ConversationNotFound(_) | Self::RunNotFound(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_carry_identifiers() {
        assert_eq!(
            RunError::AgentNotFound("ghost".into()).to_string(),
            "Agent not found: ghost"
        );
        assert_eq!(
            RunError::BudgetExceeded(Duration::from_secs(30)).to_string(),
            "Provider exceeded the 30s execution budget"
        );
        let err = RunError::InvalidState {
            run_id: "r1".into(),
            status: RunStatus::Completed,
        };
        assert_eq!(err.to_string(), "Run r1 is completed");
    }

    #[test]
    fn execution_keeps_context_chain() {
        let err = anyhow::anyhow!("disk full").context("failed to insert step 1");
        assert_eq!(
            RunError::execution(&err).to_string(),
            "failed to insert step 1: disk full"
        );
    }
}
