use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lifecycle of a run: `queued -> running -> {completed | failed | cancelled}`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub const TERMINAL: [RunStatus; 3] = [Self::Completed, Self::Failed, Self::Cancelled];

    pub fn is_terminal(self) -> bool {
        Self::TERMINAL.contains(&self)
    }

    /// Whether `self -> next` is an edge of the run state machine.
    pub fn can_transition_to(self, next: RunStatus) -> bool {
        matches!(
            (self, next),
            (Self::Queued, Self::Running | Self::Cancelled)
                | (
                    Self::Running,
                    Self::Completed | Self::Failed | Self::Cancelled
                )
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl StepStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StepStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown status: {0}")]
pub struct UnknownStatus(pub String);

/// Rejected state-machine edge.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid {entity} transition: {from} -> {to}")]
pub struct TransitionError {
    pub entity: &'static str,
    pub from: String,
    pub to: String,
}

/// One execution attempt of an agent against a conversation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Run {
    pub id: String,
    pub conversation_id: String,
    pub agent_id: String,
    pub status: RunStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    /// Set iff `status` is terminal.
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub metadata: serde_json::Value,
}

impl Run {
    pub fn queued(
        conversation_id: impl Into<String>,
        agent_id: impl Into<String>,
        metadata: serde_json::Value,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            conversation_id: conversation_id.into(),
            agent_id: agent_id.into(),
            status: RunStatus::Queued,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error: None,
            metadata,
        }
    }

    fn transition(&mut self, next: RunStatus) -> Result<(), TransitionError> {
        if !self.status.can_transition_to(next) {
            return Err(TransitionError {
                entity: "run",
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        let now = Utc::now();
        if next == RunStatus::Running {
            self.started_at = Some(now);
        }
        if next.is_terminal() {
            self.completed_at = Some(now);
        }
        self.status = next;
        Ok(())
    }

    pub fn start(&mut self) -> Result<(), TransitionError> {
        self.transition(RunStatus::Running)
    }

    pub fn complete(&mut self) -> Result<(), TransitionError> {
        self.transition(RunStatus::Completed)
    }

    pub fn fail(&mut self, error: impl Into<String>) -> Result<(), TransitionError> {
        self.transition(RunStatus::Failed)?;
        self.error = Some(error.into());
        Ok(())
    }

    pub fn cancel(&mut self) -> Result<(), TransitionError> {
        self.transition(RunStatus::Cancelled)
    }
}

/// One numbered unit of agent work inside a run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Step {
    pub id: String,
    pub run_id: String,
    pub step_number: i64,
    pub agent_id: String,
    pub status: StepStatus,
    pub input: serde_json::Value,
    pub output: Option<serde_json::Value>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl Step {
    pub fn pending(
        run_id: impl Into<String>,
        step_number: i64,
        agent_id: impl Into<String>,
        input: serde_json::Value,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            run_id: run_id.into(),
            step_number,
            agent_id: agent_id.into(),
            status: StepStatus::Pending,
            input,
            output: None,
            started_at: Utc::now(),
            completed_at: None,
            error: None,
        }
    }

    fn transition(&mut self, next: StepStatus) -> Result<(), TransitionError> {
        let allowed = matches!(
            (self.status, next),
            (StepStatus::Pending, StepStatus::Running)
                | (StepStatus::Running, StepStatus::Completed | StepStatus::Failed)
        );
        if !allowed {
            return Err(TransitionError {
                entity: "step",
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        if next == StepStatus::Running {
            self.started_at = Utc::now();
        }
        if next.is_terminal() {
            self.completed_at = Some(Utc::now());
        }
        self.status = next;
        Ok(())
    }

    pub fn dispatch(&mut self) -> Result<(), TransitionError> {
        self.transition(StepStatus::Running)
    }

    pub fn complete(&mut self, output: serde_json::Value) -> Result<(), TransitionError> {
        self.transition(StepStatus::Completed)?;
        self.output = Some(output);
        Ok(())
    }

    pub fn fail(&mut self, error: impl Into<String>) -> Result<(), TransitionError> {
        self.transition(StepStatus::Failed)?;
        self.error = Some(error.into());
        Ok(())
    }
}

/// One tool invocation within a step. Once finished, exactly one of
/// `result` / `error` is set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCall {
    pub id: String,
    pub step_id: String,
    pub tool_name: String,
    pub arguments: serde_json::Value,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ToolCall {
    pub fn begin(
        step_id: impl Into<String>,
        tool_name: impl Into<String>,
        arguments: serde_json::Value,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            step_id: step_id.into(),
            tool_name: tool_name.into(),
            arguments,
            result: None,
            error: None,
            started_at: Utc::now(),
            completed_at: None,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.completed_at.is_some()
    }

    pub fn succeed(&mut self, result: serde_json::Value) {
        self.result = Some(result);
        self.error = None;
        self.completed_at = Some(Utc::now());
    }

    pub fn fail(&mut self, error: impl Into<String>) {
        self.error = Some(error.into());
        self.result = None;
        self.completed_at = Some(Utc::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn run_walks_the_happy_path() {
        let mut run = Run::queued("conv", "router", json!({}));
        assert!(run.completed_at.is_none());

        run.start().unwrap();
        assert_eq!(run.status, RunStatus::Running);
        assert!(run.started_at.is_some());
        assert!(run.completed_at.is_none());

        run.complete().unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert!(run.completed_at.is_some());
    }

    #[test]
    fn terminal_runs_reject_further_transitions() {
        let mut run = Run::queued("conv", "router", json!({}));
        run.start().unwrap();
        run.fail("boom").unwrap();

        assert_eq!(run.error.as_deref(), Some("boom"));
        assert!(run.complete().is_err());
        assert!(run.cancel().is_err());
        assert!(run.start().is_err());
        assert_eq!(run.status, RunStatus::Failed);
    }

    #[test]
    fn queued_run_can_be_cancelled_but_not_completed() {
        let mut run = Run::queued("conv", "router", json!({}));
        assert!(run.complete().is_err());
        run.cancel().unwrap();
        assert_eq!(run.status, RunStatus::Cancelled);
        assert!(run.completed_at.is_some());
        assert!(run.started_at.is_none());
    }

    #[test]
    fn step_never_regresses_to_pending() {
        let mut step = Step::pending("run", 1, "router", json!({"messages": []}));
        assert!(step.complete(json!({})).is_err());
        step.dispatch().unwrap();
        assert!(step.dispatch().is_err());
        step.complete(json!({"content": "hi"})).unwrap();
        assert_eq!(step.status, StepStatus::Completed);
        assert!(step.fail("late").is_err());
    }

    #[test]
    fn tool_call_keeps_exactly_one_outcome() {
        let mut call = ToolCall::begin("step", "db_query", json!({"query": "select 1"}));
        assert!(!call.is_finished());

        call.succeed(json!({"rows": 1}));
        assert!(call.result.is_some() && call.error.is_none());

        call.fail("late failure");
        assert!(call.result.is_none());
        assert_eq!(call.error.as_deref(), Some("late failure"));
    }

    #[test]
    fn status_round_trips_through_text() {
        for status in [
            RunStatus::Queued,
            RunStatus::Running,
            RunStatus::Completed,
            RunStatus::Failed,
            RunStatus::Cancelled,
        ] {
            assert_eq!(status.as_str().parse::<RunStatus>().unwrap(), status);
        }
        assert!("done".parse::<RunStatus>().is_err());
    }
}
