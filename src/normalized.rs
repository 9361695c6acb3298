//! Run lifecycle events.
//!
//! Events are ephemeral protocol messages produced while a run executes.
//! Each carries a name and a JSON payload, and frames as one server-sent
//! event.
//!
//! # Example
//!
//! ```rust
//! use agent_orchestrator::normalized::{RunEvent, sse_event};
//!
//! let event = RunEvent::ModelDelta {
//!     delta: "Hello ".to_string(),
//! };
//! let sse = sse_event(&event);
//! assert_eq!(sse, "event: model.delta\ndata: {\"delta\":\"Hello \"}\n\n");
//! ```

use serde::{Deserialize, Serialize};

/// Events emitted by the run executor, in order:
/// `run.started`, `step.started`, `model.delta*`, then one terminal event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event", content = "data")]
pub enum RunEvent {
    // ─────────────────────────────────────────────────────────────────────
    // Lifecycle
    // ─────────────────────────────────────────────────────────────────────
    #[serde(rename = "run.started")]
    RunStarted { run_id: String, agent_id: String },

    #[serde(rename = "step.started")]
    StepStarted { step_id: String, agent_id: String },

    // ─────────────────────────────────────────────────────────────────────
    // Content
    // ─────────────────────────────────────────────────────────────────────
    /// One fragment, exactly as the provider produced it.
    #[serde(rename = "model.delta")]
    ModelDelta { delta: String },

    // ─────────────────────────────────────────────────────────────────────
    // Terminal
    // ─────────────────────────────────────────────────────────────────────
    /// Carries the full assembled content, not a delta.
    #[serde(rename = "run.completed")]
    RunCompleted { run_id: String, message: String },

    #[serde(rename = "run.failed")]
    RunFailed { run_id: String, error: String },

    #[serde(rename = "run.cancelled")]
    RunCancelled { run_id: String },
}

impl RunEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::RunStarted { .. } => "run.started",
            Self::StepStarted { .. } => "step.started",
            Self::ModelDelta { .. } => "model.delta",
            Self::RunCompleted { .. } => "run.completed",
            Self::RunFailed { .. } => "run.failed",
            Self::RunCancelled { .. } => "run.cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::RunCompleted { .. } | Self::RunFailed { .. } | Self::RunCancelled { .. }
        )
    }

    /// The payload without the name tag.
    pub fn payload(&self) -> serde_json::Value {
        match serde_json::to_value(self) {
            Ok(serde_json::Value::Object(mut map)) => {
                map.remove("data").unwrap_or(serde_json::Value::Null)
            }
            Ok(_) => serde_json::Value::Null,
            Err(e) => serde_json::json!({ "error": e.to_string() }),
        }
    }
}

/// Frame an event as `event: <name>\ndata: <json>\n\n`.
pub fn sse_event(evt: &RunEvent) -> String {
    format!("event: {}\ndata: {}\n\n", evt.name(), evt.payload())
}
