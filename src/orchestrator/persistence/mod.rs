use crate::orchestrator::domain::{Conversation, Message, Run, Step, ToolCall};
use anyhow::Result;
use async_trait::async_trait;

pub mod providers;

pub use providers::sqlite::SqliteStore;

/// Durable store for the execution trace.
///
/// Every write method is one transaction. The state-machine writes refuse
/// to touch a run that is already terminal.
#[async_trait]
pub trait RunStore: Send + Sync + std::fmt::Debug {
    // =========================================================================
    // Conversations & Messages
    // =========================================================================

    async fn create_conversation(&self, conversation: &Conversation) -> Result<()>;

    async fn get_conversation(&self, id: &str) -> Result<Option<Conversation>>;

    /// Append a turn and bump the conversation's `updated_at`.
    async fn append_message(&self, message: &Message) -> Result<()>;

    /// Chronological by creation time, ties in insertion order.
    async fn list_messages(&self, conversation_id: &str) -> Result<Vec<Message>>;

    // =========================================================================
    // Runs, Steps & Tool Calls (reads)
    // =========================================================================

    async fn create_run(&self, run: &Run) -> Result<()>;

    async fn get_run(&self, id: &str) -> Result<Option<Run>>;

    /// Ordered by step number.
    async fn list_steps(&self, run_id: &str) -> Result<Vec<Step>>;

    async fn list_tool_calls(&self, step_id: &str) -> Result<Vec<ToolCall>>;

    // =========================================================================
    // State transitions
    // =========================================================================

    /// `queued -> running`. Fails if the run is no longer queued.
    async fn mark_running(&self, run: &Run) -> Result<()>;

    async fn insert_step(&self, step: &Step) -> Result<()>;

    /// Insert or finish a tool call record.
    async fn save_tool_call(&self, call: &ToolCall) -> Result<()>;

    /// Completed step, assistant reply and completed run, atomically.
    async fn commit_completion(&self, run: &Run, step: &Step, reply: &Message) -> Result<()>;

    /// Failed or cancelled run, plus its step when one exists, atomically.
    async fn commit_terminal(&self, run: &Run, step: Option<&Step>) -> Result<()>;
}
