//! Data contracts shared by the executor, the store and the HTTP layer.

pub mod agents;
pub mod messages;
pub mod runs;

pub use agents::{AgentConfig, AgentRole};
pub use messages::{Conversation, Message, MessageRole};
pub use runs::{Run, RunStatus, Step, StepStatus, ToolCall, TransitionError};
