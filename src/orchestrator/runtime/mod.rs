//! Run execution: the per-run state machine, its event channel, and the
//! registry of in-flight runs.

pub mod error;
pub mod executor;
pub mod manager;
pub mod stream;

pub use error::RunError;
pub use executor::{ExecutorLimits, RunExecutor};
pub use manager::{CancelOutcome, ObserverStream, RunManager};
pub use stream::{DeliveryMode, RunEvents, RunSummary};
