//! Run orchestration: agents, the execution trace, and the run state
//! machine, plus the HTTP surface over them.

pub mod api;
pub mod catalog;
pub mod defaults;
pub mod domain;
pub mod persistence;
pub mod runtime;
pub mod security;
pub mod telemetry;
