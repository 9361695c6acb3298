//! Agent run orchestrator
//!
//! Executes agent runs against a conversation: resolves the agent, calls a
//! completion provider, streams fragments to the caller, and records the
//! whole execution trace transactionally.
//!
//! # Architecture
//!
//! - **Server**: Axum HTTP API with SSE streaming of run events
//! - **Runtime**: per-run state machine with cancellation and an execution budget
//! - **Providers**: OpenAI-compatible remote completions with a deterministic local fallback
//! - **Store**: SQLite via sqlx, one transaction per state transition
//!
//! # Modules
//!
//! - [`llm`]: completion providers and strategy selection
//! - [`mcp`]: tool gateway, built-in tools and MCP servers
//! - [`normalized`]: run event model and SSE framing
//! - [`orchestrator`]: domain, catalog, store, runtime and API

// Allow pedantic clippy warnings that don't add value for this codebase
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::missing_fields_in_debug)]
#![allow(clippy::implicit_hasher)]
#![allow(clippy::assigning_clones)]
#![allow(clippy::match_same_arms)]
#![allow(clippy::cargo_common_metadata)]
#![allow(clippy::multiple_crate_versions)]
#![allow(clippy::default_trait_access)]
#![allow(clippy::unused_async)]

pub mod config;
pub mod llm;
pub mod mcp;
pub mod normalized;
pub mod orchestrator;
pub mod server;

use crate::config::AppConfig;
use crate::mcp::ToolGateway;
use crate::orchestrator::catalog::AgentCatalog;
use crate::orchestrator::persistence::RunStore;
use crate::orchestrator::runtime::RunManager;
use std::sync::Arc;

/// Application state shared across all handlers.
#[derive(Clone, Debug)]
pub struct AppState {
    /// Global Configuration
    pub config: Arc<AppConfig>,
    /// Agents known to this deployment.
    pub catalog: Arc<AgentCatalog>,
    /// Execution trace store.
    pub store: Arc<dyn RunStore>,
    /// Built-in and MCP tools.
    pub tools: Arc<ToolGateway>,
    /// Submission, execution and cancellation of runs.
    pub runs: Arc<RunManager>,
}
