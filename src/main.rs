//! Agent run orchestrator server
//!
//! Entry point: loads configuration, installs logging, serves the API.

use mimalloc::MiMalloc;

/// Global allocator for improved performance (M-MIMALLOC-APPS).
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

use std::sync::Arc;

use agent_orchestrator::config::{AppConfig, load_llm_settings};
use agent_orchestrator::orchestrator::telemetry;
use agent_orchestrator::server;
use dotenvy::dotenv;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env (if present)
    let _ = dotenv();

    let config = Arc::new(AppConfig::load()?);
    telemetry::init(config.log_format);

    tracing::debug!(name: "config.loaded", config = ?config, "Configuration loaded");

    let settings = load_llm_settings(&config.llm);
    server::start_server(config, settings).await
}
