use axum::{
    Json, Router,
    extract::{Request, State},
    middleware::Next,
    response::IntoResponse,
    routing::get,
};
use anyhow::Context;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::AppState;
use crate::config::AppConfig;
use crate::llm::{LlmSettings, build_provider};
use crate::mcp::ToolGateway;
use crate::mcp::registry::McpRegistry;
use crate::orchestrator::{
    api::{self, error::ApiError},
    catalog::AgentCatalog,
    persistence::{RunStore, SqliteStore},
    runtime::{ExecutorLimits, RunExecutor, RunManager},
    security::api_key_middleware,
};

/// Wire the catalog, store, tools, provider and run manager together.
pub async fn build_state(config: Arc<AppConfig>, settings: LlmSettings) -> anyhow::Result<AppState> {
    info!(
        name: "llm.config.loaded",
        base_url = %settings.base_url,
        model = %settings.default_model,
        "LLM configuration loaded"
    );

    let catalog = Arc::new(AgentCatalog::load_or_default(
        &config.agents.config_path,
        &settings.default_model,
    )?);
    info!(name: "agents.loaded", count = catalog.len(), "Agent catalog loaded");

    let store: Arc<dyn RunStore> = Arc::new(
        SqliteStore::new(&config.persistence.database_url)
            .await
            .context("failed to initialize the run store")?,
    );

    let mut tools = ToolGateway::with_builtin(Arc::clone(&catalog));
    if let Some(path) = &config.tools.mcp_config {
        let registry = McpRegistry::load_from_file(path)
            .await
            .with_context(|| format!("failed to load MCP servers from {path}"))?;
        tools = tools.with_backend(Arc::new(registry));
    }
    let tools = Arc::new(tools);
    for tool in tools.discover() {
        info!(name: "tool.discovered", tool = %tool.name, "Tool available");
    }

    let provider = build_provider(&settings).context("failed to build completion provider")?;
    let executor = RunExecutor::new(
        Arc::clone(&catalog),
        provider,
        Arc::clone(&store),
        Arc::clone(&tools),
    )
    .with_limits(ExecutorLimits {
        provider_budget: settings.request_timeout,
        ..ExecutorLimits::default()
    });
    let runs = Arc::new(RunManager::new(executor, Arc::clone(&store)));

    Ok(AppState {
        config,
        catalog,
        store,
        tools,
        runs,
    })
}

/// Full router: `/health` open, `/v1` behind the API key check.
pub fn router(state: AppState) -> Router {
    let timeout_duration = Duration::from_secs(state.config.server.request_timeout_secs);

    let v1 = api::router().layer(axum::middleware::from_fn_with_state(
        state.clone(),
        api_key_middleware,
    ));

    Router::new()
        .route("/health", get(health))
        .nest("/v1", v1)
        // Bounds time to response headers; SSE bodies stream past it.
        .layer(axum::middleware::from_fn(
            move |req: Request, next: Next| async move {
                match tokio::time::timeout(timeout_duration, next.run(req)).await {
                    Ok(res) => res,
                    Err(_) => ApiError::Timeout("Request timed out".into()).into_response(),
                }
            },
        ))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "provider": state.runs.executor().provider_name(),
        "agents": state.catalog.len(),
    }))
}

/// Start the Axum server with the provided configuration.
pub async fn start_server(config: Arc<AppConfig>, settings: LlmSettings) -> anyhow::Result<()> {
    let addr = config.bind_address();
    let state = build_state(config, settings).await?;
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    info!(name: "server.started", address = %addr, "Server started");

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!(name: "server.stopping", "Shutdown signal received");
        })
        .await?;
    Ok(())
}
