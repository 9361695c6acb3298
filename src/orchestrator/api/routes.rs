use axum::{
    Json, Router,
    extract::{Path, State},
    http::{HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use futures::StreamExt;
use serde::{Deserialize, Serialize};

use super::error::ApiError;
use super::sse::build_sse_response;
use crate::AppState;
use crate::mcp::ToolSpec;
use crate::orchestrator::domain::{
    AgentConfig, Conversation, Message, MessageRole, Run, Step, ToolCall,
};
use crate::orchestrator::runtime::{CancelOutcome, DeliveryMode};

pub fn build_router() -> Router<AppState> {
    Router::new()
        .route("/conversations", post(create_conversation))
        .route("/conversations/{id}", get(get_conversation))
        .route(
            "/conversations/{id}/messages",
            post(append_message).get(list_messages),
        )
        .route("/conversations/{id}/runs", post(create_run))
        .route("/runs/{id}", get(get_run))
        .route("/runs/{id}/steps", get(list_steps))
        .route("/runs/{id}/events", get(observe_run))
        .route("/runs/{id}/cancel", post(cancel_run))
        .route("/steps/{id}/tool-calls", get(list_tool_calls))
        .route("/agents", get(list_agents))
        .route("/agents/{id}", get(get_agent))
        .route("/tools", get(list_tools))
        .route("/tools/{name}", get(get_tool))
}

// ─────────────────────────────────────────────────────────────────────────────
// Conversations
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct CreateConversationRequest {
    #[serde(default = "empty_object")]
    metadata: serde_json::Value,
}

impl Default for CreateConversationRequest {
    fn default() -> Self {
        Self {
            metadata: empty_object(),
        }
    }
}

fn empty_object() -> serde_json::Value {
    serde_json::json!({})
}

async fn create_conversation(
    State(state): State<AppState>,
    body: Option<Json<CreateConversationRequest>>,
) -> Result<(StatusCode, Json<Conversation>), ApiError> {
    let Json(req) = body.unwrap_or_default();
    let conversation = Conversation::new(req.metadata);
    state.store.create_conversation(&conversation).await?;
    tracing::info!(name: "conversation.created", conversation_id = %conversation.id, "Conversation created");
    Ok((StatusCode::CREATED, Json(conversation)))
}

async fn require_conversation(state: &AppState, id: &str) -> Result<Conversation, ApiError> {
    state
        .store
        .get_conversation(id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Conversation not found: {id}")))
}

async fn get_conversation(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Conversation>, ApiError> {
    Ok(Json(require_conversation(&state, &id).await?))
}

#[derive(Debug, Deserialize)]
struct AppendMessageRequest {
    #[serde(default = "default_role")]
    role: MessageRole,
    content: String,
    #[serde(default)]
    attachments: Vec<serde_json::Value>,
}

fn default_role() -> MessageRole {
    MessageRole::User
}

async fn append_message(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<AppendMessageRequest>,
) -> Result<(StatusCode, Json<Message>), ApiError> {
    require_conversation(&state, &id).await?;
    let message = Message::new(&id, req.role, req.content).with_attachments(req.attachments);
    state.store.append_message(&message).await?;
    Ok((StatusCode::CREATED, Json(message)))
}

async fn list_messages(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Vec<Message>>, ApiError> {
    require_conversation(&state, &id).await?;
    Ok(Json(state.store.list_messages(&id).await?))
}

// ─────────────────────────────────────────────────────────────────────────────
// Runs
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct CreateRunRequest {
    #[serde(default = "default_agent")]
    agent_id: String,
    #[serde(default)]
    stream: bool,
    #[serde(default = "empty_object")]
    metadata: serde_json::Value,
}

impl Default for CreateRunRequest {
    fn default() -> Self {
        Self {
            agent_id: default_agent(),
            stream: false,
            metadata: empty_object(),
        }
    }
}

fn default_agent() -> String {
    "router".to_string()
}

/// Buffered: wait and return `{run_id, status}`. Streaming: SSE of the
/// run's events. Dropping the connection cancels the run either way.
async fn create_run(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Option<Json<CreateRunRequest>>,
) -> Result<Response, ApiError> {
    let Json(req) = body.unwrap_or_default();
    let run = state.runs.submit(&id, &req.agent_id, req.metadata).await?;
    let run_id = run.id.clone();
    let events = state
        .runs
        .start(run, DeliveryMode::from_stream_flag(req.stream))
        .await;

    if !req.stream {
        let summary = events.finish().await?;
        return Ok(Json(summary).into_response());
    }

    // Failures already arrive as `run.failed` events.
    let stream = events.into_stream().filter_map(|item| async move {
        match item {
            Ok(event) => Some(event),
            Err(e) => {
                tracing::debug!(name: "run.stream_closed", error = %e, "Run ended with an error");
                None
            }
        }
    });

    let mut response = build_sse_response(stream).into_response();
    if let Ok(value) = HeaderValue::from_str(&run_id) {
        response.headers_mut().insert("x-run-id", value);
    }
    Ok(response)
}

async fn require_run(state: &AppState, id: &str) -> Result<Run, ApiError> {
    state
        .store
        .get_run(id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Run not found: {id}")))
}

async fn get_run(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Run>, ApiError> {
    Ok(Json(require_run(&state, &id).await?))
}

async fn list_steps(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Vec<Step>>, ApiError> {
    require_run(&state, &id).await?;
    Ok(Json(state.store.list_steps(&id).await?))
}

async fn observe_run(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    match state.runs.subscribe(&id).await {
        Some(stream) => Ok(build_sse_response(stream).into_response()),
        None => {
            let run = require_run(&state, &id).await?;
            Err(ApiError::Conflict(format!(
                "Run {} is {} and has no live events",
                run.id, run.status
            )))
        }
    }
}

#[derive(Debug, Serialize)]
struct CancelResponse {
    run_id: String,
    status: &'static str,
}

async fn cancel_run(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<CancelResponse>), ApiError> {
    let (code, status) = match state.runs.cancel(&id).await? {
        CancelOutcome::Signalled => (StatusCode::ACCEPTED, "cancelling"),
        CancelOutcome::Cancelled => (StatusCode::OK, "cancelled"),
    };
    Ok((code, Json(CancelResponse { run_id: id, status })))
}

async fn list_tool_calls(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Vec<ToolCall>>, ApiError> {
    Ok(Json(state.store.list_tool_calls(&id).await?))
}

// ─────────────────────────────────────────────────────────────────────────────
// Catalog
// ─────────────────────────────────────────────────────────────────────────────

async fn list_agents(State(state): State<AppState>) -> Json<Vec<AgentConfig>> {
    Json(state.catalog.list().to_vec())
}

async fn get_agent(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<AgentConfig>, ApiError> {
    state
        .catalog
        .resolve(&id)
        .cloned()
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("Agent not found: {id}")))
}

async fn list_tools(State(state): State<AppState>) -> Json<Vec<ToolSpec>> {
    Json(state.tools.discover())
}

async fn get_tool(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<ToolSpec>, ApiError> {
    state
        .tools
        .get(&name)
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("Unknown tool: {name}")))
}
