use crate::AppState;
use crate::config::AuthMode;
use crate::orchestrator::api::error::ApiError;
use axum::{
    extract::{Request, State},
    http::header,
    middleware::Next,
    response::Response,
};

/// Reject requests without a configured API key.
///
/// Accepts `Authorization: Bearer <key>` or the bare key.
pub async fn api_key_middleware(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    if state.config.security.auth_mode == AuthMode::None {
        return Ok(next.run(request).await);
    }

    let presented = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .map(|value| value.strip_prefix("Bearer ").unwrap_or(value).trim());

    match presented {
        Some(key) if !key.is_empty() && state.config.security.api_keys.iter().any(|k| k == key) => {
            Ok(next.run(request).await)
        }
        Some(_) => {
            tracing::warn!(name: "auth.rejected", path = %request.uri().path(), "Invalid API key");
            Err(ApiError::Unauthorized("Invalid API key".into()))
        }
        None => Err(ApiError::Unauthorized("Missing API key".into())),
    }
}
