pub mod error;
pub mod routes;
pub mod sse;

use crate::AppState;
use axum::Router;

pub fn router() -> Router<AppState> {
    routes::build_router()
}
