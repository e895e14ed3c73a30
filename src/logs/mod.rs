use crate::state::AppState;
use axum::Router;

pub mod broadcaster;
pub mod handlers;
pub mod tailer;

pub fn router() -> Router<AppState> {
    handlers::log_routes()
}
