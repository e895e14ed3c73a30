use crate::state::AppState;
use axum::Router;

pub mod handlers;
pub mod probe;
pub mod supervisor;

pub fn router() -> Router<AppState> {
    Router::new().merge(handlers::server_routes())
}
