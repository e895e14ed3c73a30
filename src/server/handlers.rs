use axum::{
    extract::State,
    routing::{get, post},
    Router,
};
use serde::Serialize;
use tracing::{info, instrument};

use super::supervisor::ServerStatus;
use crate::{
    auth::extractors::AuthUser,
    error::{done, success, ApiResult},
    state::AppState,
};

#[derive(Debug, Serialize)]
pub struct StartedResponse {
    pub pid: u32,
}

pub fn server_routes() -> Router<AppState> {
    Router::new()
        .route("/server/status", get(status))
        .route("/server/start", post(start))
        .route("/server/stop", post(stop))
        .route("/server/restart", post(restart))
}

#[instrument(skip(state, _user))]
pub async fn status(State(state): State<AppState>, _user: AuthUser) -> ApiResult<ServerStatus> {
    success(state.supervisor.status(&state.launch()).await)
}

#[instrument(skip(state, user), fields(username = %user.0.username))]
pub async fn start(State(state): State<AppState>, user: AuthUser) -> ApiResult<StartedResponse> {
    let pid = state.supervisor.start(&state.launch()).await?;
    info!(pid, "start requested");
    success(StartedResponse { pid })
}

#[instrument(skip(state, user), fields(username = %user.0.username))]
pub async fn stop(State(state): State<AppState>, user: AuthUser) -> ApiResult<()> {
    state.supervisor.stop().await?;
    done()
}

#[instrument(skip(state, user), fields(username = %user.0.username))]
pub async fn restart(State(state): State<AppState>, user: AuthUser) -> ApiResult<StartedResponse> {
    let pid = state.supervisor.restart(&state.launch()).await?;
    info!(pid, "restart requested");
    success(StartedResponse { pid })
}
