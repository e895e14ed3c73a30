use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    http::HeaderMap,
    response::Response,
    routing::get,
    Router,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tracing::{debug, info, instrument};

use crate::{
    auth::extractors::{authorize, bearer_token},
    error::ApiError,
    state::AppState,
};

#[derive(Debug, Deserialize)]
pub struct StreamQuery {
    pub token: Option<String>,
}

pub fn log_routes() -> Router<AppState> {
    Router::new().route("/ws/logs", get(stream_logs))
}

/// Browsers cannot set headers on a WebSocket upgrade, so the token may also come as `?token=`.
#[instrument(skip_all)]
pub async fn stream_logs(
    State(state): State<AppState>,
    Query(q): Query<StreamQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    let token = bearer_token(&headers).or(q.token.as_deref());
    let identity = authorize(&state, token).await?;
    info!(username = %identity.username, "log stream opened");
    Ok(ws.on_upgrade(move |socket| pump(socket, state)))
}

async fn pump(socket: WebSocket, state: AppState) {
    let mut sub = state.logs.subscribe();
    let id = sub.id();
    let (mut sender, mut receiver) = socket.split();

    let mut send_task = tokio::spawn(async move {
        while let Some(line) = sub.recv().await {
            if sender.send(Message::Text(line.text)).await.is_err() {
                break;
            }
        }
    });
    // Client frames are ignored; reading only detects the disconnect.
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            if matches!(msg, Message::Close(_)) {
                break;
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }
    debug!(subscriber = id, "log stream closed");
}
