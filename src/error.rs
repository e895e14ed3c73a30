use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;
use tracing::{error, warn};

use crate::{
    auth::{jwt::TokenError, store::StoreError},
    server::supervisor::SupervisorError,
};

/// Uniform response body: `code == 0` on success, non-zero with a message otherwise.
#[derive(Debug, Serialize)]
pub struct Envelope<T: Serialize> {
    pub code: u16,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

pub type ApiResult<T> = Result<Json<Envelope<T>>, ApiError>;

pub fn success<T: Serialize>(data: T) -> ApiResult<T> {
    Ok(Json(Envelope {
        code: 0,
        message: "success".into(),
        data: Some(data),
    }))
}

/// Success without a payload.
pub fn done() -> ApiResult<()> {
    Ok(Json(Envelope {
        code: 0,
        message: "success".into(),
        data: None,
    }))
}

/// Errors surfaced at the HTTP boundary.
///
/// Authorization problems keep their HTTP status so proxies and browsers can tell them
/// apart; everything else is a 200 envelope with `code = 1`.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    Unauthorized(String),
    #[error("{0}")]
    Forbidden(String),
    #[error("{0}")]
    Failure(String),
}

impl ApiError {
    pub fn failure(msg: impl Into<String>) -> Self {
        ApiError::Failure(msg.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            ApiError::Unauthorized(_) => (StatusCode::UNAUTHORIZED, 401),
            ApiError::Forbidden(_) => (StatusCode::FORBIDDEN, 403),
            ApiError::Failure(_) => (StatusCode::OK, 1),
        };
        let body = Envelope::<()> {
            code,
            message: self.to_string(),
            data: None,
        };
        (status, Json(body)).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Io(_) | StoreError::Serialize(_) | StoreError::Hash(_) => {
                error!(error = %e, "user store failure");
            }
            _ => warn!(error = %e, "user store rejected request"),
        }
        ApiError::Failure(e.to_string())
    }
}

impl From<TokenError> for ApiError {
    fn from(e: TokenError) -> Self {
        match e {
            TokenError::Sign(_) => {
                error!(error = %e, "token signing failed");
                ApiError::Failure("failed to issue token".into())
            }
            TokenError::Expired | TokenError::Invalid => ApiError::Unauthorized(e.to_string()),
        }
    }
}

impl From<SupervisorError> for ApiError {
    fn from(e: SupervisorError) -> Self {
        match e {
            SupervisorError::Io(_) => error!(error = %e, "server process failure"),
            _ => warn!(error = %e, "server control rejected"),
        }
        ApiError::Failure(e.to_string())
    }
}
