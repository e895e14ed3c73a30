use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{request::Parts, HeaderMap},
};
use tracing::warn;

use super::claims::Identity;
use crate::{error::ApiError, state::AppState};

/// Requires a valid bearer token while authentication is enabled.
pub struct AuthUser(pub Identity);

/// An [`AuthUser`] with the admin role.
pub struct AdminUser(pub Identity);

/// Identity if a valid token was presented; never rejects.
pub struct MaybeAuthUser(pub Option<Identity>);

/// Pulls the token out of `Authorization: Bearer <token>`.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let auth = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())?;
    auth.strip_prefix("Bearer ")
        .or_else(|| auth.strip_prefix("bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

/// Resolves the caller's identity from an optional token.
pub async fn authorize(state: &AppState, token: Option<&str>) -> Result<Identity, ApiError> {
    if !state.users.is_enabled().await {
        return Ok(Identity::anonymous());
    }
    let token = token.ok_or_else(|| ApiError::Unauthorized("missing authorization token".into()))?;
    match state.jwt.verify(token) {
        Ok(claims) => Ok(claims.into()),
        Err(e) => {
            warn!(error = %e, "rejected token");
            Err(e.into())
        }
    }
}

#[async_trait]
impl FromRequestParts<AppState> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        authorize(state, bearer_token(&parts.headers)).await.map(AuthUser)
    }
}

#[async_trait]
impl FromRequestParts<AppState> for AdminUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let AuthUser(identity) = AuthUser::from_request_parts(parts, state).await?;
        if !identity.is_admin() {
            warn!(username = %identity.username, "admin route refused");
            return Err(ApiError::Forbidden("administrator role required".into()));
        }
        Ok(AdminUser(identity))
    }
}

#[async_trait]
impl FromRequestParts<AppState> for MaybeAuthUser {
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let identity = match bearer_token(&parts.headers) {
            Some(token) => state.jwt.verify(token).ok().map(Identity::from),
            None => None,
        };
        Ok(MaybeAuthUser(identity))
    }
}
