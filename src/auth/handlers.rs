use axum::{
    extract::{Path, State},
    routing::{get, post, put},
    Json, Router,
};
use lazy_static::lazy_static;
use regex::Regex;
use tracing::{info, instrument, warn};

use crate::{
    auth::{
        dto::{
            AuthStatus, ChangePasswordRequest, CreateUserRequest, LoginRequest, LoginResponse,
            MessageResponse, Profile, UpdateUserRequest,
        },
        extractors::{AdminUser, AuthUser, MaybeAuthUser},
        store::BOOTSTRAP_USERNAME,
        user::{PublicUser, Role},
    },
    error::{done, success, ApiError, ApiResult},
    state::AppState,
};

const MIN_PASSWORD_LEN: usize = 6;

/// Usernames end up in URL paths, so no whitespace or slashes.
pub(crate) fn is_valid_username(username: &str) -> bool {
    lazy_static! {
        static ref USERNAME_RE: Regex = Regex::new(r"^[^\s/]{1,64}$").unwrap();
    }
    USERNAME_RE.is_match(username)
}

fn check_new_password(password: &str) -> Result<(), ApiError> {
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(ApiError::failure(format!(
            "password must be at least {MIN_PASSWORD_LEN} characters"
        )));
    }
    Ok(())
}

pub fn auth_routes() -> Router<AppState> {
    Router::new()
        .route("/auth/login", post(login))
        .route("/auth/status", get(status))
        .route("/auth/logout", post(logout))
        .route("/auth/profile", get(profile))
        .route("/auth/password", post(change_password))
}

pub fn user_routes() -> Router<AppState> {
    Router::new()
        .route("/auth/users", get(list_users).post(create_user))
        .route("/auth/users/:username", put(update_user).delete(delete_user))
}

#[instrument(skip(state, payload))]
pub async fn login(
    State(state): State<AppState>,
    Json(payload): Json<LoginRequest>,
) -> ApiResult<LoginResponse> {
    if payload.username.is_empty() || payload.password.is_empty() {
        return Err(ApiError::failure("username and password are required"));
    }

    let user = match state
        .users
        .authenticate(&payload.username, &payload.password)
        .await
    {
        Ok(Some(u)) => u,
        Ok(None) => {
            return success(LoginResponse {
                enabled: false,
                token: None,
                username: None,
                role: None,
                expires_at: None,
            })
        }
        Err(e) => {
            warn!(username = %payload.username, "login rejected");
            return Err(e.into());
        }
    };

    let (token, expires_at) = state.jwt.issue(&user.username, user.role)?;
    if let Err(e) = state.users.record_login(&user.username).await {
        warn!(error = %e, username = %user.username, "failed to record last login");
    }

    info!(username = %user.username, role = %user.role, "user logged in");
    success(LoginResponse {
        enabled: true,
        token: Some(token),
        username: Some(user.username),
        role: Some(user.role),
        expires_at: Some(expires_at),
    })
}

#[instrument(skip_all)]
pub async fn status(
    State(state): State<AppState>,
    MaybeAuthUser(identity): MaybeAuthUser,
) -> ApiResult<AuthStatus> {
    let enabled = state.users.is_enabled().await;
    let default_password = state.users.uses_default_password().await;
    let (username, role) = match identity {
        Some(id) => (Some(id.username), Some(id.role)),
        None => (None, None),
    };
    success(AuthStatus {
        enabled,
        authenticated: username.is_some(),
        username,
        role,
        default_password,
    })
}

/// Tokens are not revocable; the client just discards its copy.
#[instrument(skip_all, fields(username = %user.username))]
pub async fn logout(AuthUser(user): AuthUser) -> ApiResult<()> {
    info!("user logged out");
    done()
}

pub async fn profile(AuthUser(user): AuthUser) -> ApiResult<Profile> {
    success(Profile {
        username: user.username,
        role: user.role,
    })
}

#[instrument(skip_all, fields(username = %me.username))]
pub async fn change_password(
    State(state): State<AppState>,
    AuthUser(me): AuthUser,
    Json(req): Json<ChangePasswordRequest>,
) -> ApiResult<MessageResponse> {
    check_new_password(&req.new_password)?;
    if state
        .users
        .verify_password(&me.username, &req.old_password)
        .await
        .is_err()
    {
        warn!("password change with wrong current password");
        return Err(ApiError::failure("current password is incorrect"));
    }

    let rename = req
        .new_username
        .filter(|n| !n.is_empty() && *n != me.username);
    let Some(new_name) = rename else {
        state.users.update(&me.username, &req.new_password, "").await?;
        info!("password changed");
        return success(MessageResponse::new("password changed"));
    };

    if !is_valid_username(&new_name) {
        return Err(ApiError::failure("invalid username"));
    }
    if state.users.get(&new_name).await.is_some() {
        return Err(ApiError::failure("username already exists"));
    }
    if me.username == BOOTSTRAP_USERNAME {
        // the bootstrap account cannot be removed, so it keeps its name
        state.users.update(&me.username, &req.new_password, "").await?;
        return success(MessageResponse {
            username: Some(me.username),
            ..MessageResponse::new("system account keeps its name; only the password was changed")
        });
    }

    state
        .users
        .create(&new_name, &req.new_password, me.role.as_str())
        .await?;
    state.users.delete(&me.username).await?;
    info!(new_username = %new_name, "account renamed");
    success(MessageResponse {
        username: Some(new_name),
        relogin: true,
        ..MessageResponse::new("username and password updated, please log in again")
    })
}

#[instrument(skip_all)]
pub async fn list_users(
    State(state): State<AppState>,
    _admin: AdminUser,
) -> ApiResult<Vec<PublicUser>> {
    success(state.users.list().await)
}

#[instrument(skip(state, admin, req), fields(admin = %admin.0.username, username = %req.username))]
pub async fn create_user(
    State(state): State<AppState>,
    admin: AdminUser,
    Json(req): Json<CreateUserRequest>,
) -> ApiResult<MessageResponse> {
    if !is_valid_username(&req.username) {
        return Err(ApiError::failure("invalid username"));
    }
    check_new_password(&req.password)?;
    if Role::parse(&req.role).is_none() {
        return Err(ApiError::failure("role must be admin or user"));
    }

    state
        .users
        .create(&req.username, &req.password, &req.role)
        .await?;
    if !state.users.is_enabled().await {
        state.users.set_enabled(true).await?;
    }
    success(MessageResponse::new("user created"))
}

#[instrument(skip(state, me, req), fields(by = %me.username))]
pub async fn update_user(
    State(state): State<AppState>,
    AuthUser(me): AuthUser,
    Path(username): Path<String>,
    Json(req): Json<UpdateUserRequest>,
) -> ApiResult<MessageResponse> {
    if !me.is_admin() && me.username != username {
        return Err(ApiError::Forbidden("cannot modify other users".into()));
    }
    if !me.is_admin() && !req.role.is_empty() {
        return Err(ApiError::failure("only administrators can change roles"));
    }
    if !req.password.is_empty() {
        check_new_password(&req.password)?;
    }

    state.users.update(&username, &req.password, &req.role).await?;
    success(MessageResponse::new("user updated"))
}

#[instrument(skip(state, admin), fields(by = %admin.0.username))]
pub async fn delete_user(
    State(state): State<AppState>,
    admin: AdminUser,
    Path(username): Path<String>,
) -> ApiResult<MessageResponse> {
    state.users.delete(&username).await?;
    success(MessageResponse::new("user deleted"))
}
