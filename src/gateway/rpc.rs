//! Handlers behind `/rpc/*`, the surface [`crate::auth::RemoteBackend`] calls.

use super::{
    client_key, error_response, extract_bearer_token, invalid_body, ok_json, rate_limited,
    require_session, ApiResponse, AppState,
};
use crate::auth::allowlist::normalize_email;
use crate::auth::model::{NewAccount, Role};
use crate::auth::notify::ResetNotice;
use crate::auth::token::SessionToken;
use crate::error::AuthError;
use crate::store::blocking;
use axum::{
    extract::{rejection::JsonRejection, Query, State},
    http::{Extensions, HeaderMap, StatusCode},
    response::Json,
};
use serde::Deserialize;

#[derive(Deserialize)]
pub struct CredentialsBody {
    pub email: String,
    pub password: String,
}

#[derive(Deserialize)]
pub struct OpenSessionBody {
    pub email: String,
    pub password: String,
    pub token: String,
    pub expires_at: i64,
}

#[derive(Deserialize)]
pub struct SignupBody {
    pub email: String,
    pub password: String,
    #[serde(default)]
    pub full_name: String,
}

#[derive(Deserialize)]
pub struct PasswordBody {
    pub new_password: String,
}

#[derive(Deserialize)]
pub struct ResetRequestBody {
    pub email: String,
}

#[derive(Deserialize)]
pub struct ResetConfirmBody {
    pub token: String,
    pub new_password: String,
}

#[derive(Deserialize)]
pub struct RoleQuery {
    pub role: Role,
}

#[derive(Deserialize)]
pub struct AccessQuery {
    pub path: String,
    pub role: Role,
}

/// GET /health
pub async fn handle_health() -> ApiResponse {
    (
        StatusCode::OK,
        Json(serde_json::json!({"status": "ok", "version": env!("CARGO_PKG_VERSION")})),
    )
}

/// POST /rpc/authenticate
pub async fn handle_authenticate(
    State(state): State<AppState>,
    headers: HeaderMap,
    extensions: Extensions,
    body: Result<Json<CredentialsBody>, JsonRejection>,
) -> ApiResponse {
    if !state.rate_limiter.allow_login(&client_key(&state, &headers, &extensions)) {
        tracing::warn!("/rpc/authenticate rate limit exceeded");
        return rate_limited();
    }
    let Json(body) = match body {
        Ok(body) => body,
        Err(e) => return invalid_body(&e),
    };

    let store = state.store.clone();
    match blocking(move || store.authenticate(&body.email, &body.password)).await {
        Ok(record) => ok_json(StatusCode::OK, &record),
        Err(e) => error_response(&e),
    }
}

/// POST /rpc/sessions
///
/// The requested expiry is clamped to the server's configured session
/// duration so a client cannot mint an indefinite session.
pub async fn handle_open_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    extensions: Extensions,
    body: Result<Json<OpenSessionBody>, JsonRejection>,
) -> ApiResponse {
    if !state.rate_limiter.allow_login(&client_key(&state, &headers, &extensions)) {
        tracing::warn!("/rpc/sessions rate limit exceeded");
        return rate_limited();
    }
    let Json(body) = match body {
        Ok(body) => body,
        Err(e) => return invalid_body(&e),
    };
    let token = match SessionToken::parse(&body.token) {
        Ok(token) => token,
        Err(_) => return error_response(&AuthError::InvalidInput("malformed session token".into())),
    };

    let store = state.store.clone();
    let max_secs = state.session_duration_secs;
    let result = blocking(move || {
        let expires_at = body.expires_at.min(store.now().saturating_add(max_secs));
        store.open_session(&body.email, &body.password, &token, expires_at)
    })
    .await;
    match result {
        Ok(user) => ok_json(StatusCode::OK, &user),
        Err(e) => error_response(&e),
    }
}

/// GET /rpc/sessions/current
pub async fn handle_current_session(State(state): State<AppState>, headers: HeaderMap) -> ApiResponse {
    match require_session(&state, &headers).await {
        Ok((user, _)) => ok_json(StatusCode::OK, &user),
        Err(response) => response,
    }
}

/// DELETE /rpc/sessions/current
///
/// Clears only if the bearer is still the recorded session, so a replaced
/// device signing out cannot end the newer device's session.
pub async fn handle_clear_session(State(state): State<AppState>, headers: HeaderMap) -> ApiResponse {
    let Some(raw) = extract_bearer_token(&headers) else {
        return error_response(&AuthError::NoSession);
    };
    let token = match SessionToken::parse(raw) {
        Ok(token) => token,
        Err(e) => return error_response(&e),
    };

    let store = state.store.clone();
    let (user_id, fingerprint) = (token.user_id().to_string(), token.fingerprint());
    match blocking(move || store.clear_session(&user_id, Some(&fingerprint))).await {
        Ok(cleared) => (StatusCode::OK, Json(serde_json::json!({ "cleared": cleared }))),
        Err(e) => error_response(&e),
    }
}

/// POST /rpc/accounts
pub async fn handle_create_account(
    State(state): State<AppState>,
    body: Result<Json<SignupBody>, JsonRejection>,
) -> ApiResponse {
    let Json(body) = match body {
        Ok(body) => body,
        Err(e) => return invalid_body(&e),
    };
    let role = match state.policy.role_for(&body.email) {
        Ok(role) => role,
        Err(e) => return error_response(&e),
    };

    let account = NewAccount {
        email: body.email,
        password: body.password,
        full_name: body.full_name,
        role,
        is_active: true,
    };
    let store = state.store.clone();
    match blocking(move || store.create_account(&account)).await {
        Ok(user) => {
            tracing::info!(user_id = %user.id, role = %user.role, "Account created");
            ok_json(StatusCode::CREATED, &user)
        }
        Err(e) => error_response(&e),
    }
}

/// POST /rpc/password
pub async fn handle_update_password(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<PasswordBody>, JsonRejection>,
) -> ApiResponse {
    let (user, _) = match require_session(&state, &headers).await {
        Ok(session) => session,
        Err(response) => return response,
    };
    let Json(body) = match body {
        Ok(body) => body,
        Err(e) => return invalid_body(&e),
    };

    let store = state.store.clone();
    match blocking(move || store.update_password(&user.id, &body.new_password)).await {
        Ok(updated) => (StatusCode::OK, Json(serde_json::json!({ "updated": updated }))),
        Err(e) => error_response(&e),
    }
}

/// POST /rpc/password-reset
///
/// The token goes to [`AppState::notifier`], never into the response.
pub async fn handle_request_reset(
    State(state): State<AppState>,
    headers: HeaderMap,
    extensions: Extensions,
    body: Result<Json<ResetRequestBody>, JsonRejection>,
) -> ApiResponse {
    if !state.rate_limiter.allow_reset(&client_key(&state, &headers, &extensions)) {
        tracing::warn!("/rpc/password-reset rate limit exceeded");
        return rate_limited();
    }
    let Json(body) = match body {
        Ok(body) => body,
        Err(e) => return invalid_body(&e),
    };

    let store = state.store.clone();
    let issued = blocking(move || {
        let email = normalize_email(&body.email)?;
        let issued = store.request_password_reset(&email)?;
        Ok((email, issued))
    })
    .await;
    let (email, issued) = match issued {
        Ok(issued) => issued,
        Err(e) => return error_response(&e),
    };

    if let (Some(token), Some(user_id), Some(full_name)) =
        (issued.token, issued.user_id, issued.full_name)
    {
        let notice = ResetNotice { email, user_id, full_name, token };
        if let Err(e) = state.notifier.deliver(&notice).await {
            tracing::warn!(user_id = %notice.user_id, error = %e, "Reset token delivery failed");
        }
    }
    // Same answer for known and unknown addresses.
    (StatusCode::OK, Json(serde_json::json!({ "success": true })))
}

/// POST /rpc/password-reset/confirm
pub async fn handle_confirm_reset(
    State(state): State<AppState>,
    headers: HeaderMap,
    extensions: Extensions,
    body: Result<Json<ResetConfirmBody>, JsonRejection>,
) -> ApiResponse {
    if !state.rate_limiter.allow_reset(&client_key(&state, &headers, &extensions)) {
        tracing::warn!("/rpc/password-reset/confirm rate limit exceeded");
        return rate_limited();
    }
    let Json(body) = match body {
        Ok(body) => body,
        Err(e) => return invalid_body(&e),
    };

    let store = state.store.clone();
    match blocking(move || store.reset_password_with_token(&body.token, &body.new_password)).await {
        Ok(outcome) => ok_json(StatusCode::OK, &outcome),
        Err(e) => error_response(&e),
    }
}

/// GET /rpc/pages?role=
pub async fn handle_accessible_pages(
    State(state): State<AppState>,
    query: Result<Query<RoleQuery>, axum::extract::rejection::QueryRejection>,
) -> ApiResponse {
    let Query(query) = match query {
        Ok(query) => query,
        Err(e) => return error_response(&AuthError::InvalidInput(e.to_string())),
    };

    let store = state.store.clone();
    match blocking(move || store.accessible_pages(query.role)).await {
        Ok(pages) => ok_json(StatusCode::OK, &pages),
        Err(e) => error_response(&e),
    }
}

/// GET /rpc/access?path=&role=
pub async fn handle_check_access(
    State(state): State<AppState>,
    query: Result<Query<AccessQuery>, axum::extract::rejection::QueryRejection>,
) -> ApiResponse {
    let Query(query) = match query {
        Ok(query) => query,
        Err(e) => return error_response(&AuthError::InvalidInput(e.to_string())),
    };

    let store = state.store.clone();
    match blocking(move || store.check_access(&query.path, query.role)).await {
        Ok(allowed) => (StatusCode::OK, Json(serde_json::json!({ "allowed": allowed }))),
        Err(e) => error_response(&e),
    }
}
