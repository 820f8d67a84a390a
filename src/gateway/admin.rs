//! Bearer-authenticated administration: page matrix edits and account
//! activation. The acting role is always the one stored for the bearer's
//! user, never a value supplied in the request.

use super::{error_response, invalid_body, ok_json, require_session, ApiResponse, AppState};
use crate::access::{PageDefinition, PAGE_RESTRICTIONS_PATH};
use crate::auth::model::Role;
use crate::error::AuthError;
use crate::store::blocking;
use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::{HeaderMap, StatusCode},
    response::Json,
};
use serde::Deserialize;

/// Page that gates account administration for non-admin roles.
const USERS_PAGE_PATH: &str = "/users";

#[derive(Deserialize)]
pub struct RoleAccessBody {
    pub path: String,
    pub role: Role,
    pub allowed: bool,
}

#[derive(Deserialize)]
pub struct PageActiveBody {
    pub path: String,
    pub active: bool,
}

#[derive(Deserialize)]
pub struct UserActiveBody {
    pub active: bool,
}

/// GET /api/admin/pages
pub async fn handle_list_pages(State(state): State<AppState>, headers: HeaderMap) -> ApiResponse {
    let (user, _) = match require_session(&state, &headers).await {
        Ok(session) => session,
        Err(response) => return response,
    };

    let store = state.store.clone();
    let result = blocking(move || {
        if user.role != Role::Admin {
            store.require_access(PAGE_RESTRICTIONS_PATH, user.role)?;
        }
        store.list_pages()
    })
    .await;
    match result {
        Ok(pages) => ok_json(StatusCode::OK, &pages),
        Err(e) => error_response(&e),
    }
}

/// PUT /api/admin/pages
pub async fn handle_upsert_page(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<PageDefinition>, JsonRejection>,
) -> ApiResponse {
    let (user, _) = match require_session(&state, &headers).await {
        Ok(session) => session,
        Err(response) => return response,
    };
    let Json(def) = match body {
        Ok(body) => body,
        Err(e) => return invalid_body(&e),
    };

    let store = state.store.clone();
    let actor = user.role;
    match blocking(move || store.upsert_page(actor, &def)).await {
        Ok(page) => ok_json(StatusCode::OK, &page),
        Err(e) => error_response(&e),
    }
}

/// PUT /api/admin/pages/access
pub async fn handle_set_role_access(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<RoleAccessBody>, JsonRejection>,
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
    let actor = user.role;
    let (path, role, allowed) = (body.path, body.role, body.allowed);
    let log_path = path.clone();
    match blocking(move || store.set_role_access(actor, &path, role, allowed)).await {
        Ok(updated) => {
            if updated {
                tracing::info!(actor_id = %user.id, path = %log_path, role = %role, allowed, "Role access changed");
            }
            (StatusCode::OK, Json(serde_json::json!({ "updated": updated })))
        }
        Err(e) => error_response(&e),
    }
}

/// PUT /api/admin/pages/active
pub async fn handle_set_page_active(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<PageActiveBody>, JsonRejection>,
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
    let actor = user.role;
    match blocking(move || store.set_page_active(actor, &body.path, body.active)).await {
        Ok(updated) => (StatusCode::OK, Json(serde_json::json!({ "updated": updated }))),
        Err(e) => error_response(&e),
    }
}

/// PUT /api/admin/users/{user_id}/active
///
/// Deactivating a user also clears their session, so the monitor on any
/// device they hold signs them out on its next tick.
pub async fn handle_set_user_active(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(user_id): Path<String>,
    body: Result<Json<UserActiveBody>, JsonRejection>,
) -> ApiResponse {
    let (actor, _) = match require_session(&state, &headers).await {
        Ok(session) => session,
        Err(response) => return response,
    };
    let Json(body) = match body {
        Ok(body) => body,
        Err(e) => return invalid_body(&e),
    };
    if actor.id == user_id && !body.active {
        return error_response(&AuthError::InvalidInput(
            "cannot deactivate your own account".into(),
        ));
    }

    let store = state.store.clone();
    let target = user_id.clone();
    let result = blocking(move || {
        if actor.role != Role::Admin {
            store.require_access(USERS_PAGE_PATH, actor.role)?;
        }
        store.set_user_active(&target, body.active)
    })
    .await;
    match result {
        Ok(true) => {
            tracing::info!(user_id = %user_id, active = body.active, "Account activation changed");
            (StatusCode::OK, Json(serde_json::json!({ "updated": true })))
        }
        Ok(false) => error_response(&AuthError::UserNotFound),
        Err(e) => error_response(&e),
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{call, signed_in, state};
    use super::*;
    use crate::auth::token::SessionToken;
    use serde_json::json;

    #[tokio::test]
    async fn driver_cannot_touch_the_matrix() {
        let (_clock, state) = state();
        let driver = signed_in(&state, "ana@fleet.example.com", "first-password").await;

        let (status, body) = call(&state, "GET", "/api/admin/pages", Some(&driver), None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["code"], "forbidden");

        let (status, _) = call(
            &state,
            "PUT",
            "/api/admin/pages/access",
            Some(&driver),
            Some(json!({"path": "/users", "role": "driver", "allowed": true})),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert!(!state.store.check_access("/users", Role::Driver).unwrap());
    }

    #[tokio::test]
    async fn admin_edits_matrix() {
        let (_clock, state) = state();
        let admin = signed_in(&state, "boss@fleet.example.com", "boss-password").await;

        let (status, pages) = call(&state, "GET", "/api/admin/pages", Some(&admin), None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(pages.as_array().unwrap().len() >= 12);

        let (status, body) = call(
            &state,
            "PUT",
            "/api/admin/pages/access",
            Some(&admin),
            Some(json!({"path": "/users", "role": "driver", "allowed": true})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["updated"], true);
        assert!(state.store.check_access("/users", Role::Driver).unwrap());

        let (_, body) = call(
            &state,
            "PUT",
            "/api/admin/pages/active",
            Some(&admin),
            Some(json!({"path": "/users", "active": false})),
        )
        .await;
        assert_eq!(body["updated"], true);
        assert!(!state.store.check_access("/users", Role::Driver).unwrap());

        let (status, page) = call(
            &state,
            "PUT",
            "/api/admin/pages",
            Some(&admin),
            Some(json!({
                "page_name": "Fuel Cards",
                "path": "/fuel-cards",
                "allowed_roles": ["admin", "fleet_manager"],
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "{page}");
        assert_eq!(page["path"], "/fuel-cards");
        assert!(state.store.check_access("/fuel-cards", Role::FleetManager).unwrap());
        assert!(!state.store.check_access("/fuel-cards", Role::Driver).unwrap());
    }

    #[tokio::test]
    async fn deactivation_ends_the_target_session() {
        let (_clock, state) = state();
        let admin = signed_in(&state, "boss@fleet.example.com", "boss-password").await;
        let driver = signed_in(&state, "ana@fleet.example.com", "first-password").await;
        let driver_id = SessionToken::parse(&driver).unwrap().user_id().to_string();
        let admin_id = SessionToken::parse(&admin).unwrap().user_id().to_string();

        let (status, _) = call(
            &state,
            "PUT",
            &format!("/api/admin/users/{admin_id}/active"),
            Some(&driver),
            Some(json!({"active": false})),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, _) = call(
            &state,
            "PUT",
            &format!("/api/admin/users/{admin_id}/active"),
            Some(&admin),
            Some(json!({"active": false})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = call(
            &state,
            "PUT",
            &format!("/api/admin/users/{driver_id}/active"),
            Some(&admin),
            Some(json!({"active": false})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["updated"], true);

        let (status, body) = call(&state, "GET", "/rpc/sessions/current", Some(&driver), None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["code"], "account_inactive");

        let (status, body) = call(
            &state,
            "PUT",
            "/api/admin/users/no-such-user/active",
            Some(&admin),
            Some(json!({"active": true})),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], "user_not_found");
    }
}
