//! Axum-based HTTP RPC gateway over the fleet store.
//!
//! - `/rpc/*`: the operations client backends call (authenticate, session
//!   open/validate/clear, signup, password change and reset, page access)
//! - `/api/admin/*`: page matrix and account administration, bearer-only
//! - Request body limit (64KB) and per-request timeout
//! - Sliding-window rate limiting on login and password reset
//! - Background sweep: expired sessions, dead reset tokens, credential
//!   sync replay

mod admin;
mod rpc;

use crate::auth::allowlist::SignupPolicy;
use crate::auth::model::UserProfile;
use crate::auth::notify::{LogNotifier, ResetNotifier};
use crate::auth::token::SessionToken;
use crate::config::Config;
use crate::error::AuthError;
use crate::store::{blocking, FleetStore};
use anyhow::{Context, Result};
use axum::{
    extract::ConnectInfo,
    http::{header, Extensions, HeaderMap, Method, StatusCode},
    response::Json,
    routing::{get, post, put},
    Router,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;

/// Maximum request body size (64KB).
pub const MAX_BODY_SIZE: usize = 65_536;
/// Sliding window used by gateway rate limiting.
pub const RATE_LIMIT_WINDOW_SECS: u64 = 60;

/// How often the rate limiter sweeps stale client entries from its map.
const RATE_LIMITER_SWEEP_INTERVAL_SECS: u64 = 300;

pub(crate) type ApiResponse = (StatusCode, Json<serde_json::Value>);

#[derive(Debug)]
struct SlidingWindowRateLimiter {
    limit_per_window: u32,
    window: Duration,
    requests: Mutex<(HashMap<String, Vec<Instant>>, Instant)>,
}

impl SlidingWindowRateLimiter {
    fn new(limit_per_window: u32, window: Duration) -> Self {
        Self {
            limit_per_window,
            window,
            requests: Mutex::new((HashMap::new(), Instant::now())),
        }
    }

    fn allow(&self, key: &str) -> bool {
        if self.limit_per_window == 0 {
            return true;
        }

        let now = Instant::now();
        let cutoff = now.checked_sub(self.window).unwrap_or(now);

        let mut guard = self.requests.lock();
        let (requests, last_sweep) = &mut *guard;

        if last_sweep.elapsed() >= Duration::from_secs(RATE_LIMITER_SWEEP_INTERVAL_SECS) {
            requests.retain(|_, timestamps| {
                timestamps.retain(|t| *t > cutoff);
                !timestamps.is_empty()
            });
            *last_sweep = now;
        }

        let entry = requests.entry(key.to_owned()).or_default();
        entry.retain(|instant| *instant > cutoff);

        if entry.len() >= self.limit_per_window as usize {
            return false;
        }

        entry.push(now);
        true
    }
}

/// Per-client limits for the credential-guessing surfaces.
#[derive(Debug)]
pub struct GatewayRateLimiter {
    login: SlidingWindowRateLimiter,
    reset: SlidingWindowRateLimiter,
}

impl GatewayRateLimiter {
    pub fn new(login_per_minute: u32, reset_per_minute: u32) -> Self {
        let window = Duration::from_secs(RATE_LIMIT_WINDOW_SECS);
        Self {
            login: SlidingWindowRateLimiter::new(login_per_minute, window),
            reset: SlidingWindowRateLimiter::new(reset_per_minute, window),
        }
    }

    fn allow_login(&self, key: &str) -> bool {
        self.login.allow(key)
    }

    fn allow_reset(&self, key: &str) -> bool {
        self.reset.allow(key)
    }
}

fn forwarded_client(headers: &HeaderMap) -> Option<String> {
    for header_name in ["X-Forwarded-For", "X-Real-IP"] {
        if let Some(value) = headers.get(header_name).and_then(|v| v.to_str().ok()) {
            let first = value.split(',').next().unwrap_or("").trim();
            if !first.is_empty() {
                return Some(first.to_owned());
            }
        }
    }
    None
}

/// Rate limit key for a request: the peer IP, or the forwarding headers
/// when the gateway sits behind a trusted proxy.
fn client_key(state: &AppState, headers: &HeaderMap, extensions: &Extensions) -> String {
    if state.trust_forwarded_headers {
        if let Some(key) = forwarded_client(headers) {
            return key;
        }
    }
    extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".into())
}

/// Shared state for all axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<FleetStore>,
    pub policy: Arc<SignupPolicy>,
    pub rate_limiter: Arc<GatewayRateLimiter>,
    /// Receives reset tokens; callers of the reset endpoint never see them.
    pub notifier: Arc<dyn ResetNotifier>,
    /// Upper bound on the expiry a client may request for a new session.
    pub session_duration_secs: i64,
    pub trust_forwarded_headers: bool,
}

impl AppState {
    pub fn new(store: Arc<FleetStore>, config: &Config) -> Self {
        Self {
            store,
            policy: Arc::new(SignupPolicy::from_config(&config.auth)),
            rate_limiter: Arc::new(GatewayRateLimiter::new(
                config.gateway.login_rate_limit_per_minute,
                config.gateway.reset_rate_limit_per_minute,
            )),
            notifier: Arc::new(LogNotifier),
            session_duration_secs: i64::try_from(config.session.duration_secs).unwrap_or(i64::MAX / 2),
            trust_forwarded_headers: config.gateway.trust_forwarded_headers,
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn ResetNotifier>) -> Self {
        self.notifier = notifier;
        self
    }
}

/// Build the router with its middleware stack.
pub fn router(state: AppState, request_timeout: Duration) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE])
        .max_age(Duration::from_secs(3600));

    Router::new()
        .route("/health", get(rpc::handle_health))
        .route("/rpc/authenticate", post(rpc::handle_authenticate))
        .route("/rpc/sessions", post(rpc::handle_open_session))
        .route(
            "/rpc/sessions/current",
            get(rpc::handle_current_session).delete(rpc::handle_clear_session),
        )
        .route("/rpc/accounts", post(rpc::handle_create_account))
        .route("/rpc/password", post(rpc::handle_update_password))
        .route("/rpc/password-reset", post(rpc::handle_request_reset))
        .route("/rpc/password-reset/confirm", post(rpc::handle_confirm_reset))
        .route("/rpc/pages", get(rpc::handle_accessible_pages))
        .route("/rpc/access", get(rpc::handle_check_access))
        .route(
            "/api/admin/pages",
            get(admin::handle_list_pages).put(admin::handle_upsert_page),
        )
        .route("/api/admin/pages/access", put(admin::handle_set_role_access))
        .route("/api/admin/pages/active", put(admin::handle_set_page_active))
        .route(
            "/api/admin/users/{user_id}/active",
            put(admin::handle_set_user_active),
        )
        .with_state(state)
        .layer(cors)
        .layer(RequestBodyLimitLayer::new(MAX_BODY_SIZE))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            request_timeout,
        ))
}

/// Run the HTTP gateway until Ctrl-C.
pub async fn run_gateway(config: &Config, store: Arc<FleetStore>) -> Result<()> {
    let seeded = store.seed_default_pages()?;
    let replayed = store.replay_pending_sync()?;
    tracing::info!(seeded, replayed, "Store ready");

    let listener = tokio::net::TcpListener::bind((config.gateway.host.as_str(), config.gateway.port))
        .await
        .with_context(|| format!("Failed to bind {}:{}", config.gateway.host, config.gateway.port))?;
    let local_addr = listener.local_addr()?;

    let shutdown = CancellationToken::new();
    let sweeper = spawn_maintenance(
        store.clone(),
        Duration::from_secs(config.gateway.sweep_interval_secs.max(1)),
        shutdown.clone(),
    );

    let app = router(
        AppState::new(store, config),
        Duration::from_secs(config.gateway.request_timeout_secs.max(1)),
    );

    tracing::info!(addr = %local_addr, "Gateway listening");
    let signal = shutdown.clone();
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => tracing::info!("Shutdown requested"),
                _ = signal.cancelled() => {}
            }
        })
        .await?;

    shutdown.cancel();
    if let Err(e) = sweeper.await {
        tracing::warn!(error = %e, "Maintenance task ended abnormally");
    }
    Ok(())
}

/// Periodic sweep of expired sessions and reset tokens plus journal replay.
pub fn spawn_maintenance(
    store: Arc<FleetStore>,
    interval: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let store = store.clone();
            match blocking(move || store.sweep_expired()).await {
                Ok(report) => {
                    if report.sessions_cleared > 0 || report.reset_tokens_removed > 0 {
                        tracing::debug!(
                            sessions = report.sessions_cleared,
                            reset_tokens = report.reset_tokens_removed,
                            replayed = report.sync_replayed,
                            "Swept expired entries"
                        );
                    }
                }
                Err(e) => tracing::warn!(error = %e, "Maintenance sweep failed"),
            }
        }
    })
}

// ══════════════════════════════════════════════════════════════════════════════
// SHARED HANDLER HELPERS
// ══════════════════════════════════════════════════════════════════════════════

pub(crate) fn error_response(e: &AuthError) -> ApiResponse {
    if e.is_transient() {
        tracing::error!(error = %e, "Request failed on storage");
    }
    (
        e.status(),
        Json(serde_json::json!({"error": e.to_string(), "code": e.code()})),
    )
}

pub(crate) fn invalid_body(e: &axum::extract::rejection::JsonRejection) -> ApiResponse {
    if e.status() == StatusCode::PAYLOAD_TOO_LARGE {
        return (
            StatusCode::PAYLOAD_TOO_LARGE,
            Json(serde_json::json!({
                "error": format!("Request body exceeds {MAX_BODY_SIZE} bytes"),
                "code": "invalid_input",
            })),
        );
    }
    error_response(&AuthError::InvalidInput(format!("Invalid request: {e}")))
}

pub(crate) fn rate_limited() -> ApiResponse {
    (
        StatusCode::TOO_MANY_REQUESTS,
        Json(serde_json::json!({
            "error": "Too many requests. Please retry later.",
            "code": "rate_limited",
            "retry_after": RATE_LIMIT_WINDOW_SECS,
        })),
    )
}

pub(crate) fn ok_json<T: serde::Serialize>(status: StatusCode, value: &T) -> ApiResponse {
    match serde_json::to_value(value) {
        Ok(body) => (status, Json(body)),
        Err(e) => error_response(&AuthError::TransientIo(format!("encoding response: {e}"))),
    }
}

/// Extract bearer token from Authorization header.
fn extract_bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}

/// Validate the bearer session. Returns the error response if invalid.
pub(crate) async fn require_session(
    state: &AppState,
    headers: &HeaderMap,
) -> Result<(UserProfile, SessionToken), ApiResponse> {
    let raw = extract_bearer_token(headers)
        .ok_or_else(|| error_response(&AuthError::NoSession))?
        .to_string();
    let store = state.store.clone();
    blocking(move || store.validate_bearer(&raw))
        .await
        .map_err(|e| error_response(&e))
}
