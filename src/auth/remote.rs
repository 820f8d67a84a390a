//! HTTP client for the fleetgate RPC gateway.

use super::backend::AuthBackend;
use super::model::{ResetOutcome, ResetRequest, Role, SessionRecord, UserProfile};
use super::token::SessionToken;
use crate::access::PageRestriction;
use crate::config::ClientConfig;
use crate::error::AuthError;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

/// Error body the gateway answers with.
#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
    code: String,
}

#[derive(Debug, Deserialize)]
struct Cleared {
    cleared: bool,
}

#[derive(Debug, Deserialize)]
struct Updated {
    updated: bool,
}

#[derive(Debug, Deserialize)]
struct Allowed {
    allowed: bool,
}

/// [`AuthBackend`] over HTTP.
pub struct RemoteBackend {
    base_url: String,
    http: reqwest::Client,
}

impl RemoteBackend {
    pub fn new(base_url: &str, timeout: Duration) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
        })
    }

    pub fn from_config(config: &ClientConfig) -> anyhow::Result<Self> {
        Self::new(
            &config.server_url,
            Duration::from_secs(config.request_timeout_secs.max(1)),
        )
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Send a request and decode either the payload or the error body.
    ///
    /// Network failures and 5xx answers are transient. Other failures are
    /// rebuilt from their wire code, and anything unrecognizable is also
    /// treated as transient so a misbehaving proxy never forces a logout.
    async fn send<T: DeserializeOwned>(&self, request: reqwest::RequestBuilder) -> Result<T, AuthError> {
        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response.json::<T>().await?);
        }

        let body = response.json::<ErrorBody>().await.ok();
        if status.is_server_error() {
            let detail = body.map_or_else(|| format!("HTTP {status}"), |b| b.error);
            return Err(AuthError::TransientIo(detail));
        }
        Err(match body {
            Some(body) => AuthError::from_code(&body.code, &body.error),
            None => AuthError::TransientIo(format!("HTTP {status} without error body")),
        })
    }
}

#[async_trait]
impl AuthBackend for RemoteBackend {
    async fn authenticate(&self, email: &str, password: &str) -> Result<SessionRecord, AuthError> {
        self.send(
            self.http
                .post(self.url("/rpc/authenticate"))
                .json(&json!({ "email": email, "password": password })),
        )
        .await
    }

    async fn open_session(
        &self,
        email: &str,
        password: &str,
        token: &SessionToken,
        expires_at: i64,
    ) -> Result<UserProfile, AuthError> {
        self.send(self.http.post(self.url("/rpc/sessions")).json(&json!({
            "email": email,
            "password": password,
            "token": token.as_str(),
            "expires_at": expires_at,
        })))
        .await
    }

    async fn validate_session(&self, token: &SessionToken) -> Result<UserProfile, AuthError> {
        self.send(
            self.http
                .get(self.url("/rpc/sessions/current"))
                .bearer_auth(token.as_str()),
        )
        .await
    }

    async fn clear_session(&self, token: &SessionToken) -> Result<bool, AuthError> {
        let cleared: Cleared = self
            .send(
                self.http
                    .delete(self.url("/rpc/sessions/current"))
                    .bearer_auth(token.as_str()),
            )
            .await?;
        Ok(cleared.cleared)
    }

    async fn register(
        &self,
        email: &str,
        password: &str,
        full_name: &str,
    ) -> Result<UserProfile, AuthError> {
        self.send(self.http.post(self.url("/rpc/accounts")).json(&json!({
            "email": email,
            "password": password,
            "full_name": full_name,
        })))
        .await
    }

    async fn update_password(
        &self,
        token: &SessionToken,
        new_password: &str,
    ) -> Result<bool, AuthError> {
        let updated: Updated = self
            .send(
                self.http
                    .post(self.url("/rpc/password"))
                    .bearer_auth(token.as_str())
                    .json(&json!({ "new_password": new_password })),
            )
            .await?;
        Ok(updated.updated)
    }

    async fn request_password_reset(&self, email: &str) -> Result<ResetRequest, AuthError> {
        self.send(
            self.http
                .post(self.url("/rpc/password-reset"))
                .json(&json!({ "email": email })),
        )
        .await
    }

    async fn reset_password_with_token(
        &self,
        token: &str,
        new_password: &str,
    ) -> Result<ResetOutcome, AuthError> {
        self.send(
            self.http
                .post(self.url("/rpc/password-reset/confirm"))
                .json(&json!({ "token": token, "new_password": new_password })),
        )
        .await
    }

    async fn accessible_pages(&self, role: Role) -> Result<Vec<PageRestriction>, AuthError> {
        self.send(
            self.http
                .get(self.url("/rpc/pages"))
                .query(&[("role", role.as_str())]),
        )
        .await
    }

    async fn check_access(&self, path: &str, role: Role) -> Result<bool, AuthError> {
        let allowed: Allowed = self
            .send(
                self.http
                    .get(self.url("/rpc/access"))
                    .query(&[("path", path), ("role", role.as_str())]),
            )
            .await?;
        Ok(allowed.allowed)
    }
}
