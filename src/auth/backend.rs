//! Server operations the client-side auth gateway depends on.
//!
//! [`LocalBackend`] calls the store in-process; [`super::RemoteBackend`]
//! calls the same operations over the HTTP gateway. The auth gateway,
//! session monitor and access resolver only see this trait.

use super::allowlist::SignupPolicy;
use super::model::{NewAccount, ResetOutcome, ResetRequest, Role, SessionRecord, UserProfile};
use super::token::SessionToken;
use crate::access::PageRestriction;
use crate::error::AuthError;
use crate::store::{blocking, FleetStore};
use async_trait::async_trait;
use std::sync::Arc;

#[async_trait]
pub trait AuthBackend: Send + Sync {
    /// Check credentials against the primary store.
    async fn authenticate(&self, email: &str, password: &str) -> Result<SessionRecord, AuthError>;

    /// Re-check credentials and record `token` as the user's only session.
    async fn open_session(
        &self,
        email: &str,
        password: &str,
        token: &SessionToken,
        expires_at: i64,
    ) -> Result<UserProfile, AuthError>;

    /// Server verdict on a held token: the profile, or why it is no longer
    /// valid (`SessionExpired`, `SessionReplaced`, `AccountInactive`).
    async fn validate_session(&self, token: &SessionToken) -> Result<UserProfile, AuthError>;

    /// Clear the server session if `token` is still the current one.
    async fn clear_session(&self, token: &SessionToken) -> Result<bool, AuthError>;

    /// Self-service signup; the role comes from the server's allow-list.
    async fn register(
        &self,
        email: &str,
        password: &str,
        full_name: &str,
    ) -> Result<UserProfile, AuthError>;

    async fn update_password(
        &self,
        token: &SessionToken,
        new_password: &str,
    ) -> Result<bool, AuthError>;

    async fn request_password_reset(&self, email: &str) -> Result<ResetRequest, AuthError>;

    async fn reset_password_with_token(
        &self,
        token: &str,
        new_password: &str,
    ) -> Result<ResetOutcome, AuthError>;

    async fn accessible_pages(&self, role: Role) -> Result<Vec<PageRestriction>, AuthError>;

    async fn check_access(&self, path: &str, role: Role) -> Result<bool, AuthError>;
}

/// In-process backend over a shared [`FleetStore`].
#[derive(Clone)]
pub struct LocalBackend {
    store: Arc<FleetStore>,
    policy: Arc<SignupPolicy>,
}

impl LocalBackend {
    pub fn new(store: Arc<FleetStore>, policy: SignupPolicy) -> Self {
        Self {
            store,
            policy: Arc::new(policy),
        }
    }

    pub fn store(&self) -> &Arc<FleetStore> {
        &self.store
    }
}

#[async_trait]
impl AuthBackend for LocalBackend {
    async fn authenticate(&self, email: &str, password: &str) -> Result<SessionRecord, AuthError> {
        let store = self.store.clone();
        let (email, password) = (email.to_string(), password.to_string());
        blocking(move || store.authenticate(&email, &password)).await
    }

    async fn open_session(
        &self,
        email: &str,
        password: &str,
        token: &SessionToken,
        expires_at: i64,
    ) -> Result<UserProfile, AuthError> {
        let store = self.store.clone();
        let (email, password, token) = (email.to_string(), password.to_string(), token.clone());
        blocking(move || store.open_session(&email, &password, &token, expires_at)).await
    }

    async fn validate_session(&self, token: &SessionToken) -> Result<UserProfile, AuthError> {
        let store = self.store.clone();
        let raw = token.as_str().to_string();
        blocking(move || store.validate_bearer(&raw).map(|(user, _)| user)).await
    }

    async fn clear_session(&self, token: &SessionToken) -> Result<bool, AuthError> {
        let store = self.store.clone();
        let (user_id, fingerprint) = (token.user_id().to_string(), token.fingerprint());
        blocking(move || store.clear_session(&user_id, Some(&fingerprint))).await
    }

    async fn register(
        &self,
        email: &str,
        password: &str,
        full_name: &str,
    ) -> Result<UserProfile, AuthError> {
        let role = self.policy.role_for(email)?;
        let store = self.store.clone();
        let account = NewAccount {
            email: email.to_string(),
            password: password.to_string(),
            full_name: full_name.to_string(),
            role,
            is_active: true,
        };
        blocking(move || store.create_account(&account)).await
    }

    async fn update_password(
        &self,
        token: &SessionToken,
        new_password: &str,
    ) -> Result<bool, AuthError> {
        let store = self.store.clone();
        let (raw, new_password) = (token.as_str().to_string(), new_password.to_string());
        blocking(move || {
            let (user, _) = store.validate_bearer(&raw)?;
            store.update_password(&user.id, &new_password)
        })
        .await
    }

    async fn request_password_reset(&self, email: &str) -> Result<ResetRequest, AuthError> {
        let store = self.store.clone();
        let email = email.to_string();
        blocking(move || store.request_password_reset(&email)).await
    }

    async fn reset_password_with_token(
        &self,
        token: &str,
        new_password: &str,
    ) -> Result<ResetOutcome, AuthError> {
        let store = self.store.clone();
        let (token, new_password) = (token.to_string(), new_password.to_string());
        blocking(move || store.reset_password_with_token(&token, &new_password)).await
    }

    async fn accessible_pages(&self, role: Role) -> Result<Vec<PageRestriction>, AuthError> {
        let store = self.store.clone();
        blocking(move || store.accessible_pages(role)).await
    }

    async fn check_access(&self, path: &str, role: Role) -> Result<bool, AuthError> {
        let store = self.store.clone();
        let path = path.to_string();
        blocking(move || store.check_access(&path, role)).await
    }
}
