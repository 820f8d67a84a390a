//! Client-side auth gateway: sign-in, sign-out, session checks and the
//! account flows built on them.
//!
//! Owns the local session holder, the background monitor and the access
//! resolver for one client. Expired and replaced sessions are recovered
//! locally (state cleared) and re-surfaced as [`SessionEvent`]s.

use super::backend::AuthBackend;
use super::model::{ResetOutcome, ResetRequest, SessionEvent, UserProfile};
use super::monitor::{event_for, SessionMonitor};
use super::session_cache::{LocalSession, SessionCache};
use super::token::SessionToken;
use crate::access::{AccessResolver, PageRestriction};
use crate::clock::Clock;
use crate::config::{SessionConfig, DEFAULT_MONITOR_INTERVAL_SECS, DEFAULT_SESSION_DURATION_SECS};
use crate::error::AuthError;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

/// Session lifetime and polling cadence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionPolicy {
    pub duration: Duration,
    pub monitor_interval: Duration,
}

impl Default for SessionPolicy {
    fn default() -> Self {
        Self {
            duration: Duration::from_secs(DEFAULT_SESSION_DURATION_SECS),
            monitor_interval: Duration::from_secs(DEFAULT_MONITOR_INTERVAL_SECS),
        }
    }
}

impl SessionPolicy {
    pub fn from_config(config: &SessionConfig) -> Self {
        Self {
            duration: Duration::from_secs(config.duration_secs.max(1)),
            monitor_interval: Duration::from_secs(config.monitor_interval_secs.max(1)),
        }
    }
}

pub struct AuthGateway {
    backend: Arc<dyn AuthBackend>,
    cache: Arc<SessionCache>,
    clock: Arc<dyn Clock>,
    monitor: SessionMonitor,
    resolver: AccessResolver,
    session_secs: i64,
}

impl AuthGateway {
    pub fn new(
        backend: Arc<dyn AuthBackend>,
        cache: Arc<SessionCache>,
        clock: Arc<dyn Clock>,
        policy: SessionPolicy,
    ) -> Self {
        let monitor = SessionMonitor::new(
            backend.clone(),
            cache.clone(),
            clock.clone(),
            policy.monitor_interval,
        );
        let resolver = AccessResolver::new(backend.clone());
        Self {
            backend,
            cache,
            clock,
            monitor,
            resolver,
            session_secs: i64::try_from(policy.duration.as_secs()).unwrap_or(i64::MAX / 2),
        }
    }

    // ── Session lifecycle ───────────────────────────────────────────

    /// Authenticate, open a fresh session (replacing any other device's),
    /// cache it locally and start the monitor.
    ///
    /// The monitor is stopped before the server session is overwritten, so
    /// a tick for the previous token cannot report this login as a
    /// replacement.
    pub async fn sign_in(&self, email: &str, password: &str) -> Result<UserProfile, AuthError> {
        self.monitor.stop();
        let result = self.open_fresh_session(email, password).await;
        if result.is_err() && self.cache.get().is_some() {
            self.monitor.ensure_running();
        }
        result
    }

    async fn open_fresh_session(&self, email: &str, password: &str) -> Result<UserProfile, AuthError> {
        let record = self.backend.authenticate(email, password).await?;
        if !record.user.is_active {
            return Err(AuthError::AccountInactive);
        }

        let now = self.clock.now();
        let token = SessionToken::mint(&record.user.id, now);
        let expires_at = now.saturating_add(self.session_secs);
        let user = self
            .backend
            .open_session(email, password, &token, expires_at)
            .await?;

        self.resolver.clear();
        self.cache.store(LocalSession {
            token: token.as_str().to_string(),
            expires_at,
            user: user.clone(),
        });
        self.monitor.start();

        tracing::info!(user_id = %user.id, role = %user.role, "Signed in");
        Ok(user)
    }

    /// Clear the server session (if it is still ours), stop the monitor
    /// and discard local state. Calling it without a session is a no-op.
    pub async fn sign_out(&self) -> Result<(), AuthError> {
        let session = self.cache.get();
        self.discard_local();

        let Some(token) = session.and_then(|s| s.token().ok()) else {
            return Ok(());
        };
        match self.backend.clear_session(&token).await {
            Ok(cleared) => {
                tracing::info!(user_id = %token.user_id(), cleared, "Signed out");
                Ok(())
            }
            Err(e) => {
                tracing::warn!(user_id = %token.user_id(), error = %e, "Server sign-out failed");
                Err(e)
            }
        }
    }

    /// Validate the cached session against the server.
    ///
    /// A transient failure returns the cached profile; any verdict against
    /// the session clears local state.
    pub async fn get_session(&self) -> Result<UserProfile, AuthError> {
        let Some(session) = self.cache.get() else {
            return Err(AuthError::NoSession);
        };

        if session.is_expired(self.clock.now()) {
            if let Err(e) = self.sign_out().await {
                tracing::debug!(error = %e, "Ignoring sign-out failure for expired session");
            }
            self.monitor.emit(SessionEvent::Expired);
            return Err(AuthError::SessionExpired);
        }

        let Ok(token) = session.token() else {
            self.discard_local();
            return Err(AuthError::NoSession);
        };

        match self.backend.validate_session(&token).await {
            Ok(user) => {
                self.cache.update_user(user.clone());
                self.monitor.ensure_running();
                Ok(user)
            }
            Err(e) if e.is_transient() => {
                tracing::warn!(user_id = %session.user_id(), error = %e, "Session check unavailable, using cached profile");
                self.monitor.ensure_running();
                Ok(session.user)
            }
            Err(e) => {
                self.discard_local();
                if let Some(event) = event_for(&e) {
                    tracing::info!(user_id = %session.user_id(), event = %event, "Session no longer valid");
                    self.monitor.emit(event);
                }
                Err(e)
            }
        }
    }

    fn discard_local(&self) {
        self.monitor.stop();
        self.cache.clear();
        self.resolver.clear();
    }

    // ── Accounts ────────────────────────────────────────────────────

    pub async fn sign_up(
        &self,
        email: &str,
        password: &str,
        full_name: &str,
    ) -> Result<UserProfile, AuthError> {
        self.backend.register(email, password, full_name).await
    }

    /// Change the signed-in user's password. The credential sync revokes
    /// the session, so local state is discarded and the user signs in
    /// again with the new password.
    pub async fn change_password(&self, new_password: &str) -> Result<(), AuthError> {
        let session = self.cache.get().ok_or(AuthError::NoSession)?;
        let token = session.token()?;

        match self.backend.update_password(&token, new_password).await {
            Ok(true) => {
                self.discard_local();
                tracing::info!(user_id = %session.user_id(), "Password changed, session revoked");
                Ok(())
            }
            Ok(false) => Err(AuthError::UserNotFound),
            Err(e) => {
                if event_for(&e).is_some() {
                    self.discard_local();
                }
                Err(e)
            }
        }
    }

    pub async fn request_password_reset(&self, email: &str) -> Result<ResetRequest, AuthError> {
        self.backend.request_password_reset(email).await
    }

    pub async fn reset_password(
        &self,
        token: &str,
        new_password: &str,
    ) -> Result<ResetOutcome, AuthError> {
        self.backend.reset_password_with_token(token, new_password).await
    }

    // ── Access ──────────────────────────────────────────────────────

    /// Whether the signed-in user may open `path`. No session, no access.
    pub async fn can_navigate(&self, path: &str) -> bool {
        match self.current_user() {
            Some(user) => self.resolver.check_role_access(path, user.role).await,
            None => false,
        }
    }

    /// Pages open to the signed-in user's role, cached for the session.
    pub async fn accessible_pages(&self) -> Result<Vec<PageRestriction>, AuthError> {
        let user = self.current_user().ok_or(AuthError::NoSession)?;
        self.resolver.accessible_pages(user.role).await
    }

    // ── State ───────────────────────────────────────────────────────

    pub fn current_user(&self) -> Option<UserProfile> {
        self.cache.get().map(|s| s.user)
    }

    pub fn local_session(&self) -> Option<LocalSession> {
        self.cache.get()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.monitor.subscribe()
    }

    pub fn is_monitoring(&self) -> bool {
        self.monitor.is_running()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::allowlist::SignupPolicy;
    use crate::auth::backend::LocalBackend;
    use crate::auth::model::Role;
    use crate::auth::RemoteBackend;
    use crate::clock::ManualClock;
    use crate::store::FleetStore;

    const T0: i64 = 1_760_000_000;
    const EIGHT_HOURS: i64 = 8 * 3600;

    struct Fixture {
        clock: Arc<ManualClock>,
        store: Arc<FleetStore>,
        backend: LocalBackend,
    }

    impl Fixture {
        fn new() -> Self {
            let clock = Arc::new(ManualClock::new(T0));
            let store = Arc::new(FleetStore::open_in_memory(clock.clone()).unwrap());
            store.seed_default_pages().unwrap();
            let policy = SignupPolicy::new(
                vec!["fleet.example.com".to_string()],
                Vec::new(),
                vec!["boss@fleet.example.com".to_string()],
            );
            let backend = LocalBackend::new(store.clone(), policy);
            Self {
                clock,
                store,
                backend,
            }
        }

        /// One client device talking to the shared store.
        fn device(&self) -> AuthGateway {
            AuthGateway::new(
                Arc::new(self.backend.clone()),
                Arc::new(SessionCache::in_memory()),
                self.clock.clone(),
                SessionPolicy {
                    duration: Duration::from_secs(EIGHT_HOURS as u64),
                    monitor_interval: Duration::from_secs(3600),
                },
            )
        }

        async fn with_driver(self) -> Self {
            self.device()
                .sign_up("ana@fleet.example.com", "first-password", "Ana")
                .await
                .unwrap();
            self
        }
    }

    #[tokio::test]
    async fn cached_token_matches_server_record_after_sign_in() {
        let fx = Fixture::new().with_driver().await;
        let device = fx.device();
        let user = device
            .sign_in("ana@fleet.example.com", "first-password")
            .await
            .unwrap();

        let local = device.local_session().unwrap();
        let record = fx.store.session_record(&user.id).unwrap().unwrap();
        let fingerprint = SessionToken::parse(&local.token).unwrap().fingerprint();
        assert_eq!(record.session_id, Some(fingerprint));
        assert_eq!(record.session_expires_at, Some(T0 + EIGHT_HOURS));
        assert!(device.is_monitoring());
    }

    #[tokio::test]
    async fn inactive_user_gets_no_session() {
        let fx = Fixture::new().with_driver().await;
        let user = fx.store.get_user_by_email("ana@fleet.example.com").unwrap().unwrap();
        fx.store.set_user_active(&user.id, false).unwrap();

        let device = fx.device();
        assert_eq!(
            device.sign_in("ana@fleet.example.com", "first-password").await,
            Err(AuthError::AccountInactive)
        );
        assert!(device.local_session().is_none());
        assert!(!device.is_monitoring());
        assert!(fx.store.session_record(&user.id).unwrap().unwrap().session_id.is_none());
    }

    #[tokio::test]
    async fn wrong_password_is_invalid_credentials() {
        let fx = Fixture::new().with_driver().await;
        assert_eq!(
            fx.device().sign_in("ana@fleet.example.com", "nope-nope").await,
            Err(AuthError::InvalidCredentials)
        );
    }

    #[tokio::test]
    async fn second_device_replaces_first_without_resurrection() {
        let fx = Fixture::new().with_driver().await;
        let phone = fx.device();
        let laptop = fx.device();
        let mut events = phone.subscribe();

        phone.sign_in("ana@fleet.example.com", "first-password").await.unwrap();
        let stale = phone.local_session().unwrap();
        fx.clock.advance(30);
        laptop.sign_in("ana@fleet.example.com", "first-password").await.unwrap();

        assert_eq!(phone.get_session().await, Err(AuthError::SessionReplaced));
        assert_eq!(events.try_recv().unwrap(), SessionEvent::Replaced);
        assert!(phone.local_session().is_none());
        assert!(!phone.is_monitoring());

        // Local state is gone and the old token stays dead server-side
        assert_eq!(phone.get_session().await, Err(AuthError::NoSession));
        assert_eq!(
            fx.store.validate_bearer(&stale.token).unwrap_err(),
            AuthError::SessionReplaced
        );
        // A replaced device signing out must not end the new session
        let stale_token = SessionToken::parse(&stale.token).unwrap();
        assert!(!fx.backend.clear_session(&stale_token).await.unwrap());
        assert!(laptop.get_session().await.is_ok());
    }

    #[tokio::test]
    async fn session_expires_after_eight_hours() {
        let fx = Fixture::new().with_driver().await;
        let device = fx.device();
        let mut events = device.subscribe();
        let user = device
            .sign_in("ana@fleet.example.com", "first-password")
            .await
            .unwrap();

        fx.clock.set(T0 + EIGHT_HOURS - 1);
        assert!(device.get_session().await.is_ok());

        fx.clock.set(T0 + EIGHT_HOURS + 1);
        assert_eq!(device.get_session().await, Err(AuthError::SessionExpired));
        assert!(device.local_session().is_none());
        assert_eq!(events.try_recv().unwrap(), SessionEvent::Expired);
        assert!(fx.store.session_record(&user.id).unwrap().unwrap().session_id.is_none());
    }

    #[tokio::test]
    async fn server_side_expiry_is_reported_even_if_local_clock_disagrees() {
        let fx = Fixture::new().with_driver().await;
        let device = fx.device();
        let user = device
            .sign_in("ana@fleet.example.com", "first-password")
            .await
            .unwrap();
        // Server shortened the session behind the client's back
        fx.store.clear_session(&user.id, None).unwrap();

        assert_eq!(device.get_session().await, Err(AuthError::SessionExpired));
        assert!(device.local_session().is_none());
    }

    #[tokio::test]
    async fn deactivated_user_is_signed_out_on_next_check() {
        let fx = Fixture::new().with_driver().await;
        let device = fx.device();
        let user = device
            .sign_in("ana@fleet.example.com", "first-password")
            .await
            .unwrap();
        fx.store.set_user_active(&user.id, false).unwrap();

        assert_eq!(device.get_session().await, Err(AuthError::AccountInactive));
        assert!(device.local_session().is_none());
    }

    #[tokio::test]
    async fn sign_out_is_idempotent_and_clears_server() {
        let fx = Fixture::new().with_driver().await;
        let device = fx.device();
        let user = device
            .sign_in("ana@fleet.example.com", "first-password")
            .await
            .unwrap();

        device.sign_out().await.unwrap();
        device.sign_out().await.unwrap();
        assert!(!device.is_monitoring());
        assert_eq!(device.get_session().await, Err(AuthError::NoSession));
        assert!(fx.store.session_record(&user.id).unwrap().unwrap().session_id.is_none());
    }

    #[tokio::test]
    async fn password_change_revokes_session_and_swaps_credentials() {
        let fx = Fixture::new().with_driver().await;
        let device = fx.device();
        device.sign_in("ana@fleet.example.com", "first-password").await.unwrap();

        device.change_password("second-password").await.unwrap();
        assert!(device.local_session().is_none());

        assert_eq!(
            device.sign_in("ana@fleet.example.com", "first-password").await,
            Err(AuthError::InvalidCredentials)
        );
        assert!(device
            .sign_in("ana@fleet.example.com", "second-password")
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn password_change_on_another_device_signs_this_one_out() {
        let fx = Fixture::new().with_driver().await;
        let device = fx.device();
        let user = device
            .sign_in("ana@fleet.example.com", "first-password")
            .await
            .unwrap();
        fx.store.update_password(&user.id, "second-password").unwrap();

        assert_eq!(device.get_session().await, Err(AuthError::SessionExpired));
    }

    #[tokio::test]
    async fn token_reset_then_sign_in() {
        let fx = Fixture::new().with_driver().await;
        let device = fx.device();
        let issued = device
            .request_password_reset("ana@fleet.example.com")
            .await
            .unwrap();
        let outcome = device
            .reset_password(&issued.token.unwrap(), "second-password")
            .await
            .unwrap();
        assert!(outcome.success);

        assert!(device
            .sign_in("ana@fleet.example.com", "second-password")
            .await
            .is_ok());
        assert_eq!(
            fx.device().sign_in("ana@fleet.example.com", "first-password").await,
            Err(AuthError::InvalidCredentials)
        );
    }

    #[tokio::test]
    async fn sign_up_applies_allow_list() {
        let fx = Fixture::new();
        let device = fx.device();
        assert_eq!(
            device
                .sign_up("boss@fleet.example.com", "boss-password", "Boss")
                .await
                .unwrap()
                .role,
            Role::Admin
        );
        assert_eq!(
            device.sign_up("x@gmail.com", "some-password", "X").await,
            Err(AuthError::EmailNotAllowed)
        );
        assert_eq!(
            device
                .sign_up("BOSS@fleet.example.com", "boss-password", "Boss")
                .await,
            Err(AuthError::EmailAlreadyRegistered)
        );
    }

    #[tokio::test]
    async fn navigation_follows_role_matrix() {
        let fx = Fixture::new().with_driver().await;
        let device = fx.device();
        assert!(!device.can_navigate("/attendance").await);

        device.sign_in("ana@fleet.example.com", "first-password").await.unwrap();
        assert!(device.can_navigate("/attendance").await);
        assert!(!device.can_navigate("/users").await);
        assert!(!device.can_navigate("/not-registered").await);

        let pages = device.accessible_pages().await.unwrap();
        assert!(pages.iter().all(|p| p.allowed_roles.contains(&Role::Driver)));
    }

    #[tokio::test]
    async fn transient_failure_keeps_cached_profile() {
        let clock = Arc::new(ManualClock::new(T0));
        let cache = Arc::new(SessionCache::in_memory());
        let user = UserProfile {
            id: "u1".into(),
            email: "ana@fleet.example.com".into(),
            full_name: "Ana".into(),
            role: Role::Driver,
            is_active: true,
        };
        cache.store(LocalSession {
            token: SessionToken::mint("u1", T0).as_str().to_string(),
            expires_at: T0 + 3600,
            user: user.clone(),
        });
        let backend = RemoteBackend::new("http://127.0.0.1:9", Duration::from_secs(2)).unwrap();
        let device = AuthGateway::new(
            Arc::new(backend),
            cache,
            clock,
            SessionPolicy::default(),
        );

        assert_eq!(device.get_session().await.unwrap(), user);
        assert!(device.local_session().is_some());
        assert!(device.is_monitoring());

        // During login the same failure surfaces
        assert!(device
            .sign_in("ana@fleet.example.com", "first-password")
            .await
            .unwrap_err()
            .is_transient());
    }

    /// Answers `open_session` only after a delay, with the store already
    /// holding the new session.
    struct SlowOpen(LocalBackend);

    #[async_trait::async_trait]
    impl AuthBackend for SlowOpen {
        async fn authenticate(
            &self,
            email: &str,
            password: &str,
        ) -> Result<crate::auth::model::SessionRecord, AuthError> {
            self.0.authenticate(email, password).await
        }
        async fn open_session(
            &self,
            email: &str,
            password: &str,
            token: &SessionToken,
            expires_at: i64,
        ) -> Result<UserProfile, AuthError> {
            let user = self.0.open_session(email, password, token, expires_at).await?;
            tokio::time::sleep(Duration::from_millis(150)).await;
            Ok(user)
        }
        async fn validate_session(&self, token: &SessionToken) -> Result<UserProfile, AuthError> {
            self.0.validate_session(token).await
        }
        async fn clear_session(&self, token: &SessionToken) -> Result<bool, AuthError> {
            self.0.clear_session(token).await
        }
        async fn register(
            &self,
            email: &str,
            password: &str,
            full_name: &str,
        ) -> Result<UserProfile, AuthError> {
            self.0.register(email, password, full_name).await
        }
        async fn update_password(
            &self,
            token: &SessionToken,
            new_password: &str,
        ) -> Result<bool, AuthError> {
            self.0.update_password(token, new_password).await
        }
        async fn request_password_reset(&self, email: &str) -> Result<ResetRequest, AuthError> {
            self.0.request_password_reset(email).await
        }
        async fn reset_password_with_token(
            &self,
            token: &str,
            new_password: &str,
        ) -> Result<ResetOutcome, AuthError> {
            self.0.reset_password_with_token(token, new_password).await
        }
        async fn accessible_pages(&self, role: Role) -> Result<Vec<PageRestriction>, AuthError> {
            self.0.accessible_pages(role).await
        }
        async fn check_access(&self, path: &str, role: Role) -> Result<bool, AuthError> {
            self.0.check_access(path, role).await
        }
    }

    #[tokio::test]
    async fn signing_in_again_on_the_same_device_is_not_a_replacement() {
        let fx = Fixture::new().with_driver().await;
        let device = AuthGateway::new(
            Arc::new(SlowOpen(fx.backend.clone())),
            Arc::new(SessionCache::in_memory()),
            fx.clock.clone(),
            SessionPolicy {
                duration: Duration::from_secs(EIGHT_HOURS as u64),
                monitor_interval: Duration::from_millis(20),
            },
        );
        let mut events = device.subscribe();

        device.sign_in("ana@fleet.example.com", "first-password").await.unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        device.sign_in("ana@fleet.example.com", "first-password").await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(matches!(
            events.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
        assert!(device.local_session().is_some());
        assert!(device.is_monitoring());
        assert!(device.get_session().await.is_ok());
    }

    #[tokio::test]
    async fn failed_sign_in_keeps_watching_the_held_session() {
        let fx = Fixture::new().with_driver().await;
        let device = fx.device();
        device.sign_in("ana@fleet.example.com", "first-password").await.unwrap();

        assert_eq!(
            device.sign_in("ana@fleet.example.com", "wrong-password").await,
            Err(AuthError::InvalidCredentials)
        );
        assert!(device.local_session().is_some());
        assert!(device.is_monitoring());
    }
}
