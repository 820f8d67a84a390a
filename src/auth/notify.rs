//! Out-of-band delivery of password reset tokens.
//!
//! The HTTP gateway never returns a reset token to the caller who asked for
//! it; the token goes to the account owner through a [`ResetNotifier`].

use crate::error::AuthError;
use async_trait::async_trait;

/// What the account owner needs to complete a reset.
#[derive(Clone, PartialEq, Eq)]
pub struct ResetNotice {
    pub email: String,
    pub user_id: String,
    pub full_name: String,
    pub token: String,
}

impl std::fmt::Debug for ResetNotice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResetNotice")
            .field("email", &self.email)
            .field("user_id", &self.user_id)
            .finish_non_exhaustive()
    }
}

#[async_trait]
pub trait ResetNotifier: Send + Sync {
    /// Hand the token to the account owner (mail, SMS, ...).
    async fn deliver(&self, notice: &ResetNotice) -> Result<(), AuthError>;
}

/// Default notifier when no delivery channel is configured: records that a
/// token was issued, without the token itself. Operators can issue a token
/// directly with `fleetgate user reset-token`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl ResetNotifier for LogNotifier {
    async fn deliver(&self, notice: &ResetNotice) -> Result<(), AuthError> {
        tracing::warn!(
            user_id = %notice.user_id,
            "Password reset token issued but no delivery channel is configured"
        );
        Ok(())
    }
}
