//! Error taxonomy shared by the store, the HTTP gateway and the client-side
//! auth gateway.
//!
//! Every variant has a stable wire code so an error raised inside the
//! server can be reconstructed on the client side of [`crate::auth::RemoteBackend`].

use axum::http::StatusCode;

/// Errors raised by session, credential and page-access operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("Invalid email or password")]
    InvalidCredentials,
    #[error("Account is inactive")]
    AccountInactive,
    #[error("Email address is not allowed to register")]
    EmailNotAllowed,
    #[error("Email address is already registered")]
    EmailAlreadyRegistered,
    #[error("Password must be at least {0} characters")]
    WeakPassword(usize),
    #[error("No active session")]
    NoSession,
    #[error("Session expired")]
    SessionExpired,
    #[error("Session replaced by a newer login")]
    SessionReplaced,
    #[error("User not found")]
    UserNotFound,
    #[error("Reset token is invalid or expired")]
    TokenInvalidOrExpired,
    #[error("Not permitted")]
    Forbidden,
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    #[error("Transient I/O error: {0}")]
    TransientIo(String),
}

impl AuthError {
    /// Stable machine-readable code used on the wire.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidCredentials => "invalid_credentials",
            Self::AccountInactive => "account_inactive",
            Self::EmailNotAllowed => "email_not_allowed",
            Self::EmailAlreadyRegistered => "email_already_registered",
            Self::WeakPassword(_) => "weak_password",
            Self::NoSession => "no_session",
            Self::SessionExpired => "session_expired",
            Self::SessionReplaced => "session_replaced",
            Self::UserNotFound => "user_not_found",
            Self::TokenInvalidOrExpired => "token_invalid_or_expired",
            Self::Forbidden => "forbidden",
            Self::InvalidInput(_) => "invalid_input",
            Self::TransientIo(_) => "transient_io",
        }
    }

    /// Rebuild an error from its wire code. Unknown codes are treated as
    /// transient so a newer server never causes a spurious logout.
    pub fn from_code(code: &str, message: &str) -> Self {
        match code {
            "invalid_credentials" => Self::InvalidCredentials,
            "account_inactive" => Self::AccountInactive,
            "email_not_allowed" => Self::EmailNotAllowed,
            "email_already_registered" => Self::EmailAlreadyRegistered,
            "weak_password" => Self::WeakPassword(
                message
                    .split_whitespace()
                    .find_map(|w| w.parse().ok())
                    .unwrap_or(crate::store::MIN_PASSWORD_LEN),
            ),
            "no_session" => Self::NoSession,
            "session_expired" => Self::SessionExpired,
            "session_replaced" => Self::SessionReplaced,
            "user_not_found" => Self::UserNotFound,
            "token_invalid_or_expired" => Self::TokenInvalidOrExpired,
            "forbidden" => Self::Forbidden,
            "invalid_input" => Self::InvalidInput(
                message
                    .strip_prefix("Invalid input: ")
                    .unwrap_or(message)
                    .to_string(),
            ),
            _ => Self::TransientIo(
                message
                    .strip_prefix("Transient I/O error: ")
                    .unwrap_or(message)
                    .to_string(),
            ),
        }
    }

    /// HTTP status the gateway answers with for this error.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::InvalidCredentials
            | Self::NoSession
            | Self::SessionExpired
            | Self::SessionReplaced => StatusCode::UNAUTHORIZED,
            Self::AccountInactive | Self::EmailNotAllowed | Self::Forbidden => {
                StatusCode::FORBIDDEN
            }
            Self::EmailAlreadyRegistered => StatusCode::CONFLICT,
            Self::WeakPassword(_) | Self::InvalidInput(_) | Self::TokenInvalidOrExpired => {
                StatusCode::BAD_REQUEST
            }
            Self::UserNotFound => StatusCode::NOT_FOUND,
            Self::TransientIo(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// Message suitable for showing to an end user.
    ///
    /// Expired and replaced sessions get their own wording so a user who
    /// was signed out by another device does not read it as a crash.
    pub fn user_message(&self) -> String {
        match self {
            Self::SessionExpired => {
                "Your session has expired. Please sign in again.".to_string()
            }
            Self::SessionReplaced => {
                "You were signed out because your account was used to sign in on another device."
                    .to_string()
            }
            Self::AccountInactive => {
                "This account has been deactivated. Contact your fleet administrator.".to_string()
            }
            Self::TransientIo(_) => {
                "The server could not be reached. Please try again.".to_string()
            }
            other => other.to_string(),
        }
    }

    /// Whether the error is a temporary I/O failure rather than a verdict.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientIo(_))
    }
}

impl From<rusqlite::Error> for AuthError {
    fn from(e: rusqlite::Error) -> Self {
        Self::TransientIo(e.to_string())
    }
}

impl From<reqwest::Error> for AuthError {
    fn from(e: reqwest::Error) -> Self {
        Self::TransientIo(e.to_string())
    }
}
