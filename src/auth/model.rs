//! User, role and session records exchanged between store, gateway and client.

use super::token::constant_time_eq;
use crate::error::AuthError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Operational roles. The set is closed; page access for each role lives in
/// a normalized table, so adding a variant needs no schema change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    FleetManager,
    Dispatcher,
    Mechanic,
    Driver,
}

impl Role {
    pub const ALL: [Role; 5] = [
        Role::Admin,
        Role::FleetManager,
        Role::Dispatcher,
        Role::Mechanic,
        Role::Driver,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::FleetManager => "fleet_manager",
            Self::Dispatcher => "dispatcher",
            Self::Mechanic => "mechanic",
            Self::Driver => "driver",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = AuthError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "admin" => Ok(Self::Admin),
            "fleet_manager" | "fleet-manager" | "manager" => Ok(Self::FleetManager),
            "dispatcher" => Ok(Self::Dispatcher),
            "mechanic" => Ok(Self::Mechanic),
            "driver" => Ok(Self::Driver),
            other => Err(AuthError::InvalidInput(format!(
                "unknown role '{other}'"
            ))),
        }
    }
}

/// Public user profile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: String,
    pub email: String,
    pub full_name: String,
    pub role: Role,
    pub is_active: bool,
}

/// Server-side view of a user's session columns.
///
/// `session_id` is the SHA-256 fingerprint of the token, never the token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub user: UserProfile,
    pub session_id: Option<String>,
    pub session_expires_at: Option<i64>,
}

impl SessionRecord {
    /// Judge a presented token fingerprint against this record at `now`.
    ///
    /// Order matters: a deactivated account wins over everything, an
    /// elapsed or cleared session is `SessionExpired` whether or not the
    /// fingerprint still matches, and only a live session held by a
    /// different token counts as `SessionReplaced`.
    pub fn verify(&self, fingerprint: &str, now: i64) -> Result<UserProfile, AuthError> {
        if !self.user.is_active {
            return Err(AuthError::AccountInactive);
        }
        let (Some(current), Some(expires_at)) = (&self.session_id, self.session_expires_at) else {
            return Err(AuthError::SessionExpired);
        };
        if now >= expires_at {
            return Err(AuthError::SessionExpired);
        }
        if !constant_time_eq(current.as_bytes(), fingerprint.as_bytes()) {
            return Err(AuthError::SessionReplaced);
        }
        Ok(self.user.clone())
    }
}

/// Input of `create_account`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewAccount {
    pub email: String,
    pub password: String,
    pub full_name: String,
    pub role: Role,
    pub is_active: bool,
}

/// Response of `request_password_reset`.
///
/// Unknown emails still produce `success = true` with empty fields. Over
/// HTTP only `success` is ever filled in; the token travels through a
/// [`super::notify::ResetNotifier`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResetRequest {
    pub success: bool,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub full_name: Option<String>,
}

/// Response of `reset_password_with_token`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResetOutcome {
    pub success: bool,
    pub message: String,
}

/// Advisory events for the application shell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionEvent {
    #[serde(rename = "session-expired")]
    Expired,
    #[serde(rename = "session-replaced")]
    Replaced,
}

impl SessionEvent {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Expired => "session-expired",
            Self::Replaced => "session-replaced",
        }
    }

    /// The error a caller sees for the same condition.
    pub fn as_error(self) -> AuthError {
        match self {
            Self::Expired => AuthError::SessionExpired,
            Self::Replaced => AuthError::SessionReplaced,
        }
    }
}

impl fmt::Display for SessionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_parses_aliases() {
        assert_eq!("driver".parse::<Role>().unwrap(), Role::Driver);
        assert_eq!("Fleet-Manager".parse::<Role>().unwrap(), Role::FleetManager);
        assert!("owner".parse::<Role>().is_err());
    }

    #[test]
    fn role_round_trips_through_str() {
        for role in Role::ALL {
            assert_eq!(role.as_str().parse::<Role>().unwrap(), role);
        }
    }

    fn record(session_id: Option<&str>, expires_at: Option<i64>, active: bool) -> SessionRecord {
        SessionRecord {
            user: UserProfile {
                id: "u1".into(),
                email: "ana@fleet.example.com".into(),
                full_name: "Ana".into(),
                role: Role::Driver,
                is_active: active,
            },
            session_id: session_id.map(str::to_string),
            session_expires_at: expires_at,
        }
    }

    #[test]
    fn matching_live_session_verifies() {
        let user = record(Some("fp"), Some(200), true).verify("fp", 100).unwrap();
        assert_eq!(user.id, "u1");
    }

    #[test]
    fn past_expiry_is_expired_even_when_fingerprint_matches() {
        let rec = record(Some("fp"), Some(100), true);
        assert_eq!(rec.verify("fp", 101), Err(AuthError::SessionExpired));
        assert_eq!(rec.verify("other", 101), Err(AuthError::SessionExpired));
    }

    #[test]
    fn different_live_session_is_replaced() {
        let rec = record(Some("newer"), Some(200), true);
        assert_eq!(rec.verify("older", 100), Err(AuthError::SessionReplaced));
    }

    #[test]
    fn cleared_session_is_expired() {
        let rec = record(None, None, true);
        assert_eq!(rec.verify("fp", 100), Err(AuthError::SessionExpired));
    }

    #[test]
    fn inactive_account_never_verifies() {
        let rec = record(Some("fp"), Some(200), false);
        assert_eq!(rec.verify("fp", 100), Err(AuthError::AccountInactive));
    }

    #[test]
    fn session_event_serializes_with_shell_names() {
        let json = serde_json::to_string(&SessionEvent::Replaced).unwrap();
        assert_eq!(json, "\"session-replaced\"");
        assert_eq!(SessionEvent::Expired.to_string(), "session-expired");
    }
}
