//! Accounts and the per-user session columns.

use super::{check_password, is_constraint_violation, FleetStore};
use crate::auth::allowlist::normalize_email;
use crate::auth::model::{NewAccount, Role, SessionRecord, UserProfile};
use crate::auth::token::{self, SessionToken};
use crate::error::AuthError;
use serde::Serialize;

const PROFILE_COLUMNS: &str = "id, email, full_name, role, is_active";

/// What one pass of the background sweep removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub sessions_cleared: usize,
    pub reset_tokens_removed: usize,
    pub sync_replayed: usize,
}

fn read_profile(row: &rusqlite::Row<'_>) -> rusqlite::Result<UserProfile> {
    let role: String = row.get(3)?;
    let role = role.parse::<Role>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, Box::new(e))
    })?;
    Ok(UserProfile {
        id: row.get(0)?,
        email: row.get(1)?,
        full_name: row.get(2)?,
        role,
        is_active: row.get(4)?,
    })
}

impl FleetStore {
    // ── Accounts ────────────────────────────────────────────────────

    /// Create the primary credential, then the profile row linked to it.
    ///
    /// If the profile insert fails the primary record is removed again so
    /// the address can be retried; a failed removal is only logged.
    pub fn create_account(&self, account: &NewAccount) -> Result<UserProfile, AuthError> {
        let email = normalize_email(&account.email)?;
        let full_name = account.full_name.trim();
        if full_name.is_empty() {
            return Err(AuthError::InvalidInput("full name cannot be empty".into()));
        }
        check_password(&account.password)?;

        let user_id = uuid::Uuid::new_v4().to_string();
        let password_hash = token::hash_password(&account.password);
        let now = self.now();

        let conn = self.conn.lock();
        let primary = conn.execute(
            "INSERT INTO auth_credentials (user_id, email, password_hash, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?4)",
            rusqlite::params![user_id, email, password_hash, now],
        );
        match primary {
            Ok(_) => {}
            Err(e) if is_constraint_violation(&e) => return Err(AuthError::EmailAlreadyRegistered),
            Err(e) => return Err(e.into()),
        }

        let profile = conn.execute(
            "INSERT INTO users (id, email, full_name, role, is_active, legacy_password_hash, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            rusqlite::params![
                user_id,
                email,
                full_name,
                account.role.as_str(),
                account.is_active,
                password_hash,
                now
            ],
        );
        if let Err(e) = profile {
            tracing::warn!(user_id = %user_id, error = %e, "Profile insert failed, removing primary credential");
            if let Err(cleanup) = conn.execute(
                "DELETE FROM auth_credentials WHERE user_id = ?1",
                rusqlite::params![user_id],
            ) {
                tracing::error!(user_id = %user_id, error = %cleanup, "Failed to remove orphaned primary credential");
            }
            return Err(if is_constraint_violation(&e) {
                AuthError::EmailAlreadyRegistered
            } else {
                e.into()
            });
        }

        tracing::info!(user_id = %user_id, role = %account.role, "Account created");
        Ok(UserProfile {
            id: user_id,
            email,
            full_name: full_name.to_string(),
            role: account.role,
            is_active: account.is_active,
        })
    }

    /// Check credentials against the primary store only.
    ///
    /// Returns the profile together with the currently recorded session
    /// fields. Inactive accounts fail with `AccountInactive` even when the
    /// password is right.
    pub fn authenticate(&self, email: &str, password: &str) -> Result<SessionRecord, AuthError> {
        let Ok(email) = normalize_email(email) else {
            token::dummy_verify(password);
            return Err(AuthError::InvalidCredentials);
        };

        let row = {
            let conn = self.conn.lock();
            conn.query_row(
                "SELECT user_id, password_hash FROM auth_credentials WHERE email = ?1",
                rusqlite::params![email],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
            )
        };

        let (user_id, stored_hash) = match row {
            Ok(found) => found,
            Err(rusqlite::Error::QueryReturnedNoRows) => {
                // Same work as a real check so timing does not reveal the address
                token::dummy_verify(password);
                return Err(AuthError::InvalidCredentials);
            }
            Err(e) => return Err(e.into()),
        };

        if !token::verify_password(password, &stored_hash) {
            return Err(AuthError::InvalidCredentials);
        }

        let record = self
            .session_record(&user_id)?
            .ok_or(AuthError::UserNotFound)?;
        if !record.user.is_active {
            tracing::info!(user_id = %user_id, "Sign-in refused for inactive account");
            return Err(AuthError::AccountInactive);
        }
        Ok(record)
    }

    /// Re-check credentials and record `token` as the user's only session.
    ///
    /// The write is an unconditional overwrite, so the last login wins and
    /// any other device holding an older token is replaced.
    pub fn open_session(
        &self,
        email: &str,
        password: &str,
        session: &SessionToken,
        expires_at: i64,
    ) -> Result<UserProfile, AuthError> {
        let record = self.authenticate(email, password)?;
        if record.user.id != session.user_id() {
            return Err(AuthError::InvalidInput(
                "session token was minted for another user".into(),
            ));
        }
        if expires_at <= self.now() {
            return Err(AuthError::InvalidInput("session expiry is in the past".into()));
        }

        let updated = self.conn.lock().execute(
            "UPDATE users SET session_id = ?2, session_expires_at = ?3
             WHERE id = ?1 AND is_active = 1",
            rusqlite::params![record.user.id, session.fingerprint(), expires_at],
        )?;
        if updated == 0 {
            return Err(AuthError::AccountInactive);
        }

        tracing::info!(user_id = %record.user.id, expires_at, "Session opened");
        Ok(record.user)
    }

    /// Profile plus session columns for `user_id`.
    pub fn session_record(&self, user_id: &str) -> Result<Option<SessionRecord>, AuthError> {
        let conn = self.conn.lock();
        let row = conn.query_row(
            &format!(
                "SELECT {PROFILE_COLUMNS}, session_id, session_expires_at FROM users WHERE id = ?1"
            ),
            rusqlite::params![user_id],
            |row| {
                Ok(SessionRecord {
                    user: read_profile(row)?,
                    session_id: row.get(5)?,
                    session_expires_at: row.get(6)?,
                })
            },
        );

        match row {
            Ok(record) => Ok(Some(record)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Clear the session columns.
    ///
    /// With `Some(fingerprint)` the clear only happens while that session is
    /// still the current one. `None` clears whatever is recorded.
    pub fn clear_session(&self, user_id: &str, fingerprint: Option<&str>) -> Result<bool, AuthError> {
        let conn = self.conn.lock();
        let cleared = match fingerprint {
            Some(fp) => conn.execute(
                "UPDATE users SET session_id = NULL, session_expires_at = NULL
                 WHERE id = ?1 AND session_id = ?2",
                rusqlite::params![user_id, fp],
            )?,
            None => conn.execute(
                "UPDATE users SET session_id = NULL, session_expires_at = NULL
                 WHERE id = ?1 AND session_id IS NOT NULL",
                rusqlite::params![user_id],
            )?,
        };
        if cleared > 0 {
            tracing::info!(user_id = %user_id, "Session cleared");
        }
        Ok(cleared > 0)
    }

    /// Resolve a raw bearer token to its user, classifying failures as
    /// expired, replaced or inactive.
    pub fn validate_bearer(&self, raw: &str) -> Result<(UserProfile, SessionToken), AuthError> {
        let session = SessionToken::parse(raw)?;
        let record = self
            .session_record(session.user_id())?
            .ok_or(AuthError::NoSession)?;
        let user = record.verify(&session.fingerprint(), self.now())?;
        Ok((user, session))
    }

    /// Set a new password for `user_id`. Returns `false` for unknown users.
    ///
    /// Goes through the single primary write path, which propagates the
    /// hash to the legacy column and revokes the current session.
    pub fn update_password(&self, user_id: &str, new_password: &str) -> Result<bool, AuthError> {
        check_password(new_password)?;
        let hash = token::hash_password(new_password);
        self.set_primary_password(user_id, &hash)
    }

    /// Activate or deactivate an account. Deactivation also ends its session.
    pub fn set_user_active(&self, user_id: &str, active: bool) -> Result<bool, AuthError> {
        let updated = self.conn.lock().execute(
            "UPDATE users SET
                is_active = ?2,
                session_id = CASE WHEN ?2 THEN session_id ELSE NULL END,
                session_expires_at = CASE WHEN ?2 THEN session_expires_at ELSE NULL END
             WHERE id = ?1",
            rusqlite::params![user_id, active],
        )?;
        if updated > 0 {
            tracing::info!(user_id = %user_id, active, "Account active flag changed");
        }
        Ok(updated > 0)
    }

    pub fn get_user(&self, user_id: &str) -> Result<Option<UserProfile>, AuthError> {
        let conn = self.conn.lock();
        let row = conn.query_row(
            &format!("SELECT {PROFILE_COLUMNS} FROM users WHERE id = ?1"),
            rusqlite::params![user_id],
            read_profile,
        );
        match row {
            Ok(user) => Ok(Some(user)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn get_user_by_email(&self, email: &str) -> Result<Option<UserProfile>, AuthError> {
        let email = normalize_email(email)?;
        let conn = self.conn.lock();
        let row = conn.query_row(
            &format!("SELECT {PROFILE_COLUMNS} FROM users WHERE email = ?1"),
            rusqlite::params![email],
            read_profile,
        );
        match row {
            Ok(user) => Ok(Some(user)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn user_count(&self) -> Result<usize, AuthError> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    // ── Maintenance ─────────────────────────────────────────────────

    /// Clear elapsed sessions, drop dead reset tokens and finish any
    /// interrupted credential sync.
    pub fn sweep_expired(&self) -> Result<SweepReport, AuthError> {
        let now = self.now();
        let (sessions_cleared, reset_tokens_removed) = {
            let conn = self.conn.lock();
            let sessions = conn.execute(
                "UPDATE users SET session_id = NULL, session_expires_at = NULL
                 WHERE session_expires_at IS NOT NULL AND session_expires_at <= ?1",
                rusqlite::params![now],
            )?;
            let tokens = conn.execute(
                "DELETE FROM password_reset_tokens WHERE expires_at <= ?1 OR used_at IS NOT NULL",
                rusqlite::params![now],
            )?;
            (sessions, tokens)
        };
        let sync_replayed = self.replay_pending_sync()?;

        let report = SweepReport {
            sessions_cleared,
            reset_tokens_removed,
            sync_replayed,
        };
        if report != SweepReport::default() {
            tracing::debug!(?report, "Sweep finished");
        }
        Ok(report)
    }
}
