//! Password reset tokens.
//!
//! Tokens are 32 random bytes, hex encoded, and only their SHA-256 digest
//! is stored. Issuing a token discards any earlier one for the same user;
//! a token is usable once and only while `expires_at > now`.

use super::{check_password, FleetStore};
use crate::auth::allowlist::normalize_email;
use crate::auth::model::{ResetOutcome, ResetRequest};
use crate::auth::token;
use crate::error::AuthError;

const RESET_TOKEN_BYTES: usize = 32;

impl FleetStore {
    /// Issue a reset token. Unknown or inactive addresses get the same
    /// success-shaped answer with every field empty.
    pub fn request_password_reset(&self, email: &str) -> Result<ResetRequest, AuthError> {
        let email = normalize_email(email)?;
        let now = self.now();

        let mut conn = self.conn.lock();
        let found = conn.query_row(
            "SELECT u.id, u.full_name FROM auth_credentials c
             JOIN users u ON u.id = c.user_id
             WHERE c.email = ?1 AND u.is_active = 1",
            rusqlite::params![email],
            |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
        );
        let (user_id, full_name) = match found {
            Ok(found) => found,
            Err(rusqlite::Error::QueryReturnedNoRows) => {
                tracing::debug!("Reset requested for unknown address");
                return Ok(ResetRequest {
                    success: true,
                    token: None,
                    user_id: None,
                    full_name: None,
                });
            }
            Err(e) => return Err(e.into()),
        };

        let raw = token::random_hex(RESET_TOKEN_BYTES);
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM password_reset_tokens WHERE user_id = ?1",
            rusqlite::params![user_id],
        )?;
        tx.execute(
            "INSERT INTO password_reset_tokens (token_hash, user_id, created_at, expires_at)
             VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![
                token::fingerprint(&raw),
                user_id,
                now,
                now + self.reset_token_ttl_secs
            ],
        )?;
        tx.commit()?;

        tracing::info!(user_id = %user_id, "Password reset token issued");
        Ok(ResetRequest {
            success: true,
            token: Some(raw),
            user_id: Some(user_id),
            full_name: Some(full_name),
        })
    }

    /// Consume a reset token and write the new password through the
    /// primary write path (the store login reads).
    pub fn reset_password_with_token(
        &self,
        raw_token: &str,
        new_password: &str,
    ) -> Result<ResetOutcome, AuthError> {
        let token_hash = token::fingerprint(raw_token.trim());
        let now = self.now();

        let row = self.conn.lock().query_row(
            "SELECT user_id, expires_at, used_at FROM password_reset_tokens WHERE token_hash = ?1",
            rusqlite::params![token_hash],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, Option<i64>>(2)?,
                ))
            },
        );
        let user_id = match row {
            Ok((user_id, expires_at, None)) if expires_at > now => user_id,
            Ok(_) | Err(rusqlite::Error::QueryReturnedNoRows) => {
                return Err(AuthError::TokenInvalidOrExpired)
            }
            Err(e) => return Err(e.into()),
        };

        check_password(new_password)?;
        let hash = token::hash_password(new_password);

        let claimed = self.conn.lock().execute(
            "UPDATE password_reset_tokens SET used_at = ?2
             WHERE token_hash = ?1 AND used_at IS NULL AND expires_at > ?2",
            rusqlite::params![token_hash, now],
        )?;
        if claimed == 0 {
            return Err(AuthError::TokenInvalidOrExpired);
        }

        if !self.set_primary_password(&user_id, &hash)? {
            return Err(AuthError::UserNotFound);
        }

        tracing::info!(user_id = %user_id, "Password reset completed");
        Ok(ResetOutcome {
            success: true,
            message: "Password has been reset. Please sign in with the new password.".into(),
        })
    }
}
