//! Primary → secondary credential propagation.
//!
//! Every password write lands in `auth_credentials` together with a
//! journal row in one transaction. The journal row then moves through two
//! phases, each committed on its own:
//!
//! 1. `propagate`: copy the hash into `users.legacy_password_hash`
//! 2. `invalidate`: clear the session that was current when the password
//!    changed, then drop the row. A session opened afterwards was opened
//!    with the new password and is left alone.
//!
//! Both phases are idempotent, so a row left behind by a crash is simply
//! replayed from the phase it was in.

use super::FleetStore;
use crate::error::AuthError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    Propagate,
    Invalidate,
}

impl SyncPhase {
    fn as_str(self) -> &'static str {
        match self {
            Self::Propagate => "propagate",
            Self::Invalidate => "invalidate",
        }
    }

    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "propagate" => Some(Self::Propagate),
            "invalidate" => Some(Self::Invalidate),
            _ => None,
        }
    }
}

impl FleetStore {
    /// The single primary write path. Returns `false` if the user has no
    /// primary credential.
    ///
    /// A failure after the primary commit is logged and left for
    /// [`FleetStore::replay_pending_sync`]; the new password is already in
    /// force at that point.
    pub(crate) fn set_primary_password(&self, user_id: &str, new_hash: &str) -> Result<bool, AuthError> {
        if !self.stage_primary_password(user_id, new_hash)? {
            return Ok(false);
        }
        if let Err(e) = self.drive_sync(user_id) {
            tracing::warn!(user_id = %user_id, error = %e, "Credential sync deferred to replay");
        }
        Ok(true)
    }

    /// Write the primary hash and enqueue the journal row atomically.
    pub(crate) fn stage_primary_password(&self, user_id: &str, new_hash: &str) -> Result<bool, AuthError> {
        let now = self.now();
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let current = tx.query_row(
            "SELECT password_hash FROM auth_credentials WHERE user_id = ?1",
            rusqlite::params![user_id],
            |row| row.get::<_, String>(0),
        );
        let current = match current {
            Ok(hash) => hash,
            Err(rusqlite::Error::QueryReturnedNoRows) => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        if current == new_hash {
            return Ok(true);
        }

        tx.execute(
            "UPDATE auth_credentials SET password_hash = ?2, updated_at = ?3 WHERE user_id = ?1",
            rusqlite::params![user_id, new_hash, now],
        )?;
        tx.execute(
            "INSERT INTO credential_sync_journal
                (user_id, password_hash, phase, queued_at, stale_session_id)
             VALUES (?1, ?2, ?3, ?4, (SELECT session_id FROM users WHERE id = ?1))
             ON CONFLICT(user_id) DO UPDATE SET
                password_hash = excluded.password_hash,
                phase = excluded.phase,
                queued_at = excluded.queued_at,
                stale_session_id = excluded.stale_session_id",
            rusqlite::params![user_id, new_hash, SyncPhase::Propagate.as_str(), now],
        )?;
        tx.commit()?;

        tracing::info!(user_id = %user_id, "Primary credential updated");
        Ok(true)
    }

    fn pending_phase(&self, user_id: &str) -> Result<Option<SyncPhase>, AuthError> {
        let conn = self.conn.lock();
        let row = conn.query_row(
            "SELECT phase FROM credential_sync_journal WHERE user_id = ?1",
            rusqlite::params![user_id],
            |row| row.get::<_, String>(0),
        );
        match row {
            Ok(phase) => SyncPhase::parse(&phase).map(Some).ok_or_else(|| {
                AuthError::TransientIo(format!("unknown sync phase '{phase}' for {user_id}"))
            }),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn drive_sync(&self, user_id: &str) -> Result<(), AuthError> {
        let mut next = self.pending_phase(user_id)?;
        while let Some(phase) = next {
            next = self.run_sync_phase(user_id, phase)?;
        }
        Ok(())
    }

    /// Run one phase and return the phase that follows it, if any.
    pub(crate) fn run_sync_phase(
        &self,
        user_id: &str,
        phase: SyncPhase,
    ) -> Result<Option<SyncPhase>, AuthError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let next = match phase {
            SyncPhase::Propagate => {
                tx.execute(
                    "UPDATE users SET legacy_password_hash = (
                        SELECT password_hash FROM credential_sync_journal WHERE user_id = ?1
                     )
                     WHERE id = ?1
                       AND EXISTS (SELECT 1 FROM credential_sync_journal WHERE user_id = ?1)",
                    rusqlite::params![user_id],
                )?;
                tx.execute(
                    "UPDATE credential_sync_journal SET phase = ?2 WHERE user_id = ?1",
                    rusqlite::params![user_id, SyncPhase::Invalidate.as_str()],
                )?;
                Some(SyncPhase::Invalidate)
            }
            SyncPhase::Invalidate => {
                // NULL stale_session_id matches nothing: there was no session to revoke
                tx.execute(
                    "UPDATE users SET session_id = NULL, session_expires_at = NULL
                     WHERE id = ?1
                       AND session_id = (
                           SELECT stale_session_id FROM credential_sync_journal WHERE user_id = ?1
                       )",
                    rusqlite::params![user_id],
                )?;
                tx.execute(
                    "DELETE FROM credential_sync_journal WHERE user_id = ?1",
                    rusqlite::params![user_id],
                )?;
                None
            }
        };
        tx.commit()?;

        tracing::debug!(user_id = %user_id, phase = phase.as_str(), "Credential sync phase done");
        Ok(next)
    }

    /// Finish every journal row left behind. Returns the number of users
    /// brought back in sync.
    pub fn replay_pending_sync(&self) -> Result<usize, AuthError> {
        let user_ids: Vec<String> = {
            let conn = self.conn.lock();
            let mut stmt = conn.prepare("SELECT user_id FROM credential_sync_journal ORDER BY queued_at")?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
            let ids = rows.collect::<Result<Vec<_>, _>>()?;
            ids
        };

        for user_id in &user_ids {
            self.drive_sync(user_id)?;
        }
        if !user_ids.is_empty() {
            tracing::info!(count = user_ids.len(), "Replayed pending credential sync");
        }
        Ok(user_ids.len())
    }

    pub fn pending_sync_count(&self) -> Result<usize, AuthError> {
        let conn = self.conn.lock();
        let count: i64 =
            conn.query_row("SELECT COUNT(*) FROM credential_sync_journal", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// Hash the login path checks against.
    pub fn primary_hash(&self, user_id: &str) -> Result<Option<String>, AuthError> {
        let conn = self.conn.lock();
        let row = conn.query_row(
            "SELECT password_hash FROM auth_credentials WHERE user_id = ?1",
            rusqlite::params![user_id],
            |row| row.get::<_, String>(0),
        );
        match row {
            Ok(hash) => Ok(Some(hash)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Legacy hash kept on the profile row.
    pub fn secondary_hash(&self, user_id: &str) -> Result<Option<String>, AuthError> {
        let conn = self.conn.lock();
        let row = conn.query_row(
            "SELECT legacy_password_hash FROM users WHERE id = ?1",
            rusqlite::params![user_id],
            |row| row.get::<_, Option<String>>(0),
        );
        match row {
            Ok(hash) => Ok(hash),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{driver, store, T0};
    use super::*;
    use crate::auth::token::{hash_password, SessionToken};

    fn signed_in(store: &FleetStore) -> (String, SessionToken) {
        let user = driver(store);
        let token = SessionToken::mint(&user.id, T0);
        store
            .open_session("ana@fleet.example.com", "first-password", &token, T0 + 3600)
            .unwrap();
        (user.id, token)
    }

    #[test]
    fn full_write_leaves_no_journal_rows() {
        let (_clock, store) = store();
        let (user_id, token) = signed_in(&store);
        let hash = hash_password("second-password");

        assert!(store.set_primary_password(&user_id, &hash).unwrap());
        assert_eq!(store.pending_sync_count().unwrap(), 0);
        assert_eq!(store.secondary_hash(&user_id).unwrap().as_deref(), Some(hash.as_str()));
        assert_eq!(
            store.validate_bearer(token.as_str()).unwrap_err(),
            AuthError::SessionExpired
        );
    }

    #[test]
    fn interrupted_after_propagate_is_finished_by_replay() {
        let (_clock, store) = store();
        let (user_id, token) = signed_in(&store);
        let hash = hash_password("second-password");

        assert!(store.stage_primary_password(&user_id, &hash).unwrap());
        assert_eq!(
            store.run_sync_phase(&user_id, SyncPhase::Propagate).unwrap(),
            Some(SyncPhase::Invalidate)
        );
        // Crash here: hashes agree but the old session still stands
        assert_eq!(store.secondary_hash(&user_id).unwrap().as_deref(), Some(hash.as_str()));
        assert!(store.validate_bearer(token.as_str()).is_ok());
        assert_eq!(store.pending_sync_count().unwrap(), 1);

        assert_eq!(store.replay_pending_sync().unwrap(), 1);
        assert_eq!(store.pending_sync_count().unwrap(), 0);
        assert_eq!(
            store.validate_bearer(token.as_str()).unwrap_err(),
            AuthError::SessionExpired
        );
    }

    #[test]
    fn interrupted_before_propagate_runs_both_phases() {
        let (_clock, store) = store();
        let (user_id, _token) = signed_in(&store);
        let old_secondary = store.secondary_hash(&user_id).unwrap();
        let hash = hash_password("second-password");

        store.stage_primary_password(&user_id, &hash).unwrap();
        assert_eq!(store.secondary_hash(&user_id).unwrap(), old_secondary);
        // Login already reads the new primary hash
        assert!(store.authenticate("ana@fleet.example.com", "second-password").is_ok());

        store.replay_pending_sync().unwrap();
        assert_eq!(store.secondary_hash(&user_id).unwrap().as_deref(), Some(hash.as_str()));
        assert!(store.session_record(&user_id).unwrap().unwrap().session_id.is_none());
    }

    #[test]
    fn replay_spares_a_session_opened_with_the_new_password() {
        let (_clock, store) = store();
        let (user_id, old_token) = signed_in(&store);
        let hash = hash_password("second-password");

        // Primary committed, sync never ran
        store.stage_primary_password(&user_id, &hash).unwrap();
        let fresh = SessionToken::mint(&user_id, T0 + 5);
        store
            .open_session("ana@fleet.example.com", "second-password", &fresh, T0 + 3600)
            .unwrap();

        assert_eq!(store.replay_pending_sync().unwrap(), 1);
        assert_eq!(store.secondary_hash(&user_id).unwrap().as_deref(), Some(hash.as_str()));
        assert!(store.validate_bearer(fresh.as_str()).is_ok());
        assert_eq!(
            store.validate_bearer(old_token.as_str()).unwrap_err(),
            AuthError::SessionReplaced
        );
    }

    #[test]
    fn change_without_a_session_revokes_nothing_later() {
        let (_clock, store) = store();
        let user = driver(&store);
        let hash = hash_password("second-password");

        store.stage_primary_password(&user.id, &hash).unwrap();
        let fresh = SessionToken::mint(&user.id, T0 + 5);
        store
            .open_session("ana@fleet.example.com", "second-password", &fresh, T0 + 3600)
            .unwrap();

        store.replay_pending_sync().unwrap();
        assert!(store.validate_bearer(fresh.as_str()).is_ok());
    }

    #[test]
    fn replay_is_idempotent() {
        let (_clock, store) = store();
        let (user_id, _token) = signed_in(&store);
        store
            .stage_primary_password(&user_id, &hash_password("second-password"))
            .unwrap();
        store.run_sync_phase(&user_id, SyncPhase::Propagate).unwrap();
        // Re-running a finished phase changes nothing
        store.run_sync_phase(&user_id, SyncPhase::Propagate).unwrap();

        assert_eq!(store.replay_pending_sync().unwrap(), 1);
        assert_eq!(store.replay_pending_sync().unwrap(), 0);
    }

    #[test]
    fn unchanged_hash_keeps_session() {
        let (_clock, store) = store();
        let (user_id, token) = signed_in(&store);
        let current = store.primary_hash(&user_id).unwrap().unwrap();

        assert!(store.set_primary_password(&user_id, &current).unwrap());
        assert_eq!(store.pending_sync_count().unwrap(), 0);
        assert!(store.validate_bearer(token.as_str()).is_ok());
    }

    #[test]
    fn unknown_user_is_not_written() {
        let (_clock, store) = store();
        assert!(!store.set_primary_password("ghost", "salt$hash").unwrap());
        assert_eq!(store.pending_sync_count().unwrap(), 0);
    }
}
