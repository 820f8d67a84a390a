//! SQLite-backed store for accounts, sessions, credential sync and the page
//! access matrix.
//!
//! Tables:
//! - `auth_credentials`: primary credential store (login reads only this)
//! - `users`: profile, role, active flag, legacy password hash, session columns
//! - `credential_sync_journal`: pending primary → secondary propagation
//! - `password_reset_tokens`: token_hash, user_id, expires_at, used_at
//! - `page_restrictions` / `page_role_access`: normalized page × role matrix

mod credential_sync;
mod pages;
mod reset;
mod users;

pub use credential_sync::SyncPhase;
pub use users::SweepReport;

use crate::clock::Clock;
use crate::error::AuthError;
use anyhow::Result;
use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;

/// Minimum accepted password length.
pub const MIN_PASSWORD_LEN: usize = 8;

/// Default password reset token validity (seconds).
const DEFAULT_RESET_TOKEN_TTL_SECS: i64 = 3600;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS auth_credentials (
        user_id TEXT PRIMARY KEY,
        email TEXT NOT NULL UNIQUE COLLATE NOCASE,
        password_hash TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    );

    CREATE TABLE IF NOT EXISTS users (
        id TEXT PRIMARY KEY,
        email TEXT NOT NULL UNIQUE COLLATE NOCASE,
        full_name TEXT NOT NULL,
        role TEXT NOT NULL,
        is_active INTEGER NOT NULL DEFAULT 1,
        legacy_password_hash TEXT,
        session_id TEXT,
        session_expires_at INTEGER,
        created_at INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_users_session_expires ON users(session_expires_at);

    CREATE TABLE IF NOT EXISTS credential_sync_journal (
        user_id TEXT PRIMARY KEY,
        password_hash TEXT NOT NULL,
        phase TEXT NOT NULL,
        queued_at INTEGER NOT NULL,
        stale_session_id TEXT
    );

    CREATE TABLE IF NOT EXISTS password_reset_tokens (
        token_hash TEXT PRIMARY KEY,
        user_id TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        expires_at INTEGER NOT NULL,
        used_at INTEGER
    );
    CREATE INDEX IF NOT EXISTS idx_reset_tokens_user ON password_reset_tokens(user_id);

    CREATE TABLE IF NOT EXISTS page_restrictions (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        page_name TEXT NOT NULL UNIQUE,
        path TEXT NOT NULL UNIQUE,
        description TEXT,
        is_active INTEGER NOT NULL DEFAULT 1,
        updated_at INTEGER NOT NULL
    );

    CREATE TABLE IF NOT EXISTS page_role_access (
        page_id INTEGER NOT NULL REFERENCES page_restrictions(id) ON DELETE CASCADE,
        role TEXT NOT NULL,
        allowed INTEGER NOT NULL,
        PRIMARY KEY (page_id, role)
    );
    CREATE INDEX IF NOT EXISTS idx_page_role_access_role ON page_role_access(role);
";

/// Persistent store shared by the HTTP gateway and the in-process backend.
pub struct FleetStore {
    conn: Mutex<rusqlite::Connection>,
    clock: Arc<dyn Clock>,
    reset_token_ttl_secs: i64,
}

impl FleetStore {
    /// Open (or create) the database at the given path.
    pub fn open(db_path: &Path, clock: Arc<dyn Clock>) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = rusqlite::Connection::open(db_path)?;

        // WAL mode for concurrent reads + crash safety
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA busy_timeout = 5000;
             PRAGMA foreign_keys = ON;",
        )?;
        Self::from_connection(conn, clock)
    }

    /// In-memory store (tests, demos).
    pub fn open_in_memory(clock: Arc<dyn Clock>) -> Result<Self> {
        let conn = rusqlite::Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        Self::from_connection(conn, clock)
    }

    fn from_connection(conn: rusqlite::Connection, clock: Arc<dyn Clock>) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
            clock,
            reset_token_ttl_secs: DEFAULT_RESET_TOKEN_TTL_SECS,
        })
    }

    /// Override the password reset token validity window.
    pub fn with_reset_token_ttl(mut self, secs: u64) -> Self {
        self.reset_token_ttl_secs = secs.max(1) as i64;
        self
    }

    pub(crate) fn now(&self) -> i64 {
        self.clock.now()
    }
}

/// Run a store call on the blocking pool. Password stretching is CPU-bound
/// and must not stall the async executor.
pub async fn blocking<T, F>(f: F) -> Result<T, AuthError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, AuthError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| AuthError::TransientIo(format!("blocking task failed: {e}")))?
}

fn check_password(password: &str) -> Result<(), AuthError> {
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(AuthError::WeakPassword(MIN_PASSWORD_LEN));
    }
    Ok(())
}

fn is_constraint_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _)
            if err.code == rusqlite::ErrorCode::ConstraintViolation
    )
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use tempfile::TempDir;

    #[test]
    fn open_creates_file_and_parent_dir() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("nested").join("fleet.db");
        let store = FleetStore::open(&path, Arc::new(SystemClock)).unwrap();
        assert!(path.exists());
        assert_eq!(store.user_count().unwrap(), 0);
    }

    #[test]
    fn reopen_keeps_data() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("fleet.db");
        {
            let store = FleetStore::open(&path, Arc::new(SystemClock)).unwrap();
            test_support::driver(&store);
        }
        let store = FleetStore::open(&path, Arc::new(SystemClock)).unwrap();
        assert_eq!(store.user_count().unwrap(), 1);
    }

    #[test]
    fn short_password_is_weak() {
        assert_eq!(check_password("short"), Err(AuthError::WeakPassword(8)));
        assert!(check_password("long enough").is_ok());
    }

    #[tokio::test]
    async fn blocking_propagates_result() {
        let v = blocking(|| Ok::<_, AuthError>(7)).await.unwrap();
        assert_eq!(v, 7);
        let e = blocking(|| Err::<(), _>(AuthError::UserNotFound)).await;
        assert_eq!(e, Err(AuthError::UserNotFound));
    }
}
