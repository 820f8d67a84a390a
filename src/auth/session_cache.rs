//! Client-side session holder owned by the auth gateway.
//!
//! Optionally mirrored to a JSON file so the CLI keeps its session across
//! runs. The file holds a live bearer token and is written owner-only.

use super::model::UserProfile;
use super::token::SessionToken;
use crate::error::AuthError;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// What the client remembers about its own login.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalSession {
    pub token: String,
    pub expires_at: i64,
    pub user: UserProfile,
}

impl LocalSession {
    pub fn token(&self) -> Result<SessionToken, AuthError> {
        SessionToken::parse(&self.token)
    }

    pub fn user_id(&self) -> &str {
        &self.user.id
    }

    pub fn is_expired(&self, now: i64) -> bool {
        now >= self.expires_at
    }
}

impl fmt::Debug for LocalSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalSession")
            .field("user", &self.user)
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Default)]
pub struct SessionCache {
    current: RwLock<Option<LocalSession>>,
    path: Option<PathBuf>,
}

impl SessionCache {
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// File-backed cache. An unreadable or corrupt file starts empty.
    pub fn persistent(path: &Path) -> Self {
        let current = match std::fs::read_to_string(path) {
            Ok(raw) => match serde_json::from_str::<LocalSession>(&raw) {
                Ok(session) => Some(session),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Ignoring corrupt session cache");
                    None
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Failed to read session cache");
                None
            }
        };
        Self {
            current: RwLock::new(current),
            path: Some(path.to_path_buf()),
        }
    }

    pub fn get(&self) -> Option<LocalSession> {
        self.current.read().clone()
    }

    /// The "do I still have a user id" guard.
    pub fn user_id(&self) -> Option<String> {
        self.current.read().as_ref().map(|s| s.user.id.clone())
    }

    pub fn store(&self, session: LocalSession) {
        if let Some(path) = &self.path {
            if let Err(e) = write_private(path, &session) {
                tracing::warn!(path = %path.display(), error = %e, "Failed to persist session cache");
            }
        }
        *self.current.write() = Some(session);
    }

    /// Refresh the cached profile without touching the token.
    pub fn update_user(&self, user: UserProfile) {
        let updated = {
            let mut current = self.current.write();
            match current.as_mut() {
                Some(session) if session.user.id == user.id => {
                    session.user = user;
                    Some(session.clone())
                }
                _ => None,
            }
        };
        if let (Some(session), Some(path)) = (updated, &self.path) {
            if let Err(e) = write_private(path, &session) {
                tracing::warn!(path = %path.display(), error = %e, "Failed to persist session cache");
            }
        }
    }

    pub fn clear(&self) {
        *self.current.write() = None;
        self.remove_file();
    }

    /// Clear only if the held session is still the one carrying `token`.
    /// Returns whether anything was cleared.
    pub fn clear_if_token(&self, token: &str) -> bool {
        {
            let mut current = self.current.write();
            if !current.as_ref().is_some_and(|s| s.token == token) {
                return false;
            }
            *current = None;
        }
        self.remove_file();
        true
    }

    fn remove_file(&self) {
        if let Some(path) = &self.path {
            match std::fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Failed to remove session cache");
                }
            }
        }
    }
}

fn write_private(path: &Path, session: &LocalSession) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    std::fs::write(path, serde_json::to_vec(session)?)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}
