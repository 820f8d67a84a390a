//! Client-side access resolver.
//!
//! Navigation checks fail open on I/O errors: the page itself performs
//! its own server-side check before any mutation, so a flaky network
//! should not lock a user out of reading. Every other failure denies.

use super::PageRestriction;
use crate::auth::backend::AuthBackend;
use crate::auth::model::Role;
use crate::error::AuthError;
use parking_lot::RwLock;
use std::sync::Arc;

pub struct AccessResolver {
    backend: Arc<dyn AuthBackend>,
    pages: RwLock<Option<(Role, Vec<PageRestriction>)>>,
}

impl AccessResolver {
    pub fn new(backend: Arc<dyn AuthBackend>) -> Self {
        Self {
            backend,
            pages: RwLock::new(None),
        }
    }

    /// Pages open to `role`, fetched once and reused until [`Self::clear`].
    pub async fn accessible_pages(&self, role: Role) -> Result<Vec<PageRestriction>, AuthError> {
        let cached = self
            .pages
            .read()
            .as_ref()
            .filter(|(cached_role, _)| *cached_role == role)
            .map(|(_, pages)| pages.clone());
        if let Some(pages) = cached {
            return Ok(pages);
        }

        let pages = self.backend.accessible_pages(role).await?;
        *self.pages.write() = Some((role, pages.clone()));
        Ok(pages)
    }

    /// Whether `role` may navigate to `path`.
    pub async fn check_role_access(&self, path: &str, role: Role) -> bool {
        match self.backend.check_access(path, role).await {
            Ok(allowed) => allowed,
            Err(e) if e.is_transient() => {
                tracing::warn!(path, role = %role, error = %e, "Access check unavailable, allowing navigation");
                true
            }
            Err(e) => {
                tracing::debug!(path, role = %role, error = %e, "Access check rejected");
                false
            }
        }
    }

    /// Drop the cached page list (sign-in, sign-out, role change).
    pub fn clear(&self) {
        *self.pages.write() = None;
    }
}
