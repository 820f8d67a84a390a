//! Role-based page access.
//!
//! The matrix itself lives in the store (`page_restrictions` plus one
//! `page_role_access` row per page and role). This module holds the shared
//! types, path normalization and the client-side resolver.

pub mod resolver;
pub mod seed;

pub use resolver::AccessResolver;

use crate::auth::model::Role;
use crate::error::AuthError;
use serde::{Deserialize, Serialize};

/// The administrative page that guards edits to the matrix itself.
pub const PAGE_RESTRICTIONS_PATH: &str = "/settings/page-restrictions";

/// One row of the access matrix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRestriction {
    pub id: i64,
    pub page_name: String,
    pub path: String,
    pub description: Option<String>,
    pub is_active: bool,
    pub allowed_roles: Vec<Role>,
}

impl PageRestriction {
    /// Inactive pages are closed to every role.
    pub fn allows(&self, role: Role) -> bool {
        self.is_active && self.allowed_roles.contains(&role)
    }
}

/// Input for creating or replacing a page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageDefinition {
    pub page_name: String,
    pub path: String,
    #[serde(default)]
    pub description: Option<String>,
    pub allowed_roles: Vec<Role>,
}

/// Canonical form of a route: no query or fragment, leading slash, no
/// trailing slash (except the root).
pub fn normalize_path(raw: &str) -> Result<String, AuthError> {
    let raw = raw.trim();
    let end = raw.find(['?', '#']).unwrap_or(raw.len());
    let path = &raw[..end];

    if !path.starts_with('/') {
        return Err(AuthError::InvalidInput(format!(
            "path must start with '/': {raw}"
        )));
    }
    if path.contains("//") {
        return Err(AuthError::InvalidInput(format!("empty path segment: {raw}")));
    }

    let trimmed = path.trim_end_matches('/');
    Ok(if trimmed.is_empty() {
        "/".to_string()
    } else {
        trimmed.to_string()
    })
}

/// Lookup order for a normalized path: itself, then each parent on a
/// segment boundary. The root only matches itself, so an unregistered
/// top-level route never inherits the dashboard's flags.
pub(crate) fn lookup_candidates(path: &str) -> Vec<&str> {
    let mut candidates = vec![path];
    let mut current = path;
    while let Some(idx) = current.rfind('/') {
        if idx == 0 {
            break;
        }
        current = &current[..idx];
        candidates.push(current);
    }
    candidates
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_strips_query_fragment_and_trailing_slash() {
        assert_eq!(normalize_path("/vehicles/").unwrap(), "/vehicles");
        assert_eq!(normalize_path(" /trips?page=2 ").unwrap(), "/trips");
        assert_eq!(normalize_path("/reports#fuel").unwrap(), "/reports");
        assert_eq!(normalize_path("/").unwrap(), "/");
        assert_eq!(normalize_path("/?tab=1").unwrap(), "/");
    }

    #[test]
    fn normalize_rejects_relative_and_empty_segments() {
        assert!(normalize_path("vehicles").is_err());
        assert!(normalize_path("").is_err());
        assert!(normalize_path("/vehicles//42").is_err());
    }

    #[test]
    fn candidates_walk_up_to_first_segment() {
        assert_eq!(
            lookup_candidates("/vehicles/42/edit"),
            vec!["/vehicles/42/edit", "/vehicles/42", "/vehicles"]
        );
        assert_eq!(lookup_candidates("/users"), vec!["/users"]);
        assert_eq!(lookup_candidates("/"), vec!["/"]);
    }

    #[test]
    fn inactive_page_allows_nobody() {
        let page = PageRestriction {
            id: 1,
            page_name: "Reports".into(),
            path: "/reports".into(),
            description: None,
            is_active: false,
            allowed_roles: Role::ALL.to_vec(),
        };
        for role in Role::ALL {
            assert!(!page.allows(role));
        }
    }
}
