//! Signup allow-list and role inference.

use super::model::Role;
use crate::config::AuthConfig;
use crate::error::AuthError;

/// Role given to every allowed address that is not an admin address.
pub const DEFAULT_SIGNUP_ROLE: Role = Role::Driver;

/// Decides who may sign up and with which role.
#[derive(Debug, Clone, Default)]
pub struct SignupPolicy {
    allowed_domains: Vec<String>,
    allowed_emails: Vec<String>,
    admin_emails: Vec<String>,
}

impl SignupPolicy {
    pub fn new(
        allowed_domains: impl IntoIterator<Item = String>,
        allowed_emails: impl IntoIterator<Item = String>,
        admin_emails: impl IntoIterator<Item = String>,
    ) -> Self {
        let norm = |v: String| v.trim().trim_start_matches('@').to_ascii_lowercase();
        Self {
            allowed_domains: allowed_domains.into_iter().map(norm).collect(),
            allowed_emails: allowed_emails.into_iter().map(norm).collect(),
            admin_emails: admin_emails.into_iter().map(norm).collect(),
        }
    }

    pub fn from_config(config: &AuthConfig) -> Self {
        Self::new(
            config.allowed_domains.clone(),
            config.allowed_emails.clone(),
            config.admin_emails.clone(),
        )
    }

    /// Validate `email` and return the role it signs up with.
    pub fn role_for(&self, email: &str) -> Result<Role, AuthError> {
        let email = normalize_email(email)?;

        if self.admin_emails.iter().any(|e| *e == email) {
            return Ok(Role::Admin);
        }
        if self.allowed_emails.iter().any(|e| *e == email) {
            return Ok(DEFAULT_SIGNUP_ROLE);
        }

        let domain = email.rsplit_once('@').map(|(_, d)| d).unwrap_or_default();
        if self.allowed_domains.iter().any(|d| d == domain) {
            return Ok(DEFAULT_SIGNUP_ROLE);
        }

        Err(AuthError::EmailNotAllowed)
    }
}

/// Lowercase and sanity-check an email address.
pub fn normalize_email(email: &str) -> Result<String, AuthError> {
    let email = email.trim().to_ascii_lowercase();
    match email.split_once('@') {
        Some((local, domain)) if !local.is_empty() && domain.contains('.') => Ok(email),
        _ => Err(AuthError::InvalidInput("malformed email address".into())),
    }
}
