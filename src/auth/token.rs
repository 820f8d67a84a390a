//! Session tokens and password hashing.
//!
//! A session token has the shape `<user_id>.<issued_at>.<64 hex chars>`.
//! The server keeps only its SHA-256 fingerprint; the raw token lives on
//! the client that minted it.

use crate::error::AuthError;
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::fmt;

/// Random component length before hex encoding (32 bytes = 64 hex chars).
const TOKEN_BYTES: usize = 32;

/// Salt byte length for password hashing.
const SALT_BYTES: usize = 16;

/// Number of SHA-256 iterations for password stretching.
const HASH_ITERATIONS: u32 = 100_000;

/// An opaque session token minted by the auth gateway.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionToken {
    raw: String,
    user_id: String,
    issued_at: i64,
}

impl SessionToken {
    /// Mint a fresh token for `user_id` issued at `now`.
    pub fn mint(user_id: &str, now: i64) -> Self {
        let raw = format!("{user_id}.{now}.{}", random_hex(TOKEN_BYTES));
        Self {
            raw,
            user_id: user_id.to_string(),
            issued_at: now,
        }
    }

    /// Parse a raw token string (e.g. from a bearer header).
    pub fn parse(raw: &str) -> Result<Self, AuthError> {
        let raw = raw.trim();
        let mut parts = raw.rsplitn(3, '.');
        let random = parts.next().unwrap_or_default();
        let issued = parts.next().unwrap_or_default();
        let user_id = parts.next().unwrap_or_default();

        if user_id.is_empty()
            || random.len() != TOKEN_BYTES * 2
            || !random.chars().all(|c| c.is_ascii_hexdigit())
        {
            return Err(AuthError::NoSession);
        }
        let issued_at = issued.parse::<i64>().map_err(|_| AuthError::NoSession)?;

        Ok(Self {
            raw: raw.to_string(),
            user_id: user_id.to_string(),
            issued_at,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn issued_at(&self) -> i64 {
        self.issued_at
    }

    /// SHA-256 fingerprint stored server-side as `session_id`.
    pub fn fingerprint(&self) -> String {
        fingerprint(&self.raw)
    }
}

// Keep the raw token out of logs.
impl fmt::Debug for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionToken")
            .field("user_id", &self.user_id)
            .field("issued_at", &self.issued_at)
            .finish_non_exhaustive()
    }
}

/// SHA-256 hex digest of a high-entropy secret (single pass).
pub fn fingerprint(secret: &str) -> String {
    let mut h = Sha256::new();
    h.update(secret.as_bytes());
    hex::encode(h.finalize())
}

/// Generate a random hex string of `len` bytes.
pub fn random_hex(len: usize) -> String {
    let mut bytes = vec![0u8; len];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Hash a password into the stored `salt$hash` form.
pub fn hash_password(password: &str) -> String {
    let salt = random_hex(SALT_BYTES);
    let hash = stretch(password, &salt);
    format!("{salt}${hash}")
}

/// Check a password against a stored `salt$hash` value.
pub fn verify_password(password: &str, stored: &str) -> bool {
    let Some((salt, expected)) = stored.split_once('$') else {
        return false;
    };
    let attempt = stretch(password, salt);
    constant_time_eq(expected.as_bytes(), attempt.as_bytes())
}

/// Burn the same work as a real verification (unknown-user path).
pub fn dummy_verify(password: &str) {
    let _ = stretch(password, "00000000000000000000000000000000");
}

/// Iterated SHA-256 key stretching.
fn stretch(password: &str, salt: &str) -> String {
    let mut hash = Sha256::new();
    hash.update(salt.as_bytes());
    hash.update(password.as_bytes());
    let mut result = hash.finalize();

    for _ in 1..HASH_ITERATIONS {
        let mut h = Sha256::new();
        h.update(result);
        h.update(salt.as_bytes());
        result = h.finalize();
    }

    hex::encode(result)
}

/// Constant-time byte comparison to prevent timing attacks.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}
