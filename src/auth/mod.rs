//! Authentication and session lifecycle.
//!
//! Provides:
//! - Session tokens and iterated SHA-256 password hashing (`token`)
//! - Signup allow-list with role inference (`allowlist`)
//! - The [`AuthBackend`] seam with in-process and HTTP implementations
//! - [`AuthGateway`]: sign-in, sign-out, session checks, account flows
//! - [`SessionMonitor`]: background revalidation of the held session
//!
//! ## Design Decisions
//! - One session per user. A new login overwrites the stored session
//!   fingerprint, which is how other devices learn they were replaced.
//! - The server stores a SHA-256 fingerprint of the token, never the token.
//! - Validation failures are recovered locally (state cleared) and
//!   published as `session-expired` / `session-replaced` events.

pub mod allowlist;
pub mod backend;
pub mod gateway;
pub mod model;
pub mod monitor;
pub mod notify;
pub mod remote;
pub mod session_cache;
pub mod token;

pub use allowlist::SignupPolicy;
pub use backend::{AuthBackend, LocalBackend};
pub use gateway::{AuthGateway, SessionPolicy};
pub use model::{Role, SessionEvent, UserProfile};
pub use monitor::SessionMonitor;
pub use notify::{LogNotifier, ResetNotice, ResetNotifier};
pub use remote::RemoteBackend;
pub use session_cache::{LocalSession, SessionCache};
pub use token::SessionToken;
