//! Session lifecycle and role-based page access for a fleet administration
//! app.
//!
//! - [`store::FleetStore`]: SQLite accounts, single-session records,
//!   credential sync journal, reset tokens, page × role matrix
//! - [`auth::AuthGateway`]: client-side sign-in/out, session validation and
//!   the background [`auth::SessionMonitor`]
//! - [`access`]: path normalization, default pages and the access resolver
//! - [`gateway`]: the HTTP RPC server the remote backend talks to

pub mod access;
pub mod auth;
pub mod clock;
pub mod config;
pub mod error;
pub mod gateway;
pub mod store;

pub use config::Config;
pub use error::AuthError;
