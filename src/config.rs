//! TOML configuration for the gateway, the store and the CLI client.
//!
//! Resolution order: explicit `--config` path, then
//! `<config dir>/fleetgate/config.toml`, then built-in defaults. A couple
//! of environment variables override the file afterwards.

use anyhow::{Context, Result};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default session lifetime: 8 hours.
pub const DEFAULT_SESSION_DURATION_SECS: u64 = 8 * 3600;

/// Default monitor polling interval: 60 seconds.
pub const DEFAULT_MONITOR_INTERVAL_SECS: u64 = 60;

/// Default password reset token validity: 1 hour.
pub const DEFAULT_RESET_TOKEN_TTL_SECS: u64 = 3600;

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct Config {
    pub gateway: GatewayConfig,
    pub database: DatabaseConfig,
    pub session: SessionConfig,
    pub auth: AuthConfig,
    pub client: ClientConfig,
}

/// `[gateway]` - HTTP RPC server.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    /// Per-request timeout in seconds.
    pub request_timeout_secs: u64,
    /// Login attempts per client per minute (0 = unlimited).
    pub login_rate_limit_per_minute: u32,
    /// Password reset requests per client per minute (0 = unlimited).
    pub reset_rate_limit_per_minute: u32,
    /// Interval of the background sweep (expired sessions, reset tokens,
    /// pending credential sync).
    pub sweep_interval_secs: u64,
    /// Key rate limits on `X-Forwarded-For` / `X-Real-IP` instead of the
    /// peer address. Only enable behind a proxy that overwrites them.
    pub trust_forwarded_headers: bool,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 3080,
            request_timeout_secs: 30,
            login_rate_limit_per_minute: 10,
            reset_rate_limit_per_minute: 5,
            sweep_interval_secs: 60,
            trust_forwarded_headers: false,
        }
    }
}

/// `[database]`
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct DatabaseConfig {
    /// SQLite file. Defaults to `<data dir>/fleetgate.db`.
    pub path: Option<PathBuf>,
}

/// `[session]`
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct SessionConfig {
    pub duration_secs: u64,
    pub monitor_interval_secs: u64,
    /// Where the CLI keeps the locally cached session between runs.
    pub cache_path: Option<PathBuf>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            duration_secs: DEFAULT_SESSION_DURATION_SECS,
            monitor_interval_secs: DEFAULT_MONITOR_INTERVAL_SECS,
            cache_path: None,
        }
    }
}

/// `[auth]` - signup allow-list and reset token policy.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct AuthConfig {
    /// Domains whose addresses may sign up (e.g. `"fleet.example.com"`).
    pub allowed_domains: Vec<String>,
    /// Individual addresses allowed regardless of domain.
    pub allowed_emails: Vec<String>,
    /// Addresses that receive the `admin` role at signup. Always allowed.
    pub admin_emails: Vec<String>,
    pub reset_token_ttl_secs: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            allowed_domains: Vec::new(),
            allowed_emails: Vec::new(),
            admin_emails: Vec::new(),
            reset_token_ttl_secs: DEFAULT_RESET_TOKEN_TTL_SECS,
        }
    }
}

/// `[client]` - used by `fleetgate login`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct ClientConfig {
    pub server_url: String,
    pub request_timeout_secs: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:3080".into(),
            request_timeout_secs: 15,
        }
    }
}

impl Config {
    /// Load configuration, falling back to defaults when no file exists.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let path = match explicit {
            Some(p) => Some(p.to_path_buf()),
            None => default_config_path().filter(|p| p.exists()),
        };

        let mut config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(&path)
                    .with_context(|| format!("Failed to read config {}", path.display()))?;
                let parsed: Config = toml::from_str(&raw)
                    .with_context(|| format!("Failed to parse config {}", path.display()))?;
                tracing::debug!(path = %path.display(), "Loaded config");
                parsed
            }
            None => Config::default(),
        };

        config.apply_env_overrides();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Some(path) = non_empty_env("FLEETGATE_DATABASE_PATH") {
            self.database.path = Some(PathBuf::from(path));
        }
        if let Some(url) = non_empty_env("FLEETGATE_SERVER_URL") {
            self.client.server_url = url;
        }
    }

    /// Resolved SQLite path.
    pub fn database_path(&self) -> PathBuf {
        self.database.path.clone().unwrap_or_else(|| {
            project_dirs()
                .map(|dirs| dirs.data_dir().join("fleetgate.db"))
                .unwrap_or_else(|| PathBuf::from("fleetgate.db"))
        })
    }

    /// Resolved local session cache path for the CLI client.
    pub fn session_cache_path(&self) -> PathBuf {
        self.session.cache_path.clone().unwrap_or_else(|| {
            project_dirs()
                .map(|dirs| dirs.cache_dir().join("session.json"))
                .unwrap_or_else(|| PathBuf::from(".fleetgate-session.json"))
        })
    }

    /// JSON schema of the configuration file.
    pub fn json_schema() -> Result<String> {
        let schema = schemars::schema_for!(Config);
        Ok(serde_json::to_string_pretty(&schema)?)
    }
}

fn project_dirs() -> Option<directories::ProjectDirs> {
    directories::ProjectDirs::from("io", "fleetgate", "fleetgate")
}

fn default_config_path() -> Option<PathBuf> {
    project_dirs().map(|dirs| dirs.config_dir().join("config.toml"))
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}
