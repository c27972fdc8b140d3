//! Server configuration loaded from environment variables.
//!
//! Every setting has a default so the server starts with zero configuration
//! for local development.

use std::net::SocketAddr;
use std::path::PathBuf;

use tracing::warn;

const PLACEHOLDER_SECRET: &str = "dev-secret-change-me";

/// Longest accepted token lifetime.
pub const MAX_TOKEN_TTL_DAYS: i64 = 365;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Env: `CIVIC_HOST`, default `0.0.0.0`
    pub host: String,

    /// Env: `CIVIC_PORT`, default `3000`
    pub port: u16,

    /// Env: `CIVIC_DB_PATH`, default `civic.db`
    pub db_path: PathBuf,

    /// HS256 secret shared by REST auth and the live channel.
    /// Env: `CIVIC_JWT_SECRET`
    pub jwt_secret: String,

    /// Env: `CIVIC_TOKEN_TTL_DAYS`, default `30`, at most `MAX_TOKEN_TTL_DAYS`
    pub token_ttl_days: i64,

    /// Code a user must present to register as government.
    /// Env: `CIVIC_GOVERNMENT_CODE`, unset disables government sign-up.
    pub government_code: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            db_path: PathBuf::from("civic.db"),
            jwt_secret: PLACEHOLDER_SECRET.to_string(),
            token_ttl_days: 30,
            government_code: None,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(host) = lookup("CIVIC_HOST") {
            config.host = host;
        }

        if let Some(port) = lookup("CIVIC_PORT") {
            match port.parse::<u16>() {
                Ok(port) => config.port = port,
                Err(_) => warn!(value = %port, "Invalid CIVIC_PORT, using default"),
            }
        }

        if let Some(path) = lookup("CIVIC_DB_PATH") {
            config.db_path = PathBuf::from(path);
        }

        match lookup("CIVIC_JWT_SECRET") {
            Some(secret) if !secret.is_empty() => config.jwt_secret = secret,
            _ => {}
        }
        if config.uses_placeholder_secret() {
            warn!("CIVIC_JWT_SECRET is not set, using the development placeholder");
        }

        if let Some(days) = lookup("CIVIC_TOKEN_TTL_DAYS") {
            match days.parse::<i64>() {
                Ok(days) if days > MAX_TOKEN_TTL_DAYS => {
                    warn!(value = days, max = MAX_TOKEN_TTL_DAYS, "CIVIC_TOKEN_TTL_DAYS too large, clamping");
                    config.token_ttl_days = MAX_TOKEN_TTL_DAYS;
                }
                Ok(days) if days > 0 => config.token_ttl_days = days,
                _ => warn!(value = %days, "Invalid CIVIC_TOKEN_TTL_DAYS, using default"),
            }
        }

        config.government_code = lookup("CIVIC_GOVERNMENT_CODE").filter(|code| !code.is_empty());

        config
    }

    pub fn uses_placeholder_secret(&self) -> bool {
        self.jwt_secret == PLACEHOLDER_SECRET
    }

    pub fn addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(format!("{}:{}", self.host, self.port).parse()?)
    }

    pub fn token_ttl(&self) -> chrono::Duration {
        chrono::Duration::days(self.token_ttl_days.clamp(1, MAX_TOKEN_TTL_DAYS))
    }
}
