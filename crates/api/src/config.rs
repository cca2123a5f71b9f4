use std::net::SocketAddr;
use std::str::FromStr;

use crate::error::ConfigError;

/// Server configuration loaded from environment variables.
///
/// Command-line flags override the values read here.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Listen address (default: `127.0.0.1:5000`).
    pub bind_addr: SocketAddr,
    /// PostgreSQL connection string, if one is configured.
    pub database_url: Option<String>,
    /// HTTP request timeout in seconds (default: `30`).
    pub request_timeout_secs: u64,
    /// How often the config file is checked for changes (default: `500`).
    pub reload_interval_ms: u64,
    /// Largest accepted request body (default: 2 MiB).
    pub max_body_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 5000)),
            database_url: None,
            request_timeout_secs: 30,
            reload_interval_ms: 500,
            max_body_bytes: 2 * 1024 * 1024,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                    | Default          |
    /// |----------------------------|------------------|
    /// | `PGLUA_BIND_ADDR`          | `127.0.0.1:5000` |
    /// | `PGLUA_POSTGRES_CONFIG`    | `DATABASE_URL`   |
    /// | `REQUEST_TIMEOUT_SECS`     | `30`             |
    /// | `PGLUA_RELOAD_INTERVAL_MS` | `500`            |
    /// | `PGLUA_MAX_BODY_BYTES`     | `2097152`        |
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let database_url = non_empty_var("PGLUA_POSTGRES_CONFIG")
            .or_else(|| non_empty_var("DATABASE_URL"));

        Ok(Self {
            bind_addr: parse_var("PGLUA_BIND_ADDR", "socket address", defaults.bind_addr)?,
            database_url,
            request_timeout_secs: parse_var(
                "REQUEST_TIMEOUT_SECS",
                "u64",
                defaults.request_timeout_secs,
            )?,
            reload_interval_ms: parse_var(
                "PGLUA_RELOAD_INTERVAL_MS",
                "u64",
                defaults.reload_interval_ms,
            )?,
            max_body_bytes: parse_var("PGLUA_MAX_BODY_BYTES", "usize", defaults.max_body_bytes)?,
        })
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn parse_var<T: FromStr>(
    name: &'static str,
    expected: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match non_empty_var(name) {
        None => Ok(default),
        Some(value) => value.parse().map_err(|_| ConfigError::InvalidEnv {
            name,
            expected,
            value,
        }),
    }
}
