//! Configuration management for the server.

use std::env;

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Server host address
    pub host: String,
    /// Server port
    pub port: u16,
    /// PostgreSQL connection URL
    pub database_url: String,
    /// Bearer token clients must present. Unset means open access.
    pub auth_secret: Option<String>,
    /// Most records accepted by one POST.
    pub max_post_records: usize,
    /// Upper bound on an explicit `limit` of a collection GET.
    pub max_get_limit: usize,
    /// Largest accepted payload, in bytes.
    pub max_payload_bytes: usize,
    /// Size of the database connection pool.
    pub db_max_connections: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            database_url: String::new(),
            auth_secret: None,
            max_post_records: 100,
            max_get_limit: 1000,
            max_payload_bytes: 256 * 1024,
            db_max_connections: 10,
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let host = env::var("HOST").unwrap_or(defaults.host);

        let port = env::var("PORT")
            .unwrap_or_else(|_| defaults.port.to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidPort)?;

        let database_url = env::var("DATABASE_URL").map_err(|_| ConfigError::MissingDatabaseUrl)?;

        let auth_secret = env::var("AUTH_SECRET").ok().filter(|s| !s.is_empty());

        Ok(Self {
            host,
            port,
            database_url,
            auth_secret,
            max_post_records: parse_limit("MAX_POST_RECORDS", defaults.max_post_records)?,
            max_get_limit: parse_limit("MAX_GET_LIMIT", defaults.max_get_limit)?,
            max_payload_bytes: parse_limit("MAX_PAYLOAD_BYTES", defaults.max_payload_bytes)?,
            db_max_connections: parse_limit("DB_MAX_CONNECTIONS", defaults.db_max_connections as usize)?
                .try_into()
                .map_err(|_| ConfigError::InvalidLimit("DB_MAX_CONNECTIONS"))?,
        })
    }
}

fn parse_limit(name: &'static str, default: usize) -> Result<usize, ConfigError> {
    match env::var(name) {
        Ok(value) => parse_positive(name, &value),
        Err(_) => Ok(default),
    }
}

fn parse_positive(name: &'static str, value: &str) -> Result<usize, ConfigError> {
    match value.trim().parse::<usize>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(ConfigError::InvalidLimit(name)),
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("DATABASE_URL environment variable is required")]
    MissingDatabaseUrl,

    #[error("Invalid PORT value")]
    InvalidPort,

    #[error("{0} must be a positive integer")]
    InvalidLimit(&'static str),
}
