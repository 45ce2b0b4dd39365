//! Configuration module
//!
//! Loads configuration from environment variables.

use std::env;

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Database connection URL
    pub database_url: String,

    /// Maximum database connections in pool
    pub database_max_connections: u32,

    /// Server host
    pub host: String,

    /// Server port
    pub port: u16,

    /// Environment (development, production)
    pub environment: String,

    /// Issuer URL embedded in tokens and used for `htu` comparisons
    pub issuer: String,

    /// HMAC key for id-token signing (key management is external)
    pub token_signing_key: String,

    /// Access token lifetime in seconds
    pub access_token_lifetime_secs: i64,

    /// Authorization code lifetime in seconds
    pub auth_code_lifetime_secs: i64,

    /// Device authorization lifetime in seconds
    pub device_auth_lifetime_secs: i64,

    /// Device authorization minimum polling interval in seconds
    pub device_auth_interval_secs: i64,

    /// Projection polling interval in milliseconds
    pub projection_interval_ms: u64,

    /// Instance-level default: whether login requires a second factor
    pub default_require_mfa: bool,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url =
            env::var("DATABASE_URL").map_err(|_| ConfigError::MissingEnv("DATABASE_URL"))?;

        let database_max_connections = env::var("DATABASE_MAX_CONNECTIONS")
            .unwrap_or_else(|_| "10".to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidValue("DATABASE_MAX_CONNECTIONS"))?;

        let host = env::var("HOST").unwrap_or_else(|_| "127.0.0.1".to_string());

        let port = env::var("PORT")
            .unwrap_or_else(|_| "3000".to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidValue("PORT"))?;

        let environment = env::var("ENVIRONMENT").unwrap_or_else(|_| "development".to_string());

        let issuer = env::var("ISSUER").unwrap_or_else(|_| format!("http://{host}:{port}"));

        let token_signing_key =
            env::var("TOKEN_SIGNING_KEY").map_err(|_| ConfigError::MissingEnv("TOKEN_SIGNING_KEY"))?;

        let access_token_lifetime_secs = env::var("ACCESS_TOKEN_LIFETIME_SECS")
            .unwrap_or_else(|_| "3600".to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidValue("ACCESS_TOKEN_LIFETIME_SECS"))?;

        let auth_code_lifetime_secs = env::var("AUTH_CODE_LIFETIME_SECS")
            .unwrap_or_else(|_| "300".to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidValue("AUTH_CODE_LIFETIME_SECS"))?;

        let device_auth_lifetime_secs = env::var("DEVICE_AUTH_LIFETIME_SECS")
            .unwrap_or_else(|_| "600".to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidValue("DEVICE_AUTH_LIFETIME_SECS"))?;

        let device_auth_interval_secs = env::var("DEVICE_AUTH_INTERVAL_SECS")
            .unwrap_or_else(|_| "5".to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidValue("DEVICE_AUTH_INTERVAL_SECS"))?;

        let projection_interval_ms = env::var("PROJECTION_INTERVAL_MS")
            .unwrap_or_else(|_| "200".to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidValue("PROJECTION_INTERVAL_MS"))?;

        let default_require_mfa = env::var("DEFAULT_REQUIRE_MFA")
            .unwrap_or_else(|_| "false".to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidValue("DEFAULT_REQUIRE_MFA"))?;

        Ok(Self {
            database_url,
            database_max_connections,
            host,
            port,
            environment,
            issuer,
            token_signing_key,
            access_token_lifetime_secs,
            auth_code_lifetime_secs,
            device_auth_lifetime_secs,
            device_auth_interval_secs,
            projection_interval_ms,
            default_require_mfa,
        })
    }

    pub fn is_production(&self) -> bool {
        self.environment == "production"
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingEnv(&'static str),

    #[error("Invalid value for environment variable: {0}")]
    InvalidValue(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::MissingEnv("DATABASE_URL");
        assert!(err.to_string().contains("DATABASE_URL"));
    }
}
