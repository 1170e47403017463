use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::types::Constants;

/// Application configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub redis: RedisConfig,
    pub presence: PresenceConfig,
    pub server: ServerConfig,
    pub jwt: JwtConfig,
    pub app: AppSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    pub url: String,
    pub connection_timeout: u64,
    pub command_timeout: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceConfig {
    /// Presence expiry in seconds; refreshed once per TTL-1 while in sync.
    pub ttl_seconds: u64,
    /// Maximum encoded size of a submitted presence, in bytes.
    pub size_limit: usize,
    /// Janitor tick for pruning dangling presence, in milliseconds.
    pub pruning_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub ws_host: String,
    pub ws_port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JwtConfig {
    pub secret: String,
    pub expiration_hours: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppSettings {
    pub environment: String,
    pub log_level: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            redis: RedisConfig {
                url: "redis://localhost:6379".to_string(),
                connection_timeout: 5,
                command_timeout: 10,
            },
            presence: PresenceConfig {
                ttl_seconds: Constants::DEFAULT_TTL_SECONDS,
                size_limit: Constants::DEFAULT_SIZE_LIMIT,
                pruning_interval_ms: Constants::DEFAULT_PRUNING_INTERVAL_MS,
            },
            server: ServerConfig {
                ws_host: "0.0.0.0".to_string(),
                ws_port: 8082,
            },
            jwt: JwtConfig {
                secret: "your-super-secret-jwt-key-change-in-production".to_string(),
                expiration_hours: 24,
            },
            app: AppSettings {
                environment: "development".to_string(),
                log_level: "info".to_string(),
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from environment variables and config files
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Config::builder()
            // Start with default values
            .add_source(Config::try_from(&AppConfig::default())?)
            // Add configuration file if it exists
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false))
            // Add environment-specific config
            .add_source(
                Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__"),
            );

        // Override specific values from direct environment variables
        if let Ok(redis_url) = std::env::var("REDIS_URL") {
            config = config.set_override("redis.url", redis_url)?;
        }

        if let Ok(jwt_secret) = std::env::var("JWT_SECRET") {
            config = config.set_override("jwt.secret", jwt_secret)?;
        }

        if let Ok(ws_port) = std::env::var("PRESENCE_WS_PORT") {
            if let Ok(port) = ws_port.parse::<u16>() {
                config = config.set_override("server.ws_port", port)?;
            }
        }

        config.build()?.try_deserialize()
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), String> {
        if self.redis.url.is_empty() {
            return Err("Redis URL cannot be empty".to_string());
        }

        if self.jwt.secret.is_empty() {
            return Err("JWT secret cannot be empty".to_string());
        }

        if self.jwt.secret.len() < 32 {
            return Err("JWT secret should be at least 32 characters long".to_string());
        }

        if self.server.ws_port == 0 {
            return Err("WebSocket port must be specified".to_string());
        }

        if self.presence.ttl_seconds < Constants::MIN_TTL_SECONDS {
            return Err(format!(
                "Presence TTL must be at least {} seconds",
                Constants::MIN_TTL_SECONDS
            ));
        }

        if self.presence.size_limit < Constants::MIN_SIZE_LIMIT {
            return Err(format!(
                "Presence size limit must be at least {} bytes",
                Constants::MIN_SIZE_LIMIT
            ));
        }

        if self.presence.pruning_interval_ms == 0 {
            return Err("Pruning interval must be greater than 0".to_string());
        }

        Ok(())
    }

    /// Get WebSocket server address
    pub fn ws_address(&self) -> String {
        format!("{}:{}", self.server.ws_host, self.server.ws_port)
    }

    /// Check if running in production environment
    pub fn is_production(&self) -> bool {
        self.app.environment.to_lowercase() == "production"
    }
}

// Custom Display implementation to hide sensitive information
impl fmt::Display for AppConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AppConfig {{ ")?;
        write!(f, "environment: {}, ", self.app.environment)?;
        write!(f, "ws_port: {}, ", self.server.ws_port)?;
        write!(f, "log_level: {}, ", self.app.log_level)?;
        write!(f, "ttl: {}s, ", self.presence.ttl_seconds)?;
        write!(f, "size_limit: {} ", self.presence.size_limit)?;
        write!(f, "}}")
    }
}
