use thiserror::Error;

/// Application-wide error types for the presence service
#[derive(Error, Debug)]
pub enum PresenceError {
    /// Redis-related errors
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// JWT token errors
    #[error("JWT error: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// A submitted presence violates the entity schema
    #[error("Invalid presence: {message}")]
    InvalidEntity { message: String },

    /// Submitted session/user id disagrees with the authenticated session
    #[error("Presence does not belong to the authenticated session")]
    PresenceMismatch,

    /// Encoded presence exceeds the configured size limit
    #[error("Presence size {size} exceeds the limit of {limit} bytes")]
    SizeLimitExceeded { size: usize, limit: usize },

    /// Authentication and authorization errors
    #[error("No authenticated user")]
    NoUser,

    #[error("Not authorized")]
    NotAuthorized,

    #[error("Invalid or missing authentication token")]
    InvalidToken,

    #[error("Token expired")]
    TokenExpired,

    /// A read from Redis failed or returned undecodable data
    #[error("Failed to load presence: {message}")]
    LoadFailed { message: String },

    /// A stored hash is structurally invalid (e.g. non-integer lastModified)
    #[error("Invalid stored presence: {message}")]
    InvalidPresence { message: String },

    /// A write could not be reconciled with Redis
    #[error("Failed to sync presence: {message}")]
    SyncFailed { message: String },

    /// Operation attempted after the service was destroyed
    #[error("Presence service destroyed")]
    Destroyed,

    /// WebSocket-specific errors
    #[error("WebSocket connection error: {0}")]
    WebSocket(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal errors
    #[error("Internal server error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl PresenceError {
    /// Create an invalid entity error with a message
    pub fn invalid_entity(message: &str) -> Self {
        Self::InvalidEntity {
            message: message.to_string(),
        }
    }

    /// Create a load failure wrapping the underlying cause
    pub fn load_failed(cause: impl std::fmt::Display) -> Self {
        Self::LoadFailed {
            message: cause.to_string(),
        }
    }

    /// Create an invalid stored presence error
    pub fn invalid_presence(message: &str) -> Self {
        Self::InvalidPresence {
            message: message.to_string(),
        }
    }

    /// Create a sync failure wrapping the underlying cause
    pub fn sync_failed(cause: impl std::fmt::Display) -> Self {
        Self::SyncFailed {
            message: cause.to_string(),
        }
    }

    /// Create a WebSocket error
    pub fn websocket(message: &str) -> Self {
        Self::WebSocket(message.to_string())
    }

    /// Check if the error was caused by the caller rather than the service
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidEntity { .. }
                | Self::PresenceMismatch
                | Self::SizeLimitExceeded { .. }
                | Self::NoUser
                | Self::NotAuthorized
                | Self::InvalidToken
                | Self::TokenExpired
                | Self::Destroyed
        )
    }

    /// Get error code for client communication
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::InvalidEntity { .. } => "INVALID_ENTITY",
            Self::PresenceMismatch => "PRESENCE_MISMATCH",
            Self::SizeLimitExceeded { .. } => "SIZE_LIMIT_EXCEEDED",
            Self::NoUser => "NO_USER",
            Self::NotAuthorized => "NOT_AUTHORIZED",
            Self::InvalidToken => "INVALID_TOKEN",
            Self::TokenExpired => "TOKEN_EXPIRED",
            Self::LoadFailed { .. } => "LOAD_FAILED",
            Self::InvalidPresence { .. } => "INVALID_PRESENCE",
            Self::SyncFailed { .. } => "SYNC_FAILED",
            Self::Destroyed => "DESTROYED",
            Self::WebSocket(_) => "WEBSOCKET_ERROR",
            _ => "INTERNAL_ERROR",
        }
    }
}

/// Result type alias for presence operations
pub type PresenceResult<T> = Result<T, PresenceError>;
