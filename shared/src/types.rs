use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Presence record describing where a session currently is.
///
/// The record is ephemeral: it lives in Redis only while the owning client
/// keeps refreshing it, and is expunged when the client disappears.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Presence {
    pub session_id: String,
    pub user_id: String,
    pub location_id: String,
    pub data: Value,
    pub last_modified: i64,
}

impl Presence {
    /// Validate the submitted entity shape.
    pub fn validate(&self) -> Result<(), String> {
        if self.session_id.is_empty() {
            return Err("sessionId cannot be empty".to_string());
        }
        if self.user_id.is_empty() {
            return Err("userId cannot be empty".to_string());
        }
        if self.location_id.is_empty() {
            return Err("locationId cannot be empty".to_string());
        }
        Ok(())
    }

    /// Encoded size of all five fields concatenated, in bytes.
    ///
    /// This is the size that counts against `presence.size_limit`: the three
    /// ids as raw strings, the payload as serialized JSON and the timestamp
    /// in decimal digits.
    pub fn encoded_size(&self) -> Result<usize, serde_json::Error> {
        let data = serde_json::to_string(&self.data)?;
        Ok(self.session_id.len()
            + self.user_id.len()
            + self.location_id.len()
            + data.len()
            + self.last_modified.to_string().len())
    }
}

/// Redis key builders for consistent key naming.
///
/// Notification channels share the names of the keys they describe, so these
/// builders double as channel names.
pub struct RedisKeys;

impl RedisKeys {
    /// Session hash: presence:sessionId={session_id}
    pub fn session(session_id: &str) -> String {
        format!("presence:sessionId={}", session_id)
    }

    /// User index set: presence:userId={user_id}
    pub fn user(user_id: &str) -> String {
        format!("presence:userId={}", user_id)
    }

    /// Location index set: presence:locationId={location_id}
    pub fn location(location_id: &str) -> String {
        format!("presence:locationId={}", location_id)
    }

    /// Connection index set: presence:connectionId={connection_id}
    pub fn connection(connection_id: u64) -> String {
        format!("presence:connectionId={}", connection_id)
    }

    /// Global hash mapping connection ids to lock tokens.
    pub fn connections() -> &'static str {
        "connections"
    }
}

/// Constants for service configuration bounds and timing.
pub struct Constants;

impl Constants {
    /// Default presence TTL in seconds.
    pub const DEFAULT_TTL_SECONDS: u64 = 60;

    /// Minimum accepted presence TTL.
    pub const MIN_TTL_SECONDS: u64 = 10;

    /// Default encoded-size limit for a submitted presence, in bytes.
    pub const DEFAULT_SIZE_LIMIT: usize = 1024;

    /// Minimum accepted size limit.
    pub const MIN_SIZE_LIMIT: usize = 3;

    /// Default janitor tick in milliseconds.
    pub const DEFAULT_PRUNING_INTERVAL_MS: u64 = 1000;

    /// Minimum polling interval for presence streams, in whole seconds.
    pub const MIN_POLLING_INTERVAL_SECONDS: u64 = 10;

    /// Polling interval the service uses for the streams it owns.
    pub const STREAM_POLLING_INTERVAL_SECONDS: u64 = 30;

    /// Reload results younger than this never override a live update.
    pub const RELOAD_GUARD_MS: u64 = 1000;

    /// Sync retry delay bounds, in milliseconds.
    pub const RETRY_MIN_DELAY_MS: u64 = 1000;
    pub const RETRY_MAX_DELAY_MS: u64 = 10000;

    /// JWT token duration for presence sessions (24 hours).
    pub const TOKEN_DURATION_HOURS: i64 = 24;
}

/// JWT claims carried by a presence session token.
#[derive(Debug, Serialize, Deserialize)]
pub struct JwtClaims {
    pub sub: String,        // user_id
    pub session_id: String, // opaque session id
    pub exp: i64,           // expiration timestamp
    pub iat: i64,           // issued at timestamp
}

/// Request messages accepted by the presence service.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum PresenceRequest {
    #[serde(rename = "submitPresence")]
    SubmitPresence(Presence),
    #[serde(rename = "removePresence")]
    RemovePresence,
    #[serde(rename = "getPresenceBySessionId")]
    GetPresenceBySessionId(String),
    #[serde(rename = "getPresenceByUserId")]
    GetPresenceByUserId(String),
    #[serde(rename = "getPresenceByLocationId")]
    GetPresenceByLocationId(String),
    #[serde(rename = "streamPresenceBySessionId")]
    StreamPresenceBySessionId(String),
    #[serde(rename = "streamPresenceByUserId")]
    StreamPresenceByUserId(String),
    #[serde(rename = "streamPresenceByLocationId")]
    StreamPresenceByLocationId(String),
}

/// Response messages produced by the presence service.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum PresenceResponse {
    #[serde(rename = "ack")]
    Ack,
    #[serde(rename = "presence")]
    Presence(Option<Presence>),
    #[serde(rename = "presenceList")]
    PresenceList(Vec<Presence>),
    #[serde(rename = "streamOpened", rename_all = "camelCase")]
    StreamOpened { stream_id: u64 },
    #[serde(rename = "error")]
    Error(ErrorData),
}

/// Request envelope correlating a request with its response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestEnvelope {
    pub id: u64,
    #[serde(flatten)]
    pub request: PresenceRequest,
}

/// Response envelope carrying the correlation id back.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub id: u64,
    #[serde(flatten)]
    pub response: PresenceResponse,
}

/// Error payload sent to clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorData {
    pub code: String,
    pub message: String,
}
