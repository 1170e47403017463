/// Shared library for the presence service
///
/// This library provides the presence entity, error handling, configuration
/// and Redis key naming used by the presence server.
pub mod config;
pub mod error;
pub mod types;
pub mod utils;

// Re-export commonly used types
pub use crate::config::*;
pub use error::*;
pub use types::*;
pub use utils::*;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_presence() -> Presence {
        Presence {
            session_id: "s1".to_string(),
            user_id: "u1".to_string(),
            location_id: "L".to_string(),
            data: json!({"k": "v"}),
            last_modified: 0,
        }
    }

    #[test]
    fn test_presence_validation() {
        assert!(sample_presence().validate().is_ok());

        let mut missing_session = sample_presence();
        missing_session.session_id = String::new();
        assert!(missing_session.validate().is_err());

        let mut missing_user = sample_presence();
        missing_user.user_id = String::new();
        assert!(missing_user.validate().is_err());

        let mut missing_location = sample_presence();
        missing_location.location_id = String::new();
        assert!(missing_location.validate().is_err());
    }

    #[test]
    fn test_presence_encoded_size() {
        let presence = sample_presence();
        // "s1" + "u1" + "L" + {"k":"v"} + "0"
        let expected = 2 + 2 + 1 + json!({"k": "v"}).to_string().len() + 1;
        assert_eq!(presence.encoded_size().unwrap(), expected);
    }

    #[test]
    fn test_redis_keys() {
        assert_eq!(RedisKeys::session("s1"), "presence:sessionId=s1");
        assert_eq!(RedisKeys::user("u1"), "presence:userId=u1");
        assert_eq!(RedisKeys::location("L"), "presence:locationId=L");
        assert_eq!(RedisKeys::connection(42), "presence:connectionId=42");
        assert_eq!(RedisKeys::connections(), "connections");
    }

    #[test]
    fn test_error_codes() {
        let error = PresenceError::PresenceMismatch;
        assert_eq!(error.error_code(), "PRESENCE_MISMATCH");
        assert!(error.is_client_error());

        let error = PresenceError::SizeLimitExceeded {
            size: 2000,
            limit: 1024,
        };
        assert_eq!(error.error_code(), "SIZE_LIMIT_EXCEEDED");
        assert!(error.is_client_error());

        let error = PresenceError::Internal(anyhow::anyhow!("boom"));
        assert_eq!(error.error_code(), "INTERNAL_ERROR");
        assert!(!error.is_client_error());
    }

    #[test]
    fn test_config_validation_bounds() {
        let mut config = AppConfig::default();
        assert!(config.validate().is_ok());

        config.presence.ttl_seconds = 9;
        assert!(config.validate().is_err());
        config.presence.ttl_seconds = 10;
        assert!(config.validate().is_ok());

        config.presence.size_limit = 2;
        assert!(config.validate().is_err());
        config.presence.size_limit = 3;
        assert!(config.validate().is_ok());

        config.presence.pruning_interval_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_request_envelope_wire_shape() {
        let envelope = RequestEnvelope {
            id: 7,
            request: PresenceRequest::GetPresenceBySessionId("s1".to_string()),
        };
        let encoded = serde_json::to_value(&envelope).unwrap();
        assert_eq!(
            encoded,
            json!({"id": 7, "type": "getPresenceBySessionId", "data": "s1"})
        );

        let decoded: RequestEnvelope =
            serde_json::from_value(json!({"id": 3, "type": "removePresence"})).unwrap();
        assert_eq!(decoded.id, 3);
        assert!(matches!(decoded.request, PresenceRequest::RemovePresence));
    }
}
