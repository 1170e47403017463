//! Session tokens for the presence transport.
//!
//! A token binds one websocket connection to the session and user it may
//! publish presence for. The claims carry exactly the ids the facade later
//! enforces on every submission: the subject is the authenticated user id
//! and `session_id` the opaque session the connection acts on behalf of.

use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use shared::{JwtClaims, PresenceError, PresenceResult};
use tracing::debug;

/// Verify a presence session token and return its claims.
///
/// Tokens must expire: presence is ephemeral, and so is the right to publish
/// it. Claims with an empty user or session id are rejected outright since a
/// submission under them could never pass the identity check.
pub fn verify_jwt_token(token: &str, secret: &str) -> PresenceResult<JwtClaims> {
    let validation = Validation::new(Algorithm::HS256);
    let token_data = decode::<JwtClaims>(
        token,
        &DecodingKey::from_secret(secret.as_ref()),
        &validation,
    )?;

    let claims = token_data.claims;

    if claims.sub.is_empty() || claims.session_id.is_empty() {
        return Err(PresenceError::InvalidToken);
    }

    let now = chrono::Utc::now().timestamp();
    if claims.exp < now {
        return Err(PresenceError::TokenExpired);
    }

    debug!(user_id = %claims.sub, session_id = %claims.session_id, "Presence session token verified");
    Ok(claims)
}

/// Extract the token from a presence WebSocket URL's query parameters.
pub fn extract_token_from_url(url: &str) -> Option<String> {
    url::Url::parse(url)
        .ok()?
        .query_pairs()
        .find(|(key, _)| key == "token")
        .map(|(_, value)| value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde_json::json;
    use shared::Presence;

    const SECRET: &str = "presence-test-secret";

    fn claims_for(session_id: &str, user_id: &str, expires_in: Duration) -> JwtClaims {
        JwtClaims {
            sub: user_id.to_string(),
            session_id: session_id.to_string(),
            exp: (Utc::now() + expires_in).timestamp(),
            iat: Utc::now().timestamp(),
        }
    }

    fn sign(claims: &JwtClaims) -> String {
        encode(
            &Header::default(),
            claims,
            &EncodingKey::from_secret(SECRET.as_ref()),
        )
        .unwrap()
    }

    #[test]
    fn test_claims_bind_the_session_a_submission_must_match() {
        let token = sign(&claims_for("sess-1", "user-42", Duration::hours(1)));
        let claims = verify_jwt_token(&token, SECRET).unwrap();
        assert_eq!(claims.session_id, "sess-1");
        assert_eq!(claims.sub, "user-42");

        // The verified ids are exactly the pair a submitted presence has to
        // carry to pass the facade's identity check.
        let presence = Presence {
            session_id: claims.session_id.clone(),
            user_id: claims.sub.clone(),
            location_id: "lobby".to_string(),
            data: json!(null),
            last_modified: 0,
        };
        assert!(presence.validate().is_ok());
    }

    #[test]
    fn test_expired_token_rejected() {
        let token = sign(&claims_for("sess-1", "user-42", Duration::hours(-1)));
        assert!(verify_jwt_token(&token, SECRET).is_err());
    }

    #[test]
    fn test_empty_session_id_rejected() {
        let token = sign(&claims_for("", "user-42", Duration::hours(1)));
        let error = verify_jwt_token(&token, SECRET).unwrap_err();
        assert!(matches!(error, PresenceError::InvalidToken));
    }

    #[test]
    fn test_empty_user_id_rejected() {
        let token = sign(&claims_for("sess-1", "", Duration::hours(1)));
        let error = verify_jwt_token(&token, SECRET).unwrap_err();
        assert!(matches!(error, PresenceError::InvalidToken));
    }

    #[test]
    fn test_garbage_token_rejected() {
        assert!(verify_jwt_token("not-a-token", SECRET).is_err());
    }

    #[test]
    fn test_foreign_secret_rejected() {
        let token = sign(&claims_for("sess-1", "user-42", Duration::hours(1)));
        assert!(verify_jwt_token(&token, "some-other-secret").is_err());
    }

    #[test]
    fn test_token_extracted_from_presence_url() {
        assert_eq!(
            extract_token_from_url("ws://localhost:8082/presence?token=abc123"),
            Some("abc123".to_string())
        );
        assert_eq!(extract_token_from_url("ws://localhost:8082/presence"), None);
        assert_eq!(
            extract_token_from_url("ws://localhost:8082/presence?other=1&token=t2"),
            Some("t2".to_string())
        );
    }
}
