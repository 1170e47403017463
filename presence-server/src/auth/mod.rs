//! Auth collaborator: who the connection is, and what it may see.

pub mod jwt;

use async_trait::async_trait;
use shared::{Presence, PresenceResult};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;

use jwt::verify_jwt_token;

/// Auth lifecycle notifications observed by the presence service.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AuthEvent {
    /// The session is no longer allowed to act; owned presence is scrubbed.
    Inactive,
    /// The auth collaborator is gone; the service cascades its destruction.
    Destroy,
}

/// The authenticated session on whose behalf the service acts.
#[async_trait]
pub trait PresenceAuth: Send + Sync {
    fn active(&self) -> bool;
    fn session_id(&self) -> Option<String>;
    fn user_id(&self) -> Option<String>;
    /// May the caller observe this presence? Denied records are silently
    /// filtered from query results.
    async fn may_read_presence(&self, presence: &Presence) -> bool;
    /// May the caller publish this presence?
    async fn may_write_presence(&self, presence: &Presence) -> bool;
    fn subscribe(&self) -> broadcast::Receiver<AuthEvent>;
}

/// JWT-backed auth session: one per websocket connection.
pub struct JwtAuth {
    session_id: String,
    user_id: String,
    active: AtomicBool,
    events: broadcast::Sender<AuthEvent>,
}

impl JwtAuth {
    /// Build an active session from a verified token.
    pub fn from_token(token: &str, secret: &str) -> PresenceResult<Arc<Self>> {
        let claims = verify_jwt_token(token, secret)?;
        let (events, _) = broadcast::channel(4);
        debug!(user_id = %claims.sub, session_id = %claims.session_id, "Authenticated session");
        Ok(Arc::new(Self {
            session_id: claims.session_id,
            user_id: claims.sub,
            active: AtomicBool::new(true),
            events,
        }))
    }

    /// Mark the session inactive and notify observers.
    pub fn deactivate(&self) {
        if self.active.swap(false, Ordering::SeqCst) {
            let _ = self.events.send(AuthEvent::Inactive);
        }
    }

    /// Tear the session down, notifying observers first.
    pub fn destroy(&self) {
        self.active.store(false, Ordering::SeqCst);
        let _ = self.events.send(AuthEvent::Destroy);
    }
}

#[async_trait]
impl PresenceAuth for JwtAuth {
    fn active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    fn session_id(&self) -> Option<String> {
        Some(self.session_id.clone())
    }

    fn user_id(&self) -> Option<String> {
        Some(self.user_id.clone())
    }

    async fn may_read_presence(&self, _presence: &Presence) -> bool {
        self.active()
    }

    async fn may_write_presence(&self, _presence: &Presence) -> bool {
        self.active()
    }

    fn subscribe(&self) -> broadcast::Receiver<AuthEvent> {
        self.events.subscribe()
    }
}
