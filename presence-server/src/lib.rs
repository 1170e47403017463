/// Presence server library
///
/// Tracks which authenticated sessions are present at which locations and
/// streams incremental changes to subscribers, with Redis as the
/// authoritative store.
pub mod auth;
pub mod handlers;
pub mod redis;
pub mod service;
pub mod stream;
pub mod sync;

use shared::AppConfig;
use std::sync::Arc;

use crate::redis::connection::RedisConnectionManager;
use crate::redis::store::PresenceStore;
use crate::redis::subscriber::RedisSubscriber;

/// Application state shared across all client connections
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<PresenceStore>,
    pub manager: Arc<RedisConnectionManager>,
    pub subscriber: Arc<RedisSubscriber>,
    pub config: Arc<AppConfig>,
}
