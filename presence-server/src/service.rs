//! The presence service facade.
//!
//! One instance serves one authenticated session: it validates submissions,
//! enforces authorization, answers point queries, and owns the subscription
//! streams it hands out. Background failures are logged and retried; only
//! request-triggered errors travel back to the caller.

use shared::{
    Constants, Presence, PresenceConfig, PresenceError, PresenceRequest, PresenceResult, RedisKeys,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::auth::{AuthEvent, PresenceAuth};
use crate::redis::connection::{ConnectionEvent, RedisConnectionManager};
use crate::redis::store::{PresenceStore, SyncStore};
use crate::redis::subscriber::{RedisSubscriber, SubscriberEvent, Subscription};
use crate::stream::{LoadPresence, PresenceStream, PresenceStreamMessage};
use crate::sync::{PresenceSyncEngine, SyncEvent};

/// Consumer half of an owned stream, handed to the transport.
#[derive(Debug)]
pub struct PresenceStreamHandle {
    pub id: u64,
    pub messages: mpsc::UnboundedReceiver<PresenceStreamMessage>,
}

/// Result of dispatching one request.
pub enum RequestOutcome {
    Ack,
    Presence(Option<Presence>),
    PresenceList(Vec<Presence>),
    Stream(PresenceStreamHandle),
}

struct StreamRegistration {
    stream: Arc<PresenceStream>,
    channel: String,
    listener_id: u64,
    tasks: Vec<JoinHandle<()>>,
}

struct ServiceInner {
    auth: Arc<dyn PresenceAuth>,
    store: Arc<PresenceStore>,
    manager: Arc<RedisConnectionManager>,
    subscriber: Arc<RedisSubscriber>,
    sync: PresenceSyncEngine,
    size_limit: usize,
    destroyed: AtomicBool,
    streams: Mutex<HashMap<u64, StreamRegistration>>,
    next_stream_id: AtomicU64,
    watchers: Mutex<Vec<JoinHandle<()>>>,
}

/// Presence service bound to one authenticated session.
pub struct PresenceService {
    inner: Arc<ServiceInner>,
}

impl PresenceService {
    pub fn new(
        auth: Arc<dyn PresenceAuth>,
        store: Arc<PresenceStore>,
        manager: Arc<RedisConnectionManager>,
        subscriber: Arc<RedisSubscriber>,
        config: &PresenceConfig,
    ) -> Self {
        let sync = PresenceSyncEngine::spawn(
            Arc::clone(&store) as Arc<dyn SyncStore>,
            config.ttl_seconds,
        );

        let inner = Arc::new(ServiceInner {
            auth,
            store,
            manager,
            subscriber,
            sync,
            size_limit: config.size_limit,
            destroyed: AtomicBool::new(false),
            streams: Mutex::new(HashMap::new()),
            next_stream_id: AtomicU64::new(1),
            watchers: Mutex::new(Vec::new()),
        });

        let service = Self {
            inner: Arc::clone(&inner),
        };
        service.spawn_watchers();
        service
    }

    fn spawn_watchers(&self) {
        let mut watchers = self.inner.watchers.lock().unwrap();

        // Auth lifecycle: inactive scrubs owned presence, destroy cascades.
        let inner = Arc::clone(&self.inner);
        let mut auth_events = inner.auth.subscribe();
        watchers.push(tokio::spawn(async move {
            loop {
                match auth_events.recv().await {
                    Ok(AuthEvent::Inactive) => {
                        info!("Auth became inactive, scrubbing presence");
                        inner.sync.remove();
                    }
                    Ok(AuthEvent::Destroy) => {
                        inner.destroy();
                        return;
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        }));

        // A fresh connection id requires rewriting the stored record.
        let inner = Arc::clone(&self.inner);
        let mut connection_events = inner.manager.subscribe();
        watchers.push(tokio::spawn(async move {
            loop {
                match connection_events.recv().await {
                    Ok(ConnectionEvent::Ready { .. }) => inner.sync.refresh(),
                    Ok(ConnectionEvent::Closed) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        }));
    }

    /// Subscribe to the sync engine's notifications.
    pub fn sync_events(&self) -> broadcast::Receiver<SyncEvent> {
        self.inner.sync.subscribe()
    }

    /// Dispatch one request by name.
    pub async fn handle_request(&self, request: PresenceRequest) -> PresenceResult<RequestOutcome> {
        match request {
            PresenceRequest::SubmitPresence(presence) => {
                self.submit_presence(presence).await?;
                Ok(RequestOutcome::Ack)
            }
            PresenceRequest::RemovePresence => {
                self.remove_presence()?;
                Ok(RequestOutcome::Ack)
            }
            PresenceRequest::GetPresenceBySessionId(session_id) => Ok(RequestOutcome::Presence(
                self.get_presence_by_session_id(&session_id).await?,
            )),
            PresenceRequest::GetPresenceByUserId(user_id) => Ok(RequestOutcome::PresenceList(
                self.get_presence_by_user_id(&user_id).await?,
            )),
            PresenceRequest::GetPresenceByLocationId(location_id) => {
                Ok(RequestOutcome::PresenceList(
                    self.get_presence_by_location_id(&location_id).await?,
                ))
            }
            PresenceRequest::StreamPresenceBySessionId(session_id) => Ok(RequestOutcome::Stream(
                self.stream_presence_by_session_id(&session_id)?,
            )),
            PresenceRequest::StreamPresenceByUserId(user_id) => Ok(RequestOutcome::Stream(
                self.stream_presence_by_user_id(&user_id)?,
            )),
            PresenceRequest::StreamPresenceByLocationId(location_id) => Ok(
                RequestOutcome::Stream(self.stream_presence_by_location_id(&location_id)?),
            ),
        }
    }

    /// Submit the session's presence; the sync engine reconciles it with
    /// Redis in the background.
    pub async fn submit_presence(&self, presence: Presence) -> PresenceResult<()> {
        self.inner.ensure_alive()?;
        presence
            .validate()
            .map_err(|message| PresenceError::invalid_entity(&message))?;

        let session_id = self.inner.authenticated_session_id()?;
        let user_id = self.inner.authenticated_user_id()?;
        if presence.session_id != session_id || presence.user_id != user_id {
            return Err(PresenceError::PresenceMismatch);
        }

        let size = presence.encoded_size()?;
        if size > self.inner.size_limit {
            return Err(PresenceError::SizeLimitExceeded {
                size,
                limit: self.inner.size_limit,
            });
        }

        if !self.inner.auth.may_write_presence(&presence).await {
            return Err(PresenceError::NotAuthorized);
        }
        // The authorization check may have suspended; re-check liveness
        // before mutating intent.
        self.inner.ensure_alive()?;

        debug!(session_id = %presence.session_id, location_id = %presence.location_id, "Submitting presence");
        self.inner.sync.submit(presence);
        Ok(())
    }

    /// Drop the session's presence from Redis.
    pub fn remove_presence(&self) -> PresenceResult<()> {
        self.inner.ensure_alive()?;
        debug!("Removing presence");
        self.inner.sync.remove();
        Ok(())
    }

    pub async fn get_presence_by_session_id(
        &self,
        session_id: &str,
    ) -> PresenceResult<Option<Presence>> {
        self.inner.require_user()?;
        self.inner.load_by_session_id(session_id).await
    }

    pub async fn get_presence_by_user_id(&self, user_id: &str) -> PresenceResult<Vec<Presence>> {
        self.inner.require_user()?;
        let loaded = self
            .inner
            .store
            .get_by_user_id(user_id)
            .await
            .map_err(wrap_load)?;
        self.inner.filter_readable(loaded).await
    }

    pub async fn get_presence_by_location_id(
        &self,
        location_id: &str,
    ) -> PresenceResult<Vec<Presence>> {
        self.inner.require_user()?;
        let loaded = self
            .inner
            .store
            .get_by_location_id(location_id)
            .await
            .map_err(wrap_load)?;
        self.inner.filter_readable(loaded).await
    }

    /// Mirror one session's presence.
    pub fn stream_presence_by_session_id(
        &self,
        session_id: &str,
    ) -> PresenceResult<PresenceStreamHandle> {
        let channel = RedisKeys::session(session_id);
        let inner = Arc::clone(&self.inner);
        let target = session_id.to_string();
        let loader: LoadPresence = Arc::new(move || {
            let inner = Arc::clone(&inner);
            let session_id = target.clone();
            Box::pin(async move {
                let presence = inner.load_by_session_id(&session_id).await?;
                Ok(presence.into_iter().collect())
            })
        });
        self.open_stream(channel, loader, Arc::new(|_| true))
    }

    /// Mirror the presence set of one user.
    pub fn stream_presence_by_user_id(&self, user_id: &str) -> PresenceResult<PresenceStreamHandle> {
        let channel = RedisKeys::user(user_id);
        let inner = Arc::clone(&self.inner);
        let target = user_id.to_string();
        let loader: LoadPresence = Arc::new(move || {
            let inner = Arc::clone(&inner);
            let user_id = target.clone();
            Box::pin(async move {
                let loaded = inner.store.get_by_user_id(&user_id).await.map_err(wrap_load)?;
                inner.filter_readable(loaded).await
            })
        });
        let target = user_id.to_string();
        self.open_stream(
            channel,
            loader,
            Arc::new(move |presence: &Presence| presence.user_id == target),
        )
    }

    /// Mirror the presence set at one location.
    pub fn stream_presence_by_location_id(
        &self,
        location_id: &str,
    ) -> PresenceResult<PresenceStreamHandle> {
        let channel = RedisKeys::location(location_id);
        let inner = Arc::clone(&self.inner);
        let target = location_id.to_string();
        let loader: LoadPresence = Arc::new(move || {
            let inner = Arc::clone(&inner);
            let location_id = target.clone();
            Box::pin(async move {
                let loaded = inner
                    .store
                    .get_by_location_id(&location_id)
                    .await
                    .map_err(wrap_load)?;
                inner.filter_readable(loaded).await
            })
        });
        let target = location_id.to_string();
        self.open_stream(
            channel,
            loader,
            Arc::new(move |presence: &Presence| presence.location_id == target),
        )
    }

    /// Wire a stream: subscribe to the channel, route notifications through
    /// a fresh point lookup, reload on (re)connect, flush on disconnect.
    fn open_stream(
        &self,
        channel: String,
        loader: LoadPresence,
        should_add: Arc<dyn Fn(&Presence) -> bool + Send + Sync>,
    ) -> PresenceResult<PresenceStreamHandle> {
        self.inner.require_user()?;

        let (stream, messages) =
            PresenceStream::new(loader, Constants::STREAM_POLLING_INTERVAL_SECONDS)?;
        let stream = Arc::new(stream);
        let subscription = self.inner.subscriber.on_channel(&channel)?;
        let listener_id = subscription.id;

        let mut tasks = Vec::with_capacity(2);
        tasks.push(tokio::spawn(notification_loop(
            Arc::clone(&self.inner),
            Arc::clone(&stream),
            subscription,
            should_add,
        )));
        tasks.push(tokio::spawn(connection_watch_loop(
            self.inner.manager.subscribe(),
            Arc::clone(&stream),
        )));

        // Populate the mirror without waiting for the first polling tick.
        stream.trigger_reload();

        let id = self.inner.next_stream_id.fetch_add(1, Ordering::Relaxed);
        self.inner.streams.lock().unwrap().insert(
            id,
            StreamRegistration {
                stream,
                channel: channel.clone(),
                listener_id,
                tasks,
            },
        );
        debug!(stream_id = id, channel = %channel, "Opened presence stream");

        Ok(PresenceStreamHandle { id, messages })
    }

    /// Tear down one owned stream. A stream whose consumer disappeared is
    /// closed the same way.
    pub fn close_stream(&self, stream_id: u64) {
        let registration = self.inner.streams.lock().unwrap().remove(&stream_id);
        if let Some(registration) = registration {
            self.inner.cleanup_stream(registration);
            debug!(stream_id, "Closed presence stream");
        }
    }

    /// Destroy the service: scrub presence, close every owned stream and
    /// stop background work. Idempotent.
    pub fn destroy(&self) {
        self.inner.destroy();
    }

    pub fn destroyed(&self) -> bool {
        self.inner.destroyed.load(Ordering::SeqCst)
    }
}

impl Drop for PresenceService {
    fn drop(&mut self) {
        self.inner.destroy();
    }
}

impl ServiceInner {
    fn ensure_alive(&self) -> PresenceResult<()> {
        if self.destroyed.load(Ordering::SeqCst) {
            Err(PresenceError::Destroyed)
        } else {
            Ok(())
        }
    }

    fn authenticated_session_id(&self) -> PresenceResult<String> {
        if !self.auth.active() {
            return Err(PresenceError::NoUser);
        }
        self.auth.session_id().ok_or(PresenceError::NoUser)
    }

    fn authenticated_user_id(&self) -> PresenceResult<String> {
        if !self.auth.active() {
            return Err(PresenceError::NoUser);
        }
        self.auth.user_id().ok_or(PresenceError::NoUser)
    }

    fn require_user(&self) -> PresenceResult<()> {
        self.ensure_alive()?;
        self.authenticated_user_id()?;
        Ok(())
    }

    /// Point lookup with the read-authorization filter applied; a denied
    /// record reads as absent.
    async fn load_by_session_id(&self, session_id: &str) -> PresenceResult<Option<Presence>> {
        let loaded = self
            .store
            .get_by_session_id(session_id)
            .await
            .map_err(wrap_load)?;
        match loaded {
            Some(presence) if self.auth.may_read_presence(&presence).await => Ok(Some(presence)),
            _ => Ok(None),
        }
    }

    async fn filter_readable(&self, loaded: Vec<Presence>) -> PresenceResult<Vec<Presence>> {
        let mut readable = Vec::with_capacity(loaded.len());
        for presence in loaded {
            if self.auth.may_read_presence(&presence).await {
                readable.push(presence);
            }
        }
        Ok(readable)
    }

    fn cleanup_stream(&self, registration: StreamRegistration) {
        self.subscriber
            .off_channel(&registration.channel, registration.listener_id);
        for task in registration.tasks {
            task.abort();
        }
        registration.stream.close();
    }

    fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Destroying presence service");

        self.sync.destroy();

        let streams: Vec<StreamRegistration> = {
            let mut streams = self.streams.lock().unwrap();
            streams.drain().map(|(_, registration)| registration).collect()
        };
        for registration in streams {
            self.cleanup_stream(registration);
        }

        let watchers: Vec<JoinHandle<()>> = std::mem::take(&mut *self.watchers.lock().unwrap());
        for watcher in watchers {
            watcher.abort();
        }
    }
}

/// Keep a load error as-is when it is already a load failure, otherwise wrap
/// it so the caller sees one failure kind for the whole read path.
fn wrap_load(error: PresenceError) -> PresenceError {
    match error {
        PresenceError::LoadFailed { .. } => error,
        other => PresenceError::load_failed(other),
    }
}

/// Route channel notifications into a stream. Every payload is a session id;
/// a fresh point lookup decides between add and remove.
async fn notification_loop(
    inner: Arc<ServiceInner>,
    stream: Arc<PresenceStream>,
    mut subscription: Subscription,
    should_add: Arc<dyn Fn(&Presence) -> bool + Send + Sync>,
) {
    while let Some(event) = subscription.events.recv().await {
        match event {
            SubscriberEvent::Message { payload, .. } => {
                match inner.load_by_session_id(&payload).await {
                    Ok(Some(presence)) if should_add(&presence) => stream.add_presence(presence),
                    Ok(_) => stream.remove_presence(&payload),
                    // Background failure: the next reload repairs the mirror.
                    Err(e) => error!("Presence notification lookup failed: {}", e),
                }
            }
            SubscriberEvent::Active { .. } => stream.trigger_reload(),
            SubscriberEvent::Inactive { .. } => stream.flush(),
            SubscriberEvent::PatternMessage { .. } => {}
        }
    }
}

/// Mirror the command connection's lifecycle into a stream: a fresh
/// connection reloads, a lost one flushes.
async fn connection_watch_loop(
    mut events: broadcast::Receiver<ConnectionEvent>,
    stream: Arc<PresenceStream>,
) {
    loop {
        match events.recv().await {
            Ok(ConnectionEvent::Ready { .. }) => stream.trigger_reload(),
            Ok(ConnectionEvent::Closed) => stream.flush(),
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AuthEvent;
    use async_trait::async_trait;
    use serde_json::json;
    use shared::PresenceConfig;
    use std::sync::atomic::AtomicBool;

    struct StubAuth {
        session_id: Option<String>,
        user_id: Option<String>,
        active: AtomicBool,
        may_write: bool,
        may_read: bool,
        events: broadcast::Sender<AuthEvent>,
    }

    impl StubAuth {
        fn new(session_id: &str, user_id: &str) -> Arc<Self> {
            let (events, _) = broadcast::channel(4);
            Arc::new(Self {
                session_id: Some(session_id.to_string()),
                user_id: Some(user_id.to_string()),
                active: AtomicBool::new(true),
                may_write: true,
                may_read: true,
                events,
            })
        }
    }

    #[async_trait]
    impl PresenceAuth for StubAuth {
        fn active(&self) -> bool {
            self.active.load(Ordering::SeqCst)
        }
        fn session_id(&self) -> Option<String> {
            self.session_id.clone()
        }
        fn user_id(&self) -> Option<String> {
            self.user_id.clone()
        }
        async fn may_read_presence(&self, _presence: &Presence) -> bool {
            self.may_read
        }
        async fn may_write_presence(&self, _presence: &Presence) -> bool {
            self.may_write
        }
        fn subscribe(&self) -> broadcast::Receiver<AuthEvent> {
            self.events.subscribe()
        }
    }

    fn service_with_auth(auth: Arc<dyn PresenceAuth>, size_limit: usize) -> PresenceService {
        // Client construction is lazy: nothing connects in these tests.
        let client = redis::Client::open("redis://127.0.0.1:6379").unwrap();
        let manager = Arc::new(RedisConnectionManager::new(client.clone(), 1000));
        let store = Arc::new(PresenceStore::new(Arc::clone(&manager)));
        let subscriber = RedisSubscriber::spawn(client);
        let config = PresenceConfig {
            ttl_seconds: 60,
            size_limit,
            pruning_interval_ms: 1000,
        };
        PresenceService::new(auth, store, manager, subscriber, &config)
    }

    fn sample_presence() -> Presence {
        Presence {
            session_id: "s1".to_string(),
            user_id: "u1".to_string(),
            location_id: "L".to_string(),
            data: json!({"k": "v"}),
            last_modified: 0,
        }
    }

    #[tokio::test]
    async fn test_submit_rejects_invalid_entity() {
        let service = service_with_auth(StubAuth::new("s1", "u1"), 1024);
        let mut presence = sample_presence();
        presence.location_id = String::new();

        let error = service.submit_presence(presence).await.unwrap_err();
        assert!(matches!(error, PresenceError::InvalidEntity { .. }));
    }

    #[tokio::test]
    async fn test_submit_rejects_foreign_session() {
        let service = service_with_auth(StubAuth::new("other-session", "u1"), 1024);

        let error = service.submit_presence(sample_presence()).await.unwrap_err();
        assert!(matches!(error, PresenceError::PresenceMismatch));
    }

    #[tokio::test]
    async fn test_submit_rejects_foreign_user() {
        let service = service_with_auth(StubAuth::new("s1", "other-user"), 1024);

        let error = service.submit_presence(sample_presence()).await.unwrap_err();
        assert!(matches!(error, PresenceError::PresenceMismatch));
    }

    #[tokio::test]
    async fn test_submit_rejects_oversized_presence() {
        let service = service_with_auth(StubAuth::new("s1", "u1"), 3);

        let error = service.submit_presence(sample_presence()).await.unwrap_err();
        assert!(matches!(error, PresenceError::SizeLimitExceeded { .. }));
    }

    #[tokio::test]
    async fn test_submit_rejects_unauthorized_writer() {
        let (events, _) = broadcast::channel(4);
        let auth = Arc::new(StubAuth {
            session_id: Some("s1".to_string()),
            user_id: Some("u1".to_string()),
            active: AtomicBool::new(true),
            may_write: false,
            may_read: true,
            events,
        });
        let service = service_with_auth(auth, 1024);

        let error = service.submit_presence(sample_presence()).await.unwrap_err();
        assert!(matches!(error, PresenceError::NotAuthorized));
    }

    #[tokio::test]
    async fn test_operations_fail_after_destroy() {
        let service = service_with_auth(StubAuth::new("s1", "u1"), 1024);
        service.destroy();

        let error = service.submit_presence(sample_presence()).await.unwrap_err();
        assert!(matches!(error, PresenceError::Destroyed));

        let error = service.remove_presence().unwrap_err();
        assert!(matches!(error, PresenceError::Destroyed));

        let error = service
            .get_presence_by_session_id("s1")
            .await
            .unwrap_err();
        assert!(matches!(error, PresenceError::Destroyed));

        let error = service.stream_presence_by_user_id("u1").unwrap_err();
        assert!(matches!(error, PresenceError::Destroyed));
    }

    #[tokio::test]
    async fn test_queries_require_a_user() {
        let (events, _) = broadcast::channel(4);
        let auth = Arc::new(StubAuth {
            session_id: None,
            user_id: None,
            active: AtomicBool::new(false),
            may_write: true,
            may_read: true,
            events,
        });
        let service = service_with_auth(auth, 1024);

        let error = service.get_presence_by_user_id("u1").await.unwrap_err();
        assert!(matches!(error, PresenceError::NoUser));

        let error = service.submit_presence(sample_presence()).await.unwrap_err();
        assert!(matches!(error, PresenceError::NoUser));
    }

    #[tokio::test]
    async fn test_reads_surface_load_failures() {
        // No Redis connection is established in tests, so every read fails
        // with a load failure rather than a raw Redis error.
        let service = service_with_auth(StubAuth::new("s1", "u1"), 1024);

        let error = service
            .get_presence_by_session_id("s1")
            .await
            .unwrap_err();
        assert!(matches!(error, PresenceError::LoadFailed { .. }));
    }

    #[tokio::test]
    async fn test_auth_destroy_cascades() {
        let auth = StubAuth::new("s1", "u1");
        let service = service_with_auth(auth.clone(), 1024);
        assert!(!service.destroyed());

        let _ = auth.events.send(AuthEvent::Destroy);
        // Let the watcher task observe the event.
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert!(service.destroyed());
    }

    #[tokio::test]
    async fn test_destroy_is_idempotent() {
        let service = service_with_auth(StubAuth::new("s1", "u1"), 1024);
        service.destroy();
        service.destroy();
        assert!(service.destroyed());
    }
}
