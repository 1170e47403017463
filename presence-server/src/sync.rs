//! Reconciliation of the locally-intended presence with Redis.
//!
//! The engine holds the last submitted presence for the locally-attached
//! session and keeps the Redis record aligned with it: coalescing bursts of
//! submissions into single writes, refreshing the TTL while nothing changes,
//! and retrying with jitter when a write fails. All state lives in one actor
//! task, so the reconcile step never races with a trigger.

use shared::{now_millis, retry_delay, Presence, PresenceError};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::redis::store::SyncStore;

/// Latched sync-state notifications plus background failures.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// The stored record agrees with the local intent.
    InSync,
    /// The local intent diverged and reconciliation is under way.
    OutOfSync,
    /// A reconcile attempt failed; a retry is scheduled.
    Error(String),
}

enum SyncCommand {
    Submit(Presence),
    Remove,
    Refresh,
    Destroy,
}

/// Handle to the per-service reconciliation actor.
pub struct PresenceSyncEngine {
    commands: mpsc::UnboundedSender<SyncCommand>,
    events: broadcast::Sender<SyncEvent>,
}

impl PresenceSyncEngine {
    /// Spawn the reconciliation actor against the given store.
    pub fn spawn(store: Arc<dyn SyncStore>, ttl_seconds: u64) -> Self {
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(64);

        let actor = SyncActor {
            store,
            ttl_seconds,
            commands_rx,
            events: events.clone(),
            intended: None,
            should_store: false,
            modified: false,
            in_sync: true,
            destroyed: false,
        };
        tokio::spawn(actor.run());

        Self { commands, events }
    }

    /// Subscribe to sync-state notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    /// Replace the intended presence; stamps a fresh `lastModified`.
    pub fn submit(&self, presence: Presence) {
        let _ = self.commands.send(SyncCommand::Submit(presence));
    }

    /// Drop the intent to exist in Redis.
    pub fn remove(&self) {
        let _ = self.commands.send(SyncCommand::Remove);
    }

    /// Rewrite the record, e.g. because the connection id changed.
    pub fn refresh(&self) {
        let _ = self.commands.send(SyncCommand::Refresh);
    }

    /// Scrub the record and stop the actor.
    pub fn destroy(&self) {
        let _ = self.commands.send(SyncCommand::Destroy);
    }
}

struct SyncActor {
    store: Arc<dyn SyncStore>,
    ttl_seconds: u64,
    commands_rx: mpsc::UnboundedReceiver<SyncCommand>,
    events: broadcast::Sender<SyncEvent>,

    /// The last submitted presence, kept as the reconcile target.
    intended: Option<Presence>,
    /// Whether the current intent is to exist in Redis.
    should_store: bool,
    /// Whether intent diverged from what has been written.
    modified: bool,
    /// Latch for InSync/OutOfSync notifications.
    in_sync: bool,
    destroyed: bool,
}

impl SyncActor {
    async fn run(mut self) {
        // None means idle: nothing to reconcile until the next command.
        let mut next_run: Option<Instant> = None;

        loop {
            tokio::select! {
                biased;
                cmd = self.commands_rx.recv() => {
                    match cmd {
                        Some(cmd) => {
                            self.apply(cmd);
                            if self.modified {
                                next_run = Some(Instant::now());
                            }
                        }
                        // All handles dropped: scrub once, best effort, and
                        // stop.
                        None => {
                            self.apply(SyncCommand::Destroy);
                            if self.modified {
                                let _ = self.update_redis().await;
                            }
                            debug!("Presence sync engine stopped");
                            return;
                        }
                    }
                }
                _ = sleep_until(next_run), if next_run.is_some() => {
                    next_run = self.update_redis().await;
                }
            }

            if self.destroyed && !self.modified {
                debug!("Presence sync engine stopped");
                return;
            }
        }
    }

    fn apply(&mut self, cmd: SyncCommand) {
        match cmd {
            SyncCommand::Submit(mut presence) => {
                if self.destroyed {
                    return;
                }
                presence.last_modified = now_millis();
                self.intended = Some(presence);
                self.should_store = true;
                self.modified = true;
            }
            SyncCommand::Remove => {
                if self.intended.is_some() {
                    self.should_store = false;
                    self.modified = true;
                }
            }
            SyncCommand::Refresh => {
                if self.intended.is_some() {
                    self.modified = true;
                }
            }
            SyncCommand::Destroy => {
                self.destroyed = true;
                if self.intended.is_some() && self.should_store {
                    self.should_store = false;
                    self.modified = true;
                }
            }
        }
    }

    /// One reconciliation step. Returns the next scheduled run, or None when
    /// there is nothing left to do.
    async fn update_redis(&mut self) -> Option<Instant> {
        let Some(presence) = self.intended.clone() else {
            return None;
        };

        let was_modified = self.modified;
        self.modified = false;
        if was_modified && self.in_sync {
            self.in_sync = false;
            let _ = self.events.send(SyncEvent::OutOfSync);
        }

        let result = if self.should_store {
            self.store
                .update(&presence, self.ttl_seconds, was_modified)
                .await
        } else if was_modified {
            self.store.delete(&presence.session_id).await
        } else {
            Ok(())
        };

        // Commands that arrived while the store call was in flight must be
        // folded in before deciding whether we are in sync.
        while let Ok(cmd) = self.commands_rx.try_recv() {
            self.apply(cmd);
        }

        match result {
            Ok(()) => {
                if self.modified {
                    return Some(Instant::now());
                }
                if !self.in_sync {
                    self.in_sync = true;
                    let _ = self.events.send(SyncEvent::InSync);
                }
                if self.should_store {
                    // Refresh the TTL one second before it would expire.
                    let refresh = Duration::from_secs(self.ttl_seconds.saturating_sub(1).max(1));
                    Some(Instant::now() + refresh)
                } else {
                    None
                }
            }
            Err(e) => {
                // Restore the consumed flag; a failed pure refresh must not
                // turn into a modified write. Commands folded in above keep
                // any modification they brought.
                self.modified = self.modified || was_modified;
                let error = match e {
                    PresenceError::SyncFailed { .. } => e,
                    other => PresenceError::sync_failed(other),
                };
                warn!("Presence sync failed: {}", error);
                let _ = self.events.send(SyncEvent::Error(error.to_string()));
                if self.destroyed {
                    // Best effort only; the janitor will scrub what is left.
                    self.modified = false;
                    return None;
                }
                Some(Instant::now() + retry_delay())
            }
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq)]
    enum StoreCall {
        Update { modified: bool },
        Delete,
    }

    #[derive(Default)]
    struct RecordingStore {
        calls: Mutex<Vec<StoreCall>>,
        fail_next: AtomicBool,
    }

    #[async_trait]
    impl SyncStore for RecordingStore {
        async fn update(
            &self,
            _presence: &Presence,
            _ttl: u64,
            modified: bool,
        ) -> shared::PresenceResult<()> {
            self.calls
                .lock()
                .unwrap()
                .push(StoreCall::Update { modified });
            if self.fail_next.swap(false, Ordering::SeqCst) {
                return Err(PresenceError::sync_failed("connectionId mismatch"));
            }
            Ok(())
        }

        async fn delete(&self, _session_id: &str) -> shared::PresenceResult<()> {
            self.calls.lock().unwrap().push(StoreCall::Delete);
            if self.fail_next.swap(false, Ordering::SeqCst) {
                return Err(PresenceError::sync_failed("gone"));
            }
            Ok(())
        }
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

    async fn drain_settle() {
        // Give the actor a few scheduler turns to run its immediate work.
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_submit_writes_and_reaches_in_sync() {
        let store = Arc::new(RecordingStore::default());
        let engine = PresenceSyncEngine::spawn(store.clone(), 60);
        let mut events = engine.subscribe();

        engine.submit(sample_presence());
        drain_settle().await;

        let calls = store.calls.lock().unwrap().clone();
        assert_eq!(calls, vec![StoreCall::Update { modified: true }]);

        assert!(matches!(events.try_recv(), Ok(SyncEvent::OutOfSync)));
        assert!(matches!(events.try_recv(), Ok(SyncEvent::InSync)));
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_coalesced_submissions_single_transition_pair() {
        let store = Arc::new(RecordingStore::default());
        let engine = PresenceSyncEngine::spawn(store.clone(), 60);
        let mut events = engine.subscribe();

        engine.submit(sample_presence());
        engine.submit(sample_presence());
        drain_settle().await;

        // Both submissions land before the first reconcile runs, so a single
        // write suffices and only one transition pair is emitted.
        let calls = store.calls.lock().unwrap().clone();
        assert_eq!(calls, vec![StoreCall::Update { modified: true }]);

        assert!(matches!(events.try_recv(), Ok(SyncEvent::OutOfSync)));
        assert!(matches!(events.try_recv(), Ok(SyncEvent::InSync)));
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_remove_without_submit_is_a_no_op() {
        let store = Arc::new(RecordingStore::default());
        let engine = PresenceSyncEngine::spawn(store.clone(), 60);

        engine.remove();
        drain_settle().await;

        assert!(store.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_remove_after_submit_deletes_once() {
        let store = Arc::new(RecordingStore::default());
        let engine = PresenceSyncEngine::spawn(store.clone(), 60);

        engine.submit(sample_presence());
        drain_settle().await;
        engine.remove();
        engine.remove();
        drain_settle().await;

        let calls = store.calls.lock().unwrap().clone();
        assert_eq!(
            calls,
            vec![StoreCall::Update { modified: true }, StoreCall::Delete]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_restores_modified_and_retries() {
        let store = Arc::new(RecordingStore::default());
        store.fail_next.store(true, Ordering::SeqCst);
        let engine = PresenceSyncEngine::spawn(store.clone(), 60);
        let mut events = engine.subscribe();

        engine.submit(sample_presence());
        drain_settle().await;

        assert!(matches!(events.try_recv(), Ok(SyncEvent::OutOfSync)));
        assert!(matches!(events.try_recv(), Ok(SyncEvent::Error(_))));
        // InSync must not fire before the retry succeeds.
        assert!(events.try_recv().is_err());

        // The retry is scheduled 1-10 s out.
        tokio::time::advance(Duration::from_secs(11)).await;
        drain_settle().await;

        let calls = store.calls.lock().unwrap().clone();
        assert_eq!(
            calls,
            vec![
                StoreCall::Update { modified: true },
                StoreCall::Update { modified: true },
            ]
        );
        assert!(matches!(events.try_recv(), Ok(SyncEvent::InSync)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_refresh_does_not_become_a_modified_write() {
        let store = Arc::new(RecordingStore::default());
        let engine = PresenceSyncEngine::spawn(store.clone(), 60);
        let mut events = engine.subscribe();

        engine.submit(sample_presence());
        drain_settle().await;
        assert!(matches!(events.try_recv(), Ok(SyncEvent::OutOfSync)));
        assert!(matches!(events.try_recv(), Ok(SyncEvent::InSync)));

        // Fail the next pure TTL refresh.
        store.fail_next.store(true, Ordering::SeqCst);
        tokio::time::advance(Duration::from_secs(60)).await;
        drain_settle().await;

        // The refresh carried no modification, so none may be latched in:
        // an error is reported but no OutOfSync fires.
        assert!(matches!(events.try_recv(), Ok(SyncEvent::Error(_))));
        assert!(events.try_recv().is_err());

        // The retry is again a plain refresh, not a modified write, and it
        // completes without a spurious transition pair.
        tokio::time::advance(Duration::from_secs(11)).await;
        drain_settle().await;

        let calls = store.calls.lock().unwrap().clone();
        assert_eq!(
            calls,
            vec![
                StoreCall::Update { modified: true },
                StoreCall::Update { modified: false },
                StoreCall::Update { modified: false },
            ]
        );
        assert!(events.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_refresh_is_unmodified_write() {
        let store = Arc::new(RecordingStore::default());
        let engine = PresenceSyncEngine::spawn(store.clone(), 60);

        engine.submit(sample_presence());
        drain_settle().await;

        tokio::time::advance(Duration::from_secs(60)).await;
        drain_settle().await;

        let calls = store.calls.lock().unwrap().clone();
        assert_eq!(
            calls,
            vec![
                StoreCall::Update { modified: true },
                StoreCall::Update { modified: false },
            ]
        );
    }

    #[tokio::test]
    async fn test_destroy_scrubs_presence() {
        let store = Arc::new(RecordingStore::default());
        let engine = PresenceSyncEngine::spawn(store.clone(), 60);

        engine.submit(sample_presence());
        drain_settle().await;
        engine.destroy();
        drain_settle().await;

        let calls = store.calls.lock().unwrap().clone();
        assert_eq!(
            calls,
            vec![StoreCall::Update { modified: true }, StoreCall::Delete]
        );
    }
}
