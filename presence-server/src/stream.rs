//! Incremental presence streams.
//!
//! A stream mirrors one presence set (by session, user or location) for a
//! subscriber, emitting batched add/remove messages. Live pub/sub
//! notifications drive the API path; a periodic reload repairs anything the
//! pub/sub path missed. Reload results never override an update the API path
//! applied less than a second earlier, because the live path is authoritative
//! and the reload may read slightly stale state.

use futures_util::future::BoxFuture;
use serde::ser::{Serialize, SerializeSeq, Serializer};
use shared::{Constants, Presence, PresenceError, PresenceResult};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;
use tracing::{debug, error};

const RELOAD_GUARD: Duration = Duration::from_millis(Constants::RELOAD_GUARD_MS);

/// One batched stream message.
///
/// On the wire these serialize as `[true, presence, …]` for additions and
/// `[false, sessionId, …]` for removals.
#[derive(Debug, Clone, PartialEq)]
pub enum PresenceStreamMessage {
    Added(Vec<Presence>),
    Removed(Vec<String>),
}

impl Serialize for PresenceStreamMessage {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Added(presences) => {
                let mut seq = serializer.serialize_seq(Some(presences.len() + 1))?;
                seq.serialize_element(&true)?;
                for presence in presences {
                    seq.serialize_element(presence)?;
                }
                seq.end()
            }
            Self::Removed(session_ids) => {
                let mut seq = serializer.serialize_seq(Some(session_ids.len() + 1))?;
                seq.serialize_element(&false)?;
                for session_id in session_ids {
                    seq.serialize_element(session_id)?;
                }
                seq.end()
            }
        }
    }
}

/// Snapshot loader invoked on every polling tick and on demand.
pub type LoadPresence =
    Arc<dyn Fn() -> BoxFuture<'static, PresenceResult<Vec<Presence>>> + Send + Sync>;

struct StreamEntry {
    /// When the API path last touched this session, if ever.
    api_last_updated: Option<Instant>,
    /// Reload generation that last reported this session.
    load_generation: u64,
    /// None after an API-path removal, until the reload drops the entry.
    presence: Option<Presence>,
}

#[derive(Default)]
struct StreamState {
    entries: HashMap<String, StreamEntry>,
    generation: u64,
}

/// Producer half of a presence stream, owned by the service. Consumers only
/// ever hold the [`mpsc::UnboundedReceiver`], so nothing outside the service
/// can write into the stream.
pub struct PresenceStream {
    state: Arc<Mutex<StreamState>>,
    sender: mpsc::UnboundedSender<PresenceStreamMessage>,
    reload_now: Arc<Notify>,
    polling: tokio::task::JoinHandle<()>,
}

impl PresenceStream {
    /// Create a stream and its consumer half. `polling_interval_seconds`
    /// must be at least 10 whole seconds.
    pub fn new(
        load_presence: LoadPresence,
        polling_interval_seconds: u64,
    ) -> PresenceResult<(Self, mpsc::UnboundedReceiver<PresenceStreamMessage>)> {
        if polling_interval_seconds < Constants::MIN_POLLING_INTERVAL_SECONDS {
            return Err(PresenceError::invalid_entity(&format!(
                "pollingInterval must be at least {} seconds",
                Constants::MIN_POLLING_INTERVAL_SECONDS
            )));
        }

        let state = Arc::new(Mutex::new(StreamState::default()));
        let (sender, receiver) = mpsc::unbounded_channel();
        let reload_now = Arc::new(Notify::new());

        let polling = tokio::spawn(polling_loop(
            Arc::clone(&state),
            sender.clone(),
            Arc::clone(&reload_now),
            load_presence,
            Duration::from_secs(polling_interval_seconds),
        ));

        Ok((
            Self {
                state,
                sender,
                reload_now,
                polling,
            },
            receiver,
        ))
    }

    /// API path: a live notification reported this presence as relevant.
    pub fn add_presence(&self, presence: Presence) {
        let now = Instant::now();
        let mut state = self.state.lock().unwrap();
        let generation = state.generation;
        match state.entries.entry(presence.session_id.clone()) {
            Entry::Vacant(vacant) => {
                vacant.insert(StreamEntry {
                    api_last_updated: Some(now),
                    load_generation: generation,
                    presence: Some(presence.clone()),
                });
                let _ = self.sender.send(PresenceStreamMessage::Added(vec![presence]));
            }
            Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                entry.api_last_updated = Some(now);
                let newer = match &entry.presence {
                    None => true,
                    Some(stored) => stored.last_modified < presence.last_modified,
                };
                if newer {
                    entry.presence = Some(presence.clone());
                    let _ = self.sender.send(PresenceStreamMessage::Added(vec![presence]));
                }
            }
        }
    }

    /// API path: a live notification reported this session as gone.
    pub fn remove_presence(&self, session_id: &str) {
        let mut state = self.state.lock().unwrap();
        if let Some(entry) = state.entries.get_mut(session_id) {
            if entry.presence.is_some() {
                entry.presence = None;
                entry.api_last_updated = Some(Instant::now());
                let _ = self
                    .sender
                    .send(PresenceStreamMessage::Removed(vec![session_id.to_string()]));
            }
        }
    }

    /// Drop everything, emitting removals for sessions that were present.
    /// Used when the notification source goes away.
    pub fn flush(&self) {
        let mut state = self.state.lock().unwrap();
        let removed: Vec<String> = state
            .entries
            .iter()
            .filter(|(_, entry)| entry.presence.is_some())
            .map(|(session_id, _)| session_id.clone())
            .collect();
        state.entries.clear();
        if !removed.is_empty() {
            let _ = self.sender.send(PresenceStreamMessage::Removed(removed));
        }
    }

    /// Request an immediate reload outside the polling cadence.
    pub fn trigger_reload(&self) {
        self.reload_now.notify_one();
    }

    /// Stop polling and close the consumer half once every producer clone of
    /// the sender is dropped.
    pub fn close(&self) {
        self.polling.abort();
    }
}

impl Drop for PresenceStream {
    fn drop(&mut self) {
        self.polling.abort();
    }
}

async fn polling_loop(
    state: Arc<Mutex<StreamState>>,
    sender: mpsc::UnboundedSender<PresenceStreamMessage>,
    reload_now: Arc<Notify>,
    load_presence: LoadPresence,
    interval: Duration,
) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = reload_now.notified() => {}
        }

        match load_presence().await {
            Ok(loaded) => apply_reload(&state, &sender, loaded),
            // Background failure: keep the current mirror and retry on the
            // next tick.
            Err(e) => error!("Presence reload failed: {}", e),
        }
    }
}

/// Merge one reload snapshot into the stream state.
fn apply_reload(
    state: &Mutex<StreamState>,
    sender: &mpsc::UnboundedSender<PresenceStreamMessage>,
    loaded: Vec<Presence>,
) {
    let now = Instant::now();
    let mut state = state.lock().unwrap();
    state.generation += 1;
    let generation = state.generation;

    let mut added = Vec::new();
    for presence in loaded {
        match state.entries.entry(presence.session_id.clone()) {
            Entry::Vacant(vacant) => {
                vacant.insert(StreamEntry {
                    api_last_updated: None,
                    load_generation: generation,
                    presence: Some(presence.clone()),
                });
                added.push(presence);
            }
            Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                entry.load_generation = generation;
                if !api_guard_passed(entry, now) {
                    continue;
                }
                let newer = match &entry.presence {
                    None => true,
                    Some(stored) => stored.last_modified < presence.last_modified,
                };
                if newer {
                    entry.presence = Some(presence.clone());
                    added.push(presence);
                }
            }
        }
    }

    let mut removed = Vec::new();
    state.entries.retain(|session_id, entry| {
        if entry.load_generation == generation || !api_guard_passed(entry, now) {
            return true;
        }
        if entry.presence.is_some() {
            removed.push(session_id.clone());
        }
        false
    });

    if !added.is_empty() {
        debug!(count = added.len(), "Presence reload added entries");
        let _ = sender.send(PresenceStreamMessage::Added(added));
    }
    if !removed.is_empty() {
        debug!(count = removed.len(), "Presence reload removed entries");
        let _ = sender.send(PresenceStreamMessage::Removed(removed));
    }
}

/// The reload may only touch entries whose last API update is at least the
/// guard interval old.
fn api_guard_passed(entry: &StreamEntry, now: Instant) -> bool {
    match entry.api_last_updated {
        None => true,
        Some(at) => at + RELOAD_GUARD <= now,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn presence(session_id: &str, last_modified: i64) -> Presence {
        Presence {
            session_id: session_id.to_string(),
            user_id: "u1".to_string(),
            location_id: "L".to_string(),
            data: json!(null),
            last_modified,
        }
    }

    fn new_stream() -> (
        PresenceStream,
        mpsc::UnboundedReceiver<PresenceStreamMessage>,
    ) {
        let loader: LoadPresence = Arc::new(|| Box::pin(async { Ok(Vec::new()) }));
        PresenceStream::new(loader, 10).unwrap()
    }

    #[tokio::test]
    async fn test_polling_interval_bounds() {
        let loader: LoadPresence = Arc::new(|| Box::pin(async { Ok(Vec::new()) }));
        assert!(PresenceStream::new(Arc::clone(&loader), 9).is_err());
        assert!(PresenceStream::new(loader, 10).is_ok());
    }

    #[tokio::test]
    async fn test_api_add_and_remove() {
        let (stream, mut rx) = new_stream();

        stream.add_presence(presence("s1", 1));
        assert_eq!(
            rx.try_recv().unwrap(),
            PresenceStreamMessage::Added(vec![presence("s1", 1)])
        );

        // Same timestamp: no message.
        stream.add_presence(presence("s1", 1));
        assert!(rx.try_recv().is_err());

        // Newer timestamp: replaced.
        stream.add_presence(presence("s1", 2));
        assert_eq!(
            rx.try_recv().unwrap(),
            PresenceStreamMessage::Added(vec![presence("s1", 2)])
        );

        stream.remove_presence("s1");
        assert_eq!(
            rx.try_recv().unwrap(),
            PresenceStreamMessage::Removed(vec!["s1".to_string()])
        );

        // Removing again is a no-op.
        stream.remove_presence("s1");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reload_within_guard_does_not_override() {
        let (stream, mut rx) = new_stream();

        stream.add_presence(presence("s1", 100));
        rx.try_recv().unwrap();

        // 500 ms later a reload reports a newer timestamp; the live update
        // is still authoritative.
        tokio::time::advance(Duration::from_millis(500)).await;
        apply_reload(&stream.state, &stream.sender, vec![presence("s1", 101)]);
        assert!(rx.try_recv().is_err());

        // Past the guard the reload wins.
        tokio::time::advance(Duration::from_millis(1000)).await;
        apply_reload(&stream.state, &stream.sender, vec![presence("s1", 102)]);
        assert_eq!(
            rx.try_recv().unwrap(),
            PresenceStreamMessage::Added(vec![presence("s1", 102)])
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_reload_drops_stale_entries() {
        let (stream, mut rx) = new_stream();

        apply_reload(
            &stream.state,
            &stream.sender,
            vec![presence("s1", 1), presence("s2", 1)],
        );
        assert_eq!(
            rx.try_recv().unwrap(),
            PresenceStreamMessage::Added(vec![presence("s1", 1), presence("s2", 1)])
        );

        // s2 vanished from the snapshot.
        apply_reload(&stream.state, &stream.sender, vec![presence("s1", 1)]);
        assert_eq!(
            rx.try_recv().unwrap(),
            PresenceStreamMessage::Removed(vec!["s2".to_string()])
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_reload_keeps_recent_api_entries() {
        let (stream, mut rx) = new_stream();

        stream.add_presence(presence("s1", 1));
        rx.try_recv().unwrap();

        // An empty reload right after the API add must not drop the entry.
        apply_reload(&stream.state, &stream.sender, Vec::new());
        assert!(rx.try_recv().is_err());

        // After the guard has passed the reload is allowed to drop it.
        tokio::time::advance(Duration::from_millis(1500)).await;
        apply_reload(&stream.state, &stream.sender, Vec::new());
        assert_eq!(
            rx.try_recv().unwrap(),
            PresenceStreamMessage::Removed(vec!["s1".to_string()])
        );
    }

    #[tokio::test]
    async fn test_matching_reload_emits_nothing() {
        let (stream, mut rx) = new_stream();

        apply_reload(&stream.state, &stream.sender, vec![presence("s1", 5)]);
        rx.try_recv().unwrap();

        apply_reload(&stream.state, &stream.sender, vec![presence("s1", 5)]);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_flush_emits_removals_and_resets() {
        let (stream, mut rx) = new_stream();

        stream.add_presence(presence("s1", 1));
        stream.add_presence(presence("s2", 1));
        rx.try_recv().unwrap();
        rx.try_recv().unwrap();

        stream.flush();
        let message = rx.try_recv().unwrap();
        match message {
            PresenceStreamMessage::Removed(mut session_ids) => {
                session_ids.sort();
                assert_eq!(session_ids, vec!["s1".to_string(), "s2".to_string()]);
            }
            other => panic!("expected removals, got {:?}", other),
        }

        // Empty flush emits nothing.
        stream.flush();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_wire_shape() {
        let added = PresenceStreamMessage::Added(vec![presence("s1", 7)]);
        let encoded = serde_json::to_value(&added).unwrap();
        assert_eq!(encoded[0], json!(true));
        assert_eq!(encoded[1]["sessionId"], json!("s1"));
        assert_eq!(encoded[1]["lastModified"], json!(7));

        let removed = PresenceStreamMessage::Removed(vec!["s1".to_string(), "s2".to_string()]);
        let encoded = serde_json::to_value(&removed).unwrap();
        assert_eq!(encoded, json!([false, "s1", "s2"]));
    }
}
