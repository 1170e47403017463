//! Pub/sub multiplexer over a single subscription connection.
//!
//! Many local listeners share one Redis subscription client: the first
//! listener on a channel issues `SUBSCRIBE`, the last one removed issues
//! `UNSUBSCRIBE`, and the same holds for patterns. The multiplexer owns
//! resubscription after a reconnect so it can deliver accurate
//! active/inactive lifecycle events to every listener.

use ::redis::aio::PubSub;
use futures_util::StreamExt;
use shared::{PresenceError, PresenceResult};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Events delivered to a registered listener.
#[derive(Debug, Clone, PartialEq)]
pub enum SubscriberEvent {
    /// The subscription for this channel or pattern is confirmed.
    Active { name: String },
    /// The underlying subscription dropped; messages may be missed until the
    /// next `Active`.
    Inactive { name: String },
    /// A message published on a subscribed channel.
    Message { channel: String, payload: String },
    /// A message matched by a subscribed pattern.
    PatternMessage {
        pattern: String,
        channel: String,
        payload: String,
    },
}

/// A registered listener: keep the receiver, pass the id back to
/// [`RedisSubscriber::off_channel`] / [`RedisSubscriber::off_pattern`].
pub struct Subscription {
    pub id: u64,
    pub events: mpsc::UnboundedReceiver<SubscriberEvent>,
}

enum Command {
    AddChannel {
        channel: String,
        id: u64,
        sender: mpsc::UnboundedSender<SubscriberEvent>,
    },
    RemoveChannel {
        channel: String,
        id: u64,
    },
    AddPattern {
        pattern: String,
        id: u64,
        sender: mpsc::UnboundedSender<SubscriberEvent>,
    },
    RemovePattern {
        pattern: String,
        id: u64,
    },
}

#[derive(Default)]
struct ActiveState {
    channels: HashSet<String>,
    patterns: HashSet<String>,
}

/// Handle to the shared subscription connection. Create one per Redis
/// subscriber client via [`RedisSubscriber::spawn`].
pub struct RedisSubscriber {
    control: mpsc::UnboundedSender<Command>,
    active: Arc<Mutex<ActiveState>>,
    next_id: AtomicU64,
}

impl RedisSubscriber {
    /// Spawn the subscriber actor for the given client.
    pub fn spawn(client: redis::Client) -> Arc<Self> {
        let (control, control_rx) = mpsc::unbounded_channel();
        let active = Arc::new(Mutex::new(ActiveState::default()));

        let actor = SubscriberActor {
            client,
            control_rx,
            channels: HashMap::new(),
            patterns: HashMap::new(),
            active: Arc::clone(&active),
        };
        tokio::spawn(actor.run());

        Arc::new(Self {
            control,
            active,
            next_id: AtomicU64::new(1),
        })
    }

    /// Register a listener for a channel. The subscription is issued when
    /// this is the channel's first listener.
    pub fn on_channel(&self, channel: &str) -> PresenceResult<Subscription> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, events) = mpsc::unbounded_channel();
        self.control
            .send(Command::AddChannel {
                channel: channel.to_string(),
                id,
                sender,
            })
            .map_err(|_| PresenceError::websocket("Redis subscriber is gone"))?;
        Ok(Subscription { id, events })
    }

    /// Remove a channel listener. The last removed listener unsubscribes.
    pub fn off_channel(&self, channel: &str, id: u64) {
        let _ = self.control.send(Command::RemoveChannel {
            channel: channel.to_string(),
            id,
        });
    }

    /// Register a listener for a pattern.
    pub fn on_pattern(&self, pattern: &str) -> PresenceResult<Subscription> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, events) = mpsc::unbounded_channel();
        self.control
            .send(Command::AddPattern {
                pattern: pattern.to_string(),
                id,
                sender,
            })
            .map_err(|_| PresenceError::websocket("Redis subscriber is gone"))?;
        Ok(Subscription { id, events })
    }

    /// Remove a pattern listener.
    pub fn off_pattern(&self, pattern: &str, id: u64) {
        let _ = self.control.send(Command::RemovePattern {
            pattern: pattern.to_string(),
            id,
        });
    }

    /// Whether the channel subscription is currently confirmed.
    pub fn is_channel_active(&self, channel: &str) -> bool {
        self.active.lock().unwrap().channels.contains(channel)
    }

    /// Whether the pattern subscription is currently confirmed.
    pub fn is_pattern_active(&self, pattern: &str) -> bool {
        self.active.lock().unwrap().patterns.contains(pattern)
    }
}

struct Listener {
    id: u64,
    sender: mpsc::UnboundedSender<SubscriberEvent>,
}

enum Step {
    Message(Option<redis::Msg>),
    Command(Option<Command>),
}

struct SubscriberActor {
    client: redis::Client,
    control_rx: mpsc::UnboundedReceiver<Command>,
    channels: HashMap<String, Vec<Listener>>,
    patterns: HashMap<String, Vec<Listener>>,
    active: Arc<Mutex<ActiveState>>,
}

impl SubscriberActor {
    async fn run(mut self) {
        loop {
            let mut pubsub = match self.client.get_async_connection().await {
                Ok(conn) => conn.into_pubsub(),
                Err(e) => {
                    warn!("Failed to establish Redis subscription connection: {}", e);
                    if self.wait_before_reconnect().await {
                        return;
                    }
                    continue;
                }
            };

            if let Err(e) = self.resubscribe_all(&mut pubsub).await {
                warn!("Failed to re-establish subscriptions: {}", e);
                self.mark_all_inactive();
                if self.wait_before_reconnect().await {
                    return;
                }
                continue;
            }

            loop {
                let step = {
                    let mut messages = pubsub.on_message();
                    tokio::select! {
                        msg = messages.next() => Step::Message(msg),
                        cmd = self.control_rx.recv() => Step::Command(cmd),
                    }
                };

                match step {
                    Step::Message(Some(msg)) => {
                        let (empty_channels, empty_patterns) = self.dispatch(msg);
                        let mut failed = false;
                        for channel in empty_channels {
                            failed |= pubsub.unsubscribe(&channel).await.is_err();
                        }
                        for pattern in empty_patterns {
                            failed |= pubsub.punsubscribe(&pattern).await.is_err();
                        }
                        if failed {
                            break;
                        }
                    }
                    Step::Message(None) => {
                        warn!("Redis subscription connection lost");
                        break;
                    }
                    Step::Command(Some(cmd)) => {
                        if let Err(e) = self.apply(&mut pubsub, cmd).await {
                            warn!("Subscription command failed: {}", e);
                            break;
                        }
                    }
                    Step::Command(None) => return,
                }
            }

            self.mark_all_inactive();
            if self.wait_before_reconnect().await {
                return;
            }
        }
    }

    /// Sleep before reconnecting while still accepting listener changes.
    /// Returns true when every handle is gone and the actor should stop.
    async fn wait_before_reconnect(&mut self) -> bool {
        let deadline = tokio::time::sleep(RECONNECT_DELAY);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = &mut deadline => return false,
                cmd = self.control_rx.recv() => match cmd {
                    Some(cmd) => self.apply_offline(cmd),
                    None => return true,
                },
            }
        }
    }

    /// Registry-only command application while disconnected; subscriptions
    /// are re-issued wholesale on reconnect.
    fn apply_offline(&mut self, cmd: Command) {
        match cmd {
            Command::AddChannel {
                channel,
                id,
                sender,
            } => {
                add_listener(&mut self.channels, &channel, id, sender);
            }
            Command::RemoveChannel { channel, id } => {
                remove_listener(&mut self.channels, &channel, id);
            }
            Command::AddPattern {
                pattern,
                id,
                sender,
            } => {
                add_listener(&mut self.patterns, &pattern, id, sender);
            }
            Command::RemovePattern { pattern, id } => {
                remove_listener(&mut self.patterns, &pattern, id);
            }
        }
    }

    async fn apply(&mut self, pubsub: &mut PubSub, cmd: Command) -> redis::RedisResult<()> {
        match cmd {
            Command::AddChannel {
                channel,
                id,
                sender,
            } => {
                let already_active = self.active.lock().unwrap().channels.contains(&channel);
                let first = add_listener(&mut self.channels, &channel, id, sender.clone());
                if first {
                    pubsub.subscribe(&channel).await?;
                    debug!(channel = %channel, "Subscribed");
                    self.activate_channel(&channel);
                } else if already_active {
                    let _ = sender.send(SubscriberEvent::Active { name: channel });
                }
            }
            Command::RemoveChannel { channel, id } => {
                if remove_listener(&mut self.channels, &channel, id) {
                    self.active.lock().unwrap().channels.remove(&channel);
                    pubsub.unsubscribe(&channel).await?;
                    debug!(channel = %channel, "Unsubscribed");
                }
            }
            Command::AddPattern {
                pattern,
                id,
                sender,
            } => {
                let already_active = self.active.lock().unwrap().patterns.contains(&pattern);
                let first = add_listener(&mut self.patterns, &pattern, id, sender.clone());
                if first {
                    pubsub.psubscribe(&pattern).await?;
                    debug!(pattern = %pattern, "Pattern subscribed");
                    self.activate_pattern(&pattern);
                } else if already_active {
                    let _ = sender.send(SubscriberEvent::Active { name: pattern });
                }
            }
            Command::RemovePattern { pattern, id } => {
                if remove_listener(&mut self.patterns, &pattern, id) {
                    self.active.lock().unwrap().patterns.remove(&pattern);
                    pubsub.punsubscribe(&pattern).await?;
                    debug!(pattern = %pattern, "Pattern unsubscribed");
                }
            }
        }
        Ok(())
    }

    /// Record a confirmed channel subscription and deliver `Active` to its
    /// listeners.
    fn activate_channel(&mut self, channel: &str) {
        self.active
            .lock()
            .unwrap()
            .channels
            .insert(channel.to_string());
        notify_all(&mut self.channels, channel, |name| SubscriberEvent::Active {
            name: name.to_string(),
        });
    }

    /// Record a confirmed pattern subscription and deliver `Active` to its
    /// listeners.
    fn activate_pattern(&mut self, pattern: &str) {
        self.active
            .lock()
            .unwrap()
            .patterns
            .insert(pattern.to_string());
        notify_all(&mut self.patterns, pattern, |name| SubscriberEvent::Active {
            name: name.to_string(),
        });
    }

    /// Issue every registered subscription on a fresh connection and deliver
    /// `Active` to every listener.
    async fn resubscribe_all(&mut self, pubsub: &mut PubSub) -> redis::RedisResult<()> {
        let channels: Vec<String> = self.channels.keys().cloned().collect();
        for channel in channels {
            pubsub.subscribe(&channel).await?;
            self.activate_channel(&channel);
        }
        let patterns: Vec<String> = self.patterns.keys().cloned().collect();
        for pattern in patterns {
            pubsub.psubscribe(&pattern).await?;
            self.activate_pattern(&pattern);
        }
        Ok(())
    }

    /// Deliver `Inactive` for every currently-active subscription.
    fn mark_all_inactive(&mut self) {
        let (channels, patterns) = {
            let mut active = self.active.lock().unwrap();
            (
                std::mem::take(&mut active.channels),
                std::mem::take(&mut active.patterns),
            )
        };
        for channel in channels {
            notify_all(&mut self.channels, &channel, |name| {
                SubscriberEvent::Inactive {
                    name: name.to_string(),
                }
            });
        }
        for pattern in patterns {
            notify_all(&mut self.patterns, &pattern, |name| {
                SubscriberEvent::Inactive {
                    name: name.to_string(),
                }
            });
        }
    }

    fn dispatch(&mut self, msg: redis::Msg) -> (Vec<String>, Vec<String>) {
        let channel = msg.get_channel_name().to_string();
        let payload: String = msg.get_payload().unwrap_or_default();
        let pattern = if msg.from_pattern() {
            msg.get_pattern::<String>().ok()
        } else {
            None
        };
        self.route(channel, pattern, payload)
    }

    /// Route one message to its channel or pattern listeners. Returns the
    /// channels and patterns whose listener lists became empty because every
    /// receiver was dropped.
    fn route(
        &mut self,
        channel: String,
        pattern: Option<String>,
        payload: String,
    ) -> (Vec<String>, Vec<String>) {
        let mut empty_channels = Vec::new();
        let mut empty_patterns = Vec::new();

        if let Some(pattern) = pattern {
            if let Some(listeners) = self.patterns.get_mut(&pattern) {
                listeners.retain(|listener| {
                    listener
                        .sender
                        .send(SubscriberEvent::PatternMessage {
                            pattern: pattern.clone(),
                            channel: channel.clone(),
                            payload: payload.clone(),
                        })
                        .is_ok()
                });
                if listeners.is_empty() {
                    self.patterns.remove(&pattern);
                    self.active.lock().unwrap().patterns.remove(&pattern);
                    empty_patterns.push(pattern);
                }
            }
        } else if let Some(listeners) = self.channels.get_mut(&channel) {
            listeners.retain(|listener| {
                listener
                    .sender
                    .send(SubscriberEvent::Message {
                        channel: channel.clone(),
                        payload: payload.clone(),
                    })
                    .is_ok()
            });
            if listeners.is_empty() {
                self.channels.remove(&channel);
                self.active.lock().unwrap().channels.remove(&channel);
                empty_channels.push(channel);
            }
        }

        (empty_channels, empty_patterns)
    }
}

/// Register one listener; returns true when it is the name's first, i.e.
/// the server-side subscription still has to be issued.
fn add_listener(
    registry: &mut HashMap<String, Vec<Listener>>,
    name: &str,
    id: u64,
    sender: mpsc::UnboundedSender<SubscriberEvent>,
) -> bool {
    let first = !registry.contains_key(name);
    registry
        .entry(name.to_string())
        .or_default()
        .push(Listener { id, sender });
    first
}

/// Remove one listener; returns true when the name has no listeners left and
/// the entry was dropped.
fn remove_listener(
    registry: &mut HashMap<String, Vec<Listener>>,
    name: &str,
    id: u64,
) -> bool {
    let Some(listeners) = registry.get_mut(name) else {
        return false;
    };
    listeners.retain(|listener| listener.id != id);
    if listeners.is_empty() {
        registry.remove(name);
        true
    } else {
        false
    }
}

fn notify_all<F>(registry: &mut HashMap<String, Vec<Listener>>, name: &str, event: F)
where
    F: Fn(&str) -> SubscriberEvent,
{
    if let Some(listeners) = registry.get_mut(name) {
        listeners.retain(|listener| listener.sender.send(event(name)).is_ok());
        if listeners.is_empty() {
            registry.remove(name);
        }
    }
}
