//! Command-connection lifecycle and the presence janitor.
//!
//! One manager exists per Redis command client. It keeps track of the
//! connection id Redis assigned to the client, registers that id in the
//! global `connections` hash guarded by a random lock token, and periodically
//! prunes presence left behind by connections that no longer appear in
//! `CLIENT LIST`.

use ::redis::aio::MultiplexedConnection;
use ::redis::{AsyncCommands, RedisError, RedisResult};
use shared::{generate_lock_token, RedisKeys};
use std::collections::HashMap;
use std::sync::{LazyLock, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::redis::store::run_presence_delete_by_connection_id;

static CLIENT_ID_RE: LazyLock<regex::Regex> =
    LazyLock::new(|| regex::Regex::new(r"(?:^| )id=(\d+)(?: |$)").expect("valid regex"));

/// Connection lifecycle notifications delivered to local listeners.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    /// The command connection is established and registered under this id.
    Ready { connection_id: u64 },
    /// The command connection was lost.
    Closed,
}

#[derive(Default)]
struct ConnState {
    conn: Option<MultiplexedConnection>,
    connection_id: Option<u64>,
}

/// Manager for the shared Redis command connection.
///
/// Construct exactly one per Redis client and share it via `Arc`; spawn
/// [`RedisConnectionManager::run`] once at bootstrap.
pub struct RedisConnectionManager {
    client: redis::Client,
    state: Mutex<ConnState>,
    events: broadcast::Sender<ConnectionEvent>,
    pruning_interval: Duration,
}

impl RedisConnectionManager {
    pub fn new(client: redis::Client, pruning_interval_ms: u64) -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            client,
            state: Mutex::new(ConnState::default()),
            events,
            pruning_interval: Duration::from_millis(pruning_interval_ms),
        }
    }

    /// Subscribe to connection lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    /// The current command connection and its Redis connection id, if any.
    pub fn connection(&self) -> Option<(MultiplexedConnection, u64)> {
        let state = self.state.lock().unwrap();
        match (&state.conn, state.connection_id) {
            (Some(conn), Some(id)) => Some((conn.clone(), id)),
            _ => None,
        }
    }

    /// The current Redis connection id, if connected.
    pub fn connection_id(&self) -> Option<u64> {
        self.state.lock().unwrap().connection_id
    }

    /// Drive the connection: connect, register, prune, reconnect. Never
    /// returns; spawn it once.
    pub async fn run(&self) {
        loop {
            match self.connect_and_init().await {
                Ok((conn, connection_id)) => {
                    {
                        let mut state = self.state.lock().unwrap();
                        state.conn = Some(conn.clone());
                        state.connection_id = Some(connection_id);
                    }
                    info!(connection_id, "Redis command connection ready");
                    let _ = self.events.send(ConnectionEvent::Ready { connection_id });

                    if let Err(e) = self.pruning_loop(conn, connection_id).await {
                        warn!("Redis command connection lost: {}", e);
                    }

                    {
                        let mut state = self.state.lock().unwrap();
                        state.conn = None;
                        state.connection_id = None;
                    }
                    let _ = self.events.send(ConnectionEvent::Closed);
                }
                Err(e) => {
                    warn!("Failed to establish Redis command connection: {}", e);
                }
            }

            tokio::time::sleep(self.pruning_interval).await;
        }
    }

    /// Connect, obtain `CLIENT ID`, register the id under a fresh lock token
    /// and scrub any residue a previous incarnation of this id left behind.
    async fn connect_and_init(&self) -> RedisResult<(MultiplexedConnection, u64)> {
        let mut conn = self.client.get_multiplexed_tokio_connection().await?;

        let connection_id: u64 = redis::cmd("CLIENT").arg("ID").query_async(&mut conn).await?;
        let lock = generate_lock_token();
        let _: () = conn
            .hset(RedisKeys::connections(), connection_id, &lock)
            .await?;
        run_presence_delete_by_connection_id(&mut conn, connection_id, "0").await?;

        debug!(connection_id, "Registered Redis connection");
        Ok((conn, connection_id))
    }

    /// Tick the janitor until the connection dies. Returns the error that
    /// killed the connection.
    async fn pruning_loop(
        &self,
        mut conn: MultiplexedConnection,
        own_connection_id: u64,
    ) -> Result<(), RedisError> {
        let mut ticker = tokio::time::interval(self.pruning_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick of a tokio interval fires immediately.
        ticker.tick().await;

        loop {
            ticker.tick().await;

            // A newer generation owns the state; stop applying effects.
            if self.connection_id() != Some(own_connection_id) {
                return Ok(());
            }

            match self.prune_dangling(&mut conn).await {
                Ok(pruned) => {
                    if pruned > 0 {
                        info!(pruned, "Pruned presence of dead Redis connections");
                    }
                }
                Err(e) if is_disconnect(&e) => return Err(e),
                Err(e) => {
                    // Non-connection failures are surfaced but never stop the
                    // janitor; the next tick retries.
                    error!("Presence pruning failed: {}", e);
                }
            }
        }
    }

    /// Diff registered connection ids against `CLIENT LIST` and delete the
    /// presence of every id that is no longer alive.
    async fn prune_dangling(&self, conn: &mut MultiplexedConnection) -> RedisResult<usize> {
        let registered: HashMap<String, String> =
            conn.hgetall(RedisKeys::connections()).await?;
        if registered.is_empty() {
            return Ok(0);
        }

        let client_list: String = redis::cmd("CLIENT")
            .arg("LIST")
            .arg("TYPE")
            .arg("normal")
            .query_async(conn)
            .await?;
        let live = parse_client_list(&client_list);

        let mut pruned = 0;
        for (connection_id, lock) in registered {
            let Ok(connection_id) = connection_id.parse::<u64>() else {
                continue;
            };
            if live.contains(&connection_id) {
                continue;
            }
            let deleted =
                run_presence_delete_by_connection_id(conn, connection_id, &lock).await?;
            if deleted == 1 {
                debug!(connection_id, "Scrubbed presence of dead connection");
                pruned += 1;
            }
        }
        Ok(pruned)
    }
}

/// Extract the live connection ids from a `CLIENT LIST TYPE normal` reply,
/// applied line by line.
pub(crate) fn parse_client_list(reply: &str) -> Vec<u64> {
    reply
        .lines()
        .filter_map(|line| CLIENT_ID_RE.captures(line))
        .filter_map(|captures| captures[1].parse::<u64>().ok())
        .collect()
}

/// Whether a Redis error means the connection itself is gone, as opposed to
/// a command-level failure.
pub(crate) fn is_disconnect(error: &RedisError) -> bool {
    error.is_connection_dropped()
        || error.is_io_error()
        || error.is_connection_refusal()
        || error.is_timeout()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_client_list() {
        let reply = "id=3 addr=127.0.0.1:60302 fd=8 name= age=0 idle=0\n\
                     id=14 addr=127.0.0.1:60444 fd=9 name= age=5 idle=2\n";
        assert_eq!(parse_client_list(reply), vec![3, 14]);
    }

    #[test]
    fn test_parse_client_list_id_not_first_field() {
        let reply = "addr=127.0.0.1:60302 id=27 fd=8\n";
        assert_eq!(parse_client_list(reply), vec![27]);
    }

    #[test]
    fn test_parse_client_list_ignores_lookalikes() {
        // laddr and tot-net-id style fields must not match.
        let reply = "addr=1.2.3.4:1 laddr-id=9 fd=8\nid=abc addr=x\n";
        assert_eq!(parse_client_list(reply), Vec::<u64>::new());
    }

    #[test]
    fn test_parse_client_list_id_at_line_end() {
        let reply = "addr=127.0.0.1:60302 id=8";
        assert_eq!(parse_client_list(reply), vec![8]);
    }

    #[test]
    fn test_parse_client_list_empty() {
        assert_eq!(parse_client_list(""), Vec::<u64>::new());
    }
}
