//! Scripted storage layer for presence records.
//!
//! Every state change runs as a single server-side Lua script so that index
//! updates and notifications cannot interleave with concurrent writers. The
//! notification channel for a key is the key itself and the published payload
//! is always the affected session id.

use ::redis::aio::MultiplexedConnection;
use ::redis::{RedisResult, Script, Value};
use async_trait::async_trait;
use shared::{Presence, PresenceError, PresenceResult, RedisKeys};
use std::sync::Arc;
use tracing::debug;

use crate::redis::connection::RedisConnectionManager;

// ---------------------------------------------------------------------------
// Lua script constants
// ---------------------------------------------------------------------------

/// Upsert one session's presence.
///
/// KEYS[1] = session hash, KEYS[2] = user set, KEYS[3] = location set,
/// KEYS[4] = connection set.
/// ARGV[1] = sessionId, ARGV[2] = userId, ARGV[3] = locationId,
/// ARGV[4] = data JSON, ARGV[5] = lastModified, ARGV[6] = connectionId,
/// ARGV[7] = ttl seconds, ARGV[8] = modified flag ('1' or '0').
///
/// With ARGV[8] == '0' the script refreshes TTLs only and short-circuits when
/// every key was still present. A stored connectionId belonging to another
/// connection fails the script.
const LUA_PRESENCE_UPDATE: &str = r#"
local ttl = tonumber(ARGV[7])

if ARGV[8] == '0' then
    local refreshed = redis.call('EXPIRE', KEYS[1], ttl)
        + redis.call('EXPIRE', KEYS[2], ttl)
        + redis.call('EXPIRE', KEYS[3], ttl)
    if refreshed == 3 then
        return 0
    end
end

local old = redis.call('HMGET', KEYS[1], 'userId', 'locationId', 'connectionId')
if old[3] and old[3] ~= ARGV[6] then
    return redis.error_reply('connectionId mismatch')
end

if old[1] and old[1] ~= ARGV[2] then
    local oldUserKey = 'presence:userId=' .. old[1]
    redis.call('SREM', oldUserKey, ARGV[1])
    redis.call('PUBLISH', oldUserKey, ARGV[1])
end
if old[2] and old[2] ~= ARGV[3] then
    local oldLocationKey = 'presence:locationId=' .. old[2]
    redis.call('SREM', oldLocationKey, ARGV[1])
    redis.call('PUBLISH', oldLocationKey, ARGV[1])
end

redis.call('HSET', KEYS[1],
    'userId', ARGV[2],
    'locationId', ARGV[3],
    'data', ARGV[4],
    'lastModified', ARGV[5],
    'connectionId', ARGV[6])
redis.call('EXPIRE', KEYS[1], ttl)
redis.call('PUBLISH', KEYS[1], ARGV[1])

redis.call('SADD', KEYS[2], ARGV[1])
redis.call('EXPIRE', KEYS[2], ttl)
redis.call('PUBLISH', KEYS[2], ARGV[1])

redis.call('SADD', KEYS[3], ARGV[1])
redis.call('EXPIRE', KEYS[3], ttl)
redis.call('PUBLISH', KEYS[3], ARGV[1])

redis.call('SADD', KEYS[4], ARGV[1])

return 1
"#;

/// Delete one session's presence and its index entries. Idempotent: a
/// missing session hash publishes nothing.
///
/// KEYS[1] = session hash. ARGV[1] = sessionId.
const LUA_PRESENCE_DELETE: &str = r#"
local old = redis.call('HMGET', KEYS[1], 'userId', 'locationId', 'connectionId')
if not (old[1] or old[2] or old[3]) then
    return 0
end

redis.call('DEL', KEYS[1])
redis.call('PUBLISH', KEYS[1], ARGV[1])

if old[1] then
    local userKey = 'presence:userId=' .. old[1]
    redis.call('SREM', userKey, ARGV[1])
    redis.call('PUBLISH', userKey, ARGV[1])
end
if old[2] then
    local locationKey = 'presence:locationId=' .. old[2]
    redis.call('SREM', locationKey, ARGV[1])
    redis.call('PUBLISH', locationKey, ARGV[1])
end
if old[3] then
    redis.call('SREM', 'presence:connectionId=' .. old[3], ARGV[1])
end

return 1
"#;

/// Delete every presence owned by one connection id.
///
/// KEYS[1] = connection set, KEYS[2] = connections hash.
/// ARGV[1] = connectionId, ARGV[2] = lock token, or '0' for an unlocked
/// self-scrub that leaves the connections hash alone.
///
/// With a lock supplied this is compare-and-delete: a token that does not
/// match the recorded one returns 0 without touching anything.
const LUA_PRESENCE_DELETE_BY_CONNECTION_ID: &str = r#"
if ARGV[2] ~= '0' then
    local lock = redis.call('HGET', KEYS[2], ARGV[1])
    if lock ~= ARGV[2] then
        return 0
    end
    redis.call('HDEL', KEYS[2], ARGV[1])
end

local sessionIds = redis.call('SMEMBERS', KEYS[1])
for _, sid in ipairs(sessionIds) do
    local sessionKey = 'presence:sessionId=' .. sid
    local old = redis.call('HMGET', sessionKey, 'userId', 'locationId')
    if old[1] or old[2] then
        redis.call('DEL', sessionKey)
        redis.call('PUBLISH', sessionKey, sid)
        if old[1] then
            local userKey = 'presence:userId=' .. old[1]
            redis.call('SREM', userKey, sid)
            redis.call('PUBLISH', userKey, sid)
        end
        if old[2] then
            local locationKey = 'presence:locationId=' .. old[2]
            redis.call('SREM', locationKey, sid)
            redis.call('PUBLISH', locationKey, sid)
        end
    end
end
redis.call('DEL', KEYS[1])

return 1
"#;

/// Read one session's presence tuple, or nil when any field is missing.
///
/// KEYS[1] = session hash. ARGV[1] = sessionId.
const LUA_PRESENCE_GET_BY_SESSION_ID: &str = r#"
local p = redis.call('HMGET', KEYS[1], 'userId', 'locationId', 'data', 'lastModified')
if not (p[1] and p[2] and p[3] and p[4]) then
    return false
end
return {ARGV[1], p[1], p[2], p[3], p[4]}
"#;

/// Read the presence tuples of every session in an index set, skipping
/// sessions whose hash has already expired.
///
/// KEYS[1] = index set (user or location).
const LUA_PRESENCE_GET_BY_INDEX: &str = r#"
local result = {}
for _, sid in ipairs(redis.call('SMEMBERS', KEYS[1])) do
    local p = redis.call('HMGET', 'presence:sessionId=' .. sid, 'userId', 'locationId', 'data', 'lastModified')
    if p[1] and p[2] and p[3] and p[4] then
        result[#result + 1] = {sid, p[1], p[2], p[3], p[4]}
    end
end
return result
"#;

// ---------------------------------------------------------------------------
// Low-level script runners
// ---------------------------------------------------------------------------

pub(crate) async fn run_presence_update(
    conn: &mut MultiplexedConnection,
    presence: &Presence,
    data: &str,
    connection_id: u64,
    ttl: u64,
    modified: bool,
) -> RedisResult<i64> {
    let script = Script::new(LUA_PRESENCE_UPDATE);
    script
        .key(RedisKeys::session(&presence.session_id))
        .key(RedisKeys::user(&presence.user_id))
        .key(RedisKeys::location(&presence.location_id))
        .key(RedisKeys::connection(connection_id))
        .arg(&presence.session_id)
        .arg(&presence.user_id)
        .arg(&presence.location_id)
        .arg(data)
        .arg(presence.last_modified)
        .arg(connection_id)
        .arg(ttl)
        .arg(if modified { "1" } else { "0" })
        .invoke_async(conn)
        .await
}

pub(crate) async fn run_presence_delete(
    conn: &mut MultiplexedConnection,
    session_id: &str,
) -> RedisResult<i64> {
    let script = Script::new(LUA_PRESENCE_DELETE);
    script
        .key(RedisKeys::session(session_id))
        .arg(session_id)
        .invoke_async(conn)
        .await
}

pub(crate) async fn run_presence_delete_by_connection_id(
    conn: &mut MultiplexedConnection,
    connection_id: u64,
    lock: &str,
) -> RedisResult<i64> {
    let script = Script::new(LUA_PRESENCE_DELETE_BY_CONNECTION_ID);
    script
        .key(RedisKeys::connection(connection_id))
        .key(RedisKeys::connections())
        .arg(connection_id)
        .arg(lock)
        .invoke_async(conn)
        .await
}

async fn run_presence_get_by_session_id(
    conn: &mut MultiplexedConnection,
    session_id: &str,
) -> RedisResult<Value> {
    let script = Script::new(LUA_PRESENCE_GET_BY_SESSION_ID);
    script
        .key(RedisKeys::session(session_id))
        .arg(session_id)
        .invoke_async(conn)
        .await
}

async fn run_presence_get_by_index(
    conn: &mut MultiplexedConnection,
    index_key: &str,
) -> RedisResult<Value> {
    let script = Script::new(LUA_PRESENCE_GET_BY_INDEX);
    script.key(index_key).invoke_async(conn).await
}

// ---------------------------------------------------------------------------
// Tuple decoding
// ---------------------------------------------------------------------------

fn decode_string(value: &Value, field: &str) -> PresenceResult<String> {
    match value {
        Value::Data(bytes) => String::from_utf8(bytes.clone()).map_err(|_| {
            PresenceError::invalid_presence(&format!("{} is not valid UTF-8", field))
        }),
        Value::Status(s) => Ok(s.clone()),
        _ => Err(PresenceError::invalid_presence(&format!(
            "{} is missing or not a string",
            field
        ))),
    }
}

/// Decode a single `[sessionId, userId, locationId, data, lastModified]`
/// tuple. `Nil` means the presence is gone.
pub(crate) fn decode_presence(value: &Value) -> PresenceResult<Option<Presence>> {
    let items = match value {
        Value::Nil => return Ok(None),
        Value::Bulk(items) => items,
        _ => {
            return Err(PresenceError::invalid_presence(
                "expected a presence tuple",
            ))
        }
    };
    if items.len() != 5 {
        return Err(PresenceError::invalid_presence(
            "presence tuple has the wrong arity",
        ));
    }

    let session_id = decode_string(&items[0], "sessionId")?;
    let user_id = decode_string(&items[1], "userId")?;
    let location_id = decode_string(&items[2], "locationId")?;
    let data = decode_string(&items[3], "data")?;
    let last_modified = decode_string(&items[4], "lastModified")?;

    let data = serde_json::from_str(&data)
        .map_err(|_| PresenceError::invalid_presence("data is not valid JSON"))?;
    let last_modified = last_modified
        .parse::<i64>()
        .map_err(|_| PresenceError::invalid_presence("lastModified is not an integer"))?;

    Ok(Some(Presence {
        session_id,
        user_id,
        location_id,
        data,
        last_modified,
    }))
}

/// Decode an array of presence tuples. Any invalid tuple fails the whole
/// query.
pub(crate) fn decode_presence_list(value: &Value) -> PresenceResult<Vec<Presence>> {
    let items = match value {
        Value::Nil => return Ok(Vec::new()),
        Value::Bulk(items) => items,
        _ => {
            return Err(PresenceError::invalid_presence(
                "expected a list of presence tuples",
            ))
        }
    };

    let mut result = Vec::with_capacity(items.len());
    for item in items {
        if let Some(presence) = decode_presence(item)? {
            result.push(presence);
        }
    }
    Ok(result)
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Write seam of the sync engine, split out so reconciliation logic can be
/// driven against a test double.
#[async_trait]
pub trait SyncStore: Send + Sync {
    async fn update(&self, presence: &Presence, ttl: u64, modified: bool) -> PresenceResult<()>;
    async fn delete(&self, session_id: &str) -> PresenceResult<()>;
}

/// Presence store backed by the scripted storage layer.
pub struct PresenceStore {
    manager: Arc<RedisConnectionManager>,
}

impl PresenceStore {
    pub fn new(manager: Arc<RedisConnectionManager>) -> Self {
        Self { manager }
    }

    fn write_connection(&self) -> PresenceResult<(MultiplexedConnection, u64)> {
        self.manager
            .connection()
            .ok_or_else(|| PresenceError::sync_failed("not connected to Redis"))
    }

    fn read_connection(&self) -> PresenceResult<MultiplexedConnection> {
        self.manager
            .connection()
            .map(|(conn, _)| conn)
            .ok_or_else(|| PresenceError::load_failed("not connected to Redis"))
    }

    /// Load one session's presence.
    pub async fn get_by_session_id(&self, session_id: &str) -> PresenceResult<Option<Presence>> {
        let mut conn = self.read_connection()?;
        let value = run_presence_get_by_session_id(&mut conn, session_id).await?;
        decode_presence(&value)
    }

    /// Load every presence of one user.
    pub async fn get_by_user_id(&self, user_id: &str) -> PresenceResult<Vec<Presence>> {
        let mut conn = self.read_connection()?;
        let value = run_presence_get_by_index(&mut conn, &RedisKeys::user(user_id)).await?;
        decode_presence_list(&value)
    }

    /// Load every presence at one location.
    pub async fn get_by_location_id(&self, location_id: &str) -> PresenceResult<Vec<Presence>> {
        let mut conn = self.read_connection()?;
        let value = run_presence_get_by_index(&mut conn, &RedisKeys::location(location_id)).await?;
        decode_presence_list(&value)
    }
}

#[async_trait]
impl SyncStore for PresenceStore {
    async fn update(&self, presence: &Presence, ttl: u64, modified: bool) -> PresenceResult<()> {
        let (mut conn, connection_id) = self.write_connection()?;
        let data = serde_json::to_string(&presence.data)?;
        let result =
            run_presence_update(&mut conn, presence, &data, connection_id, ttl, modified).await?;
        debug!(
            session_id = %presence.session_id,
            modified,
            result,
            "Updated presence in Redis"
        );
        Ok(())
    }

    async fn delete(&self, session_id: &str) -> PresenceResult<()> {
        let (mut conn, _) = self.write_connection()?;
        run_presence_delete(&mut conn, session_id).await?;
        debug!(session_id = %session_id, "Deleted presence from Redis");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn bulk(fields: &[&str]) -> Value {
        Value::Bulk(
            fields
                .iter()
                .map(|f| Value::Data(f.as_bytes().to_vec()))
                .collect(),
        )
    }

    #[test]
    fn test_decode_presence_tuple() {
        let value = bulk(&["s1", "u1", "L", r#"{"k":"v"}"#, "1234"]);
        let presence = decode_presence(&value).unwrap().unwrap();
        assert_eq!(presence.session_id, "s1");
        assert_eq!(presence.user_id, "u1");
        assert_eq!(presence.location_id, "L");
        assert_eq!(presence.data, json!({"k": "v"}));
        assert_eq!(presence.last_modified, 1234);
    }

    #[test]
    fn test_decode_presence_gone() {
        assert_eq!(decode_presence(&Value::Nil).unwrap(), None);
    }

    #[test]
    fn test_decode_presence_bad_last_modified() {
        let value = bulk(&["s1", "u1", "L", "null", "not-a-number"]);
        let error = decode_presence(&value).unwrap_err();
        assert!(matches!(error, PresenceError::InvalidPresence { .. }));
    }

    #[test]
    fn test_decode_presence_bad_data() {
        let value = bulk(&["s1", "u1", "L", "{not json", "0"]);
        let error = decode_presence(&value).unwrap_err();
        assert!(matches!(error, PresenceError::InvalidPresence { .. }));
    }

    #[test]
    fn test_decode_presence_wrong_arity() {
        let value = bulk(&["s1", "u1"]);
        assert!(decode_presence(&value).is_err());
    }

    #[test]
    fn test_decode_presence_list() {
        let value = Value::Bulk(vec![
            bulk(&["s1", "u1", "L1", "null", "1"]),
            bulk(&["s2", "u1", "L2", "42", "2"]),
        ]);
        let list = decode_presence_list(&value).unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].session_id, "s1");
        assert_eq!(list[1].data, json!(42));
    }

    #[test]
    fn test_decode_presence_list_fails_on_invalid_entry() {
        let value = Value::Bulk(vec![
            bulk(&["s1", "u1", "L1", "null", "1"]),
            bulk(&["s2", "u1", "L2", "null", "oops"]),
        ]);
        assert!(decode_presence_list(&value).is_err());
    }

    #[test]
    fn test_decode_presence_list_empty() {
        assert!(decode_presence_list(&Value::Bulk(Vec::new()))
            .unwrap()
            .is_empty());
        assert!(decode_presence_list(&Value::Nil).unwrap().is_empty());
    }
}
