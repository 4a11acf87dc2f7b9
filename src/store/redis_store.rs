//! Redis Streams log store
//!
//! Maps every [`LogStore`] operation onto one Redis command:
//!
//! | operation          | command                                   |
//! |--------------------|-------------------------------------------|
//! | `append`           | `XADD key * message <payload>`            |
//! | `ensure_group`     | `XGROUP CREATE key group 0 MKSTREAM`      |
//! | `read_unclaimed`   | `XREADGROUP GROUP g c COUNT n STREAMS key >` |
//! | `list_pending`     | `XPENDING key g IDLE ms start + count`    |
//! | `reclaim`          | `XCLAIM key g c ms id`                    |
//! | `ack`              | `XACK key g id`                           |
//! | `delete`           | `XDEL key id`                             |
//! | `count`            | `XLEN key`                                |
//! | `list_streams`     | `SCAN cursor MATCH p* COUNT n TYPE stream`|
//! | `auto_claim_stale` | `XAUTOCLAIM key g c ms 0-0 COUNT n`       |
//!
//! Atomicity comes from Redis executing each command on its single thread.
//! The connection handle is a `ConnectionManager`: it reconnects on its own
//! with a bounded number of retries, and every command is additionally capped
//! by a timeout. Nothing above the transport retries.

use super::{EntryId, GroupCreation, LogEntry, LogStore, PendingInfo, StoreError, StoreFuture};
use bytes::Bytes;
use redis::aio::{ConnectionManager, ConnectionManagerConfig};
use redis::streams::{
    StreamAutoClaimReply, StreamClaimReply, StreamId, StreamPendingCountReply, StreamReadReply,
};
use redis::{Client, Cmd, FromRedisValue, RedisError, RedisResult, Value};
use std::time::Duration;
use tracing::{debug, warn};

/// Stream field holding the serialized webhook payload
pub const MESSAGE_FIELD: &str = "message";

/// `SCAN` page size hint
const SCAN_COUNT: usize = 100;

// TigerStyle: Explicit limits
const COMMAND_TIMEOUT_MS_MIN: u64 = 10;
const COMMAND_TIMEOUT_MS_MAX: u64 = 60_000;

/// Connection settings for [`RedisLogStore`]
#[derive(Debug, Clone)]
pub struct RedisStoreConfig {
    pub host: String,
    pub port: u16,
    /// Reconnect attempts the connection manager makes before failing a call
    pub max_retries_per_request: usize,
    /// Upper bound on a single command, reconnects included
    pub command_timeout: Duration,
}

impl Default for RedisStoreConfig {
    fn default() -> Self {
        RedisStoreConfig {
            host: "127.0.0.1".to_string(),
            port: 6379,
            max_retries_per_request: 3,
            command_timeout: Duration::from_secs(5),
        }
    }
}

impl RedisStoreConfig {
    pub fn url(&self) -> String {
        format!("redis://{}:{}/", self.host, self.port)
    }

    fn clamped_timeout(&self) -> Duration {
        let ms = (self.command_timeout.as_millis() as u64)
            .clamp(COMMAND_TIMEOUT_MS_MIN, COMMAND_TIMEOUT_MS_MAX);
        Duration::from_millis(ms)
    }
}

/// Production log store backed by Redis Streams
#[derive(Clone)]
pub struct RedisLogStore {
    conn: ConnectionManager,
    command_timeout: Duration,
}

impl RedisLogStore {
    /// Open the connection; fails with `Unavailable` if Redis cannot be reached
    pub async fn connect(config: &RedisStoreConfig) -> Result<Self, StoreError> {
        let command_timeout = config.clamped_timeout();
        let client =
            Client::open(config.url()).map_err(|e| StoreError::Unavailable(e.to_string()))?;
        let manager_config =
            ConnectionManagerConfig::new().set_number_of_retries(config.max_retries_per_request);

        let conn = tokio::time::timeout(
            command_timeout,
            ConnectionManager::new_with_config(client, manager_config),
        )
        .await
        .map_err(|_| {
            StoreError::Unavailable(format!(
                "connecting to {} timed out after {:?}",
                config.url(),
                command_timeout
            ))
        })?
        .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        debug!(url = %config.url(), "connected to redis");
        Ok(RedisLogStore {
            conn,
            command_timeout,
        })
    }

    /// Run `cmd`, separating a timeout (outer error) from the Redis result
    async fn run_raw<T: FromRedisValue>(&self, cmd: &Cmd) -> Result<RedisResult<T>, StoreError> {
        let mut conn = self.conn.clone();
        tokio::time::timeout(self.command_timeout, cmd.query_async(&mut conn))
            .await
            .map_err(|_| {
                StoreError::Unavailable(format!(
                    "command timed out after {:?}",
                    self.command_timeout
                ))
            })
    }

    async fn run<T: FromRedisValue>(
        &self,
        cmd: &Cmd,
        stream: &str,
        group: &str,
    ) -> Result<T, StoreError> {
        self.run_raw(cmd)
            .await?
            .map_err(|e| classify_error(e, stream, group))
    }
}

/// Only transport failures are outages; replies that fail to parse are protocol errors
fn classify_error(err: RedisError, stream: &str, group: &str) -> StoreError {
    if err.code() == Some("NOGROUP") {
        return StoreError::MissingGroup {
            stream: stream.to_string(),
            group: group.to_string(),
        };
    }
    if err.is_io_error()
        || err.is_timeout()
        || err.is_connection_dropped()
        || err.is_connection_refusal()
    {
        StoreError::Unavailable(err.to_string())
    } else {
        StoreError::Protocol(err.to_string())
    }
}

fn parse_id(raw: &str) -> Result<EntryId, StoreError> {
    raw.parse()
        .map_err(|_| StoreError::Protocol(format!("invalid stream id {:?}", raw)))
}

/// Convert a stream reply item; a missing `message` field yields an empty payload
fn to_log_entry(mut item: StreamId) -> Result<LogEntry, StoreError> {
    let id = parse_id(&item.id)?;
    let payload = match item.map.remove(MESSAGE_FIELD) {
        Some(Value::BulkString(bytes)) => Bytes::from(bytes),
        Some(Value::SimpleString(s)) => Bytes::from(s),
        _ => Bytes::new(),
    };
    Ok(LogEntry { id, payload })
}

/// Escape glob metacharacters so a prefix matches literally in `SCAN MATCH`
fn glob_escape(prefix: &str) -> String {
    let mut out = String::with_capacity(prefix.len() + 1);
    for c in prefix.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

impl LogStore for RedisLogStore {
    fn append<'a>(&'a self, stream: &'a str, payload: Bytes) -> StoreFuture<'a, EntryId> {
        Box::pin(async move {
            let mut cmd = redis::cmd("XADD");
            cmd.arg(stream).arg("*").arg(MESSAGE_FIELD).arg(&payload[..]);
            let raw: String = self.run(&cmd, stream, "").await?;
            parse_id(&raw)
        })
    }

    fn ensure_group<'a>(
        &'a self,
        stream: &'a str,
        group: &'a str,
    ) -> StoreFuture<'a, GroupCreation> {
        Box::pin(async move {
            let mut cmd = redis::cmd("XGROUP");
            cmd.arg("CREATE").arg(stream).arg(group).arg("0").arg("MKSTREAM");
            match self.run_raw::<()>(&cmd).await? {
                Ok(()) => Ok(GroupCreation::Created),
                Err(e) if e.code() == Some("BUSYGROUP") => Ok(GroupCreation::AlreadyExists),
                Err(e) => Err(classify_error(e, stream, group)),
            }
        })
    }

    fn read_unclaimed<'a>(
        &'a self,
        stream: &'a str,
        group: &'a str,
        consumer: &'a str,
        max_count: Option<usize>,
    ) -> StoreFuture<'a, Vec<LogEntry>> {
        Box::pin(async move {
            let mut cmd = redis::cmd("XREADGROUP");
            cmd.arg("GROUP").arg(group).arg(consumer);
            if let Some(count) = max_count.filter(|&n| n > 0) {
                cmd.arg("COUNT").arg(count);
            }
            cmd.arg("STREAMS").arg(stream).arg(">");

            let reply: Option<StreamReadReply> = self.run(&cmd, stream, group).await?;
            let Some(reply) = reply else {
                return Ok(Vec::new());
            };
            reply
                .keys
                .into_iter()
                .flat_map(|key| key.ids)
                .map(to_log_entry)
                .collect()
        })
    }

    fn list_pending<'a>(
        &'a self,
        stream: &'a str,
        group: &'a str,
        min_idle: Duration,
        after: Option<EntryId>,
        limit: usize,
    ) -> StoreFuture<'a, Vec<PendingInfo>> {
        Box::pin(async move {
            let start = match after {
                Some(id) => format!("({}", id),
                None => "-".to_string(),
            };
            let mut cmd = redis::cmd("XPENDING");
            cmd.arg(stream)
                .arg(group)
                .arg("IDLE")
                .arg(min_idle.as_millis() as u64)
                .arg(start)
                .arg("+")
                .arg(limit);

            let reply: StreamPendingCountReply = self.run(&cmd, stream, group).await?;
            reply
                .ids
                .into_iter()
                .map(|p| {
                    Ok(PendingInfo {
                        id: parse_id(&p.id)?,
                        consumer: p.consumer,
                        delivery_count: p.times_delivered as u64,
                        // XPENDING reports the idle time in this slot.
                        idle: Duration::from_millis(p.last_delivered_ms as u64),
                    })
                })
                .collect()
        })
    }

    fn reclaim<'a>(
        &'a self,
        stream: &'a str,
        group: &'a str,
        consumer: &'a str,
        min_idle: Duration,
        id: EntryId,
    ) -> StoreFuture<'a, LogEntry> {
        Box::pin(async move {
            let mut cmd = redis::cmd("XCLAIM");
            cmd.arg(stream)
                .arg(group)
                .arg(consumer)
                .arg(min_idle.as_millis() as u64)
                .arg(id.to_string());

            // Redis 6 answers a claim of an entry deleted from the log with an
            // `[id, nil]` item, which does not parse as a stream entry.
            let reply: StreamClaimReply = match self.run(&cmd, stream, group).await {
                Ok(reply) => reply,
                Err(StoreError::Protocol(reason)) => {
                    warn!(stream, entry_id = %id, reason = %reason, "unreadable claim reply");
                    return Err(StoreError::ClaimRaced(id));
                }
                Err(e) => return Err(e),
            };
            match reply.ids.into_iter().next() {
                Some(item) => to_log_entry(item),
                None => Err(StoreError::ClaimRaced(id)),
            }
        })
    }

    fn ack<'a>(&'a self, stream: &'a str, group: &'a str, id: EntryId) -> StoreFuture<'a, bool> {
        Box::pin(async move {
            let mut cmd = redis::cmd("XACK");
            cmd.arg(stream).arg(group).arg(id.to_string());
            let acked: i64 = self.run(&cmd, stream, group).await?;
            Ok(acked > 0)
        })
    }

    fn delete<'a>(&'a self, stream: &'a str, id: EntryId) -> StoreFuture<'a, bool> {
        Box::pin(async move {
            let mut cmd = redis::cmd("XDEL");
            cmd.arg(stream).arg(id.to_string());
            let deleted: i64 = self.run(&cmd, stream, "").await?;
            Ok(deleted > 0)
        })
    }

    fn count<'a>(&'a self, stream: &'a str) -> StoreFuture<'a, u64> {
        Box::pin(async move {
            let mut cmd = redis::cmd("XLEN");
            cmd.arg(stream);
            self.run(&cmd, stream, "").await
        })
    }

    fn list_streams<'a>(&'a self, prefix: &'a str) -> StoreFuture<'a, Vec<String>> {
        Box::pin(async move {
            let pattern = format!("{}*", glob_escape(prefix));
            let mut names = Vec::new();
            let mut cursor: u64 = 0;
            loop {
                let mut cmd = redis::cmd("SCAN");
                cmd.arg(cursor)
                    .arg("MATCH")
                    .arg(&pattern)
                    .arg("COUNT")
                    .arg(SCAN_COUNT)
                    .arg("TYPE")
                    .arg("stream");
                let (next, page): (u64, Vec<String>) = self.run(&cmd, prefix, "").await?;
                names.extend(page);
                if next == 0 {
                    break;
                }
                cursor = next;
            }
            // SCAN may return a key more than once while the keyspace changes.
            names.sort();
            names.dedup();
            Ok(names)
        })
    }

    fn auto_claim_stale<'a>(
        &'a self,
        stream: &'a str,
        group: &'a str,
        consumer: &'a str,
        min_idle: Duration,
        batch_size: usize,
    ) -> StoreFuture<'a, Vec<LogEntry>> {
        Box::pin(async move {
            let mut cmd = redis::cmd("XAUTOCLAIM");
            cmd.arg(stream)
                .arg(group)
                .arg(consumer)
                .arg(min_idle.as_millis() as u64)
                .arg("0-0")
                .arg("COUNT")
                .arg(batch_size);

            let reply: StreamAutoClaimReply = match self.run(&cmd, stream, group).await {
                Ok(reply) => reply,
                Err(StoreError::MissingGroup { .. }) => return Ok(Vec::new()),
                Err(e) => return Err(e),
            };
            if !reply.deleted_ids.is_empty() {
                debug!(
                    stream,
                    deleted = reply.deleted_ids.len(),
                    "auto-claim dropped pending entries already deleted from the log"
                );
            }
            reply.claimed.into_iter().map(to_log_entry).collect()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use redis::ErrorKind;
    use std::collections::HashMap;

    #[test]
    fn test_url_from_host_and_port() {
        let config = RedisStoreConfig {
            host: "redis.internal".to_string(),
            port: 6380,
            ..RedisStoreConfig::default()
        };
        assert_eq!(config.url(), "redis://redis.internal:6380/");
    }

    #[test]
    fn test_timeout_is_clamped() {
        let config = RedisStoreConfig {
            command_timeout: Duration::ZERO,
            ..RedisStoreConfig::default()
        };
        assert_eq!(
            config.clamped_timeout(),
            Duration::from_millis(COMMAND_TIMEOUT_MS_MIN)
        );
    }

    #[test]
    fn test_unparseable_reply_is_protocol_error() {
        let err = RedisError::from((ErrorKind::UnexpectedReturnType, "not a stream entry"));
        assert!(matches!(
            classify_error(err, "line:ch", "workers"),
            StoreError::Protocol(_)
        ));
    }

    #[test]
    fn test_transport_failure_is_unavailable() {
        let refused = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let err = classify_error(RedisError::from(refused), "line:ch", "workers");
        assert!(err.is_unavailable());
    }

    #[test]
    fn test_glob_escape() {
        assert_eq!(glob_escape("line:"), "line:");
        assert_eq!(glob_escape("a*b?[c]\\"), "a\\*b\\?\\[c\\]\\\\");
    }

    #[test]
    fn test_to_log_entry_reads_message_field() {
        let mut map = HashMap::new();
        map.insert(
            MESSAGE_FIELD.to_string(),
            Value::BulkString(b"{\"a\":1}".to_vec()),
        );
        let entry = to_log_entry(StreamId {
            id: "10-2".to_string(),
            map,
            ..Default::default()
        })
        .unwrap();
        assert_eq!(entry.id, EntryId::new(10, 2));
        assert_eq!(&entry.payload[..], b"{\"a\":1}");
    }

    #[test]
    fn test_to_log_entry_without_message_field_is_empty() {
        let entry = to_log_entry(StreamId {
            id: "10-2".to_string(),
            map: HashMap::new(),
            ..Default::default()
        })
        .unwrap();
        assert!(entry.payload.is_empty());
    }

    #[test]
    fn test_to_log_entry_rejects_bad_id() {
        let err = to_log_entry(StreamId {
            id: "garbage".to_string(),
            map: HashMap::new(),
            ..Default::default()
        })
        .unwrap_err();
        assert!(matches!(err, StoreError::Protocol(_)));
    }
}
