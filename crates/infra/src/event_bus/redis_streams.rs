//! Redis Streams-backed log (durable, at-least-once delivery).
//!
//! - **Stream key**: the orders topic (one stream, so per-key order holds)
//! - **Fences**: `<topic>:seq`, `<topic>:pos` and `<topic>:digest` hashes hold,
//!   per ordering key, the highest appended sequence, its entry id and a digest
//!   of its payload. Appends go through one Lua script, so the fence check and
//!   the XADD are atomic.
//! - **Consumer groups**: one per query service deployment; every group sees
//!   every record
//! - **Consumers**: named members of a group; a record delivered to a
//!   consumer stays in its pending entries list until XACK
//! - **Dead-letter stream**: `<topic>:dlq`
//!
//! On connect a session first re-reads its own pending entries (`XREADGROUP`
//! with id `0`) and only then asks for new ones (`>`), so deliveries that were
//! never committed before a crash are replayed. Entries another consumer left
//! pending longer than the claim idle time are taken over with `XCLAIM`.
//!
//! Sequences are compared inside Lua as doubles and must stay below 2^53.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use redis::streams::{StreamClaimReply, StreamId, StreamReadOptions, StreamReadReply};
use redis::{Commands, ErrorKind, RedisError};
use tracing::{debug, instrument, warn};

use orderflow_events::{
    Ack, BusFailure, ConsumerSession, Delivery, EventBus, EventSource, LogPosition,
};

use crate::config::BrokerConfig;

/// Field holding the serialized envelope.
const PAYLOAD_FIELD: &str = "envelope";
/// Field holding the ordering key.
const KEY_FIELD: &str = "key";
/// Slack added to the socket timeout on top of the XREADGROUP block time.
const READ_TIMEOUT_SLACK: Duration = Duration::from_secs(2);
/// Idle producer connections kept around.
const PRODUCER_POOL_CAPACITY: usize = 8;
/// Socket timeouts of zero are rejected by the OS.
const MIN_SOCKET_TIMEOUT: Duration = Duration::from_millis(1);

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_CLAIM_IDLE: Duration = Duration::from_secs(30);

/// KEYS: stream, sequence hash, position hash, digest hash.
/// ARGV: ordering key, sequence, payload.
const FENCED_APPEND: &str = r#"
local key, payload = ARGV[1], ARGV[3]
local seq = tonumber(ARGV[2])
local last = redis.call('HGET', KEYS[2], key)
local digest = redis.sha1hex(payload)
if last then
  local high = tonumber(last)
  if seq == high and redis.call('HGET', KEYS[4], key) == digest then
    return {'duplicate', redis.call('HGET', KEYS[3], key)}
  end
  if seq <= high then
    return {'fenced', last}
  end
end
local id = redis.call('XADD', KEYS[1], '*', 'key', key, 'envelope', payload)
redis.call('HSET', KEYS[2], key, ARGV[2])
redis.call('HSET', KEYS[3], key, id)
redis.call('HSET', KEYS[4], key, digest)
return {'appended', id}
"#;

#[derive(Debug, thiserror::Error)]
pub enum RedisStreamsError {
    #[error("Redis connection error: {0}")]
    Connection(String),

    #[error("Redis command error: {0}")]
    Command(String),

    #[error("Consumer group error: {0}")]
    ConsumerGroup(String),

    #[error("append fenced by sequence {high_water}")]
    Fenced { high_water: u64 },
}

impl RedisStreamsError {
    fn from_redis(context: &str, err: RedisError) -> Self {
        if is_transient(&err) {
            RedisStreamsError::Connection(format!("{context}: {err}"))
        } else {
            RedisStreamsError::Command(format!("{context}: {err}"))
        }
    }
}

impl BusFailure for RedisStreamsError {
    fn is_transient(&self) -> bool {
        matches!(self, RedisStreamsError::Connection(_))
    }

    fn fenced_by(&self) -> Option<u64> {
        match self {
            RedisStreamsError::Fenced { high_water } => Some(*high_water),
            _ => None,
        }
    }
}

fn is_transient(err: &RedisError) -> bool {
    err.is_io_error()
        || err.is_timeout()
        || err.is_connection_dropped()
        || err.is_connection_refusal()
        || matches!(
            err.kind(),
            ErrorKind::TryAgain
                | ErrorKind::BusyLoadingError
                | ErrorKind::ClusterDown
                | ErrorKind::MasterDown
        )
}

/// Interpret the reply of the fenced append script.
fn append_outcome(status: &str, value: String) -> Result<Ack, RedisStreamsError> {
    match status {
        "appended" | "duplicate" => Ok(Ack {
            position: LogPosition::new(value),
        }),
        "fenced" => match value.parse() {
            Ok(high_water) => Err(RedisStreamsError::Fenced { high_water }),
            Err(_) => Err(RedisStreamsError::Command(format!(
                "bad fence reply: {value}"
            ))),
        },
        other => Err(RedisStreamsError::Command(format!(
            "unexpected append reply: {other}"
        ))),
    }
}

/// Idle connections waiting for reuse. The lock is held only to take or
/// return one.
#[derive(Debug)]
struct IdlePool<C> {
    idle: Mutex<Vec<C>>,
    capacity: usize,
}

impl<C> IdlePool<C> {
    fn new(capacity: usize) -> Self {
        Self {
            idle: Mutex::new(Vec::with_capacity(capacity)),
            capacity,
        }
    }

    fn take(&self) -> Option<C> {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner).pop()
    }

    /// Keep `conn` for reuse unless the pool is full.
    fn give_back(&self, conn: C) {
        let mut idle = self.idle.lock().unwrap_or_else(PoisonError::into_inner);
        if idle.len() < self.capacity {
            idle.push(conn);
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

fn socket_timeout(budget: Option<Duration>) -> Option<Duration> {
    budget.map(|b| b.max(MIN_SOCKET_TIMEOUT))
}

/// Producer and session factory over one Redis stream.
///
/// Producer connections live in a small pool; a connection is taken out for
/// the duration of one append and only returned after it succeeded, so no
/// lock is held across a round trip. Every consumer session opens its own
/// connection.
#[derive(Clone)]
pub struct RedisStreamsEventBus {
    client: Arc<redis::Client>,
    stream_key: String,
    dlq_key: String,
    fenced_append: redis::Script,
    producers: Arc<IdlePool<redis::Connection>>,
    connect_timeout: Duration,
    claim_idle: Duration,
}

impl std::fmt::Debug for RedisStreamsEventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStreamsEventBus")
            .field("stream_key", &self.stream_key)
            .field("dlq_key", &self.dlq_key)
            .field("connect_timeout", &self.connect_timeout)
            .field("claim_idle", &self.claim_idle)
            .finish_non_exhaustive()
    }
}

impl RedisStreamsEventBus {
    /// Create a new Redis Streams log.
    ///
    /// # Arguments
    ///
    /// * `redis_url` - Redis connection URL (e.g., "redis://localhost:6379")
    /// * `stream_key` - stream carrying the topic
    /// * `dlq_key` - dead-letter stream
    pub fn new(
        redis_url: impl AsRef<str>,
        stream_key: impl Into<String>,
        dlq_key: impl Into<String>,
    ) -> Result<Self, RedisStreamsError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| RedisStreamsError::Connection(e.to_string()))?;

        Ok(Self {
            client: Arc::new(client),
            stream_key: stream_key.into(),
            dlq_key: dlq_key.into(),
            fenced_append: redis::Script::new(FENCED_APPEND),
            producers: Arc::new(IdlePool::new(PRODUCER_POOL_CAPACITY)),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            claim_idle: DEFAULT_CLAIM_IDLE,
        })
    }

    pub fn from_config(config: &BrokerConfig) -> Result<Self, RedisStreamsError> {
        Ok(Self::new(&config.url, config.topic.clone(), config.dead_letter_topic())?
            .with_connect_timeout(config.connect_timeout)
            .with_claim_idle(config.claim_idle))
    }

    /// Upper bound for opening a consumer connection.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout.max(MIN_SOCKET_TIMEOUT);
        self
    }

    /// Idle time after which a session claims entries another consumer of
    /// its group left pending.
    pub fn with_claim_idle(mut self, idle: Duration) -> Self {
        self.claim_idle = idle;
        self
    }

    pub fn stream_key(&self) -> &str {
        &self.stream_key
    }

    fn fence_keys(&self) -> [String; 3] {
        [
            format!("{}:seq", self.stream_key),
            format!("{}:pos", self.stream_key),
            format!("{}:digest", self.stream_key),
        ]
    }

    fn connection(&self, timeout: Duration) -> Result<redis::Connection, RedisStreamsError> {
        self.client
            .get_connection_with_timeout(timeout)
            .map_err(|e| RedisStreamsError::Connection(e.to_string()))
    }

    /// A pooled producer connection, or a fresh one, with socket timeouts
    /// set to what is left of `budget`.
    fn checkout(&self, budget: Option<Duration>) -> Result<redis::Connection, RedisStreamsError> {
        let started = Instant::now();
        let mut conn = match self.producers.take() {
            Some(conn) => conn,
            None => self.connection(
                socket_timeout(budget).map_or(self.connect_timeout, |b| b.min(self.connect_timeout)),
            )?,
        };

        let timeout = socket_timeout(budget.map(|b| b.saturating_sub(started.elapsed())));
        conn.set_read_timeout(timeout)
            .map_err(|e| RedisStreamsError::from_redis("set read timeout", e))?;
        conn.set_write_timeout(timeout)
            .map_err(|e| RedisStreamsError::from_redis("set write timeout", e))?;
        Ok(conn)
    }

    /// Ensure a consumer group exists (idempotent).
    ///
    /// New groups start at the beginning of the stream.
    pub fn ensure_consumer_group(
        &self,
        conn: &mut redis::Connection,
        group: &str,
    ) -> Result<(), RedisStreamsError> {
        let created: redis::RedisResult<()> = conn.xgroup_create_mkstream(&self.stream_key, group, "0");
        match created {
            Ok(()) => {
                debug!(stream = %self.stream_key, group, "consumer group created");
                Ok(())
            }
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) if is_transient(&e) => Err(RedisStreamsError::Connection(e.to_string())),
            Err(e) => Err(RedisStreamsError::ConsumerGroup(e.to_string())),
        }
    }
}

impl EventBus for RedisStreamsEventBus {
    type Error = RedisStreamsError;

    #[instrument(skip(self, payload), fields(stream = %self.stream_key), err)]
    fn publish(
        &self,
        key: &str,
        sequence: u64,
        payload: &[u8],
        timeout: Option<Duration>,
    ) -> Result<Ack, Self::Error> {
        let mut conn = self.checkout(timeout)?;

        let [seq_key, pos_key, digest_key] = self.fence_keys();
        let (status, value): (String, String) = self
            .fenced_append
            .key(&self.stream_key)
            .key(seq_key)
            .key(pos_key)
            .key(digest_key)
            .arg(key)
            .arg(sequence)
            .arg(payload)
            .invoke(&mut conn)
            .map_err(|e| RedisStreamsError::from_redis("fenced XADD failed", e))?;

        // The connection answered, so it goes back into the pool whatever the
        // fence said.
        self.producers.give_back(conn);
        append_outcome(&status, value)
    }
}

impl EventSource for RedisStreamsEventBus {
    type Error = RedisStreamsError;
    type Session = RedisStreamsSession;

    fn connect(&self, group: &str, consumer: &str) -> Result<Self::Session, Self::Error> {
        let mut conn = self.connection(self.connect_timeout)?;
        self.ensure_consumer_group(&mut conn, group)?;

        Ok(RedisStreamsSession {
            conn,
            stream_key: self.stream_key.clone(),
            dlq_key: self.dlq_key.clone(),
            group: group.to_string(),
            consumer: consumer.to_string(),
            pending_cursor: Some("0".to_string()),
            claim_idle: self.claim_idle,
            next_claim: Instant::now(),
        })
    }
}

/// One consumer's connection to the stream.
pub struct RedisStreamsSession {
    conn: redis::Connection,
    stream_key: String,
    dlq_key: String,
    group: String,
    consumer: String,
    /// While set, polls walk this consumer's pending entries after this id.
    pending_cursor: Option<String>,
    claim_idle: Duration,
    next_claim: Instant,
}

impl RedisStreamsSession {
    fn read(
        &mut self,
        start: &str,
        max: usize,
        block: Option<Duration>,
    ) -> Result<Vec<StreamId>, RedisStreamsError> {
        let mut opts = StreamReadOptions::default()
            .group(&self.group, &self.consumer)
            .count(max);
        if let Some(block) = block {
            opts = opts.block(block.as_millis().max(1) as usize);
            self.conn
                .set_read_timeout(Some(block + READ_TIMEOUT_SLACK))
                .map_err(|e| RedisStreamsError::from_redis("set read timeout", e))?;
        }

        // A BLOCK that times out answers nil, which maps to None here.
        let reply: Option<StreamReadReply> = self
            .conn
            .xread_options(&[&self.stream_key], &[start], &opts)
            .map_err(|e| RedisStreamsError::from_redis("XREADGROUP failed", e))?;

        Ok(reply
            .map(|r| r.keys.into_iter().flat_map(|k| k.ids).collect())
            .unwrap_or_default())
    }

    /// Take over entries other consumers of the group left pending for at
    /// least the claim idle time.
    fn claim_stale(&mut self, max: usize) -> Result<Vec<StreamId>, RedisStreamsError> {
        let now = Instant::now();
        if now < self.next_claim {
            return Ok(Vec::new());
        }
        self.next_claim = now + self.claim_idle.max(Duration::from_secs(1));

        let min_idle_ms = self.claim_idle.as_millis() as u64;
        // XPENDING <key> <group> IDLE <ms> - + <count>: (id, consumer, idle, deliveries)
        let pending: Vec<(String, String, u64, u64)> = redis::cmd("XPENDING")
            .arg(&self.stream_key)
            .arg(&self.group)
            .arg("IDLE")
            .arg(min_idle_ms)
            .arg("-")
            .arg("+")
            .arg(max)
            .query(&mut self.conn)
            .map_err(|e| RedisStreamsError::from_redis("XPENDING failed", e))?;

        let ids: Vec<String> = pending
            .into_iter()
            .filter(|(_, owner, _, _)| *owner != self.consumer)
            .map(|(id, _, _, _)| id)
            .collect();
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        // XCLAIM re-checks the idle time, so a racing consumer wins cleanly.
        let claimed: StreamClaimReply = self
            .conn
            .xclaim(&self.stream_key, &self.group, &self.consumer, min_idle_ms, &ids[..])
            .map_err(|e| RedisStreamsError::from_redis("XCLAIM failed", e))?;

        if !claimed.ids.is_empty() {
            warn!(
                group = %self.group,
                consumer = %self.consumer,
                count = claimed.ids.len(),
                "claimed idle entries of another consumer"
            );
        }
        Ok(claimed.ids)
    }
}

fn to_delivery(entry: StreamId, redelivered: bool) -> Delivery {
    // Entries whose fields vanished (trimmed) arrive empty and end up as poison.
    let payload: Vec<u8> = entry.get(PAYLOAD_FIELD).unwrap_or_default();
    Delivery {
        position: LogPosition::new(entry.id),
        payload,
        redelivered,
    }
}

impl ConsumerSession for RedisStreamsSession {
    type Error = RedisStreamsError;

    fn poll(&mut self, max: usize, wait: Duration) -> Result<Vec<Delivery>, Self::Error> {
        let max = max.max(1);

        if let Some(cursor) = self.pending_cursor.clone() {
            let entries = self.read(&cursor, max, None)?;
            match entries.last() {
                Some(last) => {
                    self.pending_cursor = Some(last.id.clone());
                    debug!(
                        group = %self.group,
                        consumer = %self.consumer,
                        count = entries.len(),
                        "replaying pending entries"
                    );
                    return Ok(entries.into_iter().map(|e| to_delivery(e, true)).collect());
                }
                None => self.pending_cursor = None,
            }
        }

        let claimed = self.claim_stale(max)?;
        if !claimed.is_empty() {
            return Ok(claimed.into_iter().map(|e| to_delivery(e, true)).collect());
        }

        let block = (!wait.is_zero()).then_some(wait);
        let entries = self.read(">", max, block)?;
        Ok(entries.into_iter().map(|e| to_delivery(e, false)).collect())
    }

    fn commit(&mut self, position: &LogPosition) -> Result<(), Self::Error> {
        let _: u64 = self
            .conn
            .xack(&self.stream_key, &self.group, &[position.as_str()])
            .map_err(|e| RedisStreamsError::from_redis("XACK failed", e))?;
        Ok(())
    }

    fn dead_letter(&mut self, delivery: &Delivery, reason: &str) -> Result<(), Self::Error> {
        let failed_at = chrono::Utc::now().to_rfc3339();
        let _: String = self
            .conn
            .xadd(
                &self.dlq_key,
                "*",
                &[
                    ("group", self.group.as_bytes()),
                    ("original_id", delivery.position.as_str().as_bytes()),
                    ("reason", reason.as_bytes()),
                    ("failed_at", failed_at.as_bytes()),
                    (PAYLOAD_FIELD, delivery.payload.as_slice()),
                ],
            )
            .map_err(|e| RedisStreamsError::from_redis("DLQ XADD failed", e))?;

        warn!(
            stream = %self.stream_key,
            dlq = %self.dlq_key,
            position = %delivery.position,
            "message sent to dead-letter stream"
        );
        Ok(())
    }
}
