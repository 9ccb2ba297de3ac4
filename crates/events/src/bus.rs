//! Durable log abstraction (mechanics only).
//!
//! The broker is split into two independent roles:
//!
//! - [`EventBus`]: the producer side. `publish()` returns only once the log has
//!   durably accepted the record and assigned it a [`LogPosition`]. Appends are
//!   fenced per key by the envelope sequence, so log order and sequence order
//!   agree for every key whatever the producers' clocks say.
//! - [`EventSource`] / [`ConsumerSession`]: the consumer side. A session belongs
//!   to one consumer inside one consumer group and tracks progress through
//!   explicit [`ConsumerSession::commit`] calls.
//!
//! ## Delivery guarantees expected from implementations
//!
//! - **At-least-once**: a delivery that is never committed is delivered again
//!   to the same consumer after it reconnects, or to another consumer of the
//!   group once it has been idle long enough.
//! - **Per-key ordering**: records published with the same key are delivered in
//!   publish order.
//! - **Group isolation**: every consumer group tracks its own progress.
//!
//! Nothing here is shared between the two roles; a publisher and a consumer
//! always hold separate connections.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Position assigned by the log to an appended record (offset, stream id, ...).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LogPosition(String);

impl LogPosition {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for LogPosition {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Broker acknowledgment of a publish.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    pub position: LogPosition,
}

/// A record handed to a consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub position: LogPosition,
    pub payload: Vec<u8>,
    /// True when this record was delivered before and never committed.
    pub redelivered: bool,
}

/// Error classification every broker error must provide.
pub trait BusFailure: std::error::Error + Send + Sync + 'static {
    /// Whether retrying the same call later may succeed.
    fn is_transient(&self) -> bool;

    /// For a fenced append: the highest sequence the log holds for the key.
    fn fenced_by(&self) -> Option<u64> {
        None
    }
}

/// Producer side of the log.
///
/// ## Thread Safety
///
/// Implementations are shared between request handlers, so `publish` takes
/// `&self` and may be called concurrently.
pub trait EventBus: Send + Sync {
    type Error: BusFailure;

    /// Append `payload` under the ordering key `key`.
    ///
    /// The append is fenced: it is refused (see [`BusFailure::fenced_by`])
    /// unless `sequence` is greater than every sequence already appended for
    /// `key`. Appending the record that already holds the key's highest
    /// sequence again, byte for byte, returns that record's ack instead, so a
    /// retry after a lost ack never duplicates it.
    ///
    /// `timeout` bounds the whole call, connecting included.
    fn publish(
        &self,
        key: &str,
        sequence: u64,
        payload: &[u8],
        timeout: Option<Duration>,
    ) -> Result<Ack, Self::Error>;
}

impl<B> EventBus for Arc<B>
where
    B: EventBus + ?Sized,
{
    type Error = B::Error;

    fn publish(
        &self,
        key: &str,
        sequence: u64,
        payload: &[u8],
        timeout: Option<Duration>,
    ) -> Result<Ack, Self::Error> {
        (**self).publish(key, sequence, payload, timeout)
    }
}

/// Consumer side of the log: opens sessions.
pub trait EventSource: Send + Sync {
    type Error: BusFailure;
    type Session: ConsumerSession<Error = Self::Error>;

    /// Join `group` as `consumer`, creating the group if needed.
    ///
    /// A new session first replays this consumer's uncommitted deliveries, then
    /// continues with records the group has not seen yet.
    fn connect(&self, group: &str, consumer: &str) -> Result<Self::Session, Self::Error>;
}

impl<S> EventSource for Arc<S>
where
    S: EventSource + ?Sized,
{
    type Error = S::Error;
    type Session = S::Session;

    fn connect(&self, group: &str, consumer: &str) -> Result<Self::Session, Self::Error> {
        (**self).connect(group, consumer)
    }
}

/// One consumer's connection to the log.
///
/// Sessions are owned by a single thread; they are `Send` but not shared.
pub trait ConsumerSession: Send {
    type Error: BusFailure;

    /// Wait up to `wait` for at most `max` deliveries.
    ///
    /// Returns an empty batch on timeout.
    fn poll(&mut self, max: usize, wait: Duration) -> Result<Vec<Delivery>, Self::Error>;

    /// Record that the delivery at `position` has been fully processed.
    ///
    /// Committing a position twice is not an error.
    fn commit(&mut self, position: &LogPosition) -> Result<(), Self::Error>;

    /// Park an unprocessable delivery on the dead-letter channel.
    ///
    /// This does not commit it; callers commit afterwards.
    fn dead_letter(&mut self, delivery: &Delivery, reason: &str) -> Result<(), Self::Error>;
}
