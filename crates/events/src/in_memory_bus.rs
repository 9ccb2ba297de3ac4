//! In-memory durable log for tests/dev.
//!
//! Mirrors the consumer-group semantics of a real broker closely enough for the
//! applier to be exercised end to end:
//! - one totally ordered log (so per-key order holds trivially)
//! - per-key sequence fencing on append
//! - per-group delivery cursor and per-consumer pending set
//! - uncommitted deliveries are replayed when the same consumer reconnects,
//!   and claimed by any other consumer of the group once idle long enough
//! - fault injection to simulate an unavailable broker or a lost ack

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::bus::{Ack, BusFailure, ConsumerSession, Delivery, EventBus, EventSource, LogPosition};

/// Default idle time after which another consumer may claim a pending delivery.
pub const DEFAULT_CLAIM_IDLE: Duration = Duration::from_secs(30);

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum InMemoryBusError {
    #[error("broker unavailable")]
    Unavailable,

    #[error("unknown log position: {0}")]
    UnknownPosition(String),

    #[error("append for key {key} fenced by sequence {high_water}")]
    Fenced { key: String, high_water: u64 },

    /// Internal lock poisoning.
    #[error("broker state poisoned")]
    Poisoned,
}

impl BusFailure for InMemoryBusError {
    fn is_transient(&self) -> bool {
        matches!(self, InMemoryBusError::Unavailable)
    }

    fn fenced_by(&self) -> Option<u64> {
        match self {
            InMemoryBusError::Fenced { high_water, .. } => Some(*high_water),
            _ => None,
        }
    }
}

/// A record parked on the dead-letter channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetter {
    pub group: String,
    pub position: LogPosition,
    pub reason: String,
    pub payload: Vec<u8>,
}

#[derive(Debug)]
struct Record {
    key: String,
    payload: Vec<u8>,
}

/// Highest fenced append of one key.
#[derive(Debug, Clone, Copy)]
struct Fence {
    sequence: u64,
    offset: usize,
}

#[derive(Debug)]
struct Pending {
    consumer: String,
    delivered_at: Instant,
}

#[derive(Debug, Default)]
struct GroupState {
    /// Next offset never handed to any consumer of this group.
    next: usize,
    /// Delivered but not committed, by offset.
    pending: BTreeMap<usize, Pending>,
}

#[derive(Debug)]
struct LogState {
    records: Vec<Record>,
    fences: HashMap<String, Fence>,
    groups: HashMap<String, GroupState>,
    dead_letters: Vec<DeadLetter>,
    available: bool,
    failing_publishes: u32,
    lost_acks: u32,
    claim_idle: Duration,
}

#[derive(Debug)]
struct Shared {
    state: Mutex<LogState>,
    appended: Condvar,
}

impl Shared {
    fn lock(&self) -> Result<MutexGuard<'_, LogState>, InMemoryBusError> {
        self.state.lock().map_err(|_| InMemoryBusError::Poisoned)
    }
}

/// In-memory log. Cloning yields another handle to the same log.
#[derive(Debug, Clone)]
pub struct InMemoryEventLog {
    shared: Arc<Shared>,
}

impl Default for InMemoryEventLog {
    fn default() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(LogState {
                    records: Vec::new(),
                    fences: HashMap::new(),
                    groups: HashMap::new(),
                    dead_letters: Vec::new(),
                    available: true,
                    failing_publishes: 0,
                    lost_acks: 0,
                    claim_idle: DEFAULT_CLAIM_IDLE,
                }),
                appended: Condvar::new(),
            }),
        }
    }
}

impl InMemoryEventLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Toggle availability; while unavailable every call fails with `Unavailable`.
    pub fn set_available(&self, available: bool) {
        if let Ok(mut state) = self.shared.lock() {
            state.available = available;
        }
        self.shared.appended.notify_all();
    }

    /// Make the next `n` publishes fail with `Unavailable` before appending.
    pub fn fail_next_publishes(&self, n: u32) {
        if let Ok(mut state) = self.shared.lock() {
            state.failing_publishes = n;
        }
    }

    /// Make the next `n` publishes append their record, then fail with
    /// `Unavailable` as if the ack was lost on the way back.
    pub fn lose_next_acks(&self, n: u32) {
        if let Ok(mut state) = self.shared.lock() {
            state.lost_acks = n;
        }
    }

    /// Idle time after which a pending delivery may be claimed by another
    /// consumer of its group.
    pub fn set_claim_idle(&self, idle: Duration) {
        if let Ok(mut state) = self.shared.lock() {
            state.claim_idle = idle;
        }
    }

    /// Append without fencing, the way a producer that ignores sequences (or
    /// a broker redelivering an old record) would. Consumers must cope with
    /// whatever this writes.
    pub fn append_unfenced(&self, key: &str, payload: &[u8]) -> Result<Ack, InMemoryBusError> {
        let mut state = self.shared.lock()?;
        let offset = state.append(key, payload);
        drop(state);

        self.shared.appended.notify_all();
        Ok(Ack {
            position: LogPosition::new(offset.to_string()),
        })
    }

    /// Number of records in the log.
    pub fn len(&self) -> usize {
        self.shared.lock().map(|s| s.records.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ordering keys of all records, in log order.
    pub fn keys(&self) -> Vec<String> {
        self.shared
            .lock()
            .map(|s| s.records.iter().map(|r| r.key.clone()).collect())
            .unwrap_or_default()
    }

    /// Raw payload at `offset`.
    pub fn payload_at(&self, offset: usize) -> Option<Vec<u8>> {
        let state = self.shared.lock().ok()?;
        state.records.get(offset).map(|r| r.payload.clone())
    }

    /// Deliveries of `group` that were handed out but not committed.
    pub fn pending_count(&self, group: &str) -> usize {
        self.shared
            .lock()
            .ok()
            .and_then(|s| s.groups.get(group).map(|g| g.pending.len()))
            .unwrap_or(0)
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.shared
            .lock()
            .map(|s| s.dead_letters.clone())
            .unwrap_or_default()
    }
}

impl LogState {
    fn append(&mut self, key: &str, payload: &[u8]) -> usize {
        let offset = self.records.len();
        self.records.push(Record {
            key: key.to_string(),
            payload: payload.to_vec(),
        });
        offset
    }
}

fn parse_offset(position: &LogPosition) -> Result<usize, InMemoryBusError> {
    position
        .as_str()
        .parse::<usize>()
        .map_err(|_| InMemoryBusError::UnknownPosition(position.to_string()))
}

impl EventBus for InMemoryEventLog {
    type Error = InMemoryBusError;

    fn publish(
        &self,
        key: &str,
        sequence: u64,
        payload: &[u8],
        _timeout: Option<Duration>,
    ) -> Result<Ack, Self::Error> {
        let mut state = self.shared.lock()?;
        if !state.available {
            return Err(InMemoryBusError::Unavailable);
        }
        if state.failing_publishes > 0 {
            state.failing_publishes -= 1;
            return Err(InMemoryBusError::Unavailable);
        }

        if let Some(fence) = state.fences.get(key).copied() {
            if sequence == fence.sequence && state.records[fence.offset].payload == payload {
                return Ok(Ack {
                    position: LogPosition::new(fence.offset.to_string()),
                });
            }
            if sequence <= fence.sequence {
                return Err(InMemoryBusError::Fenced {
                    key: key.to_string(),
                    high_water: fence.sequence,
                });
            }
        }

        let offset = state.append(key, payload);
        state.fences.insert(key.to_string(), Fence { sequence, offset });
        let ack_lost = state.lost_acks > 0;
        if ack_lost {
            state.lost_acks -= 1;
        }
        drop(state);

        self.shared.appended.notify_all();
        if ack_lost {
            return Err(InMemoryBusError::Unavailable);
        }
        Ok(Ack {
            position: LogPosition::new(offset.to_string()),
        })
    }
}

impl EventSource for InMemoryEventLog {
    type Error = InMemoryBusError;
    type Session = InMemorySession;

    fn connect(&self, group: &str, consumer: &str) -> Result<Self::Session, Self::Error> {
        let mut state = self.shared.lock()?;
        if !state.available {
            return Err(InMemoryBusError::Unavailable);
        }
        state.groups.entry(group.to_string()).or_default();

        Ok(InMemorySession {
            shared: self.shared.clone(),
            group: group.to_string(),
            consumer: consumer.to_string(),
            recover_from: Some(0),
        })
    }
}

/// Session of one consumer in one group.
#[derive(Debug)]
pub struct InMemorySession {
    shared: Arc<Shared>,
    group: String,
    consumer: String,
    /// While set, polls replay this consumer's pending deliveries from this offset.
    recover_from: Option<usize>,
}

impl InMemorySession {
    fn take_pending(&mut self, state: &LogState, max: usize) -> Vec<Delivery> {
        let Some(from) = self.recover_from else {
            return Vec::new();
        };
        let Some(group) = state.groups.get(&self.group) else {
            return Vec::new();
        };

        let batch: Vec<Delivery> = group
            .pending
            .range(from..)
            .filter(|(_, pending)| pending.consumer == self.consumer)
            .take(max)
            .map(|(offset, _)| Delivery {
                position: LogPosition::new(offset.to_string()),
                payload: state.records[*offset].payload.clone(),
                redelivered: true,
            })
            .collect();

        self.recover_from = match batch.last() {
            Some(last) => parse_offset(&last.position).ok().map(|o| o + 1),
            None => None,
        };
        batch
    }

    /// Take over deliveries other consumers left pending for too long.
    fn claim_idle(&self, state: &mut LogState, max: usize) -> Vec<Delivery> {
        let LogState {
            records,
            groups,
            claim_idle,
            ..
        } = state;
        let Some(group) = groups.get_mut(&self.group) else {
            return Vec::new();
        };

        let now = Instant::now();
        group
            .pending
            .iter_mut()
            .filter(|(_, pending)| {
                pending.consumer != self.consumer
                    && now.duration_since(pending.delivered_at) >= *claim_idle
            })
            .take(max)
            .map(|(offset, pending)| {
                pending.consumer = self.consumer.clone();
                pending.delivered_at = now;
                Delivery {
                    position: LogPosition::new(offset.to_string()),
                    payload: records[*offset].payload.clone(),
                    redelivered: true,
                }
            })
            .collect()
    }

    fn take_new(&self, state: &mut LogState, max: usize) -> Vec<Delivery> {
        let LogState { records, groups, .. } = state;
        let Some(group) = groups.get_mut(&self.group) else {
            return Vec::new();
        };

        let now = Instant::now();
        let end = records.len().min(group.next + max);
        let batch = (group.next..end)
            .map(|offset| {
                group.pending.insert(
                    offset,
                    Pending {
                        consumer: self.consumer.clone(),
                        delivered_at: now,
                    },
                );
                Delivery {
                    position: LogPosition::new(offset.to_string()),
                    payload: records[offset].payload.clone(),
                    redelivered: false,
                }
            })
            .collect();
        group.next = end;
        batch
    }
}

impl ConsumerSession for InMemorySession {
    type Error = InMemoryBusError;

    fn poll(&mut self, max: usize, wait: Duration) -> Result<Vec<Delivery>, Self::Error> {
        let deadline = Instant::now() + wait;
        let shared = self.shared.clone();
        let mut state = shared.lock()?;

        loop {
            if !state.available {
                return Err(InMemoryBusError::Unavailable);
            }

            let recovered = self.take_pending(&state, max);
            if !recovered.is_empty() {
                return Ok(recovered);
            }

            let claimed = self.claim_idle(&mut state, max);
            if !claimed.is_empty() {
                return Ok(claimed);
            }

            let fresh = self.take_new(&mut state, max);
            if !fresh.is_empty() {
                return Ok(fresh);
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            let (guard, _) = shared
                .appended
                .wait_timeout(state, deadline - now)
                .map_err(|_| InMemoryBusError::Poisoned)?;
            state = guard;
        }
    }

    fn commit(&mut self, position: &LogPosition) -> Result<(), Self::Error> {
        let offset = parse_offset(position)?;
        let mut state = self.shared.lock()?;
        if !state.available {
            return Err(InMemoryBusError::Unavailable);
        }
        if offset >= state.records.len() {
            return Err(InMemoryBusError::UnknownPosition(position.to_string()));
        }
        if let Some(group) = state.groups.get_mut(&self.group) {
            group.pending.remove(&offset);
        }
        Ok(())
    }

    fn dead_letter(&mut self, delivery: &Delivery, reason: &str) -> Result<(), Self::Error> {
        let mut state = self.shared.lock()?;
        if !state.available {
            return Err(InMemoryBusError::Unavailable);
        }
        state.dead_letters.push(DeadLetter {
            group: self.group.clone(),
            position: delivery.position.clone(),
            reason: reason.to_string(),
            payload: delivery.payload.clone(),
        });
        Ok(())
    }
}
