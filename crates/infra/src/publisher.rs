//! Command-side publisher: seals events into envelopes and hands them to the
//! log, retrying transient broker failures.

use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, instrument, warn};

use orderflow_core::AggregateId;
use orderflow_events::{
    Ack, BusFailure, EnvelopeError, Event, EventBus, EventEnvelope, EventRegistry, SequenceClock,
};

use crate::retry::RetryPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishErrorKind {
    /// The event could not be turned into an envelope; retrying cannot help.
    Invalid,
    /// The broker refused the record with a non-transient error.
    Rejected,
    /// The broker stayed unavailable for the whole retry budget.
    Unavailable,
}

#[derive(Debug, Error)]
#[error("publish failed ({kind:?}) after {attempts} attempt(s): {message}")]
pub struct PublishError {
    pub kind: PublishErrorKind,
    pub attempts: u32,
    pub message: String,
}

impl PublishError {
    fn new(kind: PublishErrorKind, attempts: u32, message: impl Into<String>) -> Self {
        Self {
            kind,
            attempts,
            message: message.into(),
        }
    }

    pub fn is_unavailable(&self) -> bool {
        self.kind == PublishErrorKind::Unavailable
    }
}

impl From<EnvelopeError> for PublishError {
    fn from(e: EnvelopeError) -> Self {
        PublishError::new(PublishErrorKind::Invalid, 0, e.to_string())
    }
}

/// Publishes domain events for the command service.
///
/// `publish` returns only after the log acknowledged the record. The envelope
/// is sealed once, before the first attempt: a retry after an ambiguous
/// failure republishes the very same bytes, which the log acknowledges without
/// appending twice.
///
/// The log fences every append at or below the highest sequence it holds for
/// the key. When a fence is hit (another producer's clock ran ahead of ours),
/// the clock is moved past the reported high water and the envelope is
/// resealed, so a later publish always carries the larger sequence.
#[derive(Debug)]
pub struct Publisher<B> {
    bus: B,
    registry: EventRegistry,
    retry: RetryPolicy,
    clock: SequenceClock,
}

impl<B> Publisher<B>
where
    B: EventBus,
{
    pub fn new(bus: B, registry: EventRegistry, retry: RetryPolicy) -> Self {
        Self {
            bus,
            registry,
            retry,
            clock: SequenceClock::new(),
        }
    }

    /// Replace the sequence source, e.g. with
    /// [`SequenceClock::starting_after`] for a producer resuming after a known
    /// sequence.
    pub fn with_clock(mut self, clock: SequenceClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn registry(&self) -> &EventRegistry {
        &self.registry
    }

    /// Seal `event` for `aggregate_id` and publish it.
    #[instrument(
        skip(self, event),
        fields(aggregate_id = %aggregate_id, event_type = event.event_type()),
        err
    )]
    pub fn publish<E>(&self, aggregate_id: &AggregateId, event: &E) -> Result<Ack, PublishError>
    where
        E: Event + Serialize,
    {
        let envelope =
            EventEnvelope::seal(&self.registry, aggregate_id.clone(), self.clock.next(), event)?;
        self.send(envelope, true)
    }

    /// Publish an already sealed envelope unchanged.
    ///
    /// A fenced sequence is reported as `Rejected`; the envelope is never
    /// resealed.
    pub fn publish_envelope(&self, envelope: &EventEnvelope<JsonValue>) -> Result<Ack, PublishError> {
        self.send(envelope.clone(), false)
    }

    /// What is left of the overall publish budget, if there is one.
    fn remaining(&self, started: Instant) -> Option<Duration> {
        self.retry
            .timeout
            .map(|budget| budget.saturating_sub(started.elapsed()))
    }

    fn send(
        &self,
        mut envelope: EventEnvelope<JsonValue>,
        reseal_when_fenced: bool,
    ) -> Result<Ack, PublishError> {
        let mut bytes = envelope.to_bytes()?;
        let started = Instant::now();
        let mut attempt: u32 = 0;

        loop {
            let remaining = self.remaining(started);
            if remaining == Some(Duration::ZERO) {
                return Err(PublishError::new(
                    PublishErrorKind::Unavailable,
                    attempt,
                    "publish budget exhausted",
                ));
            }

            attempt += 1;
            let key = envelope.aggregate_id().as_str();
            let err = match self.bus.publish(key, envelope.sequence(), &bytes, remaining) {
                Ok(ack) => {
                    debug!(
                        position = %ack.position,
                        sequence = envelope.sequence(),
                        occurred_at = %envelope.occurred_at(),
                        attempt,
                        "envelope published"
                    );
                    return Ok(ack);
                }
                Err(err) => err,
            };

            if let Some(high_water) = err.fenced_by() {
                if !reseal_when_fenced || !self.retry.should_retry(attempt) {
                    return Err(PublishError::new(
                        PublishErrorKind::Rejected,
                        attempt,
                        err.to_string(),
                    ));
                }
                self.clock.observe(high_water);
                envelope = envelope.resequence(self.clock.next())?;
                bytes = envelope.to_bytes()?;
                debug!(
                    high_water,
                    sequence = envelope.sequence(),
                    attempt,
                    "sequence fenced, resealed"
                );
                continue;
            }

            if !err.is_transient() {
                return Err(PublishError::new(
                    PublishErrorKind::Rejected,
                    attempt,
                    err.to_string(),
                ));
            }
            if !self.retry.should_retry(attempt) {
                return Err(PublishError::new(
                    PublishErrorKind::Unavailable,
                    attempt,
                    err.to_string(),
                ));
            }

            let delay = self.retry.delay_for_attempt(attempt);
            if let Some(budget) = self.retry.timeout {
                if started.elapsed() + delay >= budget {
                    return Err(PublishError::new(
                        PublishErrorKind::Unavailable,
                        attempt,
                        format!("retry budget of {budget:?} exhausted: {err}"),
                    ));
                }
            }

            warn!(attempt, ?delay, error = %err, "publish failed, retrying");
            thread::sleep(delay);
        }
    }
}
