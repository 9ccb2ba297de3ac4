use serde::de::DeserializeOwned;

use crate::{Event, EventEnvelope};

/// Result of folding one envelope into the current record of an aggregate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation<R> {
    /// Replace (or create) the record.
    Put(R),
    /// Drop the record from the read model (tombstone event types).
    ///
    /// The store keeps a tombstone at `sequence`, so an older envelope
    /// redelivered afterwards is still recognised as stale.
    Remove { sequence: u64 },
    /// Leave the record untouched.
    Keep,
}

/// What the store holds for an aggregate when a mutator runs.
#[derive(Debug, PartialEq, Eq)]
pub enum Current<'a, R> {
    /// Never written.
    Vacant,
    Live(&'a R),
    /// Removed by the envelope at `sequence`; invisible to readers.
    Removed { sequence: u64 },
}

impl<R> Clone for Current<'_, R> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<R> Copy for Current<'_, R> {}

impl<'a, R> Current<'a, R> {
    /// The live record, if any.
    pub fn record(self) -> Option<&'a R> {
        match self {
            Current::Live(record) => Some(record),
            Current::Vacant | Current::Removed { .. } => None,
        }
    }
}

impl<'a, R> From<Option<&'a R>> for Current<'a, R> {
    fn from(record: Option<&'a R>) -> Self {
        record.map_or(Current::Vacant, Current::Live)
    }
}

/// A projection builds a read model from an append-only event stream.
///
/// Projections implement the **CQRS read model pattern**: they transform events
/// (write side) into denormalized records (read side), one record per
/// aggregate.
///
/// ## Ordering and idempotency
///
/// Implementations do not check ordering themselves: [`crate::guarded_evolve`]
/// only calls [`Projection::evolve`] for envelopes strictly newer than the
/// record's [`Projection::last_applied_sequence`]. What `evolve` must do is
/// stamp the envelope's `sequence()` into the record it returns (or into
/// `Mutation::Remove`), otherwise the guard cannot recognise a redelivery.
///
/// ## Purity
///
/// `evolve` runs inside the store's per-aggregate critical section. It must be
/// deterministic and must not perform IO.
pub trait Projection: Send + Sync {
    type Ev: Event + DeserializeOwned;
    type Record: Clone + Send + Sync + 'static;

    /// Stable name, used in logs.
    fn name(&self) -> &'static str;

    /// Sequence of the last envelope folded into `record`.
    fn last_applied_sequence(record: &Self::Record) -> u64;

    /// Reject envelopes that can never be applied, whatever the current record.
    ///
    /// An error here marks the envelope as a poison message.
    fn validate(&self, envelope: &EventEnvelope<Self::Ev>) -> Result<(), String> {
        let _ = envelope;
        Ok(())
    }

    /// Fold one envelope into the current record.
    ///
    /// `None` means a fresh aggregate, including one whose record was removed
    /// by an older envelope.
    fn evolve(
        &self,
        current: Option<&Self::Record>,
        envelope: &EventEnvelope<Self::Ev>,
    ) -> Mutation<Self::Record>;
}
