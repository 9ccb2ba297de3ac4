//! Projection implementations (read model builders).
//!
//! Projections consume envelopes from the log and build query-optimized read
//! models. All of them are:
//! - **Rebuildable**: replaying the log reproduces the same records
//! - **Idempotent**: safe under at-least-once delivery
//! - **Order-guarded**: stale envelopes never overwrite newer state

pub mod orders;

use serde_json::Value as JsonValue;
use thiserror::Error;

use orderflow_core::AggregateId;
use orderflow_events::{guarded_evolve, ApplyOutcome, EnvelopeError, EventEnvelope, Projection};

use crate::read_model::{ProjectionStore, StoreError};

pub use orders::{OrderView, OrdersProjection};

#[derive(Debug, Error)]
pub enum ApplyError {
    /// The envelope can never be applied; it must be dead-lettered.
    #[error("poison message: {0}")]
    Poison(String),

    /// The store refused the write; the envelope must be redelivered.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<EnvelopeError> for ApplyError {
    fn from(e: EnvelopeError) -> Self {
        ApplyError::Poison(e.to_string())
    }
}

impl ApplyError {
    pub fn is_poison(&self) -> bool {
        matches!(self, ApplyError::Poison(_))
    }
}

/// A projection bound to the store that holds its records.
///
/// `apply_envelope` decodes the payload and folds it into the store behind the
/// idempotence guard, inside the store's per-aggregate critical section.
#[derive(Debug)]
pub struct MaterializedView<P, S> {
    projection: P,
    store: S,
}

impl<P, S> MaterializedView<P, S>
where
    P: Projection,
    S: ProjectionStore<AggregateId, P::Record>,
{
    pub fn new(projection: P, store: S) -> Self {
        Self { projection, store }
    }

    pub fn projection(&self) -> &P {
        &self.projection
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn apply_envelope(
        &self,
        envelope: &EventEnvelope<JsonValue>,
    ) -> Result<ApplyOutcome, ApplyError> {
        let typed = envelope.decode_payload::<P::Ev>()?;
        self.projection.validate(&typed).map_err(ApplyError::Poison)?;

        let outcome = self
            .store
            .upsert(typed.aggregate_id().clone(), |current| {
                guarded_evolve(&self.projection, current, &typed)
            })?;
        Ok(outcome)
    }
}
