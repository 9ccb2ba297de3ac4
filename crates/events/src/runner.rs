//! The idempotence guard, plus a single-threaded runner built on it.
//!
//! Read models are **disposable**; events are the source of truth. The runner
//! here is the deterministic reference: folding the same envelopes through it
//! must give the same records as the concurrent applier does.

use std::collections::BTreeMap;

use orderflow_core::AggregateId;

use crate::{Current, EventEnvelope, Mutation, Projection};

/// What happened to one envelope.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The envelope was folded into the record.
    Applied { sequence: u64 },
    /// The envelope removed the record.
    Removed { sequence: u64 },
    /// Duplicate or stale redelivery; nothing changed.
    Skipped { last_applied: u64, found: u64 },
}

impl ApplyOutcome {
    pub fn is_skipped(&self) -> bool {
        matches!(self, ApplyOutcome::Skipped { .. })
    }
}

/// Fold `envelope` into `current` unless it is not newer than what is applied.
///
/// A tombstone counts as applied: an envelope at or below the sequence that
/// removed the record is skipped, a newer one starts a fresh record.
/// `Mutation::Keep` returned by the projection for a newer envelope is
/// reported as applied: the envelope was consumed, it just had no effect.
pub fn guarded_evolve<P>(
    projection: &P,
    current: Current<'_, P::Record>,
    envelope: &EventEnvelope<P::Ev>,
) -> (Mutation<P::Record>, ApplyOutcome)
where
    P: Projection,
{
    let last_applied = match current {
        Current::Vacant => 0,
        Current::Live(record) => P::last_applied_sequence(record),
        Current::Removed { sequence } => sequence,
    };
    let found = envelope.sequence();

    if found <= last_applied {
        return (Mutation::Keep, ApplyOutcome::Skipped { last_applied, found });
    }

    let mutation = projection.evolve(current.record(), envelope);
    match mutation {
        Mutation::Remove { sequence } => {
            debug_assert_eq!(sequence, found);
            (
                Mutation::Remove { sequence: found },
                ApplyOutcome::Removed { sequence: found },
            )
        }
        Mutation::Put(record) => {
            debug_assert_eq!(P::last_applied_sequence(&record), found);
            (Mutation::Put(record), ApplyOutcome::Applied { sequence: found })
        }
        Mutation::Keep => (Mutation::Keep, ApplyOutcome::Applied { sequence: found }),
    }
}

/// Runs envelopes through a projection into an owned, ordered map.
pub struct ProjectionRunner<P>
where
    P: Projection,
{
    projection: P,
    records: BTreeMap<AggregateId, P::Record>,
    tombstones: BTreeMap<AggregateId, u64>,
}

impl<P> ProjectionRunner<P>
where
    P: Projection,
{
    pub fn new(projection: P) -> Self {
        Self {
            projection,
            records: BTreeMap::new(),
            tombstones: BTreeMap::new(),
        }
    }

    pub fn projection(&self) -> &P {
        &self.projection
    }

    pub fn get(&self, aggregate_id: &AggregateId) -> Option<&P::Record> {
        self.records.get(aggregate_id)
    }

    /// Sequence of the envelope that removed `aggregate_id`, while it stays removed.
    pub fn tombstone(&self, aggregate_id: &AggregateId) -> Option<u64> {
        self.tombstones.get(aggregate_id).copied()
    }

    /// Live records only.
    pub fn records(&self) -> &BTreeMap<AggregateId, P::Record> {
        &self.records
    }

    pub fn into_records(self) -> BTreeMap<AggregateId, P::Record> {
        self.records
    }

    fn current(&self, key: &AggregateId) -> Current<'_, P::Record> {
        match (self.records.get(key), self.tombstones.get(key)) {
            (Some(record), _) => Current::Live(record),
            (None, Some(sequence)) => Current::Removed {
                sequence: *sequence,
            },
            (None, None) => Current::Vacant,
        }
    }

    /// Apply a single envelope behind the idempotence guard.
    pub fn apply(&mut self, envelope: &EventEnvelope<P::Ev>) -> ApplyOutcome {
        let key = envelope.aggregate_id();
        let (mutation, outcome) = guarded_evolve(&self.projection, self.current(key), envelope);

        match mutation {
            Mutation::Put(record) => {
                self.tombstones.remove(key);
                self.records.insert(key.clone(), record);
            }
            Mutation::Remove { sequence } => {
                self.records.remove(key);
                self.tombstones.insert(key.clone(), sequence);
            }
            Mutation::Keep => {}
        }
        outcome
    }

    /// Apply many envelopes in order.
    pub fn run<'a>(&mut self, envelopes: impl IntoIterator<Item = &'a EventEnvelope<P::Ev>>)
    where
        P::Ev: 'a,
    {
        for env in envelopes {
            self.apply(env);
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, Utc};
    use proptest::prelude::*;
    use serde::{Deserialize, Serialize};
    use serde_json::Value as JsonValue;

    use super::*;
    use crate::{Event, EventRegistry};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    #[serde(tag = "kind", rename_all = "snake_case")]
    enum CounterEvent {
        Set { value: i64 },
        Cleared,
    }

    impl Event for CounterEvent {
        fn event_type(&self) -> &'static str {
            match self {
                CounterEvent::Set { .. } => "counter.set",
                CounterEvent::Cleared => "counter.cleared",
            }
        }

        fn version(&self) -> u32 {
            1
        }

        fn occurred_at(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }

    #[derive(Debug, Clone, PartialEq)]
    struct Counter {
        value: i64,
        seq: u64,
    }

    struct CounterProjection;

    impl Projection for CounterProjection {
        type Ev = CounterEvent;
        type Record = Counter;

        fn name(&self) -> &'static str {
            "counter"
        }

        fn last_applied_sequence(record: &Counter) -> u64 {
            record.seq
        }

        fn evolve(
            &self,
            _current: Option<&Counter>,
            envelope: &EventEnvelope<CounterEvent>,
        ) -> Mutation<Counter> {
            match envelope.payload() {
                CounterEvent::Set { value } => Mutation::Put(Counter {
                    value: *value,
                    seq: envelope.sequence(),
                }),
                CounterEvent::Cleared => Mutation::Remove {
                    sequence: envelope.sequence(),
                },
            }
        }
    }

    fn env(id: &str, seq: u64, event: CounterEvent) -> EventEnvelope<CounterEvent> {
        let registry = EventRegistry::from_types(["counter.set", "counter.cleared"]);
        let raw: EventEnvelope<JsonValue> =
            EventEnvelope::seal(&registry, AggregateId::parse(id).unwrap(), seq, &event).unwrap();
        raw.decode_payload().unwrap()
    }

    fn set(id: &str, seq: u64, value: i64) -> EventEnvelope<CounterEvent> {
        env(id, seq, CounterEvent::Set { value })
    }

    #[test]
    fn duplicate_is_skipped() {
        let mut runner = ProjectionRunner::new(CounterProjection);
        let e = set("a", 10, 1);

        assert_eq!(runner.apply(&e), ApplyOutcome::Applied { sequence: 10 });
        let once = runner.records().clone();

        assert_eq!(
            runner.apply(&e),
            ApplyOutcome::Skipped {
                last_applied: 10,
                found: 10
            }
        );
        assert_eq!(runner.records(), &once);
    }

    #[test]
    fn older_envelope_after_newer_is_skipped() {
        let mut runner = ProjectionRunner::new(CounterProjection);
        runner.apply(&set("a", 20, 2));
        let outcome = runner.apply(&set("a", 10, 1));

        assert!(outcome.is_skipped());
        let id = AggregateId::parse("a").unwrap();
        assert_eq!(runner.get(&id), Some(&Counter { value: 2, seq: 20 }));
    }

    #[test]
    fn later_envelope_wins() {
        let mut runner = ProjectionRunner::new(CounterProjection);
        runner.run(&[set("a", 1, 1), set("a", 2, 2)]);

        let id = AggregateId::parse("a").unwrap();
        assert_eq!(runner.get(&id).map(|c| c.value), Some(2));
    }

    #[test]
    fn remove_drops_the_record() {
        let mut runner = ProjectionRunner::new(CounterProjection);
        runner.apply(&set("a", 1, 1));
        let outcome = runner.apply(&env("a", 2, CounterEvent::Cleared));

        assert_eq!(outcome, ApplyOutcome::Removed { sequence: 2 });
        assert!(runner.records().is_empty());
    }

    #[test]
    fn stale_redelivery_after_remove_stays_removed() {
        let mut runner = ProjectionRunner::new(CounterProjection);
        let created = set("a", 1, 7);
        runner.apply(&created);
        runner.apply(&env("a", 2, CounterEvent::Cleared));

        let outcome = runner.apply(&created);
        assert_eq!(
            outcome,
            ApplyOutcome::Skipped {
                last_applied: 2,
                found: 1
            }
        );
        assert!(runner.records().is_empty());

        let id = AggregateId::parse("a").unwrap();
        assert_eq!(runner.tombstone(&id), Some(2));
    }

    #[test]
    fn newer_envelope_after_remove_starts_a_fresh_record() {
        let mut runner = ProjectionRunner::new(CounterProjection);
        runner.run(&[
            set("a", 1, 7),
            env("a", 2, CounterEvent::Cleared),
            set("a", 3, 9),
        ]);

        let id = AggregateId::parse("a").unwrap();
        assert_eq!(runner.get(&id), Some(&Counter { value: 9, seq: 3 }));
        assert_eq!(runner.tombstone(&id), None);
    }

    #[test]
    fn aggregates_do_not_interfere() {
        let mut runner = ProjectionRunner::new(CounterProjection);
        runner.run(&[set("a", 5, 1), set("b", 1, 2)]);

        // "b" at sequence 1 is fresh for "b", even though "a" is at 5.
        assert_eq!(runner.records().len(), 2);
    }

    proptest! {
        // Whatever the delivery order and however many duplicates, the record
        // ends up holding the highest sequence seen for it.
        #[test]
        fn final_record_holds_highest_sequence(
            seqs in proptest::collection::vec(1u64..50, 1..40),
            repeats in 1usize..3,
        ) {
            let mut runner = ProjectionRunner::new(CounterProjection);
            for _ in 0..repeats {
                for s in &seqs {
                    runner.apply(&set("a", *s, *s as i64 * 10));
                }
            }

            let max = *seqs.iter().max().unwrap();
            let id = AggregateId::parse("a").unwrap();
            prop_assert_eq!(runner.get(&id), Some(&Counter { value: max as i64 * 10, seq: max }));
        }

        // Applying an in-order stream twice equals applying it once.
        #[test]
        fn replaying_an_ordered_stream_is_idempotent(
            values in proptest::collection::vec(any::<i64>(), 1..20),
        ) {
            let stream: Vec<_> = values
                .iter()
                .enumerate()
                .map(|(i, v)| set("a", i as u64 + 1, *v))
                .collect();

            let mut once = ProjectionRunner::new(CounterProjection);
            once.run(&stream);

            let mut twice = ProjectionRunner::new(CounterProjection);
            twice.run(&stream);
            twice.run(&stream);

            prop_assert_eq!(once.records(), twice.records());
        }
    }
}
