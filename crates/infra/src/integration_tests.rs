//! Integration tests for the full pipeline.
//!
//! Tests: Command → Publisher → Log → Applier → Store → ReadGateway
//!
//! Verifies:
//! - Accepted commands become visible on the read side
//! - Per-aggregate order holds even with parallel apply lanes
//! - Redelivery after a crash is harmless
//! - Stale envelopes never overwrite newer state
//! - Producers with skewed clocks cannot lose a later write
//! - Another consumer takes over what a crashed one left pending

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, Instant};

    use chrono::Utc;
    use serde_json::Value as JsonValue;

    use orderflow_core::AggregateId;
    use orderflow_events::{
        CommandHandler, ConsumerSession, EventEnvelope, EventSource, InMemoryEventLog,
        ProjectionRunner, SequenceClock,
    };
    use orderflow_orders::{registry, CreateOrder, OrderCommandHandler, OrderCreated, OrderEvent};

    use crate::projections::{MaterializedView, OrderView, OrdersProjection};
    use crate::publisher::Publisher;
    use crate::read_model::{InMemoryProjectionStore, ReadGateway};
    use crate::retry::RetryPolicy;
    use crate::workers::{Applier, ApplierConfig, ApplierHandle};

    type Store = Arc<InMemoryProjectionStore<AggregateId, OrderView>>;

    const GROUP: &str = "pipeline";

    struct Pipeline {
        log: InMemoryEventLog,
        publisher: Publisher<InMemoryEventLog>,
        gateway: ReadGateway<Store, OrderView>,
        view: Arc<MaterializedView<OrdersProjection, Store>>,
    }

    fn id(s: &str) -> AggregateId {
        AggregateId::parse(s).unwrap()
    }

    fn config(consumer: &str, parallelism: usize) -> ApplierConfig {
        ApplierConfig {
            group: GROUP.to_string(),
            consumer: consumer.to_string(),
            batch_size: 64,
            poll_timeout: Duration::from_millis(20),
            backoff: RetryPolicy::fixed(u32::MAX, Duration::from_millis(5)),
            degraded_after: 3,
            parallelism,
        }
    }

    fn setup() -> Pipeline {
        let log = InMemoryEventLog::new();
        let store: Store = Arc::new(InMemoryProjectionStore::new());
        Pipeline {
            publisher: Publisher::new(log.clone(), registry(), RetryPolicy::no_retry()),
            gateway: ReadGateway::new(store.clone()),
            view: Arc::new(MaterializedView::new(OrdersProjection, store)),
            log,
        }
    }

    impl Pipeline {
        fn start(&self, consumer: &str, parallelism: usize) -> ApplierHandle {
            Applier::new(
                self.log.clone(),
                self.view.clone(),
                registry(),
                config(consumer, parallelism),
            )
            .spawn(format!("applier-{consumer}"))
            .unwrap()
        }

        fn create(&self, order: &str, customer: &str) {
            let command = CreateOrder {
                order_id: id(order),
                customer: customer.to_string(),
                occurred_at: Utc::now(),
            };
            for event in OrderCommandHandler.handle(command).unwrap() {
                self.publisher.publish(event.order_id(), &event).unwrap();
            }
        }

        fn seal(&self, order: &str, customer: &str, sequence: u64) -> EventEnvelope<JsonValue> {
            let event = OrderEvent::OrderCreated(OrderCreated {
                order_id: id(order),
                customer: customer.to_string(),
                created_at: Utc::now(),
            });
            EventEnvelope::seal(&registry(), id(order), sequence, &event).unwrap()
        }

        /// Append bytes the way a broker redelivery or a non-fencing producer
        /// would put them on the log.
        fn append_unfenced(&self, envelope: &EventEnvelope<JsonValue>) {
            let bytes = envelope.to_bytes().unwrap();
            self.log
                .append_unfenced(envelope.aggregate_id().as_str(), &bytes)
                .unwrap();
        }
    }

    fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        cond()
    }

    #[test]
    fn created_orders_become_visible() {
        let p = setup();
        let handle = p.start("c1", 4);

        p.create("o2", "bob");
        p.create("o1", " alice ");

        assert!(wait_until(Duration::from_secs(5), || p.gateway.list_all().len() == 2));
        let all = p.gateway.list_all();
        assert_eq!(all[0].id.as_str(), "o1");
        assert_eq!(all[0].customer, "alice");
        assert_eq!(all[1].id.as_str(), "o2");
        assert_eq!(p.gateway.get_one(&id("o2")).unwrap().customer, "bob");

        assert!(wait_until(Duration::from_secs(5), || p.log.pending_count(GROUP) == 0));
        handle.shutdown();
    }

    #[test]
    fn parallel_lanes_match_the_sequential_reference() {
        let p = setup();

        // Interleave many updates over a handful of aggregates.
        let mut envelopes = Vec::new();
        for round in 0..40u64 {
            for agg in 0..7u64 {
                let sequence = round * 10 + agg + 1;
                envelopes.push(p.seal(&format!("agg-{agg}"), &format!("v{round}"), sequence));
            }
        }
        for env in &envelopes {
            p.publisher.publish_envelope(env).unwrap();
        }

        let handle = p.start("c1", 4);
        assert!(wait_until(Duration::from_secs(10), || {
            handle.health().snapshot().stats.applied == envelopes.len() as u64
        }));
        handle.shutdown();

        let mut reference = ProjectionRunner::new(OrdersProjection);
        let typed: Vec<EventEnvelope<OrderEvent>> = envelopes
            .iter()
            .map(|env| env.decode_payload().unwrap())
            .collect();
        reference.run(&typed);

        let expected: Vec<OrderView> = reference.into_records().into_values().collect();
        assert_eq!(p.gateway.list_all(), expected);
        assert!(expected.iter().all(|view| view.customer == "v39"));
    }

    #[test]
    fn stale_envelope_after_a_newer_one_is_ignored() {
        let p = setup();
        p.publisher.publish_envelope(&p.seal("o1", "newer", 200)).unwrap();
        p.append_unfenced(&p.seal("o1", "older", 100));

        let handle = p.start("c1", 2);
        assert!(wait_until(Duration::from_secs(5), || {
            let stats = handle.health().snapshot().stats;
            stats.applied + stats.duplicates == 2
        }));
        let stats = handle.health().snapshot().stats;
        handle.shutdown();

        assert_eq!(stats.applied, 1);
        assert_eq!(stats.duplicates, 1);
        let view = p.gateway.get_one(&id("o1")).unwrap();
        assert_eq!(view.customer, "newer");
        assert_eq!(view.last_applied_sequence, 200);
    }

    #[test]
    fn uncommitted_deliveries_are_replayed_after_a_crash() {
        let p = setup();
        p.create("o1", "alice");
        p.create("o2", "bob");

        // A consumer takes the records and dies before committing.
        {
            let mut session = p.log.connect(GROUP, "c1").unwrap();
            let taken = session.poll(10, Duration::from_millis(50)).unwrap();
            assert_eq!(taken.len(), 2);
        }
        assert_eq!(p.log.pending_count(GROUP), 2);

        let handle = p.start("c1", 4);
        assert!(wait_until(Duration::from_secs(5), || p.gateway.list_all().len() == 2));
        assert!(wait_until(Duration::from_secs(5), || p.log.pending_count(GROUP) == 0));
        handle.shutdown();
    }

    #[test]
    fn redelivered_envelopes_after_apply_are_duplicates() {
        let p = setup();
        p.create("o1", "alice");

        let handle = p.start("c1", 1);
        assert!(wait_until(Duration::from_secs(5), || p.gateway.get_one(&id("o1")).is_some()));
        handle.shutdown();
        let before = p.gateway.get_one(&id("o1"));

        // Republish the exact bytes, as a broker redelivery would.
        let bytes = p.log.payload_at(0).unwrap();
        let env = EventEnvelope::from_bytes(&bytes, &registry()).unwrap();
        p.append_unfenced(&env);

        let handle = p.start("c1", 1);
        assert!(wait_until(Duration::from_secs(5), || {
            handle.health().snapshot().stats.duplicates == 1
        }));
        handle.shutdown();
        assert_eq!(p.gateway.get_one(&id("o1")), before);
    }

    #[test]
    fn producers_with_skewed_clocks_keep_the_latest_write() {
        let p = setup();
        let ahead = SequenceClock::new().next() + 5_000_000;
        let skewed = Publisher::new(p.log.clone(), registry(), RetryPolicy::fixed(3, Duration::ZERO))
            .with_clock(SequenceClock::starting_after(ahead));
        let behind = Publisher::new(p.log.clone(), registry(), RetryPolicy::fixed(3, Duration::ZERO));

        let created = |customer: &str| {
            OrderEvent::OrderCreated(OrderCreated {
                order_id: id("o1"),
                customer: customer.to_string(),
                created_at: Utc::now(),
            })
        };
        skewed.publish(&id("o1"), &created("alice")).unwrap();
        behind.publish(&id("o1"), &created("bob")).unwrap();

        let handle = p.start("c1", 2);
        assert!(wait_until(Duration::from_secs(5), || {
            handle.health().snapshot().stats.applied == 2
        }));
        let stats = handle.health().snapshot().stats;
        handle.shutdown();

        assert_eq!(stats.duplicates, 0);
        let view = p.gateway.get_one(&id("o1")).unwrap();
        assert_eq!(view.customer, "bob");
        assert!(view.last_applied_sequence > ahead);
    }

    #[test]
    fn another_consumer_recovers_deliveries_of_a_crashed_one() {
        let p = setup();
        p.create("o1", "alice");
        p.create("o2", "bob");

        {
            let mut session = p.log.connect(GROUP, "crashed").unwrap();
            let taken = session.poll(10, Duration::from_millis(50)).unwrap();
            assert_eq!(taken.len(), 2);
        }
        p.log.set_claim_idle(Duration::ZERO);

        let handle = p.start("rescuer", 2);
        assert!(wait_until(Duration::from_secs(5), || p.gateway.list_all().len() == 2));
        assert!(wait_until(Duration::from_secs(5), || p.log.pending_count(GROUP) == 0));
        let stats = handle.health().snapshot().stats;
        handle.shutdown();

        assert_eq!(stats.applied, 2);
        assert_eq!(p.gateway.get_one(&id("o2")).unwrap().customer, "bob");
    }

    #[test]
    fn readers_are_never_blocked_by_the_applier() {
        let p = setup();
        let handle = p.start("c1", 4);

        let writer = {
            let publisher = Publisher::new(p.log.clone(), registry(), RetryPolicy::no_retry());
            thread::spawn(move || {
                for i in 0..300 {
                    let order = format!("o{}", i % 30);
                    let event = OrderEvent::OrderCreated(OrderCreated {
                        order_id: id(&order),
                        customer: format!("c{i}"),
                        created_at: Utc::now(),
                    });
                    publisher.publish(&id(&order), &event).unwrap();
                }
            })
        };

        // Every read sees complete records while writes are in flight.
        let started = Instant::now();
        while started.elapsed() < Duration::from_millis(200) {
            for view in p.gateway.list_all() {
                assert!(view.customer.starts_with('c'));
                assert!(view.last_applied_sequence > 0);
            }
        }

        writer.join().unwrap();
        assert!(wait_until(Duration::from_secs(10), || {
            handle.health().snapshot().stats.applied == 300
        }));
        handle.shutdown();
        assert_eq!(p.gateway.list_all().len(), 30);
    }
}
