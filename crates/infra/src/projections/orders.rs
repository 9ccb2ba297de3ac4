use chrono::{DateTime, Utc};
use serde::Serialize;

use orderflow_core::AggregateId;
use orderflow_events::{EventEnvelope, Mutation, Projection};
use orderflow_orders::OrderEvent;

/// Query-side view of one order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OrderView {
    pub id: AggregateId,
    pub customer: String,
    pub created_at: DateTime<Utc>,
    /// Sequence of the envelope that produced this view; never served.
    #[serde(skip)]
    pub last_applied_sequence: u64,
}

/// Builds [`OrderView`] records from order events.
#[derive(Debug, Clone, Copy, Default)]
pub struct OrdersProjection;

impl Projection for OrdersProjection {
    type Ev = OrderEvent;
    type Record = OrderView;

    fn name(&self) -> &'static str {
        "orders.view"
    }

    fn last_applied_sequence(record: &OrderView) -> u64 {
        record.last_applied_sequence
    }

    fn validate(&self, envelope: &EventEnvelope<OrderEvent>) -> Result<(), String> {
        let order_id = envelope.payload().order_id();
        if order_id != envelope.aggregate_id() {
            return Err(format!(
                "payload order {order_id} does not match aggregate {}",
                envelope.aggregate_id()
            ));
        }
        Ok(())
    }

    fn evolve(
        &self,
        _current: Option<&OrderView>,
        envelope: &EventEnvelope<OrderEvent>,
    ) -> Mutation<OrderView> {
        match envelope.payload() {
            OrderEvent::OrderCreated(e) => Mutation::Put(OrderView {
                id: e.order_id.clone(),
                customer: e.customer.clone(),
                created_at: e.created_at,
                last_applied_sequence: envelope.sequence(),
            }),
        }
    }
}
