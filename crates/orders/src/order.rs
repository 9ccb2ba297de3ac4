use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use orderflow_core::{AggregateId, DomainError};
use orderflow_events::{Command, CommandHandler, Event, EventRegistry};

/// Event type name of [`OrderCreated`] on the wire.
pub const ORDER_CREATED: &str = "order.created";

/// Every event type the orders domain produces.
pub fn registry() -> EventRegistry {
    EventRegistry::from_types([ORDER_CREATED])
}

/// An order as accepted by the command side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub id: AggregateId,
    pub customer: String,
    pub created_at: DateTime<Utc>,
}

impl From<&OrderCreated> for Order {
    fn from(e: &OrderCreated) -> Self {
        Self {
            id: e.order_id.clone(),
            customer: e.customer.clone(),
            created_at: e.created_at,
        }
    }
}

/// Command: CreateOrder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateOrder {
    pub order_id: AggregateId,
    pub customer: String,
    pub occurred_at: DateTime<Utc>,
}

impl Command for CreateOrder {
    fn target_aggregate_id(&self) -> &AggregateId {
        &self.order_id
    }
}

/// Event: OrderCreated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderCreated {
    pub order_id: AggregateId,
    pub customer: String,
    pub created_at: DateTime<Utc>,
}

/// Events of the order aggregate.
///
/// New event types (including a future tombstone) are added here and to
/// [`registry`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OrderEvent {
    OrderCreated(OrderCreated),
}

impl OrderEvent {
    pub fn order_id(&self) -> &AggregateId {
        match self {
            OrderEvent::OrderCreated(e) => &e.order_id,
        }
    }
}

impl Event for OrderEvent {
    fn event_type(&self) -> &'static str {
        match self {
            OrderEvent::OrderCreated(_) => ORDER_CREATED,
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            OrderEvent::OrderCreated(e) => e.created_at,
        }
    }
}

/// Validates order commands and describes the resulting events.
#[derive(Debug, Clone, Copy, Default)]
pub struct OrderCommandHandler;

impl CommandHandler for OrderCommandHandler {
    type Cmd = CreateOrder;
    type Ev = OrderEvent;
    type Error = DomainError;

    fn handle(&self, command: CreateOrder) -> Result<Vec<OrderEvent>, DomainError> {
        let customer = command.customer.trim();
        if customer.is_empty() {
            return Err(DomainError::validation("customer must not be blank"));
        }

        Ok(vec![OrderEvent::OrderCreated(OrderCreated {
            order_id: command.order_id,
            customer: customer.to_string(),
            created_at: command.occurred_at,
        })])
    }
}
