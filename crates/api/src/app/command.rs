//! Write-side services: validate a command, then publish its events.

use std::sync::Arc;

use thiserror::Error;

use orderflow_core::{AggregateId, DomainError};
use orderflow_events::{Ack, CommandHandler, InMemoryEventLog};
use orderflow_infra::{PublishError, Publisher, RetryPolicy};
use orderflow_orders::{registry, CreateOrder, Order, OrderCommandHandler, OrderEvent};

#[cfg(feature = "redis")]
use orderflow_infra::CommandServiceConfig;
#[cfg(feature = "redis")]
use orderflow_infra::event_bus::{RedisStreamsError, RedisStreamsEventBus};

#[derive(Debug, Error)]
pub enum CreateOrderError {
    #[error(transparent)]
    Validation(#[from] DomainError),

    #[error(transparent)]
    Publish(#[from] PublishError),
}

/// Publisher wiring per broker.
#[derive(Debug, Clone)]
pub enum CommandServices {
    InMemory {
        publisher: Arc<Publisher<InMemoryEventLog>>,
    },
    #[cfg(feature = "redis")]
    Redis {
        publisher: Arc<Publisher<RedisStreamsEventBus>>,
    },
}

impl CommandServices {
    /// In-memory log (dev/test).
    pub fn in_memory(log: InMemoryEventLog, retry: RetryPolicy) -> Self {
        CommandServices::InMemory {
            publisher: Arc::new(Publisher::new(log, registry(), retry)),
        }
    }

    /// Redis Streams log, from the service configuration.
    #[cfg(feature = "redis")]
    pub fn redis(config: &CommandServiceConfig) -> Result<Self, RedisStreamsError> {
        let bus = RedisStreamsEventBus::from_config(&config.broker)?;
        Ok(CommandServices::Redis {
            publisher: Arc::new(Publisher::new(bus, registry(), config.publish_retry.clone())),
        })
    }

    /// Validate and publish. Blocks for the publisher's whole retry budget, so
    /// async callers run it on the blocking pool.
    pub fn create_order(&self, command: CreateOrder) -> Result<Order, CreateOrderError> {
        let events = OrderCommandHandler.handle(command)?;

        let mut created = None;
        for event in &events {
            self.publish(event.order_id(), event)?;
            match event {
                OrderEvent::OrderCreated(e) => created = Some(Order::from(e)),
            }
        }

        created.ok_or_else(|| DomainError::validation("command produced no order").into())
    }

    fn publish(&self, aggregate_id: &AggregateId, event: &OrderEvent) -> Result<Ack, PublishError> {
        match self {
            CommandServices::InMemory { publisher } => publisher.publish(aggregate_id, event),
            #[cfg(feature = "redis")]
            CommandServices::Redis { publisher } => publisher.publish(aggregate_id, event),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::Utc;

    use orderflow_infra::PublishErrorKind;

    use super::*;

    fn command(customer: &str) -> CreateOrder {
        CreateOrder {
            order_id: AggregateId::parse("o1").unwrap(),
            customer: customer.to_string(),
            occurred_at: Utc::now(),
        }
    }

    #[test]
    fn validation_failures_never_reach_the_broker() {
        let log = InMemoryEventLog::new();
        let services = CommandServices::in_memory(log.clone(), RetryPolicy::no_retry());

        let err = services.create_order(command("   ")).unwrap_err();
        assert!(matches!(err, CreateOrderError::Validation(_)));
        assert!(log.is_empty());
    }

    #[test]
    fn unavailable_broker_surfaces_as_publish_error() {
        let log = InMemoryEventLog::new();
        log.set_available(false);
        let services = CommandServices::in_memory(
            log.clone(),
            RetryPolicy::fixed(2, Duration::from_millis(1)),
        );

        match services.create_order(command("alice")).unwrap_err() {
            CreateOrderError::Publish(e) => assert_eq!(e.kind, PublishErrorKind::Unavailable),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn accepted_order_is_returned() {
        let log = InMemoryEventLog::new();
        let services = CommandServices::in_memory(log.clone(), RetryPolicy::no_retry());

        let order = services.create_order(command(" alice ")).unwrap();
        assert_eq!(order.id.as_str(), "o1");
        assert_eq!(order.customer, "alice");
        assert_eq!(log.len(), 1);
    }
}
