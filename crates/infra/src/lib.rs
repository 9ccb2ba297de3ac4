//! Infrastructure layer: broker adapters, the publisher, the read model and
//! the background applier that keeps it up to date.

pub mod config;
pub mod event_bus;
pub mod health;
pub mod projections;
pub mod publisher;
pub mod read_model;
pub mod retry;
pub mod workers;

#[cfg(test)]
mod integration_tests;

pub use config::{BrokerConfig, CommandServiceConfig, ConfigError, QueryServiceConfig};
pub use health::{ApplierState, HealthSnapshot, HealthState, HealthStatus, StatsSnapshot};
pub use projections::{ApplyError, MaterializedView};
pub use publisher::{PublishError, PublishErrorKind, Publisher};
pub use read_model::{InMemoryProjectionStore, ProjectionStore, ReadGateway, StoreError};
pub use retry::{BackoffStrategy, RetryPolicy};
pub use workers::{Applier, ApplierConfig, ApplierHandle};
