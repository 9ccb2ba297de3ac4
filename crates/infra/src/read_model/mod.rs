//! Read model storage: the per-aggregate projection store and the read gateway.

pub mod gateway;
pub mod projection_store;

pub use gateway::ReadGateway;
pub use projection_store::{InMemoryProjectionStore, ProjectionStore, StoreError};
