//! Orders domain module.
//!
//! Business rules for placing orders, implemented purely as deterministic
//! domain logic (no IO, no HTTP, no broker).

pub mod order;

pub use order::{
    registry, CreateOrder, Order, OrderCommandHandler, OrderCreated, OrderEvent, ORDER_CREATED,
};
