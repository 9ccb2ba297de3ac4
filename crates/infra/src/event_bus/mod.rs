//! Infrastructure event bus implementations.
//!
//! The log abstraction lives in `orderflow-events` as pure mechanics (with an
//! in-memory log for tests/dev). This module provides broker-backed
//! implementations.

#[cfg(feature = "redis")]
pub mod redis_streams;

#[cfg(feature = "redis")]
pub use redis_streams::{RedisStreamsError, RedisStreamsEventBus, RedisStreamsSession};
