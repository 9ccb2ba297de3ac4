//! Event mechanics shared by the command and query sides.
//!
//! Nothing in here knows about orders, HTTP or a concrete broker:
//! - `envelope` / `registry` / `sequence`: the wire contract and how it is produced
//! - `bus`: producer and consumer-session abstractions over a durable log
//! - `in_memory_bus`: a log with consumer-group semantics for tests and local runs
//! - `projection` / `runner`: folding envelopes into read records behind the idempotence guard

pub mod bus;
pub mod command;
pub mod envelope;
pub mod event;
pub mod handler;
pub mod in_memory_bus;
pub mod projection;
pub mod registry;
pub mod runner;
pub mod sequence;

pub use bus::{Ack, BusFailure, ConsumerSession, Delivery, EventBus, EventSource, LogPosition};
pub use command::Command;
pub use envelope::{EnvelopeError, EventEnvelope};
pub use event::Event;
pub use handler::CommandHandler;
pub use in_memory_bus::{DeadLetter, InMemoryBusError, InMemoryEventLog};
pub use projection::{Current, Mutation, Projection};
pub use registry::EventRegistry;
pub use runner::{guarded_evolve, ApplyOutcome, ProjectionRunner};
pub use sequence::SequenceClock;
