use crate::{Command, Event};

/// Turns a command into the events it implies (no IO, no publishing).
///
/// The command service is stateless, so there is no aggregate history to
/// rehydrate: a handler only validates the command and describes the resulting
/// facts. Publishing them is the caller's job.
pub trait CommandHandler {
    type Cmd: Command;
    type Ev: Event;
    type Error: core::fmt::Debug + Send + Sync + 'static;

    fn handle(&self, command: Self::Cmd) -> Result<Vec<Self::Ev>, Self::Error>;
}
