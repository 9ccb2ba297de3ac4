use orderflow_core::AggregateId;

/// A command targets a specific aggregate.
///
/// Commands represent **intent** and are transient: the command side validates
/// them and turns them into events, which are what travels over the broker.
///
/// The target aggregate id is also the broker ordering key, so every event
/// produced from one command lands in the same ordering domain.
pub trait Command: Clone + core::fmt::Debug + Send + Sync + 'static {
    fn target_aggregate_id(&self) -> &AggregateId;
}
