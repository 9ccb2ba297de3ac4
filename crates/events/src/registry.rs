//! Fixed registry of event types accepted on the wire.

use std::collections::BTreeSet;

/// The set of event types a deployment knows how to produce and consume.
///
/// Envelopes are checked against it twice: by the publisher before anything is
/// sent, and by the consumer after decoding. An unknown type on the consumer
/// side is treated as a poison message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventRegistry {
    known: BTreeSet<&'static str>,
}

impl EventRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_types(types: impl IntoIterator<Item = &'static str>) -> Self {
        Self {
            known: types.into_iter().collect(),
        }
    }

    pub fn with(mut self, event_type: &'static str) -> Self {
        self.known.insert(event_type);
        self
    }

    pub fn contains(&self, event_type: &str) -> bool {
        self.known.contains(event_type)
    }

    pub fn event_types(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.known.iter().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.known.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookups_are_exact() {
        let registry = EventRegistry::new().with("order.created");
        assert!(registry.contains("order.created"));
        assert!(!registry.contains("order.Created"));
        assert!(!registry.contains("order"));
        assert!(!EventRegistry::new().contains("order.created"));
    }

    #[test]
    fn from_types_deduplicates() {
        let registry = EventRegistry::from_types(["a", "b", "a"]);
        assert_eq!(registry.event_types().collect::<Vec<_>>(), vec!["a", "b"]);
    }
}
