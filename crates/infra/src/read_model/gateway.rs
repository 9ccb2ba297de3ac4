use std::marker::PhantomData;

use orderflow_core::AggregateId;

use super::ProjectionStore;

/// Read-only facade over a projection store, used by the query service.
///
/// Reads never wait for the applier: they return whatever snapshot the store
/// holds at the moment of the call.
#[derive(Debug)]
pub struct ReadGateway<S, V> {
    store: S,
    _record: PhantomData<fn() -> V>,
}

impl<S: Clone, V> Clone for ReadGateway<S, V> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            _record: PhantomData,
        }
    }
}

impl<S, V> ReadGateway<S, V>
where
    S: ProjectionStore<AggregateId, V>,
{
    pub fn new(store: S) -> Self {
        Self {
            store,
            _record: PhantomData,
        }
    }

    pub fn get_one(&self, id: &AggregateId) -> Option<V> {
        self.store.get(id)
    }

    /// Every record, ascending by aggregate id.
    pub fn list_all(&self) -> Vec<V> {
        self.store.list_all().collect()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use orderflow_events::Mutation;

    use super::*;
    use crate::read_model::InMemoryProjectionStore;

    fn id(s: &str) -> AggregateId {
        AggregateId::parse(s).unwrap()
    }

    #[test]
    fn reads_go_straight_to_the_store() {
        let store = Arc::new(InMemoryProjectionStore::<AggregateId, String>::new());
        let gateway = ReadGateway::new(store.clone());

        assert!(gateway.list_all().is_empty());
        assert_eq!(gateway.get_one(&id("o1")), None);

        for key in ["o2", "o1"] {
            store
                .upsert(id(key), |_| (Mutation::Put(key.to_uppercase()), ()))
                .unwrap();
        }

        assert_eq!(gateway.get_one(&id("o1")).as_deref(), Some("O1"));
        assert_eq!(gateway.list_all(), vec!["O1".to_string(), "O2".to_string()]);
    }
}
