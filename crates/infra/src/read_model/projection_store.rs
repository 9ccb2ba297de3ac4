use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use thiserror::Error;

use orderflow_events::{Current, Mutation};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("read model store unavailable: {0}")]
    Unavailable(String),
}

/// Keyed store for disposable read models.
///
/// ## Concurrency contract
///
/// - `upsert` calls on the **same key** are serialized: the mutator always sees
///   the value left by the previous `upsert` on that key.
/// - `upsert` calls on **different keys** never wait on each other.
/// - Readers never block on writers and never observe a partially written
///   value; they see either the old or the new value.
pub trait ProjectionStore<K, V>: Send + Sync {
    fn get(&self, key: &K) -> Option<V>;

    /// Atomically read-modify-write the value under `key`.
    ///
    /// `mutator` receives what the key currently holds (a live value, a
    /// tombstone left by `Mutation::Remove`, or nothing) and returns the
    /// mutation to apply plus an arbitrary result handed back to the caller.
    /// It runs inside the key's critical section and must not block.
    fn upsert<F, R>(&self, key: K, mutator: F) -> Result<R, StoreError>
    where
        F: FnOnce(Current<'_, V>) -> (Mutation<V>, R);

    /// Every present value in ascending key order.
    ///
    /// The sequence is lazy: each value is read when the iterator reaches it,
    /// so concurrent writers are never blocked by a long listing.
    fn list_all(&self) -> impl Iterator<Item = V>;
}

impl<K, V, S> ProjectionStore<K, V> for Arc<S>
where
    S: ProjectionStore<K, V> + ?Sized,
{
    fn get(&self, key: &K) -> Option<V> {
        (**self).get(key)
    }

    fn upsert<F, R>(&self, key: K, mutator: F) -> Result<R, StoreError>
    where
        F: FnOnce(Current<'_, V>) -> (Mutation<V>, R),
    {
        (**self).upsert(key, mutator)
    }

    fn list_all(&self) -> impl Iterator<Item = V> {
        (**self).list_all()
    }
}

/// One key's storage: a writer lock plus an immutable snapshot that is swapped
/// on every write.
///
/// The writer lock guards the tombstone sequence, which only mutators read.
#[derive(Debug)]
struct Slot<V> {
    writer: Mutex<Option<u64>>,
    current: RwLock<Option<Arc<V>>>,
}

impl<V> Slot<V> {
    fn empty() -> Self {
        Self {
            writer: Mutex::new(None),
            current: RwLock::new(None),
        }
    }

    fn snapshot(&self) -> Option<Arc<V>> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn replace(&self, value: Option<Arc<V>>) {
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = value;
    }
}

/// In-memory projection store.
///
/// The outer map only holds slots; it is write-locked just long enough to
/// insert a slot for a key seen for the first time. Removed values leave their
/// slot behind so a later `upsert` of the same key serializes on the same lock.
///
/// Lock poisoning is recovered from: values are swapped as whole snapshots, so
/// a panicking mutator can never leave a torn value behind.
#[derive(Debug)]
pub struct InMemoryProjectionStore<K, V> {
    slots: RwLock<BTreeMap<K, Arc<Slot<V>>>>,
}

impl<K, V> InMemoryProjectionStore<K, V> {
    pub fn new() -> Self {
        Self {
            slots: RwLock::new(BTreeMap::new()),
        }
    }
}

impl<K, V> Default for InMemoryProjectionStore<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> InMemoryProjectionStore<K, V>
where
    K: Ord + Clone,
{
    fn existing_slot(&self, key: &K) -> Option<Arc<Slot<V>>> {
        self.slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    fn slot_for_write(&self, key: K) -> Arc<Slot<V>> {
        if let Some(slot) = self.existing_slot(&key) {
            return slot;
        }
        self.slots
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(key)
            .or_insert_with(|| Arc::new(Slot::empty()))
            .clone()
    }

    /// Number of present values.
    pub fn len(&self) -> usize {
        let slots: Vec<Arc<Slot<V>>> = self
            .slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        slots.iter().filter(|s| s.snapshot().is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K, V> ProjectionStore<K, V> for InMemoryProjectionStore<K, V>
where
    K: Ord + Clone + Send + Sync,
    V: Clone + Send + Sync,
{
    fn get(&self, key: &K) -> Option<V> {
        let slot = self.existing_slot(key)?;
        let value = slot.snapshot()?;
        Some(V::clone(&value))
    }

    fn upsert<F, R>(&self, key: K, mutator: F) -> Result<R, StoreError>
    where
        F: FnOnce(Current<'_, V>) -> (Mutation<V>, R),
    {
        let slot = self.slot_for_write(key);
        let mut tombstone = slot.writer.lock().unwrap_or_else(PoisonError::into_inner);

        let snapshot = slot.snapshot();
        let current = match (snapshot.as_deref(), *tombstone) {
            (Some(value), _) => Current::Live(value),
            (None, Some(sequence)) => Current::Removed { sequence },
            (None, None) => Current::Vacant,
        };

        let (mutation, result) = mutator(current);
        match mutation {
            Mutation::Put(value) => {
                slot.replace(Some(Arc::new(value)));
                *tombstone = None;
            }
            Mutation::Remove { sequence } => {
                slot.replace(None);
                *tombstone = Some(sequence);
            }
            Mutation::Keep => {}
        }
        Ok(result)
    }

    fn list_all(&self) -> impl Iterator<Item = V> {
        // Slots are collected up front; values are read lazily.
        let slots: Vec<Arc<Slot<V>>> = self
            .slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();

        slots
            .into_iter()
            .filter_map(|slot| slot.snapshot())
            .map(|value| V::clone(&value))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Barrier;
    use std::thread;

    use super::*;

    fn put(store: &InMemoryProjectionStore<String, u64>, key: &str, value: u64) {
        store
            .upsert(key.to_string(), |_| (Mutation::Put(value), ()))
            .unwrap();
    }

    #[test]
    fn get_returns_none_for_unknown_keys() {
        let store: InMemoryProjectionStore<String, u64> = InMemoryProjectionStore::new();
        assert_eq!(store.get(&"missing".to_string()), None);
        assert!(store.is_empty());
    }

    #[test]
    fn mutator_sees_the_previous_value() {
        let store = InMemoryProjectionStore::new();
        put(&store, "a", 1);

        let seen = store
            .upsert("a".to_string(), |current| {
                let seen = current.record().copied();
                (Mutation::Put(seen.unwrap_or(0) + 10), seen)
            })
            .unwrap();

        assert_eq!(seen, Some(1));
        assert_eq!(store.get(&"a".to_string()), Some(11));
    }

    #[test]
    fn keep_and_remove() {
        let store = InMemoryProjectionStore::new();
        put(&store, "a", 1);

        store.upsert("a".to_string(), |_| (Mutation::Keep, ())).unwrap();
        assert_eq!(store.get(&"a".to_string()), Some(1));

        store
            .upsert("a".to_string(), |_| (Mutation::Remove { sequence: 4 }, ()))
            .unwrap();
        assert_eq!(store.get(&"a".to_string()), None);
        assert_eq!(store.len(), 0);

        let seen = store
            .upsert("a".to_string(), |current| {
                let seen = format!("{current:?}");
                (Mutation::Put(5), seen)
            })
            .unwrap();
        assert_eq!(seen, "Removed { sequence: 4 }");
        assert_eq!(store.get(&"a".to_string()), Some(5));

        let after_put = store
            .upsert("a".to_string(), |current| (Mutation::Keep, current.record().copied()))
            .unwrap();
        assert_eq!(after_put, Some(5));
    }

    #[test]
    fn list_all_is_in_key_order() {
        let store = InMemoryProjectionStore::new();
        put(&store, "c", 3);
        put(&store, "a", 1);
        put(&store, "b", 2);
        store
            .upsert("b".to_string(), |_| (Mutation::Remove { sequence: 1 }, ()))
            .unwrap();

        let all: Vec<u64> = store.list_all().collect();
        assert_eq!(all, vec![1, 3]);
    }

    #[test]
    fn list_all_does_not_hold_locks_while_consumed() {
        let store = InMemoryProjectionStore::new();
        put(&store, "a", 1);
        put(&store, "b", 2);

        let mut iter = store.list_all();
        assert_eq!(iter.next(), Some(1));

        // A write to a brand new key needs the outer write lock.
        put(&store, "c", 3);
        put(&store, "b", 20);

        assert_eq!(iter.next(), Some(20));
        assert_eq!(iter.next(), None);
    }

    #[test]
    fn same_key_updates_are_serialized() {
        let store = Arc::new(InMemoryProjectionStore::<String, u64>::new());
        let threads = 8;
        let per_thread = 500;
        let barrier = Arc::new(Barrier::new(threads));

        let handles: Vec<_> = (0..threads)
            .map(|_| {
                let store = store.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    for _ in 0..per_thread {
                        store
                            .upsert("hot".to_string(), |current: Current<'_, u64>| {
                                (Mutation::Put(current.record().copied().unwrap_or(0) + 1), ())
                            })
                            .unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(
            store.get(&"hot".to_string()),
            Some((threads * per_thread) as u64)
        );
    }

    #[test]
    fn readers_never_see_torn_values() {
        // Every written pair holds two equal halves; a torn read would not.
        let store = Arc::new(InMemoryProjectionStore::<u32, (u64, u64)>::new());
        store.upsert(0, |_| (Mutation::Put((0, 0)), ())).unwrap();

        let writer = {
            let store = store.clone();
            thread::spawn(move || {
                for i in 1..=5_000u64 {
                    store.upsert(0, |_| (Mutation::Put((i, i)), ())).unwrap();
                }
            })
        };

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let store = store.clone();
                thread::spawn(move || {
                    let mut last = 0;
                    for _ in 0..5_000 {
                        let (a, b) = store.get(&0).unwrap();
                        assert_eq!(a, b);
                        assert!(a >= last, "values never go backwards for one reader");
                        last = a;
                    }
                })
            })
            .collect();

        writer.join().unwrap();
        for r in readers {
            r.join().unwrap();
        }
        assert_eq!(store.get(&0), Some((5_000, 5_000)));
    }

    #[test]
    fn a_slow_mutator_does_not_block_other_keys() {
        use std::sync::mpsc;
        use std::time::Duration;

        let store = Arc::new(InMemoryProjectionStore::<String, u64>::new());
        put(&store, "slow", 0);

        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();

        let slow = {
            let store = store.clone();
            thread::spawn(move || {
                store
                    .upsert("slow".to_string(), |_| {
                        entered_tx.send(()).unwrap();
                        release_rx.recv().unwrap();
                        (Mutation::Put(1), ())
                    })
                    .unwrap();
            })
        };

        entered_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        // Other keys and readers of the busy key proceed meanwhile.
        put(&store, "fast", 7);
        assert_eq!(store.get(&"fast".to_string()), Some(7));
        assert_eq!(store.get(&"slow".to_string()), Some(0));

        release_tx.send(()).unwrap();
        slow.join().unwrap();
        assert_eq!(store.get(&"slow".to_string()), Some(1));
    }

    #[test]
    fn panicking_mutator_leaves_the_previous_value() {
        let store = Arc::new(InMemoryProjectionStore::<String, u64>::new());
        put(&store, "a", 1);

        let s = store.clone();
        let result = thread::spawn(move || {
            s.upsert("a".to_string(), |_| -> (Mutation<u64>, ()) { panic!("boom") })
        })
        .join();
        assert!(result.is_err());

        assert_eq!(store.get(&"a".to_string()), Some(1));
        put(&store, "a", 2);
        assert_eq!(store.get(&"a".to_string()), Some(2));
    }
}
