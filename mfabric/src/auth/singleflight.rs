use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;

use tokio::sync::OnceCell;

use crate::types::DashMap;

/// Collapses concurrent lookups of the same key into one call. Callers that
/// arrive while a call is in flight wait for its result; the slot is removed
/// once the call completes so later lookups run again.
pub struct Group<K, V>
where
    K: Eq + Hash,
{
    calls: DashMap<K, Arc<OnceCell<V>>>,
}

impl<K, V> Default for Group<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> Group<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        Self { calls: DashMap::default() }
    }

    pub async fn work<F, Fut>(&self, key: K, f: F) -> V
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = V>,
    {
        let cell = self.calls.entry(key.clone()).or_insert_with(|| Arc::new(OnceCell::new())).clone();
        let v = cell.get_or_init(f).await.clone();
        self.calls.remove_if(&key, |_, c| Arc::ptr_eq(c, &cell));
        v
    }

    #[inline]
    pub fn in_flight(&self) -> usize {
        self.calls.len()
    }
}
