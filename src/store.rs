//! The cache entry store: key to [`QueryState`] mapping.

use std::collections::HashMap;
use std::fmt;

use crate::key::{QueryKey, QueryValue};
use crate::signal::{Callback, Signal, Subscription, WeakSignal};
use crate::state::{EntryUpdate, QueryState};

/// Full contents of a store.
pub type CacheMap<K, D, E> = HashMap<K, QueryState<D, E>>;

/// Observable mapping from key to [`QueryState`].
///
/// This is the ground truth for the query engine and for anything layered on
/// top of it. Every write is a single notification to subscribers, so a
/// subscriber never observes a half-applied entry.
///
/// This is cheap to clone - clones share the same entries. There is no
/// process-wide instance: whoever creates a store decides who sees it.
pub struct CacheStore<K, D, E> {
    cache: Signal<CacheMap<K, D, E>>,
}

impl<K, D, E> Clone for CacheStore<K, D, E> {
    fn clone(&self) -> Self {
        Self {
            cache: self.cache.clone(),
        }
    }
}

impl<K, D, E> fmt::Debug for CacheStore<K, D, E>
where
    K: fmt::Debug,
    D: fmt::Debug,
    E: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.cache.with(|cache| f.debug_map().entries(cache.iter()).finish())
    }
}

impl<K: QueryKey, D: QueryValue, E: QueryValue> Default for CacheStore<K, D, E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: QueryKey, D: QueryValue, E: QueryValue> CacheStore<K, D, E> {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            cache: Signal::new(HashMap::new()),
        }
    }

    /// Clone out the entry for `key`.
    pub fn get(&self, key: &K) -> Option<QueryState<D, E>> {
        self.cache.with(|cache| cache.get(key).cloned())
    }

    /// Read the entry for `key` without cloning it.
    pub fn with_entry<R>(&self, key: &K, f: impl FnOnce(&QueryState<D, E>) -> R) -> Option<R> {
        self.cache.with(|cache| cache.get(key).map(f))
    }

    /// Read the whole mapping without cloning it.
    pub fn with<R>(&self, f: impl FnOnce(&CacheMap<K, D, E>) -> R) -> R {
        self.cache.with(f)
    }

    /// Returns true if an entry exists for `key`.
    pub fn contains(&self, key: &K) -> bool {
        self.cache.with(|cache| cache.contains_key(key))
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.cache.with(HashMap::len)
    }

    /// Returns true if there are no entries.
    pub fn is_empty(&self) -> bool {
        self.cache.with(HashMap::is_empty)
    }

    /// Clone out every entry.
    pub fn snapshot(&self) -> CacheMap<K, D, E> {
        self.cache.get()
    }

    /// Swap in a whole new mapping.
    pub fn replace(&self, cache: CacheMap<K, D, E>) {
        self.cache.set(cache);
    }

    /// Arbitrary write to the mapping, delivered as one notification.
    pub fn update<R>(&self, f: impl FnOnce(&mut CacheMap<K, D, E>) -> R) -> R {
        self.cache.update(f)
    }

    /// Apply an [`EntryUpdate`] to `key`, creating the entry if needed.
    pub fn patch(&self, key: K, update: impl Into<EntryUpdate<D, E>>) {
        let update = update.into();
        self.cache
            .update(|cache| cache.entry(key).or_default().apply(update));
    }

    /// Overlay `other` on this store; entries from `other` win on overlap.
    pub fn merge(&self, other: CacheMap<K, D, E>) {
        self.cache.update(|cache| cache.extend(other));
    }

    /// Drop every entry.
    pub fn clear(&self) {
        self.cache.update(HashMap::clear);
    }

    /// Register a callback fired after every write.
    pub fn subscribe(&self, callback: impl Fn() + Send + Sync + 'static) -> Subscription {
        self.cache.subscribe(callback)
    }

    /// Same as [`CacheStore::subscribe`] for an already shared callback.
    pub fn subscribe_callback(&self, callback: Callback) -> Subscription {
        self.cache.subscribe_callback(callback)
    }

    /// Number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.cache.subscriber_count()
    }

    /// Wait until `predicate` holds for the mapping.
    pub async fn wait_for(&self, predicate: impl FnMut(&CacheMap<K, D, E>) -> bool) {
        self.cache.wait_for(predicate).await
    }

    /// Weak handle for callbacks registered on this store.
    pub fn downgrade(&self) -> WeakCacheStore<K, D, E> {
        WeakCacheStore {
            cache: self.cache.downgrade(),
        }
    }
}

/// Weak counterpart of [`CacheStore`].
pub struct WeakCacheStore<K, D, E> {
    cache: WeakSignal<CacheMap<K, D, E>>,
}

impl<K, D, E> Clone for WeakCacheStore<K, D, E> {
    fn clone(&self) -> Self {
        Self {
            cache: self.cache.clone(),
        }
    }
}

impl<K, D, E> WeakCacheStore<K, D, E> {
    /// Recover the store if it is still alive.
    pub fn upgrade(&self) -> Option<CacheStore<K, D, E>> {
        self.cache.upgrade().map(|cache| CacheStore { cache })
    }
}
