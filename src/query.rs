//! Query cache engine.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::error::QueryError;
use crate::fetcher::Fetcher;
use crate::key::{QueryKey, QueryValue};
use crate::signal::{Accessor, Callback, Subscription};
use crate::state::{EntryUpdate, QueryState};
use crate::store::{CacheMap, CacheStore};
use crate::tracer::{CacheWrite, FetchOutcome, NoopTracer, Tracer, TracerKey};

type EnabledFn = Arc<dyn Fn() -> bool + Send + Sync>;

/// Whether fetches may start.
enum Gate {
    /// Watched: turning it on fetches the current key if it has no entry.
    Accessor(Arc<dyn Accessor<bool>>),
    /// Polled at each fetch attempt only.
    Fn(EnabledFn),
}

impl Gate {
    fn get(&self) -> bool {
        match self {
            Gate::Accessor(enabled) => enabled.get(),
            Gate::Fn(enabled) => enabled(),
        }
    }
}
type SuccessFn<K, D> = Arc<dyn Fn(&K, &D) + Send + Sync>;
type ErrorFn<K, E> = Arc<dyn Fn(&K, &E) + Send + Sync>;
type SettledFn<K> = Arc<dyn Fn(&K) + Send + Sync>;

/// Configuration for a [`Query`].
///
/// Only the key accessor and the fetcher are required. Defaults:
///
/// | option       | default                                         |
/// |--------------|-------------------------------------------------|
/// | `enabled`    | always `true` (see also `enabled_fn`)           |
/// | `on_success` | none                                            |
/// | `on_error`   | none                                            |
/// | `on_settled` | none                                            |
/// | `tracer`     | [`NoopTracer`]                                  |
/// | `handle`     | the tokio runtime the query is built in         |
/// | `store`      | a fresh [`CacheStore`] owned by this query      |
///
/// # Example
///
/// ```ignore
/// let todo_id = Signal::new(1u32);
/// let query = QueryOptions::new(todo_id.clone(), |id: u32| async move {
///     api::fetch_todo(id).await
/// })
/// .on_error(|id, err| tracing::warn!(id, %err, "todo fetch failed"))
/// .build()?;
/// ```
pub struct QueryOptions<K, D, E> {
    key: Arc<dyn Accessor<K>>,
    fetcher: Arc<dyn Fetcher<K, D, E>>,
    enabled: Option<Gate>,
    on_success: Option<SuccessFn<K, D>>,
    on_error: Option<ErrorFn<K, E>>,
    on_settled: Option<SettledFn<K>>,
    tracer: Arc<dyn Tracer>,
    handle: Option<Handle>,
    store: Option<CacheStore<K, D, E>>,
}

impl<K: QueryKey, D: QueryValue, E: QueryValue> QueryOptions<K, D, E> {
    /// Options for a query over `key` fetched by `fetcher`.
    pub fn new(key: impl Accessor<K>, fetcher: impl Fetcher<K, D, E>) -> Self {
        Self {
            key: Arc::new(key),
            fetcher: Arc::new(fetcher),
            enabled: None,
            on_success: None,
            on_error: None,
            on_settled: None,
            tracer: Arc::new(NoopTracer),
            handle: None,
            store: None,
        }
    }

    /// Gate every fetch, automatic or manual, on `enabled`.
    ///
    /// The accessor is watched: when it turns `true` and the current key has
    /// no entry, that key is fetched.
    pub fn enabled(mut self, enabled: impl Accessor<bool>) -> Self {
        self.enabled = Some(Gate::Accessor(Arc::new(enabled)));
        self
    }

    /// Gate every fetch on a plain predicate.
    ///
    /// Unlike [`QueryOptions::enabled`] nothing watches it, so it only takes
    /// effect at the next fetch attempt.
    pub fn enabled_fn(mut self, enabled: impl Fn() -> bool + Send + Sync + 'static) -> Self {
        self.enabled = Some(Gate::Fn(Arc::new(enabled)));
        self
    }

    /// Called after a successful fetch has been written.
    pub fn on_success(mut self, f: impl Fn(&K, &D) + Send + Sync + 'static) -> Self {
        self.on_success = Some(Arc::new(f));
        self
    }

    /// Called after a failed fetch has been written.
    pub fn on_error(mut self, f: impl Fn(&K, &E) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(f));
        self
    }

    /// Called after every fetch, after `on_success`/`on_error`.
    pub fn on_settled(mut self, f: impl Fn(&K) + Send + Sync + 'static) -> Self {
        self.on_settled = Some(Arc::new(f));
        self
    }

    /// Observe fetches and writes.
    pub fn tracer(mut self, tracer: Arc<dyn Tracer>) -> Self {
        self.tracer = tracer;
        self
    }

    /// Runtime used to drive fetches.
    pub fn handle(mut self, handle: Handle) -> Self {
        self.handle = Some(handle);
        self
    }

    /// Use an existing store instead of a fresh one.
    pub fn store(mut self, store: CacheStore<K, D, E>) -> Self {
        self.store = Some(store);
        self
    }

    /// Build the query. Same as [`Query::new`].
    pub fn build(self) -> Result<Query<K, D, E>, QueryError> {
        Query::new(self)
    }
}

struct Inner<K, D, E> {
    key: Arc<dyn Accessor<K>>,
    fetcher: Arc<dyn Fetcher<K, D, E>>,
    enabled: Option<Gate>,
    on_success: Option<SuccessFn<K, D>>,
    on_error: Option<ErrorFn<K, E>>,
    on_settled: Option<SettledFn<K>>,
    tracer: Arc<dyn Tracer>,
    handle: Handle,
    store: CacheStore<K, D, E>,
    /// Key, gate and store subscriptions driving auto-refetch. Dropped with the engine.
    watchers: Mutex<Vec<Subscription>>,
}

impl<K: QueryKey, D: QueryValue, E: QueryValue> Inner<K, D, E> {
    fn is_enabled(&self) -> bool {
        self.enabled.as_ref().map_or(true, Gate::get)
    }

    /// Fetch the current key if it has no entry.
    ///
    /// Starting a fetch creates the entry synchronously, so however many
    /// notifications arrive afterwards only the first one fetches.
    fn ensure_current_key(self: &Arc<Self>) {
        let key = self.key.get();
        if self.store.contains(&key) || !self.is_enabled() {
            return;
        }
        trace!(key = ?key, "auto-refetch: current key has no entry");
        self.tracer.on_auto_refetch(&TracerKey::of(&key));
        // Detached: the result is observed through the store.
        drop(self.start(key));
    }

    fn start(self: &Arc<Self>, key: K) -> Refetch<D> {
        let tracer_key = TracerKey::of(&key);
        if !self.is_enabled() {
            trace!(key = ?key, "refetch skipped: query disabled");
            self.tracer.on_fetch_end(&tracer_key, FetchOutcome::Skipped);
            return Refetch { task: None };
        }

        let initial = self.store.update(|cache| {
            let first = cache.is_empty();
            let entry = cache.entry(key.clone()).or_default();
            entry.is_loading = true;
            if first {
                entry.is_loading_initial = true;
            }
            first
        });
        debug!(key = ?key, initial, "fetch started");
        self.tracer
            .on_cache_write(Some(&tracer_key), CacheWrite::Loading);
        self.tracer.on_fetch_start(&tracer_key);

        let inner = Arc::clone(self);
        let task = self.handle.spawn(inner.settle(key, tracer_key));
        Refetch { task: Some(task) }
    }

    async fn settle(self: Arc<Self>, key: K, tracer_key: TracerKey) -> Option<D> {
        let result = self.fetcher.fetch(key.clone()).await;

        // Value, error and both loading flags land in one notification.
        self.store.update(|cache| {
            let entry = cache.entry(key.clone()).or_default();
            match &result {
                Ok(data) => entry.resolve(data.clone()),
                Err(error) => entry.reject(error.clone()),
            }
            entry.is_loading = false;
            entry.is_loading_initial = false;
        });
        let outcome = match &result {
            Ok(_) => FetchOutcome::Success,
            Err(_) => FetchOutcome::Failure,
        };
        debug!(key = ?key, ?outcome, "fetch settled");
        self.tracer
            .on_cache_write(Some(&tracer_key), CacheWrite::Settled);
        self.tracer.on_fetch_end(&tracer_key, outcome);

        match &result {
            Ok(data) => {
                if let Some(on_success) = &self.on_success {
                    on_success(&key, data);
                }
            }
            Err(error) => {
                if let Some(on_error) = &self.on_error {
                    on_error(&key, error);
                }
            }
        }
        if let Some(on_settled) = &self.on_settled {
            on_settled(&key);
        }
        result.ok()
    }

    fn traced_write(&self, key: Option<&K>, write: CacheWrite) {
        let key = key.map(TracerKey::of);
        self.tracer.on_cache_write(key.as_ref(), write);
    }
}

/// Keyed async cache driven by a reactive key.
///
/// Whenever the key accessor points at a key without an entry, the query
/// fetches it, exactly once. Everything else is a cache read. Entries can be
/// overwritten by hand (`set_*`) without fetching.
///
/// Every `*_for` method has a sibling without the suffix that uses the
/// current key, evaluated at call time.
///
/// This is cheap to clone. The key and store subscriptions that drive
/// automatic fetching live as long as any clone (or an in-flight fetch).
///
/// # Concurrent fetches
///
/// Fetches are not deduplicated. Two fetches for the same key that overlap
/// both write their result; whichever settles last wins, regardless of the
/// order they were started in. The first one to settle also clears the
/// loading flag while the other is still in flight.
///
/// # Callbacks
///
/// `on_success`, `on_error` and `on_settled` run on the task that settled the
/// fetch. A panic in them is not caught: it aborts that task, and resurfaces
/// from the [`Refetch`] future if someone is awaiting it.
pub struct Query<K, D, E> {
    inner: Arc<Inner<K, D, E>>,
}

impl<K, D, E> Clone for Query<K, D, E> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<K: QueryKey, D: QueryValue, E: QueryValue> Query<K, D, E> {
    /// Build a query and, if enabled, start fetching the current key.
    ///
    /// # Errors
    ///
    /// [`QueryError::NoRuntime`] if no handle was configured and this is not
    /// called from within a tokio runtime.
    pub fn new(options: QueryOptions<K, D, E>) -> Result<Self, QueryError> {
        let handle = match options.handle {
            Some(handle) => handle,
            None => Handle::try_current().map_err(|_| QueryError::NoRuntime)?,
        };
        let inner = Arc::new(Inner {
            key: options.key,
            fetcher: options.fetcher,
            enabled: options.enabled,
            on_success: options.on_success,
            on_error: options.on_error,
            on_settled: options.on_settled,
            tracer: options.tracer,
            handle,
            store: options.store.unwrap_or_default(),
            watchers: Mutex::new(Vec::new()),
        });

        let watch: Callback = {
            let weak = Arc::downgrade(&inner);
            Arc::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.ensure_current_key();
                }
            })
        };
        let mut watchers = vec![
            inner.key.subscribe(watch.clone()),
            inner.store.subscribe_callback(watch.clone()),
        ];
        if let Some(Gate::Accessor(enabled)) = &inner.enabled {
            watchers.push(enabled.subscribe(watch));
        }
        *inner.watchers.lock() = watchers;

        inner.ensure_current_key();
        Ok(Self { inner })
    }

    /// The current key.
    pub fn key(&self) -> K {
        self.inner.key.get()
    }

    /// The store backing this query.
    pub fn store(&self) -> &CacheStore<K, D, E> {
        &self.inner.store
    }

    /// Data cached for the current key.
    pub fn data(&self) -> Option<D> {
        self.data_for(&self.key())
    }

    /// Data cached for `key`.
    pub fn data_for(&self, key: &K) -> Option<D> {
        self.inner
            .store
            .with_entry(key, |entry| entry.data.clone())
            .flatten()
    }

    /// Error cached for the current key.
    pub fn error(&self) -> Option<E> {
        self.error_for(&self.key())
    }

    /// Error cached for `key`.
    pub fn error_for(&self, key: &K) -> Option<E> {
        self.inner
            .store
            .with_entry(key, |entry| entry.error.clone())
            .flatten()
    }

    /// Returns true if the current key holds an error.
    pub fn is_error(&self) -> bool {
        self.is_error_for(&self.key())
    }

    /// Returns true if `key` holds an error.
    pub fn is_error_for(&self, key: &K) -> bool {
        self.inner
            .store
            .with_entry(key, QueryState::is_error)
            .unwrap_or(false)
    }

    /// Returns true while a fetch for the current key is in flight.
    pub fn is_loading(&self) -> bool {
        self.is_loading_for(&self.key())
    }

    /// Returns true while a fetch for `key` is in flight.
    pub fn is_loading_for(&self, key: &K) -> bool {
        self.inner
            .store
            .with_entry(key, |entry| entry.is_loading)
            .unwrap_or(false)
    }

    /// Returns true while the first fetch ever issued against the store is
    /// in flight.
    pub fn is_loading_initial(&self) -> bool {
        self.inner
            .store
            .with(|cache| cache.values().any(|entry| entry.is_loading_initial))
    }

    /// Whole entry for the current key.
    pub fn entry(&self) -> Option<QueryState<D, E>> {
        self.inner.store.get(&self.key())
    }

    /// Whole entry for `key`.
    pub fn entry_for(&self, key: &K) -> Option<QueryState<D, E>> {
        self.inner.store.get(key)
    }

    /// Overwrite the current key's data and clear its error, without fetching.
    pub fn set_data(&self, data: D) {
        self.set_data_for(self.key(), data);
    }

    /// Overwrite `key`'s data and clear its error, without fetching.
    pub fn set_data_for(&self, key: K, data: D) {
        trace!(key = ?key, "set data");
        self.inner
            .store
            .update(|cache| cache.entry(key.clone()).or_default().resolve(data));
        self.inner.traced_write(Some(&key), CacheWrite::SetData);
    }

    /// Overwrite the current key's error and clear its data, without fetching.
    pub fn set_error(&self, error: E) {
        self.set_error_for(self.key(), error);
    }

    /// Overwrite `key`'s error and clear its data, without fetching.
    pub fn set_error_for(&self, key: K, error: E) {
        trace!(key = ?key, "set error");
        self.inner
            .store
            .update(|cache| cache.entry(key.clone()).or_default().reject(error));
        self.inner.traced_write(Some(&key), CacheWrite::SetError);
    }

    /// Replace or merge into the current key's entry.
    ///
    /// Pass an [`EntryPatch`](crate::EntryPatch) to merge, or a whole
    /// [`QueryState`] to replace.
    pub fn set_entry(&self, update: impl Into<EntryUpdate<D, E>>) {
        self.set_entry_for(self.key(), update);
    }

    /// Replace or merge into `key`'s entry.
    pub fn set_entry_for(&self, key: K, update: impl Into<EntryUpdate<D, E>>) {
        trace!(key = ?key, "set entry");
        self.inner.store.patch(key.clone(), update);
        self.inner.traced_write(Some(&key), CacheWrite::SetEntry);
    }

    /// Fetch the current key again.
    pub fn refetch(&self) -> Refetch<D> {
        self.refetch_key(self.key())
    }

    /// Fetch `key`, whether or not it is cached.
    ///
    /// If the query is disabled this does nothing and the returned future
    /// resolves to `None`. Otherwise the entry is marked loading before this
    /// returns and the fetch runs in the background; awaiting the returned
    /// future yields the fetched value, or `None` if the fetch failed.
    pub fn refetch_key(&self, key: K) -> Refetch<D> {
        self.inner.start(key)
    }

    /// Snapshot of every entry.
    pub fn cache(&self) -> CacheMap<K, D, E> {
        self.inner.store.snapshot()
    }

    /// Edit the whole mapping in one write.
    pub fn set_cache(&self, f: impl FnOnce(&mut CacheMap<K, D, E>)) {
        self.inner.store.update(f);
        self.inner.traced_write(None, CacheWrite::SetCache);
    }

    /// Swap in a whole new mapping.
    pub fn replace_cache(&self, cache: CacheMap<K, D, E>) {
        self.inner.store.replace(cache);
        self.inner.traced_write(None, CacheWrite::SetCache);
    }

    /// Drop every entry.
    ///
    /// The current key then has no entry, so it is fetched again right away
    /// (when enabled).
    pub fn empty_cache(&self) {
        debug!("emptying cache");
        self.inner.store.clear();
        self.inner.traced_write(None, CacheWrite::Clear);
    }
}

/// A fetch started by [`Query::refetch`].
///
/// The fetch runs whether or not this is awaited; dropping it only discards
/// the result.
#[must_use = "the fetch runs regardless; await this to get the fetched value"]
pub struct Refetch<D> {
    task: Option<JoinHandle<Option<D>>>,
}

impl<D> Future for Refetch<D> {
    type Output = Option<D>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let Some(task) = this.task.as_mut() else {
            return Poll::Ready(None);
        };
        let joined = match Pin::new(task).poll(cx) {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(joined) => joined,
        };
        this.task = None;
        match joined {
            Ok(data) => Poll::Ready(data),
            Err(err) if err.is_panic() => std::panic::resume_unwind(err.into_panic()),
            // Runtime shut down under the fetch.
            Err(_) => Poll::Ready(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::Signal;

    #[test]
    fn test_new_outside_runtime() {
        let result = QueryOptions::new(Signal::new(1u32), |id: u32| async move {
            Ok::<_, String>(id)
        })
        .build();

        assert!(matches!(result, Err(QueryError::NoRuntime)));
    }

    #[test]
    fn test_explicit_handle_outside_runtime() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();
        let query = QueryOptions::new(Signal::new(1u32), |id: u32| async move {
            Ok::<_, String>(id * 2)
        })
        .handle(runtime.handle().clone())
        .build()
        .unwrap();

        assert!(query.is_loading());
        assert!(query.is_loading_initial());

        let data = runtime.block_on(query.refetch());
        assert_eq!(data, Some(2));
        assert_eq!(query.data(), Some(2));
    }

    #[test]
    fn test_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Query<u32, String, String>>();
        assert_send_sync::<Refetch<String>>();
    }
}
